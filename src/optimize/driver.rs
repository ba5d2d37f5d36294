//! Multi-function driver
//!
//! Walks the extracted functions in file order: resolve tests, run the
//! controller to `Done`, record the result, advance. The cursor only ever
//! moves forward and every function is attempted exactly once.

use super::controller::Controller;
use super::progress::{Observer, ProgressEvent};
use super::state::{FunctionOutcome, FunctionResults, RunContext};
use crate::error::OptimizeError;
use crate::oracle::Oracles;

/// What a completed run produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub results: FunctionResults,
    /// Per-function detail, in the same order as `results`.
    pub outcomes: Vec<FunctionOutcome>,
}

pub struct Driver {
    context: RunContext,
    oracles: Oracles,
}

impl Driver {
    pub fn new(context: RunContext, oracles: Oracles) -> Self {
        Self { context, oracles }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Process every function. Any fatal error aborts the run before assembly.
    pub async fn run(&self, observer: &mut Observer<'_>) -> Result<RunOutcome, OptimizeError> {
        let total = self.context.function_count();
        let controller = Controller::new(&self.context, &self.oracles);
        let mut outcome = RunOutcome::default();
        let mut current_func_idx = 0;

        while current_func_idx < total {
            let unit = &self.context.functions()[current_func_idx];
            observer(&ProgressEvent::FunctionStarted {
                index: current_func_idx,
                total,
                name: &unit.name,
            });

            let test_code = self
                .oracles
                .spec
                .resolve(unit, self.context.raw_tests())
                .await
                .map_err(|err| OptimizeError::SpecResolution {
                    function: unit.name.clone(),
                    message: format!("{:#}", err),
                })?;
            observer(&ProgressEvent::TestsResolved {
                name: &unit.name,
                line_count: test_code.lines().count(),
            });

            let function_outcome = controller.run(current_func_idx, test_code, observer).await?;
            outcome.results.record(function_outcome.result.clone())?;
            outcome.outcomes.push(function_outcome);
            current_func_idx += 1;
        }

        Ok(outcome)
    }
}
