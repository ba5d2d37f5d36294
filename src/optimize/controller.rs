//! Per-function attempt loop
//!
//! Drives `machine::transition` against the injected oracles. Test failures
//! and profiler failures become feedback for the next proposal; only an
//! improvement-oracle error ends the function early.

use super::machine::{transition, Event, Stage};
use super::progress::{Observer, ProgressEvent};
use super::state::{
    percent_change, AttemptState, EndReason, FeedbackKind, FunctionOutcome, FunctionUnit,
    RunContext, FALLBACK_BASELINE_COST,
};
use crate::error::OptimizeError;
use crate::oracle::{ImproveRequest, Oracles, ProfileRequest, TestFailure, TestVerdict};
use crate::util::{strip_code_fences, truncate};

/// Longest failure message carried into feedback; stack traces can be huge.
const MAX_FEEDBACK_MESSAGE_CHARS: usize = 600;

pub struct Controller<'a> {
    context: &'a RunContext,
    oracles: &'a Oracles,
}

impl<'a> Controller<'a> {
    pub fn new(context: &'a RunContext, oracles: &'a Oracles) -> Self {
        Self { context, oracles }
    }

    /// Run the function at `index` from baseline measurement to `Done`.
    pub async fn run(
        &self,
        index: usize,
        test_code: String,
        observer: &mut Observer<'_>,
    ) -> Result<FunctionOutcome, OptimizeError> {
        let unit = &self.context.functions()[index];
        let max_attempts = self.context.settings().max_attempts;
        let mut state = AttemptState::new(unit.source.clone(), test_code);
        let mut stage = Stage::MeasureBaseline;

        while !stage.is_terminal() {
            let event = match stage {
                Stage::MeasureBaseline => {
                    self.measure_baseline(index, unit, &mut state, observer)
                        .await;
                    Event::BaselineMeasured
                }
                Stage::Optimize => {
                    self.propose(unit, &mut state, observer).await?;
                    Event::CandidateProposed
                }
                Stage::RunTests => {
                    if self.run_tests(index, &mut state, observer).await {
                        Event::TestsPassed
                    } else {
                        Event::TestsFailed
                    }
                }
                Stage::MeasureEmissions => {
                    if self.measure_candidate(index, unit, &mut state, observer).await {
                        Event::CostImproved
                    } else {
                        Event::CostNotImproved
                    }
                }
                Stage::Done => break,
            };

            stage = transition(stage, event, state.attempt(), max_attempts).map_err(|source| {
                OptimizeError::InvalidTransition {
                    function: unit.name.clone(),
                    source,
                }
            })?;
            tracing::debug!(function = %unit.name, ?event, ?stage, attempt = state.attempt(), "transition");
        }

        let end = if state.cost_improved {
            EndReason::Improved
        } else {
            EndReason::BudgetExhausted
        };
        let outcome = state.finish(&unit.name, end);
        tracing::info!(
            function = %unit.name,
            attempts = outcome.attempts,
            baseline = outcome.result.baseline_cost,
            best = outcome.result.best_cost,
            end = end.as_str(),
            "function finished"
        );
        observer(&ProgressEvent::FunctionFinished {
            result: &outcome.result,
            attempts: outcome.attempts,
            end,
        });
        Ok(outcome)
    }

    async fn measure_baseline(
        &self,
        index: usize,
        unit: &FunctionUnit,
        state: &mut AttemptState,
        observer: &mut Observer<'_>,
    ) {
        let full_context = self.context.assemble_with(index, state.baseline_code());
        match self.profile(&full_context, &unit.name).await {
            Ok(cost) => {
                tracing::info!(function = %unit.name, cost, "baseline measured");
                state.set_baseline(cost);
                observer(&ProgressEvent::BaselineMeasured { cost });
            }
            Err(err) => {
                let error = format!("{:#}", err);
                tracing::warn!(function = %unit.name, %error, "baseline measurement failed; using fallback");
                state.set_baseline(FALLBACK_BASELINE_COST);
                observer(&ProgressEvent::BaselineFallback {
                    error: &error,
                    fallback: FALLBACK_BASELINE_COST,
                });
            }
        }
    }

    async fn propose(
        &self,
        unit: &FunctionUnit,
        state: &mut AttemptState,
        observer: &mut Observer<'_>,
    ) -> Result<(), OptimizeError> {
        let attempt = state.begin_attempt();
        observer(&ProgressEvent::AttemptStarted {
            attempt,
            max_attempts: self.context.settings().max_attempts,
        });

        let request = ImproveRequest {
            function_name: &unit.name,
            code: state.baseline_code(),
            test_code: state.test_code(),
            feedback: state.feedback(),
        };
        let raw = self
            .oracles
            .improver
            .improve(request)
            .await
            .map_err(|err| OptimizeError::Oracle {
                function: unit.name.clone(),
                attempt,
                message: format!("{:#}", err),
            })?;

        state.candidate_code = strip_code_fences(&raw);
        tracing::debug!(
            function = %unit.name,
            attempt,
            lines = state.candidate_code.lines().count(),
            "candidate proposed"
        );
        Ok(())
    }

    async fn run_tests(
        &self,
        index: usize,
        state: &mut AttemptState,
        observer: &mut Observer<'_>,
    ) -> bool {
        let attempt = state.attempt();
        let full_context = self.context.assemble_with(index, state.candidate_code());

        let verdict = match self
            .oracles
            .tests
            .validate(&full_context, state.test_code())
            .await
        {
            Ok(verdict) => verdict,
            Err(err) => TestVerdict::Failed(TestFailure::new("SandboxError", format!("{:#}", err))),
        };

        match verdict {
            TestVerdict::Passed => {
                observer(&ProgressEvent::TestsPassed { attempt });
                true
            }
            TestVerdict::Failed(failure) => {
                let message = truncate(failure.message.trim(), MAX_FEEDBACK_MESSAGE_CHARS);
                tracing::info!(attempt, kind = %failure.kind, %message, "tests failed");
                state.record_feedback(
                    FeedbackKind::TestFailure,
                    format!("Attempt {}: {}: {}", attempt, failure.kind, message),
                );
                observer(&ProgressEvent::TestsFailed {
                    attempt,
                    kind: &failure.kind,
                    message: &message,
                });
                false
            }
        }
    }

    async fn measure_candidate(
        &self,
        index: usize,
        unit: &FunctionUnit,
        state: &mut AttemptState,
        observer: &mut Observer<'_>,
    ) -> bool {
        let attempt = state.attempt();
        let full_context = self.context.assemble_with(index, state.candidate_code());

        let cost = match self.profile(&full_context, &unit.name).await {
            Ok(cost) => cost,
            Err(err) => {
                let error = truncate(&format!("{:#}", err), MAX_FEEDBACK_MESSAGE_CHARS);
                tracing::warn!(function = %unit.name, attempt, %error, "cost measurement failed");
                state.cost_improved = false;
                state.record_feedback(
                    FeedbackKind::MeasurementError,
                    format!("Attempt {}: cost measurement error: {}", attempt, error),
                );
                observer(&ProgressEvent::CostMeasurementFailed {
                    attempt,
                    error: &error,
                });
                return false;
            }
        };

        let baseline = state.baseline_cost();
        let improved = state.consider_candidate(cost);
        observer(&ProgressEvent::CostMeasured {
            attempt,
            baseline,
            cost,
            improved,
        });

        if !improved {
            state.record_feedback(
                FeedbackKind::NoImprovement,
                format!(
                    "Attempt {}: cost did not improve ({:+.1}%).",
                    attempt,
                    percent_change(baseline, cost)
                ),
            );
        }
        improved
    }

    /// Profile an assembled file and reject values that are not a usable cost.
    async fn profile(&self, full_context: &str, function_name: &str) -> anyhow::Result<f64> {
        let settings = self.context.settings();
        let cost = self
            .oracles
            .profiler
            .measure(ProfileRequest {
                full_context,
                function_name,
                iterations: settings.iterations,
                runtime: &settings.runtime,
            })
            .await?;

        if !cost.is_finite() || cost < 0.0 {
            return Err(anyhow::anyhow!(
                "Profiler reported an unusable cost ({})",
                cost
            ));
        }
        Ok(cost)
    }
}
