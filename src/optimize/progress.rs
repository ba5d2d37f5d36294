use super::state::{EndReason, FunctionResult};

/// Observable step of a run, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent<'a> {
    FunctionStarted {
        index: usize,
        total: usize,
        name: &'a str,
    },
    TestsResolved {
        name: &'a str,
        line_count: usize,
    },
    BaselineMeasured {
        cost: f64,
    },
    BaselineFallback {
        error: &'a str,
        fallback: f64,
    },
    AttemptStarted {
        attempt: u32,
        max_attempts: u32,
    },
    TestsPassed {
        attempt: u32,
    },
    TestsFailed {
        attempt: u32,
        kind: &'a str,
        message: &'a str,
    },
    CostMeasured {
        attempt: u32,
        baseline: f64,
        cost: f64,
        improved: bool,
    },
    CostMeasurementFailed {
        attempt: u32,
        error: &'a str,
    },
    FunctionFinished {
        result: &'a FunctionResult,
        attempts: u32,
        end: EndReason,
    },
}

/// Callback the driver and controller report progress through.
pub type Observer<'o> = dyn FnMut(&ProgressEvent<'_>) + Send + 'o;
