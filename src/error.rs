//! Fatal error taxonomy
//!
//! Only failures that end a function (or the whole run) live here. Test
//! failures and profiler failures are recoverable: the controller turns them
//! into feedback entries and they never surface as an `OptimizeError`.

use crate::optimize::machine::TransitionError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptimizeError {
    /// Source could not be split into function units. Fatal for the run.
    #[error("Failed to extract functions: {message}")]
    Extraction { message: String },

    /// No test harness could be obtained for a function.
    #[error("Failed to resolve tests for `{function}`: {message}")]
    SpecResolution { function: String, message: String },

    /// The improvement oracle returned an error, so there is no candidate to validate.
    #[error("Improvement oracle failed for `{function}` on attempt {attempt}: {message}")]
    Oracle {
        function: String,
        attempt: u32,
        message: String,
    },

    #[error("Controller for `{function}` reached an invalid state: {source}")]
    InvalidTransition {
        function: String,
        #[source]
        source: TransitionError,
    },

    #[error("A result for `{0}` was already recorded")]
    DuplicateResult(String),

    #[error("Failed to write output '{}': {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OptimizeError {
    /// Short machine-friendly label, used in the run report and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            OptimizeError::Extraction { .. } => "extraction_failure",
            OptimizeError::SpecResolution { .. } => "spec_resolution_failure",
            OptimizeError::Oracle { .. } => "oracle_failure",
            OptimizeError::InvalidTransition { .. } => "invalid_transition",
            OptimizeError::DuplicateResult(_) => "duplicate_result",
            OptimizeError::Output { .. } => "output_failure",
        }
    }
}
