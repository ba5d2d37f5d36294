//! Stage graph of the per-function optimization loop
//!
//! ```text
//! MeasureBaseline -> Optimize -> RunTests -> MeasureEmissions -> Done
//!                       ^           |               |
//!                       +-----------+---------------+   (while budget remains)
//! ```
//!
//! `transition` is pure so the graph can be checked without any oracle.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    MeasureBaseline,
    Optimize,
    RunTests,
    MeasureEmissions,
    Done,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done)
    }
}

/// Outcome of the work done in a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Baseline cost is known (measured or fallback).
    BaselineMeasured,
    CandidateProposed,
    TestsPassed,
    TestsFailed,
    CostImproved,
    /// Candidate was no cheaper than the baseline, or could not be measured.
    CostNotImproved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event {event:?} is not valid in stage {stage:?}")]
pub struct TransitionError {
    pub stage: Stage,
    pub event: Event,
}

/// Next stage after `event` fired in `stage`, given `attempt` proposals so far.
pub fn transition(
    stage: Stage,
    event: Event,
    attempt: u32,
    max_attempts: u32,
) -> Result<Stage, TransitionError> {
    let retry_or_stop = if attempt < max_attempts {
        Stage::Optimize
    } else {
        Stage::Done
    };

    match (stage, event) {
        (Stage::MeasureBaseline, Event::BaselineMeasured) => Ok(retry_or_stop),
        (Stage::Optimize, Event::CandidateProposed) => Ok(Stage::RunTests),
        (Stage::RunTests, Event::TestsPassed) => Ok(Stage::MeasureEmissions),
        (Stage::RunTests, Event::TestsFailed) => Ok(retry_or_stop),
        (Stage::MeasureEmissions, Event::CostImproved) => Ok(Stage::Done),
        (Stage::MeasureEmissions, Event::CostNotImproved) => Ok(retry_or_stop),
        _ => Err(TransitionError { stage, event }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_leads_to_first_attempt() {
        assert_eq!(
            transition(Stage::MeasureBaseline, Event::BaselineMeasured, 0, 5),
            Ok(Stage::Optimize)
        );
    }

    #[test]
    fn zero_budget_skips_straight_to_done() {
        assert_eq!(
            transition(Stage::MeasureBaseline, Event::BaselineMeasured, 0, 0),
            Ok(Stage::Done)
        );
    }

    #[test]
    fn proposal_always_goes_to_tests() {
        assert_eq!(
            transition(Stage::Optimize, Event::CandidateProposed, 5, 5),
            Ok(Stage::RunTests)
        );
    }

    #[test]
    fn failed_tests_retry_until_budget() {
        assert_eq!(
            transition(Stage::RunTests, Event::TestsFailed, 4, 5),
            Ok(Stage::Optimize)
        );
        assert_eq!(
            transition(Stage::RunTests, Event::TestsFailed, 5, 5),
            Ok(Stage::Done)
        );
    }

    #[test]
    fn passing_tests_are_always_measured() {
        assert_eq!(
            transition(Stage::RunTests, Event::TestsPassed, 5, 5),
            Ok(Stage::MeasureEmissions)
        );
    }

    #[test]
    fn improvement_ends_the_loop_even_with_budget_left() {
        assert_eq!(
            transition(Stage::MeasureEmissions, Event::CostImproved, 1, 5),
            Ok(Stage::Done)
        );
    }

    #[test]
    fn non_improvement_retries_until_budget() {
        assert_eq!(
            transition(Stage::MeasureEmissions, Event::CostNotImproved, 2, 5),
            Ok(Stage::Optimize)
        );
        assert_eq!(
            transition(Stage::MeasureEmissions, Event::CostNotImproved, 5, 5),
            Ok(Stage::Done)
        );
    }

    #[test]
    fn out_of_place_events_are_rejected() {
        let err = transition(Stage::Optimize, Event::TestsPassed, 1, 5).unwrap_err();
        assert_eq!(err.stage, Stage::Optimize);
        assert_eq!(err.event, Event::TestsPassed);
        assert!(transition(Stage::Done, Event::CandidateProposed, 1, 5).is_err());
        assert!(transition(Stage::MeasureBaseline, Event::CostImproved, 0, 5).is_err());
    }
}
