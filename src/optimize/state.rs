//! Run-wide context, per-function attempt state and terminal results

use crate::error::OptimizeError;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_ITERATIONS: u64 = 1_000_000;

/// Cost recorded when the baseline cannot be profiled. Any real measurement
/// of a candidate lands above it, so the function keeps its original code.
pub const FALLBACK_BASELINE_COST: f64 = 1e-10;

/// One top-level function, in file order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionUnit {
    pub name: String,
    pub source: String,
}

impl FunctionUnit {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Knobs that stay fixed for a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub max_attempts: u32,
    /// Calls per profiler run.
    pub iterations: u64,
    /// Interpreter the profiler and test oracle execute candidates with.
    pub runtime: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            iterations: DEFAULT_ITERATIONS,
            runtime: PathBuf::from("python3"),
        }
    }
}

/// Everything the driver needs about the input file. Read-only once built.
#[derive(Debug, Clone)]
pub struct RunContext {
    input_path: PathBuf,
    functions: Vec<FunctionUnit>,
    preamble: String,
    raw_tests: Option<String>,
    settings: RunSettings,
}

impl RunContext {
    pub fn new(
        input_path: impl Into<PathBuf>,
        functions: Vec<FunctionUnit>,
        preamble: impl Into<String>,
        raw_tests: Option<String>,
        settings: RunSettings,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            functions,
            preamble: preamble.into(),
            raw_tests: raw_tests.filter(|t| !t.trim().is_empty()),
            settings,
        }
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn functions(&self) -> &[FunctionUnit] {
        &self.functions
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    pub fn raw_tests(&self) -> Option<&str> {
        self.raw_tests.as_deref()
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Whole-file source with the function at `index` replaced by `replacement`.
    ///
    /// Sibling functions keep their original source so cross-function calls
    /// resolve while a candidate is tested or profiled.
    pub fn assemble_with(&self, index: usize, replacement: &str) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.functions.len() + 1);
        if !self.preamble.is_empty() {
            parts.push(&self.preamble);
        }
        for (i, func) in self.functions.iter().enumerate() {
            if i == index {
                parts.push(replacement);
            } else {
                parts.push(&func.source);
            }
        }
        parts.join("\n\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    TestFailure,
    MeasurementError,
    NoImprovement,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackEntry {
    pub attempt: u32,
    pub kind: FeedbackKind,
    pub text: String,
}

/// Append-only record of why earlier attempts were rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeedbackLog {
    entries: Vec<FeedbackEntry>,
}

impl FeedbackLog {
    pub fn push(&mut self, attempt: u32, kind: FeedbackKind, text: impl Into<String>) {
        debug_assert!(
            self.entries.last().is_none_or(|last| last.attempt < attempt),
            "feedback must be recorded at most once per attempt, in order"
        );
        self.entries.push(FeedbackEntry {
            attempt,
            kind,
            text: text.into(),
        });
    }

    pub fn entries(&self) -> &[FeedbackEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One `- reason` line per entry; empty when nothing has failed yet.
    pub fn bullets(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("- {}", e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Signed percentage change from `baseline` to `value`; 0 when the baseline is not positive.
pub fn percent_change(baseline: f64, value: f64) -> f64 {
    if baseline > 0.0 {
        (value - baseline) / baseline * 100.0
    } else {
        0.0
    }
}

/// Mutable state of one controller run. Dropped once the function is done.
#[derive(Debug, Clone)]
pub struct AttemptState {
    baseline_code: String,
    test_code: String,
    pub(crate) candidate_code: String,
    attempt: u32,
    feedback: FeedbackLog,
    best_code: String,
    best_cost: f64,
    baseline_cost: f64,
    pub(crate) cost_improved: bool,
}

impl AttemptState {
    pub fn new(baseline_code: impl Into<String>, test_code: impl Into<String>) -> Self {
        let baseline_code = baseline_code.into();
        Self {
            candidate_code: String::new(),
            attempt: 0,
            feedback: FeedbackLog::default(),
            best_code: baseline_code.clone(),
            best_cost: f64::INFINITY,
            baseline_cost: f64::INFINITY,
            baseline_code,
            test_code: test_code.into(),
            cost_improved: false,
        }
    }

    pub fn baseline_code(&self) -> &str {
        &self.baseline_code
    }

    pub fn test_code(&self) -> &str {
        &self.test_code
    }

    pub fn candidate_code(&self) -> &str {
        &self.candidate_code
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn feedback(&self) -> &FeedbackLog {
        &self.feedback
    }

    pub fn best_code(&self) -> &str {
        &self.best_code
    }

    pub fn best_cost(&self) -> f64 {
        self.best_cost
    }

    pub fn baseline_cost(&self) -> f64 {
        self.baseline_cost
    }

    /// Whether the latest measured candidate beat the baseline.
    pub fn cost_improved(&self) -> bool {
        self.cost_improved
    }

    pub(crate) fn set_baseline(&mut self, cost: f64) {
        self.baseline_cost = cost;
        self.best_cost = cost;
        self.best_code = self.baseline_code.clone();
    }

    /// Start a new attempt; returns its 1-based number.
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.cost_improved = false;
        self.attempt
    }

    pub(crate) fn record_feedback(&mut self, kind: FeedbackKind, text: impl Into<String>) {
        self.feedback.push(self.attempt, kind, text);
    }

    /// Classify a validated candidate's cost and keep it if it is the new best.
    ///
    /// Both comparisons are strict: a tie with the baseline is not an
    /// improvement and a tie with the incumbent does not replace it.
    pub(crate) fn consider_candidate(&mut self, cost: f64) -> bool {
        let improved = cost < self.baseline_cost;
        if improved && cost < self.best_cost {
            self.best_cost = cost;
            self.best_code = self.candidate_code.clone();
        }
        self.cost_improved = improved;
        improved
    }

    pub(crate) fn finish(self, name: &str, end: EndReason) -> FunctionOutcome {
        FunctionOutcome {
            result: FunctionResult {
                name: name.to_string(),
                baseline_cost: self.baseline_cost,
                best_code: self.best_code,
                best_cost: self.best_cost,
            },
            attempts: self.attempt,
            feedback: self.feedback,
            end,
        }
    }
}

/// Terminal record for one function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResult {
    pub name: String,
    pub baseline_cost: f64,
    pub best_code: String,
    pub best_cost: f64,
}

impl FunctionResult {
    pub fn improved(&self) -> bool {
        self.best_cost < self.baseline_cost
    }

    pub fn change_pct(&self) -> f64 {
        percent_change(self.baseline_cost, self.best_cost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A validated candidate beat the baseline.
    Improved,
    /// The attempt budget ran out first.
    BudgetExhausted,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Improved => "improved",
            EndReason::BudgetExhausted => "budget_exhausted",
        }
    }
}

/// A function's result plus how the controller got there.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionOutcome {
    pub result: FunctionResult,
    pub attempts: u32,
    pub feedback: FeedbackLog,
    pub end: EndReason,
}

/// Results keyed by function name, kept in the order they were recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FunctionResults {
    entries: Vec<FunctionResult>,
}

impl FunctionResults {
    /// Record a result. A name can only be written once.
    pub fn record(&mut self, result: FunctionResult) -> Result<(), OptimizeError> {
        if self.get(&result.name).is_some() {
            return Err(OptimizeError::DuplicateResult(result.name));
        }
        self.entries.push(result);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FunctionResult> {
        self.entries.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionResult> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
