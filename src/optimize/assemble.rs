//! Output assembly
//!
//! Rebuilds the input file from the preamble and each function's best code,
//! and derives the per-function summary shown at the end of a run.

use super::state::{percent_change, FunctionResults, RunContext};
use crate::error::OptimizeError;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Full optimized file: preamble, then every function in extraction order.
///
/// A function without a recorded result keeps its original source. The
/// output depends only on its inputs, so repeated calls are byte-identical.
pub fn assemble_output(context: &RunContext, results: &FunctionResults) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(context.function_count() + 1);
    if !context.preamble().is_empty() {
        parts.push(context.preamble());
    }
    for func in context.functions() {
        let code = results
            .get(&func.name)
            .map(|r| r.best_code.as_str())
            .unwrap_or(func.source.as_str());
        parts.push(code);
    }
    let mut output = parts.join("\n\n");
    output.push('\n');
    output
}

/// `<stem>_optimized.<ext>` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let file_name = match input.extension() {
        Some(ext) => format!("{}_optimized.{}", stem, ext.to_string_lossy()),
        None => format!("{}_optimized", stem),
    };
    input.with_file_name(file_name)
}

/// Write the artifact, replacing whatever was at `path`.
pub fn write_artifact(path: &Path, content: &str) -> Result<(), OptimizeError> {
    let to_output_error = |source| OptimizeError::Output {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(to_output_error)?;
    }
    std::fs::write(path, content).map_err(to_output_error)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub name: String,
    /// `None` when the function has no recorded result.
    pub baseline_cost: Option<f64>,
    pub best_cost: Option<f64>,
}

impl SummaryRow {
    pub fn improved(&self) -> bool {
        matches!((self.baseline_cost, self.best_cost), (Some(b), Some(best)) if best < b)
    }

    pub fn change_pct(&self) -> Option<f64> {
        match (self.baseline_cost, self.best_cost) {
            (Some(b), Some(best)) => Some(percent_change(b, best)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub rows: Vec<SummaryRow>,
    pub total_baseline: f64,
    pub total_best: f64,
}

impl Summary {
    /// Overall change, only meaningful when something was measured.
    pub fn overall_change_pct(&self) -> Option<f64> {
        (self.total_baseline > 0.0).then(|| percent_change(self.total_baseline, self.total_best))
    }
}

pub fn summarize(context: &RunContext, results: &FunctionResults) -> Summary {
    let mut rows = Vec::with_capacity(context.function_count());
    let mut total_baseline = 0.0;
    let mut total_best = 0.0;

    for func in context.functions() {
        match results.get(&func.name) {
            Some(result) => {
                total_baseline += result.baseline_cost;
                total_best += result.best_cost;
                rows.push(SummaryRow {
                    name: func.name.clone(),
                    baseline_cost: Some(result.baseline_cost),
                    best_cost: Some(result.best_cost),
                });
            }
            None => rows.push(SummaryRow {
                name: func.name.clone(),
                baseline_cost: None,
                best_cost: None,
            }),
        }
    }

    Summary {
        rows,
        total_baseline,
        total_best,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::state::{FunctionResult, FunctionUnit, RunSettings};

    fn context() -> RunContext {
        RunContext::new(
            "/tmp/work/train.py",
            vec![
                FunctionUnit::new("f", "def f():\n    return sum([1, 2])"),
                FunctionUnit::new("g", "def g():\n    return 2"),
            ],
            "import random",
            None,
            RunSettings::default(),
        )
    }

    fn results() -> FunctionResults {
        let mut results = FunctionResults::default();
        results
            .record(FunctionResult {
                name: "f".to_string(),
                baseline_cost: 10.0,
                best_code: "def f():\n    return 3".to_string(),
                best_cost: 7.0,
            })
            .unwrap();
        results
    }

    #[test]
    fn assemble_uses_best_code_and_falls_back_to_source() {
        let out = assemble_output(&context(), &results());
        assert_eq!(
            out,
            "import random\n\ndef f():\n    return 3\n\ndef g():\n    return 2\n"
        );
    }

    #[test]
    fn assemble_is_idempotent() {
        let ctx = context();
        let res = results();
        assert_eq!(assemble_output(&ctx, &res), assemble_output(&ctx, &res));
    }

    #[test]
    fn default_output_path_appends_suffix() {
        assert_eq!(
            default_output_path(Path::new("/tmp/work/train.py")),
            PathBuf::from("/tmp/work/train_optimized.py")
        );
        assert_eq!(
            default_output_path(Path::new("script")),
            PathBuf::from("script_optimized")
        );
    }

    #[test]
    fn write_artifact_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.py");
        write_artifact(&path, "old\n").unwrap();
        write_artifact(&path, "new\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
    }

    #[test]
    fn summary_totals_and_missing_rows() {
        let summary = summarize(&context(), &results());
        assert_eq!(summary.rows.len(), 2);
        assert!(summary.rows[0].improved());
        assert!((summary.rows[0].change_pct().unwrap() + 30.0).abs() < 1e-9);
        assert_eq!(summary.rows[1].baseline_cost, None);
        assert_eq!(summary.rows[1].change_pct(), None);
        assert_eq!(summary.total_baseline, 10.0);
        assert_eq!(summary.total_best, 7.0);
        assert!((summary.overall_change_pct().unwrap() + 30.0).abs() < 1e-9);
    }

    #[test]
    fn overall_change_hidden_without_baseline() {
        let summary = summarize(&context(), &FunctionResults::default());
        assert_eq!(summary.overall_change_pct(), None);
    }
}
