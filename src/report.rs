//! Console progress, final summary table and the JSON run report

use crate::llm::Usage;
use crate::optimize::progress::ProgressEvent;
use crate::optimize::state::{EndReason, FunctionOutcome, RunSettings, FALLBACK_BASELINE_COST};
use crate::optimize::Summary;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// kg CO2eq rendered as grams with fixed precision.
pub fn format_grams(kg: f64) -> String {
    format!("{:.7}", kg * 1000.0)
}

fn format_change(pct: f64) -> String {
    format!("{:+.1}%", pct)
}

/// Prints run progress for a person watching the terminal.
pub struct ConsoleReporter<W: Write = std::io::Stdout> {
    out: W,
}

impl ConsoleReporter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn observe(&mut self, event: &ProgressEvent<'_>) {
        let _ = self.write_event(event);
    }

    fn write_event(&mut self, event: &ProgressEvent<'_>) -> std::io::Result<()> {
        let out = &mut self.out;
        match event {
            ProgressEvent::FunctionStarted { index, total, name } => {
                writeln!(out)?;
                writeln!(out, "{}", "─".repeat(60))?;
                writeln!(out, "[Function {}/{}] {}", index + 1, total, name)?;
            }
            ProgressEvent::TestsResolved { line_count, .. } => {
                writeln!(out, "  Tests ready ({} lines)", line_count)?;
            }
            ProgressEvent::BaselineMeasured { cost } => {
                writeln!(out, "  Baseline: {} g CO2eq", format_grams(*cost))?;
            }
            ProgressEvent::BaselineFallback { error, fallback } => {
                writeln!(out, "  Baseline measurement failed: {}", error)?;
                writeln!(out, "  Using fallback baseline of {:e} kg CO2eq", fallback)?;
            }
            ProgressEvent::AttemptStarted {
                attempt,
                max_attempts,
            } => {
                writeln!(out)?;
                writeln!(
                    out,
                    "  [Attempt {}/{}] Asking for an optimized version...",
                    attempt, max_attempts
                )?;
            }
            ProgressEvent::TestsPassed { .. } => {
                writeln!(out, "    + Tests passed")?;
            }
            ProgressEvent::TestsFailed { kind, message, .. } => {
                writeln!(out, "    x Tests failed ({}): {}", kind, message)?;
            }
            ProgressEvent::CostMeasured {
                baseline,
                cost,
                improved,
                ..
            } => {
                let pct = crate::optimize::state::percent_change(*baseline, *cost);
                writeln!(
                    out,
                    "    Original  {:>14} g CO2",
                    format_grams(*baseline)
                )?;
                writeln!(
                    out,
                    "    Candidate {:>14} g CO2  {} {}",
                    format_grams(*cost),
                    format_change(pct),
                    if *improved { "+" } else { "x" }
                )?;
            }
            ProgressEvent::CostMeasurementFailed { error, .. } => {
                writeln!(out, "    x Cost measurement failed: {}", error)?;
            }
            ProgressEvent::FunctionFinished { result, .. } => {
                let verdict = if result.improved() {
                    "improved"
                } else {
                    "no improvement"
                };
                writeln!(out)?;
                writeln!(
                    out,
                    "  [{}] {}: {} -> {} g CO2 ({})",
                    result.name,
                    verdict,
                    format_grams(result.baseline_cost),
                    format_grams(result.best_cost),
                    format_change(result.change_pct())
                )?;
            }
        }
        Ok(())
    }
}

/// Final per-function table with totals and, when known, the LLM spend.
pub fn render_summary(summary: &Summary, llm: Option<(u32, &Usage)>) -> String {
    let name_width = summary
        .rows
        .iter()
        .map(|r| r.name.chars().count())
        .max()
        .unwrap_or(0)
        .max("Function".len());

    let mut lines = Vec::new();
    lines.push("Optimization Summary".to_string());
    lines.push(format!(
        "{:<nw$}  {:>18}  {:>18}  {:>11}",
        "Function",
        "Baseline (g CO2)",
        "Optimized (g CO2)",
        "Change",
        nw = name_width
    ));
    for row in &summary.rows {
        let (baseline, best, change) = match (row.baseline_cost, row.best_cost, row.change_pct()) {
            (Some(b), Some(best), Some(pct)) => {
                (format_grams(b), format_grams(best), format_change(pct))
            }
            _ => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        lines.push(format!(
            "{:<nw$}  {:>18}  {:>18}  {:>11}",
            row.name,
            baseline,
            best,
            change,
            nw = name_width
        ));
    }

    if let Some(pct) = summary.overall_change_pct() {
        lines.push(String::new());
        lines.push(format!(
            "Overall: {} -> {} g CO2 ({})",
            format_grams(summary.total_baseline),
            format_grams(summary.total_best),
            format_change(pct)
        ));
    }

    if let Some((calls, usage)) = llm {
        lines.push(format!(
            "LLM: {} calls, {} tokens, ${:.4}",
            calls,
            usage.total_tokens,
            usage.cost()
        ));
    }

    lines.join("\n")
}

/// Machine-readable record of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input: PathBuf,
    pub output: PathBuf,
    pub model: String,
    pub max_attempts: u32,
    pub iterations: u64,
    pub fallback_baseline_cost: f64,
    pub functions: Vec<FunctionOutcome>,
    pub improved_count: usize,
    pub summary: Summary,
    pub llm_calls: u32,
    pub llm_usage: Usage,
}

impl RunReport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: &str,
        started_at: DateTime<Utc>,
        input: &Path,
        output: &Path,
        model: &str,
        settings: &RunSettings,
        functions: Vec<FunctionOutcome>,
        summary: Summary,
        llm: (u32, Usage),
    ) -> Self {
        let improved_count = functions
            .iter()
            .filter(|f| f.end == EndReason::Improved && f.result.improved())
            .count();
        Self {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            model: model.to_string(),
            max_attempts: settings.max_attempts,
            iterations: settings.iterations,
            fallback_baseline_cost: FALLBACK_BASELINE_COST,
            functions,
            improved_count,
            summary,
            llm_calls: llm.0,
            llm_usage: llm.1,
        }
    }
}

/// Where to write the report: the requested path, resolved against the
/// input's directory, or a timestamped file under `.carbonloop/`.
pub fn report_path(requested: Option<&Path>, input: &Path, run_id: &str) -> PathBuf {
    let base = input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    match requested {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => base.join(path),
        None => {
            let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
            let short = run_id.chars().take(8).collect::<String>();
            base.join(".carbonloop")
                .join(format!("run-{}-{}.json", timestamp, short))
        }
    }
}

pub fn write_report_json<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory '{}'", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(report)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report '{}'", path.display()))?;
    Ok(())
}
