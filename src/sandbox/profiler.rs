use super::{python_str_literal, ReportChannel, SandboxSession, REPORT_NONCE_ENV};
use crate::oracle::{CostProfiler, ProfileRequest};
use crate::util::{tail_chars, CommandRunResult};
use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const STDERR_TAIL_CHARS: usize = 1_000;
const STDOUT_TAIL_CHARS: usize = 500;

/// Measures kg CO2eq for `iterations` zero-argument calls under CodeCarbon.
pub struct CodeCarbonProfiler {
    session: Arc<SandboxSession>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CodeCarbonProfiler {
    pub fn new(session: Arc<SandboxSession>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            session,
            workdir: workdir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CostProfiler for CodeCarbonProfiler {
    async fn measure(&self, request: ProfileRequest<'_>) -> anyhow::Result<f64> {
        let path = self
            .session
            .reserve_script(&format!("profile-{}", request.function_name));
        let channel = ReportChannel::for_script(&path);
        let script = runner_script(
            request.full_context,
            request.function_name,
            request.iterations,
            &self.workdir.to_string_lossy(),
            &channel.path().to_string_lossy(),
        );
        self.session.write_at(&path, &script)?;
        let result = self
            .session
            .run_python(request.runtime, &path, &self.workdir, self.timeout, &channel.env())
            .await?;
        let report = parse_report(&result, channel.read(), self.timeout)?;
        tracing::debug!(
            function = request.function_name,
            emissions = report.emissions,
            energy = report.energy,
            "profiled"
        );
        Ok(report.emissions)
    }
}

pub(crate) fn runner_script(
    full_context: &str,
    function_name: &str,
    iterations: u64,
    workdir: &str,
    report_path: &str,
) -> String {
    format!(
        r#"import json, os, sys
sys.path.insert(0, {workdir})
from codecarbon import EmissionsTracker

_SOURCE = {source}


def _main(report_file, nonce):
    namespace = {{"__name__": "__carbonloop__"}}
    exec(compile(_SOURCE, "<candidate>", "exec"), namespace)
    target = namespace[{name}]

    tracker = EmissionsTracker(
        project_name="carbonloop",
        log_level="ERROR",
        save_to_file=False,
        save_to_api=False,
        save_to_logger=False,
    )
    tracker.start()
    try:
        for _ in range({iterations}):
            target()
    finally:
        tracker.stop()

    emissions = tracker.final_emissions or 0.0
    energy = 0.0
    if tracker.final_emissions_data:
        energy = tracker.final_emissions_data.energy_consumed or 0.0
    report_file.write(json.dumps({{"nonce": nonce, "emissions": emissions, "energy": energy}}))
    report_file.flush()


_main(open({report_path}, "w"), os.environ.pop({nonce_env}, ""))
"#,
        workdir = python_str_literal(workdir),
        source = python_str_literal(full_context),
        name = python_str_literal(function_name),
        iterations = iterations,
        report_path = python_str_literal(report_path),
        nonce_env = python_str_literal(REPORT_NONCE_ENV),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub(crate) struct EmissionsReport {
    /// kg CO2eq
    pub emissions: f64,
    /// kWh
    #[serde(default)]
    pub energy: f64,
}

pub(crate) fn parse_report(
    result: &CommandRunResult,
    report: Option<EmissionsReport>,
    timeout: Duration,
) -> anyhow::Result<EmissionsReport> {
    if result.timed_out {
        return Err(anyhow!(
            "Profiler timed out after {}s",
            timeout.as_secs()
        ));
    }
    if !result.success() {
        return Err(anyhow!(
            "Subprocess error:\n{}",
            tail_chars(result.stderr.trim(), STDERR_TAIL_CHARS)
        ));
    }

    report.ok_or_else(|| {
        anyhow!(
            "No emissions report from profiler.\nstdout: {}",
            tail_chars(&result.stdout, STDOUT_TAIL_CHARS)
        )
    })
}
