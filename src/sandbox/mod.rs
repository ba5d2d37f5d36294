//! Throwaway script directory and Python subprocess execution
//!
//! Every candidate is tested and profiled in a fresh interpreter process. The
//! scripts live under `$TMPDIR/carbonloop-sandbox/<run_id>/` and are removed
//! when the session is dropped unless the run asked to keep them.

pub mod profiler;
pub mod python_tests;

pub use profiler::CodeCarbonProfiler;
pub use python_tests::PythonTestOracle;

use crate::util::{run_command_with_timeout, CommandRunResult};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

const SANDBOX_DIR_NAME: &str = "carbonloop-sandbox";
pub(crate) const REPORT_NONCE_ENV: &str = "CARBONLOOP_REPORT_NONCE";

#[derive(Debug)]
pub struct SandboxSession {
    root: PathBuf,
    keep: bool,
    next_script: AtomicU64,
}

impl SandboxSession {
    pub fn create(run_id: &str, keep: bool) -> Result<Self> {
        Self::create_in(&std::env::temp_dir().join(SANDBOX_DIR_NAME), run_id, keep)
    }

    pub fn create_in(base: &Path, run_id: &str, keep: bool) -> Result<Self> {
        let root = base.join(run_id);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create sandbox '{}'", root.display()))?;
        tracing::debug!(root = %root.display(), "sandbox created");
        Ok(Self {
            root,
            keep,
            next_script: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Environment applied to every interpreter the sandbox starts.
    pub fn env_overrides() -> Vec<(String, String)> {
        vec![
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONHASHSEED".to_string(), "0".to_string()),
        ]
    }

    /// Next unique, ordered script path; nothing is written yet.
    pub fn reserve_script(&self, label: &str) -> PathBuf {
        let seq = self.next_script.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!("{:04}-{}.py", seq, label))
    }

    pub fn write_at(&self, path: &Path, contents: &str) -> Result<()> {
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write sandbox script '{}'", path.display()))
    }

    /// Run `runtime script` from `workdir` on the blocking pool, killing it at `timeout`.
    pub async fn run_python(
        &self,
        runtime: &Path,
        script: &Path,
        workdir: &Path,
        timeout: Duration,
        extra_env: &[(String, String)],
    ) -> Result<CommandRunResult> {
        let mut command = Command::new(runtime);
        command.arg(script).current_dir(workdir);
        for (key, value) in Self::env_overrides().iter().chain(extra_env) {
            command.env(key, value);
        }

        let label = format!("{} {}", runtime.display(), script.display());
        let result = tokio::task::spawn_blocking(move || {
            run_command_with_timeout(&mut command, timeout)
        })
        .await
        .map_err(|e| anyhow!("Sandbox task failed: {}", e))?
        .map_err(|e| anyhow!("{} ({})", e, label))?;

        tracing::debug!(
            command = %label,
            duration_ms = result.duration_ms,
            timed_out = result.timed_out,
            "sandbox command finished"
        );
        Ok(result)
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if self.keep {
            tracing::info!(root = %self.root.display(), "keeping sandbox");
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.root) {
            tracing::warn!(root = %self.root.display(), %err, "failed to remove sandbox");
        }
    }
}

/// Render a Rust string as a Python string literal.
///
/// JSON string syntax is a subset of Python's, so the embedded code survives
/// quotes, backslashes and non-ASCII text byte for byte.
pub(crate) fn python_str_literal(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

/// Side file a sandboxed script writes its result to.
///
/// The script opens the file before any candidate code runs and takes the
/// nonce out of its environment, so candidate output on stdout or a
/// premature `os._exit` cannot stand in for a real result.
#[derive(Debug, Clone)]
pub(crate) struct ReportChannel {
    path: PathBuf,
    nonce: String,
}

#[derive(Deserialize)]
struct Tagged<T> {
    nonce: String,
    #[serde(flatten)]
    body: T,
}

impl ReportChannel {
    pub fn for_script(script: &Path) -> Self {
        Self {
            path: script.with_extension("report.json"),
            nonce: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn env(&self) -> Vec<(String, String)> {
        vec![(REPORT_NONCE_ENV.to_string(), self.nonce.clone())]
    }

    /// The report body, if the file holds one tagged with this channel's nonce.
    pub fn read<T: DeserializeOwned>(&self) -> Option<T> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        self.parse(&text)
    }

    pub fn parse<T: DeserializeOwned>(&self, text: &str) -> Option<T> {
        let tagged: Tagged<T> = serde_json::from_str(text.trim()).ok()?;
        (tagged.nonce == self.nonce).then_some(tagged.body)
    }
}
