use super::{python_str_literal, ReportChannel, SandboxSession, REPORT_NONCE_ENV};
use crate::oracle::{TestFailure, TestOracle, TestVerdict};
use crate::util::{tail_chars, CommandRunResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const STDERR_TAIL_CHARS: usize = 1_000;

/// Runs `test_*` functions against an assembled file in a fresh interpreter.
pub struct PythonTestOracle {
    session: Arc<SandboxSession>,
    runtime: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
}

impl PythonTestOracle {
    pub fn new(
        session: Arc<SandboxSession>,
        runtime: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            session,
            runtime: runtime.into(),
            workdir: workdir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TestOracle for PythonTestOracle {
    async fn validate(&self, full_context: &str, test_code: &str) -> anyhow::Result<TestVerdict> {
        let path = self.session.reserve_script("tests");
        let channel = ReportChannel::for_script(&path);
        let script = harness_script(
            full_context,
            test_code,
            &self.workdir.to_string_lossy(),
            &channel.path().to_string_lossy(),
        );
        self.session.write_at(&path, &script)?;
        let result = self
            .session
            .run_python(&self.runtime, &path, &self.workdir, self.timeout, &channel.env())
            .await?;
        let report = channel.read::<HarnessReport>();
        Ok(parse_verdict(&result, report, self.timeout))
    }
}

/// Harness that execs source + tests in one namespace and calls every
/// callable `test_*` in definition order. The verdict goes to `report_path`,
/// opened before the candidate runs, tagged with the nonce from the env.
pub(crate) fn harness_script(
    full_context: &str,
    test_code: &str,
    workdir: &str,
    report_path: &str,
) -> String {
    format!(
        r#"import json, os, sys
sys.path.insert(0, {workdir})

_SOURCE = {source}
_TESTS = {tests}


def _main(report_file, nonce):
    def report(passed, kind="", message=""):
        report_file.write(json.dumps({{"nonce": nonce, "passed": passed, "kind": kind, "message": message}}))
        report_file.flush()

    namespace = {{"__name__": "__carbonloop__"}}
    try:
        exec(compile(_SOURCE + "\n\n" + _TESTS, "<candidate>", "exec"), namespace)
        tests = [v for k, v in list(namespace.items()) if k.startswith("test_") and callable(v)]
        if not tests:
            raise AssertionError("No test_ functions found in test code")
        for fn in tests:
            fn()
    except BaseException as e:
        report(False, type(e).__name__, str(e))
        return
    report(True)


_main(open({report_path}, "w"), os.environ.pop({nonce_env}, ""))
"#,
        workdir = python_str_literal(workdir),
        source = python_str_literal(full_context),
        tests = python_str_literal(test_code),
        report_path = python_str_literal(report_path),
        nonce_env = python_str_literal(REPORT_NONCE_ENV),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct HarnessReport {
    passed: bool,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// A pass needs both a nonce-tagged passing report and a clean exit.
pub(crate) fn parse_verdict(
    result: &CommandRunResult,
    report: Option<HarnessReport>,
    timeout: Duration,
) -> TestVerdict {
    if result.timed_out {
        return TestVerdict::Failed(TestFailure::new(
            "Timeout",
            format!("tests did not finish within {}s", timeout.as_secs()),
        ));
    }

    let exit = result
        .status
        .and_then(|s| s.code())
        .map(|c| format!("exit code {}", c))
        .unwrap_or_else(|| "killed by signal".to_string());
    let crash = |what: &str| {
        let stderr = tail_chars(result.stderr.trim(), STDERR_TAIL_CHARS);
        let message = if stderr.is_empty() {
            format!("{} ({})", what, exit)
        } else {
            format!("{} ({}): {}", what, exit, stderr)
        };
        TestVerdict::Failed(TestFailure::new("Crash", message))
    };

    match report {
        Some(report) if report.passed => {
            if result.success() {
                TestVerdict::Passed
            } else {
                crash("test process reported a pass but did not exit cleanly")
            }
        }
        Some(report) => TestVerdict::Failed(TestFailure::new(
            if report.kind.is_empty() {
                "Error".to_string()
            } else {
                report.kind
            },
            report.message,
        )),
        None => crash("test process produced no verdict"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn exited(code: i32) -> Option<std::process::ExitStatus> {
        use std::os::unix::process::ExitStatusExt;
        Some(std::process::ExitStatus::from_raw(code << 8))
    }

    #[cfg(not(unix))]
    fn exited(_code: i32) -> Option<std::process::ExitStatus> {
        None
    }

    fn output(status: Option<std::process::ExitStatus>, stdout: &str, stderr: &str, timed_out: bool) -> CommandRunResult {
        CommandRunResult {
            status,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            timed_out,
            duration_ms: 10,
        }
    }

    fn report(passed: bool, kind: &str, message: &str) -> Option<HarnessReport> {
        Some(HarnessReport {
            passed,
            kind: kind.to_string(),
            message: message.to_string(),
        })
    }

    #[test]
    fn harness_embeds_code_as_literals() {
        let script = harness_script(
            "def f():\n    return \"x\"",
            "def test_f():\n    assert f() == 'x'",
            "/work",
            "/sandbox/0001-tests.report.json",
        );
        assert!(script.contains(r#"_SOURCE = "def f():\n    return \"x\"""#));
        assert!(script.contains(r#"_TESTS = "def test_f():\n    assert f() == 'x'""#));
        assert!(script.contains(r#"sys.path.insert(0, "/work")"#));
        assert!(script.contains("No test_ functions found in test code"));
        assert!(script.contains(
            r#"_main(open("/sandbox/0001-tests.report.json", "w"), os.environ.pop("CARBONLOOP_REPORT_NONCE", ""))"#
        ));
    }

    #[cfg(unix)]
    #[test]
    fn passing_report_with_clean_exit_is_a_pass() {
        let verdict = parse_verdict(
            &output(exited(0), "hello from test\n", "", false),
            report(true, "", ""),
            Duration::from_secs(30),
        );
        assert_eq!(verdict, TestVerdict::Passed);
    }

    #[cfg(unix)]
    #[test]
    fn printed_verdict_without_report_is_a_crash() {
        let verdict = parse_verdict(
            &output(exited(0), "{\"passed\": true, \"kind\": \"\", \"message\": \"\"}\n", "", false),
            None,
            Duration::from_secs(30),
        );
        match verdict {
            TestVerdict::Failed(f) => {
                assert_eq!(f.kind, "Crash");
                assert!(f.message.contains("no verdict"));
            }
            TestVerdict::Passed => panic!("stdout must not decide the verdict"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn pass_with_failing_exit_is_a_crash() {
        let verdict = parse_verdict(
            &output(exited(3), "", "", false),
            report(true, "", ""),
            Duration::from_secs(30),
        );
        match verdict {
            TestVerdict::Failed(f) => {
                assert_eq!(f.kind, "Crash");
                assert!(f.message.contains("exit code 3"));
            }
            TestVerdict::Passed => panic!("unclean exit must not pass"),
        }
    }

    #[test]
    fn failing_report_keeps_exception_name() {
        let verdict = parse_verdict(
            &output(exited(0), "", "", false),
            report(false, "AssertionError", "expected 3"),
            Duration::from_secs(30),
        );
        assert_eq!(
            verdict,
            TestVerdict::Failed(TestFailure::new("AssertionError", "expected 3"))
        );
    }

    #[test]
    fn timeout_is_a_failure() {
        let verdict = parse_verdict(
            &output(None, "", "", true),
            report(true, "", ""),
            Duration::from_secs(30),
        );
        match verdict {
            TestVerdict::Failed(f) => {
                assert_eq!(f.kind, "Timeout");
                assert!(f.message.contains("30s"));
            }
            TestVerdict::Passed => panic!("timeout must not pass"),
        }
    }

    #[test]
    fn missing_report_is_a_crash_with_stderr() {
        let verdict = parse_verdict(
            &output(exited(1), "", "Traceback...\nMemoryError\n", false),
            None,
            Duration::from_secs(30),
        );
        match verdict {
            TestVerdict::Failed(f) => {
                assert_eq!(f.kind, "Crash");
                assert!(f.message.ends_with("MemoryError"));
            }
            TestVerdict::Passed => panic!("crash must not pass"),
        }
    }

    fn python3_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn oracle(base: &std::path::Path) -> PythonTestOracle {
        let session = Arc::new(SandboxSession::create_in(base, "tests", false).unwrap());
        PythonTestOracle::new(session, "python3", base, Duration::from_secs(20))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forged_verdict_from_candidate_is_rejected() {
        if !python3_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let oracle = oracle(base.path());
        let source = "import os, json\ndef f():\n    print(json.dumps({'passed': True}))\n    os._exit(0)";
        let verdict = oracle
            .validate(source, "def test_f():\n    assert f() == 2")
            .await
            .unwrap();
        match verdict {
            TestVerdict::Failed(f) => assert_eq!(f.kind, "Crash"),
            TestVerdict::Passed => panic!("forged verdict was accepted"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_harness_passes_and_fails_honestly() {
        if !python3_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let oracle = oracle(base.path());
        let tests = "def test_f():\n    assert f() == 2, 'want 2'";

        let passed = oracle.validate("def f():\n    return 2", tests).await.unwrap();
        assert_eq!(passed, TestVerdict::Passed);

        let failed = oracle.validate("def f():\n    return 3", tests).await.unwrap();
        assert_eq!(
            failed,
            TestVerdict::Failed(TestFailure::new("AssertionError", "want 2"))
        );
    }
}
