use regex::Regex;
use std::io::{BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Truncate to `max` characters, marking the cut with `...` (Unicode-safe).
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep the last `max_chars` characters; subprocess errors live at the end of the output.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}

fn fenced_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)\r?\n[ \t]*```").ok())
        .as_ref()
}

/// Strip markdown code fences a model wrapped around its code.
///
/// A response that opens with a fence loses the opening and closing fence
/// lines. A response with prose around a single fenced block is reduced to
/// the block. Anything else is returned trimmed.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        let mut lines: Vec<&str> = trimmed.lines().collect();
        lines.remove(0);
        if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
            lines.pop();
        }
        return lines.join("\n").trim().to_string();
    }

    if let Some(captures) = fenced_block_regex().and_then(|re| re.captures(trimmed)) {
        if let Some(body) = captures.get(1) {
            return body.as_str().trim().to_string();
        }
    }

    trimmed.to_string()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

/// Bytes kept per stream; older output is dropped so only the tail survives.
pub const MAX_CAPTURE_BYTES: usize = 256 * 1024;

/// How long to wait for the pipes to drain once the child itself is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Output captured by a reader thread, readable before the stream closes.
struct TailCapture {
    bytes: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl TailCapture {
    fn spawn<R: Read + Send + 'static>(source: R) -> Self {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&bytes);
        thread::spawn(move || {
            let mut reader = BufReader::new(source);
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let Ok(mut kept) = sink.lock() else { break };
                        kept.extend_from_slice(&chunk[..n]);
                        if kept.len() > MAX_CAPTURE_BYTES {
                            let excess = kept.len() - MAX_CAPTURE_BYTES;
                            kept.drain(..excess);
                        }
                    }
                }
            }
            let _ = tx.send(());
        });
        Self { bytes, done }
    }

    /// Wait until `deadline` for the stream to close, then take what arrived.
    fn finish(self, deadline: Instant) -> String {
        let _ = self
            .done
            .recv_timeout(deadline.saturating_duration_since(Instant::now()));
        let bytes = match self.bytes.lock() {
            Ok(mut kept) => std::mem::take(&mut *kept),
            Err(_) => Vec::new(),
        };
        String::from_utf8_lossy(&bytes).to_string()
    }
}

/// Kill the child and everything it spawned into its process group.
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    let group = format!("-{}", child.id());
    let _ = Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Run a command to completion, killing it once `timeout` elapses.
///
/// On unix the child leads its own process group, so a timeout also takes
/// down anything it forked. Captured output keeps the last
/// [`MAX_CAPTURE_BYTES`] of each stream.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout = TailCapture::spawn(stdout);
    let stderr = TailCapture::spawn(stderr);

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    kill_process_tree(&mut child);
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                kill_process_tree(&mut child);
                return Err(format!("Failed to wait for command: {}", e));
            }
        }
    };

    // Leftover background processes in the group would hold the pipes open.
    if !timed_out {
        kill_process_tree(&mut child);
    }
    // One that left the group (setsid) is not waited on past the grace period.
    let drain_deadline = Instant::now() + PIPE_DRAIN_GRACE;
    let stdout = stdout.finish(drain_deadline);
    let stderr = stderr.finish(drain_deadline);

    Ok(CommandRunResult {
        status,
        stdout,
        stderr,
        timed_out,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_adds_ellipsis() {
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 2), "ab");
        assert_eq!(truncate("abc", 0), "");
    }

    #[test]
    fn tail_chars_is_unicode_safe() {
        assert_eq!(tail_chars("错误: 失败", 2), "失败");
        assert_eq!(tail_chars("ok", 10), "ok");
    }

    #[test]
    fn strip_code_fences_removes_language_fence() {
        let raw = "```python\ndef f():\n    return 1\n```";
        assert_eq!(strip_code_fences(raw), "def f():\n    return 1");
    }

    #[test]
    fn strip_code_fences_handles_missing_closing_fence() {
        let raw = "```\ndef f():\n    return 1\n";
        assert_eq!(strip_code_fences(raw), "def f():\n    return 1");
    }

    #[test]
    fn strip_code_fences_extracts_block_from_prose() {
        let raw = "Here is a faster version:\n\n```py\ndef f():\n    return 2\n```\n\nIt avoids the loop.";
        assert_eq!(strip_code_fences(raw), "def f():\n    return 2");
    }

    #[test]
    fn strip_code_fences_leaves_plain_code() {
        let raw = "  def f():\n    return 3\n";
        assert_eq!(strip_code_fences(raw), "def f():\n    return 3");
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_kills_slow_commands() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let result = run_command_with_timeout(&mut command, Duration::from_millis(200)).unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_captures_stdout() {
        let mut command = Command::new("echo");
        command.arg("carbon");
        let result = run_command_with_timeout(&mut command, Duration::from_secs(5)).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "carbon");
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_kills_background_children() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 6 & wait");
        let started = Instant::now();
        let result = run_command_with_timeout(&mut command, Duration::from_millis(300)).unwrap();
        assert!(result.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_reaps_leftover_background_jobs() {
        // The background sleep keeps stdout open after the shell exits.
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 6 & echo started");
        let started = Instant::now();
        let result = run_command_with_timeout(&mut command, Duration::from_secs(5)).unwrap();
        assert!(!result.timed_out);
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "started");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_keeps_only_the_output_tail() {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg("head -c 1000000 /dev/zero | tr '\\0' 'a'; echo; echo last-line");
        let result = run_command_with_timeout(&mut command, Duration::from_secs(10)).unwrap();
        assert!(result.success());
        assert!(result.stdout.len() <= MAX_CAPTURE_BYTES);
        assert!(result.stdout.trim_end().ends_with("last-line"));
    }
}
