//! Confined subprocess execution.
//!
//! Commands run under `bash` with the working directory pinned to a workspace
//! root. A `DEBUG` trap re-checks the physical working directory before every
//! simple command and once more at the end, aborting with
//! [`CONFINEMENT_EXIT_CODE`] if the shell has wandered outside the root.

use anyhow::Result;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit status used by the confinement wrapper when the shell leaves the root.
pub const CONFINEMENT_EXIT_CODE: i32 = 97;

const CONFINEMENT_MARKER: &str = "sandbox: working directory left the workspace root";

/// Time allowed for output readers to drain after the process is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    /// Window between the graceful termination signal and the forced kill
    pub kill_grace: Duration,
    /// Cap applied independently to stdout and stderr
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(2),
            max_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Whether the confinement wrapper aborted the command.
    pub fn left_workspace(&self) -> bool {
        self.exit_code == CONFINEMENT_EXIT_CODE && self.stderr.contains(CONFINEMENT_MARKER)
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Default, Clone)]
pub struct CodeExecutor {}

impl CodeExecutor {
    pub fn new() -> Self {
        Self {}
    }

    /// Run `command` inside `root` with the confinement wrapper applied.
    pub async fn execute_confined(
        &self,
        command: &str,
        root: &Path,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let script = confinement_script(command, root);
        debug!("Executing confined command in {}: {}", root.display(), command);

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&script)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr"))?;
        let stdout_task = tokio::spawn(read_capped(stdout, limits.max_output_bytes));
        let stderr_task = tokio::spawn(read_capped(stderr, limits.max_output_bytes));

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status?),
            _ = tokio::time::sleep(limits.timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let (status, timed_out, cancelled) = match outcome {
            WaitOutcome::Exited(status) => (Some(status), false, false),
            WaitOutcome::TimedOut => {
                warn!("Command timed out after {:?}: {}", limits.timeout, command);
                (terminate(&mut child, limits.kill_grace).await, true, false)
            }
            WaitOutcome::Cancelled => {
                debug!("Command cancelled: {}", command);
                (terminate(&mut child, limits.kill_grace).await, false, true)
            }
        };

        let (stdout_bytes, stdout_truncated) = join_reader(stdout_task).await;
        let (stderr_bytes, stderr_truncated) = join_reader(stderr_task).await;

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let success = !timed_out && !cancelled && status.map(|s| s.success()).unwrap_or(false);

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            exit_code,
            success,
            timed_out,
            cancelled,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

/// Build the bash script that pins the working directory to `root` and
/// re-asserts containment around `command`.
pub fn confinement_script(command: &str, root: &Path) -> String {
    let quoted_root = shell_single_quote(&root.to_string_lossy());
    format!(
        r#"__neural_root={root}
__neural_check() {{
  case "$(pwd -P)/" in
    "$__neural_root"/*) ;;
    *) printf '%s\n' '{marker}' >&2; exit {code} ;;
  esac
}}
cd -- "$__neural_root" || exit {code}
set -o functrace
trap __neural_check DEBUG
{command}
__neural_status=$?
trap - DEBUG
__neural_check
exit $__neural_status
"#,
        root = quoted_root,
        marker = CONFINEMENT_MARKER,
        code = CONFINEMENT_EXIT_CODE,
        command = command,
    )
}

fn shell_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Send the graceful signal, wait out the grace window, then force-kill.
async fn terminate(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    signal_group(child, Signal::Terminate);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => {
            warn!("Process ignored termination signal, killing");
            signal_group(child, Signal::Kill);
            if let Err(e) = child.kill().await {
                debug!("Kill after grace window failed: {}", e);
            }
            child.wait().await.ok()
        }
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own process group, so signal the whole group.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signo);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, signal: Signal) {
    if matches!(signal, Signal::Kill) {
        let _ = child.start_kill();
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buffer.len());
                buffer.extend_from_slice(&chunk[..n.min(room)]);
                if n > room {
                    truncated = true;
                }
            }
        }
    }

    (buffer, truncated)
}

async fn join_reader(task: tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, task).await {
        Ok(Ok(result)) => result,
        _ => (Vec::new(), false),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(200),
            max_output_bytes: 1024,
        }
    }

    async fn run(command: &str, root: &Path, limits: &ExecutionLimits) -> ExecutionResult {
        CodeExecutor::new()
            .execute_confined(command, root, limits, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_runs_in_workspace_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let result = run("pwd -P && echo done", &root, &limits()).await;
        assert!(result.success, "stderr: {}", result.stderr);
        assert!(result.stdout.contains(root.to_str().unwrap()));
        assert!(result.stdout.contains("done"));
    }

    #[tokio::test]
    async fn test_leaving_root_aborts_before_next_command() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let result = run("cd ..; echo escaped", &root, &limits()).await;
        assert!(!result.success);
        assert!(result.left_workspace());
        assert!(!result.stdout.contains("escaped"));
    }

    #[tokio::test]
    async fn test_subdirectory_cd_is_allowed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();

        let result = run("cd sub && echo inside", &root, &limits()).await;
        assert!(result.success, "stderr: {}", result.stderr);
        assert!(result.stdout.contains("inside"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let limits = ExecutionLimits {
            timeout: Duration::from_millis(200),
            ..limits()
        };

        let started = std::time::Instant::now();
        let result = run("sleep 30", &root, &limits).await;
        assert!(result.timed_out);
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let result = run("head -c 5000 /dev/zero | tr '\\0' a", &root, &limits()).await;
        assert_eq!(result.stdout.len(), 1024);
        assert!(result.stdout_truncated);
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = CodeExecutor::new()
            .execute_confined("sleep 30", &root, &limits(), &cancel)
            .await
            .unwrap();
        assert!(result.cancelled);
    }

    #[test]
    fn test_root_with_quote_is_escaped() {
        let script = confinement_script("true", Path::new("/tmp/it's"));
        assert!(script.starts_with("__neural_root='/tmp/it'\\''s'"));
    }
}
