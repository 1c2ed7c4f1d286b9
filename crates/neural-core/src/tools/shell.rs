//! Shell command execution tool.

use neural_execution::{ExecutionLimits, ExecutionResult};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::secret_guard::{looks_sensitive_secret, SECRET_REMEDIATION};
use crate::workspace::SandboxErrorCode;

use super::executor::{ToolContext, ToolOutput};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BashArgs {
    pub command: String,
}

/// Execute the `bash` tool.
pub async fn execute_bash(args: &BashArgs, ctx: &ToolContext<'_>) -> ToolOutput {
    debug!("Processing bash tool call: {}", args.command);

    if looks_sensitive_secret(&args.command) {
        warn!("Blocked shell command containing a secret-looking value");
        return ToolOutput::error(SECRET_REMEDIATION);
    }
    if let Err(e) = ctx.sandbox().validate_command(&args.command) {
        return ToolOutput::error(e.to_string());
    }

    let sandbox = &ctx.config.sandbox;
    let limits = ExecutionLimits {
        timeout: Duration::from_secs(sandbox.command_timeout_secs),
        kill_grace: Duration::from_millis(sandbox.kill_grace_ms),
        max_output_bytes: sandbox.max_output_bytes,
    };

    match ctx
        .executor
        .execute_confined(&args.command, ctx.sandbox().root(), &limits, ctx.cancel)
        .await
    {
        Ok(result) => format_result(&result, &limits),
        Err(e) => ToolOutput::error(format!("Execution error: {}", e)),
    }
}

fn format_result(result: &ExecutionResult, limits: &ExecutionLimits) -> ToolOutput {
    if result.cancelled {
        return ToolOutput::error("Command cancelled");
    }
    if result.timed_out {
        return ToolOutput::error(format!(
            "Command timed out after {}s and was terminated{}",
            limits.timeout.as_secs(),
            partial_output(result)
        ));
    }
    if result.left_workspace() {
        return ToolOutput::error(format!(
            "[{}] Command changed directory outside the workspace and was stopped",
            SandboxErrorCode::CommandPathOutsideWorkspace
        ));
    }

    let stdout = result.stdout.trim_end();
    let stderr = result.stderr.trim_end();
    let mut text = if result.success {
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => "Command completed with no output".to_string(),
            (false, true) => stdout.to_string(),
            (true, false) => format!("[stderr]\n{}", stderr),
            (false, false) => format!("{}\n[stderr]\n{}", stdout, stderr),
        }
    } else if !stderr.is_empty() {
        format!("Exit code {}: {}", result.exit_code, stderr)
    } else if !stdout.is_empty() {
        format!("Exit code {}: {}", result.exit_code, stdout)
    } else {
        format!("Command failed with exit code {}", result.exit_code)
    };

    if result.stdout_truncated || result.stderr_truncated {
        text.push_str(&format!(
            "\n[output truncated at {} bytes]",
            limits.max_output_bytes
        ));
    }

    ToolOutput {
        text,
        is_error: !result.success,
    }
}

fn partial_output(result: &ExecutionResult) -> String {
    let stdout = result.stdout.trim_end();
    if stdout.is_empty() {
        String::new()
    } else {
        format!("; partial output:\n{}", stdout)
    }
}
