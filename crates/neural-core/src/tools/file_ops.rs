//! File operation tools: read, write, edit.
//!
//! Every path goes through the workspace sandbox. Writes and edits are also
//! screened by the secret guard, and during onboarding a write that lands on
//! durable memory marks the `memory_seeded` checkpoint.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::onboarding::Checkpoint;
use crate::paths::is_memory_path;
use crate::secret_guard::{looks_sensitive_secret, SECRET_REMEDIATION};
use crate::workspace::EntryKind;

use super::executor::{ToolContext, ToolOutput};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadArgs {
    pub path: String,
    /// First line to return, 1-based
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EditArgs {
    pub path: String,
    pub old_text: String,
    pub new_text: String,
    #[serde(default)]
    pub replace_all: bool,
}

/// Execute the `read` tool.
pub async fn execute_read(args: &ReadArgs, ctx: &ToolContext<'_>) -> ToolOutput {
    debug!("Processing read tool call: {}", args.path);

    let path = match ctx.sandbox().resolve_read(&args.path, Some(EntryKind::File)) {
        Ok(path) => path,
        Err(e) => return ToolOutput::error(e.to_string()),
    };
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => return ToolOutput::error(format!("Failed to read {}: {}", args.path, e)),
    };

    let max_bytes = ctx.config.sandbox.max_read_bytes;
    let byte_truncated = bytes.len() > max_bytes;
    let content = String::from_utf8_lossy(&bytes[..bytes.len().min(max_bytes)]).into_owned();

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let start = args.offset.unwrap_or(1).max(1);
    if total > 0 && start > total {
        return ToolOutput::error(format!(
            "Offset {} is past the end of {} ({} lines)",
            start, args.path, total
        ));
    }
    let end = match args.limit {
        Some(limit) => (start - 1).saturating_add(limit).min(total),
        None => total,
    };
    let begin = (start - 1).min(end);

    let mut text = if args.offset.is_none() && args.limit.is_none() {
        content.clone()
    } else {
        let mut selected = lines[begin..end].join("\n");
        selected.push_str(&format!("\n[lines {}-{} of {}]", start, end, total));
        selected
    };
    if byte_truncated {
        text.push_str(&format!(
            "\n[truncated: file is {} bytes, showing the first {}]",
            bytes.len(),
            max_bytes
        ));
    }
    ToolOutput::ok(text)
}

/// Execute the `write` tool.
pub async fn execute_write(args: &WriteArgs, ctx: &mut ToolContext<'_>) -> ToolOutput {
    debug!("Processing write tool call: {} ({} chars)", args.path, args.content.len());

    if looks_sensitive_secret(&args.content) || looks_sensitive_secret(&args.path) {
        warn!("Blocked write to {}: content looks like a secret", args.path);
        return ToolOutput::error(SECRET_REMEDIATION);
    }

    let path = match ctx.sandbox().resolve_write(&args.path) {
        Ok(path) => path,
        Err(e) => return ToolOutput::error(e.to_string()),
    };
    if let Err(e) = tokio::fs::write(&path, args.content.as_bytes()).await {
        return ToolOutput::error(format!("Failed to write {}: {}", args.path, e));
    }

    note_memory_write(&args.path, ctx);
    ToolOutput::ok(format!("Wrote {} bytes to {}", args.content.len(), args.path))
}

/// Execute the `edit` tool.
pub async fn execute_edit(args: &EditArgs, ctx: &mut ToolContext<'_>) -> ToolOutput {
    debug!("Processing edit tool call: {}", args.path);

    if args.old_text.is_empty() {
        return ToolOutput::error("old_text must not be empty");
    }
    if looks_sensitive_secret(&args.new_text) {
        warn!("Blocked edit of {}: replacement looks like a secret", args.path);
        return ToolOutput::error(SECRET_REMEDIATION);
    }

    let path = match ctx
        .sandbox()
        .resolve_read(&args.path, Some(EntryKind::File))
        .and_then(|_| ctx.sandbox().resolve_write(&args.path))
    {
        Ok(path) => path,
        Err(e) => return ToolOutput::error(e.to_string()),
    };
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) => return ToolOutput::error(format!("Failed to read {}: {}", args.path, e)),
    };

    let occurrences = content.matches(args.old_text.as_str()).count();
    let updated = match occurrences {
        0 => return ToolOutput::error(format!("old_text was not found in {}", args.path)),
        1 => content.replacen(&args.old_text, &args.new_text, 1),
        n if args.replace_all => {
            debug!("Replacing {} occurrences in {}", n, args.path);
            content.replace(&args.old_text, &args.new_text)
        }
        n => {
            return ToolOutput::error(format!(
                "old_text matches {} times in {}; add surrounding context or set replace_all",
                n, args.path
            ))
        }
    };

    if let Err(e) = tokio::fs::write(&path, updated.as_bytes()).await {
        return ToolOutput::error(format!("Failed to write {}: {}", args.path, e));
    }

    note_memory_write(&args.path, ctx);
    let replaced = if args.replace_all { occurrences } else { 1 };
    ToolOutput::ok(format!("Edited {}: {} replacement(s)", args.path, replaced))
}

fn note_memory_write(relative: &str, ctx: &mut ToolContext<'_>) {
    if !ctx.onboarding_gated || !is_memory_path(relative) {
        return;
    }
    if let Err(e) = ctx.onboarding.set_checkpoint(Checkpoint::MemorySeeded, true) {
        warn!("Failed to record memory_seeded checkpoint: {}", e);
    }
}
