//! Durable memory notes kept as Markdown under the workspace root.

use anyhow::Result;
use chrono::{Local, Utc};
use std::io::Write;
use tracing::{debug, info};

use crate::context_lane::LaneKey;
use crate::paths::{self, MEMORY_DIR, SCAFFOLD_FILES};
use crate::workspace::WorkspaceSandbox;

fn scaffold_content(name: &str) -> &'static str {
    match name {
        "AGENTS.md" => {
            "# Agents\n\nInstructions for assistants working in this workspace.\n\n\
             - Publish every screen with `emit_screen`.\n\
             - Keep credentials out of files; use `save_provider_credential`.\n"
        }
        "MEMORY.md" => "# Memory\n\nLong-lived facts worth remembering across sessions.\n",
        "USER.md" => "# User\n\nPreferences and details the user has shared.\n",
        _ => "",
    }
}

/// Create the note files and `memory/` directory if they are missing.
///
/// Existing files are never touched. Returns the files that were created.
pub fn scaffold_workspace(sandbox: &WorkspaceSandbox) -> Result<Vec<String>> {
    let mut created = Vec::new();

    // resolving a child for writing creates the directory
    sandbox.resolve_write(&format!("{}/.keep", MEMORY_DIR))?;

    for name in SCAFFOLD_FILES {
        let path = sandbox.resolve_write(name)?;
        if path.exists() {
            continue;
        }
        std::fs::write(&path, scaffold_content(name))?;
        created.push(name.to_string());
    }

    if !created.is_empty() {
        info!("Scaffolded workspace notes in {}: {:?}", sandbox.root().display(), created);
    }
    Ok(created)
}

/// Append a compaction summary to today's note file.
pub fn append_daily_note(sandbox: &WorkspaceSandbox, lane: &LaneKey, summary: &str) -> Result<String> {
    let relative = paths::daily_note_path(Local::now().date_naive());
    let path = sandbox.resolve_write(&relative)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(
        file,
        "\n## {} · {}\n\n{}\n",
        Utc::now().format("%H:%M:%S UTC"),
        lane.app_context,
        summary.trim()
    )?;

    debug!("Appended compaction summary for lane {} to {}", lane, relative);
    Ok(relative)
}
