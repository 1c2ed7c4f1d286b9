//! Workspace-relative locations of the files the backend persists.
//!
//! Everything here is relative to the workspace root and is resolved through
//! [`crate::workspace::WorkspaceSandbox`] before use.

use chrono::NaiveDate;

/// Hidden directory holding backend state.
pub const STATE_DIR: &str = ".neural";

/// Durable memory notes directory.
pub const MEMORY_DIR: &str = "memory";

/// Top-level note files scaffolded on first use of a root.
pub const SCAFFOLD_FILES: [&str; 3] = ["AGENTS.md", "MEMORY.md", "USER.md"];

pub const MEMORY_FILE: &str = "MEMORY.md";

/// `.neural/onboarding-state.json`
pub fn onboarding_state_path() -> String {
    format!("{}/onboarding-state.json", STATE_DIR)
}

/// `.neural/onboarding-events.jsonl`
pub fn onboarding_events_path() -> String {
    format!("{}/onboarding-events.jsonl", STATE_DIR)
}

/// `memory/<YYYY-MM-DD>.md`
pub fn daily_note_path(date: NaiveDate) -> String {
    format!("{}/{}.md", MEMORY_DIR, date.format("%Y-%m-%d"))
}

/// Whether a workspace-relative path counts as durable memory.
pub fn is_memory_path(relative: &str) -> bool {
    let normalized = relative.trim_start_matches("./");
    normalized == MEMORY_FILE
        || normalized == MEMORY_DIR
        || normalized.starts_with(&format!("{}/", MEMORY_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_paths() {
        assert!(is_memory_path("MEMORY.md"));
        assert!(is_memory_path("./memory/2026-01-02.md"));
        assert!(!is_memory_path("memory.md"));
        assert!(!is_memory_path("memorylane/x.md"));
        assert!(!is_memory_path("docs/MEMORY.md"));
    }

    #[test]
    fn test_daily_note_path() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(daily_note_path(date), "memory/2026-03-09.md");
    }
}
