//! CLI argument parsing for neural.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Clone, Debug)]
#[command(name = "neural")]
#[command(about = "Drive a generated screen with an LLM confined to a local workspace")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Workspace root (defaults to the configured default root)
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Override the provider from config
    #[arg(long, value_name = "PROVIDER")]
    pub provider: Option<String>,

    /// Override the model
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Session identifier; a fresh one is generated when omitted
    #[arg(long)]
    pub session: Option<String>,

    /// App context the interaction belongs to
    #[arg(long, value_name = "APP")]
    pub app: Option<String>,

    /// Seed the turn with a previously published screen
    #[arg(long, value_name = "FILE")]
    pub previous_html: Option<PathBuf>,

    /// Revisit onboarding even if it was completed
    #[arg(long)]
    pub reopen_onboarding: bool,

    /// Read one prompt per line from stdin and keep the session across turns
    #[arg(long)]
    pub interactive: bool,

    /// Prompt for a single turn
    pub prompt: Option<String>,
}

impl Cli {
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "neural_core=debug,neural_cli=debug,neural_providers=debug,neural_execution=debug"
        } else {
            "neural_core=info,neural_cli=info,neural_providers=warn"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_single_turn() {
        let cli = Cli::try_parse_from(["neural", "--app", "notes", "--session", "s1", "hello"]).unwrap();
        assert_eq!(cli.prompt.as_deref(), Some("hello"));
        assert_eq!(cli.app.as_deref(), Some("notes"));
        assert_eq!(cli.session.as_deref(), Some("s1"));
        assert!(!cli.interactive);
    }

    #[test]
    fn test_verbose_filter() {
        let cli = Cli::try_parse_from(["neural", "-v", "--interactive"]).unwrap();
        assert!(cli.interactive);
        assert!(cli.log_filter().contains("neural_core=debug"));
    }
}
