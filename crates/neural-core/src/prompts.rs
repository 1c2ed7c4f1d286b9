//! Prompt text for the tool loop.

use crate::interaction::{Interaction, Viewport};

const SYSTEM_IDENTITY: &str =
"You are Neural, an assistant that drives a user's screen. Every reply is a working UI: you publish \
complete HTML documents and the user interacts with them. Clicks, form submissions and typed prompts \
come back to you as interactions.";

const TOOL_GUIDANCE: &str = "# Tools

- `emit_screen` publishes the whole screen. Always send the complete document; it replaces what is \
shown, it is never merged. Put a `data-interaction-id` on every element the user can act on. Publish \
at least once per turn and set `is_final` on the last publish.
- `read_screen` inspects what you last published. Start with `metadata`, then `outline`; use \
`snippet` only when you need raw markup. Two reads per turn at most, and the second must set \
`recovery`.
- `read`, `write` and `edit` work on files inside the workspace. Paths are relative to the workspace \
root; absolute paths and `..` escapes are rejected.
- `bash` runs a command inside the workspace. Do not use `$VAR`, `$(...)` or backticks, and do not \
`cd` outside the workspace.
- `web_search` looks things up on the web when it is available.

Never put API keys or passwords in files, commands or searches. Use `save_provider_credential` for \
provider keys.

Tool results tell you when something failed. Read the error, fix the call and continue.";

const ONBOARDING_GUIDANCE: &str = "# Onboarding

Setup is not finished. Guide the user through it on screen, one step at a time:
1. Confirm or change the workspace folder with `onboarding_set_workspace_root`.
2. Ask for a provider API key and store it with `save_provider_credential`.
3. Let the user pick a model with `onboarding_set_model_preferences`.
4. Write a first note about the user to `MEMORY.md`.
5. Call `onboarding_complete`. If it reports missing checkpoints, finish those first.

Use `onboarding_get_state` to see which checkpoints are done. Only onboarding, screen and file tools \
are available until setup is complete.";

/// Corrective instruction for a turn that ended without publishing.
pub const MISSING_PUBLISH_CORRECTION: &str = "Your previous attempt ended without publishing a screen. \
This app requires a visible result every turn. Call `emit_screen` now with the complete HTML for the \
current state, then finish.";

/// Build the system prompt for a turn.
pub fn system_prompt(onboarding: bool) -> String {
    let mut prompt = format!("{}\n\n{}", SYSTEM_IDENTITY, TOOL_GUIDANCE);
    if onboarding {
        prompt.push_str("\n\n");
        prompt.push_str(ONBOARDING_GUIDANCE);
    }
    prompt
}

/// The turn-specific prompt section: what happened and what is on screen.
///
/// This is what gets stored on the lane's turn record, so it excludes the
/// memory section.
pub fn turn_prompt(
    interaction: &Interaction,
    app_context: &str,
    viewport: Option<&Viewport>,
    previous_html: Option<&str>,
) -> String {
    let mut prompt = format!("# Interaction\nApp: {}\n{}\n", app_context, interaction.describe());
    if let Some(viewport) = viewport {
        prompt.push_str(&format!("Viewport: {}x{}\n", viewport.width, viewport.height));
    }
    match previous_html {
        Some(html) => prompt.push_str(&format!(
            "\n# Current screen\nThe user is looking at this document ({} chars). Replace it with \
             `emit_screen`; read it with `read_screen`.\n",
            html.chars().count()
        )),
        None => prompt.push_str("\n# Current screen\nNothing is shown yet.\n"),
    }
    prompt
}

/// Assemble the user message from memory and the turn section.
pub fn user_message(memory: &str, turn_prompt: &str, correction: Option<&str>) -> String {
    let mut message = String::new();
    if !memory.trim().is_empty() {
        message.push_str("# Memory\n");
        message.push_str(memory.trim_end());
        message.push_str("\n\n");
    }
    message.push_str(turn_prompt);
    if let Some(correction) = correction {
        message.push_str("\n# Correction\n");
        message.push_str(correction);
        message.push('\n');
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onboarding_guidance_only_when_gated() {
        assert!(system_prompt(true).contains("# Onboarding"));
        assert!(!system_prompt(false).contains("# Onboarding"));
    }

    #[test]
    fn test_user_message_sections() {
        let turn = turn_prompt(&Interaction::prompt("hello"), "notes", None, None);
        let message = user_message("## Conversation summary\nearlier", &turn, Some(MISSING_PUBLISH_CORRECTION));
        let memory_at = message.find("# Memory").unwrap();
        let interaction_at = message.find("# Interaction").unwrap();
        let correction_at = message.find("# Correction").unwrap();
        assert!(memory_at < interaction_at && interaction_at < correction_at);

        assert!(!user_message("", &turn, None).contains("# Memory"));
    }
}
