//! Structured per-turn state capture.
//!
//! After a turn completes the model is asked for a strict-JSON description of
//! where things stand. Each field is validated on its own; anything missing or
//! malformed is replaced by a value derived mechanically from the turn.

use neural_providers::{CompletionRequest, LLMProvider, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const MAX_LIST_ITEMS: usize = 8;
const MAX_FIELD_CHARS: usize = 400;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantStateSummary {
    pub goal: String,
    pub ui_state: String,
    pub actions_taken: Vec<String>,
    pub open_issues: Vec<String>,
    pub next_steps: Vec<String>,
}

impl AssistantStateSummary {
    pub fn to_prompt_text(&self) -> String {
        let list = |items: &[String]| {
            if items.is_empty() {
                "none".to_string()
            } else {
                items.join("; ")
            }
        };
        format!(
            "goal: {}\nui_state: {}\nactions_taken: {}\nopen_issues: {}\nnext_steps: {}",
            self.goal,
            self.ui_state,
            list(&self.actions_taken),
            list(&self.open_issues),
            list(&self.next_steps)
        )
    }
}

/// What the capture step knows about the finished turn.
#[derive(Debug, Clone, Default)]
pub struct TurnFacts {
    pub interaction: String,
    pub output_chars: usize,
    pub revisions: u32,
    pub tools_used: Vec<String>,
    pub final_text: String,
}

/// Deterministic summary built only from facts about the turn.
pub fn fallback_state_summary(facts: &TurnFacts) -> AssistantStateSummary {
    let ui_state = if facts.revisions > 0 {
        format!(
            "Screen published {} time(s) this turn; {} characters of output.",
            facts.revisions, facts.output_chars
        )
    } else {
        format!("No screen published; {} characters of output.", facts.output_chars)
    };

    let mut actions_taken: Vec<String> = Vec::new();
    for tool in &facts.tools_used {
        if !actions_taken.contains(tool) {
            actions_taken.push(tool.clone());
        }
    }
    actions_taken.truncate(MAX_LIST_ITEMS);

    AssistantStateSummary {
        goal: clip(&format!("Respond to: {}", facts.interaction)),
        ui_state,
        actions_taken,
        open_issues: Vec::new(),
        next_steps: vec!["Wait for the next user interaction.".to_string()],
    }
}

/// Parse a model reply, substituting fallback values field by field.
///
/// Returns the summary and whether every field came from the model.
pub fn parse_state_summary(reply: &str, facts: &TurnFacts) -> (AssistantStateSummary, bool) {
    let fallback = fallback_state_summary(facts);
    let Some(object) = extract_json_object(reply) else {
        return (fallback, false);
    };

    let mut complete = true;
    let mut text_field = |name: &str, default: &str| match object.get(name).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => clip(s.trim()),
        _ => {
            complete = false;
            default.to_string()
        }
    };
    let goal = text_field("goal", &fallback.goal);
    let ui_state = text_field("ui_state", &fallback.ui_state);

    let mut list_field = |name: &str, default: &[String]| match object.get(name).and_then(string_list) {
        Some(items) => items,
        None => {
            complete = false;
            default.to_vec()
        }
    };
    let actions_taken = list_field("actions_taken", &fallback.actions_taken);
    let open_issues = list_field("open_issues", &fallback.open_issues);
    let next_steps = list_field("next_steps", &fallback.next_steps);

    (
        AssistantStateSummary {
            goal,
            ui_state,
            actions_taken,
            open_issues,
            next_steps,
        },
        complete,
    )
}

/// Ask the provider for a state summary; never fails.
pub async fn capture_state_summary(
    provider: &dyn LLMProvider,
    facts: &TurnFacts,
    max_tokens: u32,
) -> AssistantStateSummary {
    let request = CompletionRequest::plain(
        vec![
            Message::system(
                "You record the state of an assistant-driven UI session. Reply with one JSON object \
                 and nothing else. Keys: goal (string), ui_state (string), actions_taken (array of \
                 strings), open_issues (array of strings), next_steps (array of strings).",
            ),
            Message::user(format!(
                "Interaction: {}\nTools used: {}\nScreens published: {}\nAssistant output:\n{}",
                facts.interaction,
                if facts.tools_used.is_empty() {
                    "none".to_string()
                } else {
                    facts.tools_used.join(", ")
                },
                facts.revisions,
                facts.final_text.chars().take(4000).collect::<String>()
            )),
        ],
        max_tokens,
    );

    match provider.complete(request).await {
        Ok(response) => {
            let (summary, complete) = parse_state_summary(&response.content, facts);
            if !complete {
                debug!("State summary reply was incomplete, fallback fields substituted");
            }
            summary
        }
        Err(e) => {
            warn!("State summary request failed, using fallback: {}", e);
            fallback_state_summary(facts)
        }
    }
}

fn extract_json_object(reply: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = reply.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    match serde_json::from_str::<Value>(unfenced) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    let mut out = Vec::with_capacity(items.len().min(MAX_LIST_ITEMS));
    for item in items.iter().take(MAX_LIST_ITEMS) {
        out.push(clip(item.as_str()?.trim()));
    }
    Some(out)
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_FIELD_CHARS {
        text.to_string()
    } else {
        let mut clipped: String = text.chars().take(MAX_FIELD_CHARS).collect();
        clipped.push('…');
        clipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neural_providers::{MockProvider, MockResponse};

    fn facts() -> TurnFacts {
        TurnFacts {
            interaction: "clicked 'Add task'".to_string(),
            output_chars: 1200,
            revisions: 2,
            tools_used: vec!["emit_screen".into(), "write".into(), "emit_screen".into()],
            final_text: String::new(),
        }
    }

    #[test]
    fn test_valid_reply_is_used_verbatim() {
        let reply = r#"{"goal":"Track tasks","ui_state":"List with 3 tasks","actions_taken":["added task"],"open_issues":[],"next_steps":["await input"]}"#;
        let (summary, complete) = parse_state_summary(reply, &facts());
        assert!(complete);
        assert_eq!(summary.goal, "Track tasks");
        assert_eq!(summary.actions_taken, vec!["added task"]);
        assert!(summary.open_issues.is_empty());
    }

    #[test]
    fn test_invalid_fields_fall_back_individually() {
        let reply = "```json\n{\"goal\":\"Track tasks\",\"ui_state\":42,\"actions_taken\":\"oops\"}\n```";
        let (summary, complete) = parse_state_summary(reply, &facts());
        assert!(!complete);
        assert_eq!(summary.goal, "Track tasks");
        assert!(summary.ui_state.contains("published 2 time(s)"));
        assert_eq!(summary.actions_taken, vec!["emit_screen", "write"]);
    }

    #[test]
    fn test_non_json_reply_uses_full_fallback() {
        let (summary, complete) = parse_state_summary("Sure! Here's the state.", &facts());
        assert!(!complete);
        assert_eq!(summary, fallback_state_summary(&facts()));
        assert!(summary.goal.contains("Add task"));
    }

    #[tokio::test]
    async fn test_provider_failure_yields_fallback() {
        let provider = MockProvider::new().with_completion(MockResponse::failure("boom"));
        let summary = capture_state_summary(&provider, &facts(), 600).await;
        assert_eq!(summary, fallback_state_summary(&facts()));
    }
}
