//! Context lanes: the bounded conversational memory kept per (session, app context).
//!
//! A lane holds a rolling summary plus the most recent turns, oldest first.
//! Token counts are conservative estimates; see [`estimate_tokens`].

use chrono::{DateTime, Utc};
use neural_providers::Usage;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state_capture::AssistantStateSummary;

/// Marker stored in place of a turn's state summary after it has been split.
pub const COMPACTED_STATE_MARKER: &str = "[compacted: earlier part of this turn was summarized]";

/// Estimate tokens for a piece of text.
///
/// - Average English text: ~4 characters per token
/// - Code/JSON/markup: ~3 characters per token (more symbols)
/// - 10% buffer on top
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as f32;
    let looks_structured =
        text.contains('{') || text.contains("```") || text.contains('<') || text.contains("fn ");
    let base_estimate = if looks_structured {
        (chars / 3.0).ceil() as u32
    } else {
        (chars / 4.0).ceil() as u32
    };
    (base_estimate as f32 * 1.1).ceil() as u32
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaneKey {
    pub session_id: String,
    pub app_context: String,
}

impl LaneKey {
    pub fn new(session_id: impl Into<String>, app_context: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            app_context: app_context.into(),
        }
    }
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.app_context)
    }
}

/// One completed request/response cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub app_context: String,
    /// Human-readable description of the triggering interaction
    pub interaction: String,
    /// The turn-specific prompt section that was sent to the model
    pub prompt: String,
    pub state: AssistantStateSummary,
    pub usage: Option<Usage>,
    pub estimated_tokens: u32,
    /// Set once the turn has been split by compaction
    pub compacted: bool,
}

impl Turn {
    pub fn new(
        app_context: &str,
        interaction: String,
        prompt: String,
        state: AssistantStateSummary,
        usage: Option<Usage>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            app_context: app_context.to_string(),
            interaction,
            prompt,
            state,
            usage,
            estimated_tokens: 0,
            compacted: false,
        }
    }

    /// Text of the state portion as it appears in prompts.
    pub fn state_text(&self) -> String {
        if self.compacted {
            COMPACTED_STATE_MARKER.to_string()
        } else {
            self.state.to_prompt_text()
        }
    }

    /// Heuristic token estimate of everything this turn contributes to a prompt.
    pub fn heuristic_tokens(&self) -> u32 {
        estimate_tokens(&self.prompt) + estimate_tokens(&self.state_text())
    }

    /// Serialized form used both in prompts and as summarizer input.
    pub fn render(&self) -> String {
        format!(
            "### Turn {} ({})\nInteraction: {}\nPrompt:\n{}\nAssistant state:\n{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.app_context,
            self.interaction,
            self.prompt,
            self.state_text()
        )
    }
}

/// Snapshot of the most recent size estimate for a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneEstimate {
    pub tokens: u32,
    pub context_window: u32,
    pub threshold: u32,
}

impl LaneEstimate {
    pub fn over_threshold(&self) -> bool {
        self.tokens > self.threshold
    }
}

#[derive(Debug, Clone)]
pub struct ContextLane {
    pub key: LaneKey,
    pub summary: String,
    /// Oldest first
    pub turns: Vec<Turn>,
    pub last_estimate: Option<LaneEstimate>,
    pub compaction_in_flight: bool,
    pub compaction_queued: bool,
    /// Most recent provider-reported usage seen on an appended turn
    last_usage: Option<Usage>,
}

impl ContextLane {
    pub fn new(key: LaneKey) -> Self {
        Self {
            key,
            summary: String::new(),
            turns: Vec::new(),
            last_estimate: None,
            compaction_in_flight: false,
            compaction_queued: false,
            last_usage: None,
        }
    }

    /// Append a finished turn, fixing its estimate as the larger of the text
    /// heuristic and a fraction of the latest provider-reported usage.
    pub fn append_turn(&mut self, mut turn: Turn, usage_fraction: f32) {
        if let Some(usage) = &turn.usage {
            self.last_usage = Some(usage.clone());
        }
        let usage_floor = self
            .last_usage
            .as_ref()
            .map(|u| (u.completion_tokens as f32 * usage_fraction).ceil() as u32)
            .unwrap_or(0);
        turn.estimated_tokens = turn.heuristic_tokens().max(usage_floor);
        self.turns.push(turn);
    }

    pub fn summary_tokens(&self) -> u32 {
        estimate_tokens(&self.summary)
    }

    pub fn turn_tokens(&self) -> u32 {
        self.turns.iter().map(|t| t.estimated_tokens).sum()
    }

    /// Estimate the lane plus an incoming prompt against a model's window.
    pub fn estimate(&mut self, incoming_prompt: &str, context_window: u32, reserve_tokens: u32) -> LaneEstimate {
        let estimate = LaneEstimate {
            tokens: self.summary_tokens() + self.turn_tokens() + estimate_tokens(incoming_prompt),
            context_window,
            threshold: context_window.saturating_sub(reserve_tokens),
        };
        self.last_estimate = Some(estimate);
        estimate
    }

    /// Render summary and recent turns as the memory section of a prompt.
    pub fn render_memory(&self) -> String {
        let mut out = String::new();
        if !self.summary.trim().is_empty() {
            out.push_str("## Conversation summary\n");
            out.push_str(self.summary.trim());
            out.push_str("\n\n");
        }
        if !self.turns.is_empty() {
            out.push_str("## Recent turns\n");
            for turn in &self.turns {
                out.push_str(&turn.render());
                out.push_str("\n\n");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(prompt: &str, usage: Option<Usage>) -> Turn {
        Turn::new(
            "notes",
            "click #save".to_string(),
            prompt.to_string(),
            AssistantStateSummary::default(),
            usage,
        )
    }

    #[test]
    fn test_estimate_tokens_heuristic() {
        assert_eq!(estimate_tokens(""), 0);
        // 400 plain chars -> 100 * 1.1
        assert_eq!(estimate_tokens(&"a".repeat(400)), 110);
        // 300 markup chars -> 100 * 1.1
        assert_eq!(estimate_tokens(&format!("<{}", "b".repeat(299))), 110);
    }

    #[test]
    fn test_usage_floor_raises_small_turn_estimates() {
        let mut lane = ContextLane::new(LaneKey::new("s", "notes"));
        let usage = Usage {
            prompt_tokens: 5000,
            completion_tokens: 2000,
            total_tokens: 7000,
        };
        lane.append_turn(turn("hi", Some(usage)), 0.5);
        assert_eq!(lane.turns[0].estimated_tokens, 1000);

        // later turns without usage still carry the floor
        lane.append_turn(turn("again", None), 0.5);
        assert_eq!(lane.turns[1].estimated_tokens, 1000);

        // the heuristic wins when it is larger
        lane.append_turn(turn(&"x".repeat(8000), None), 0.5);
        assert!(lane.turns[2].estimated_tokens > 1000);
    }

    #[test]
    fn test_threshold_is_window_minus_reserve() {
        let mut lane = ContextLane::new(LaneKey::new("s", "notes"));
        let estimate = lane.estimate("", 100_000, 16_384);
        assert_eq!(estimate.threshold, 83_616);
        assert!(!estimate.over_threshold());
        assert_eq!(lane.last_estimate, Some(estimate));
    }

    #[test]
    fn test_compacted_turn_renders_marker() {
        let mut t = turn("tail", None);
        t.compacted = true;
        assert!(t.render().contains(COMPACTED_STATE_MARKER));
    }
}
