//! Streaming state for the tool loop.
//!
//! Consumes one provider stream, forwarding text, thoughts and throttled
//! partial screens to the event sink, and hands back the final assistant
//! message. The loop itself lives in [`crate::engine`].

use anyhow::Result;
use neural_config::RenderConfig;
use neural_providers::{AssistantMessage, CompletionStream, StreamEvent, Usage};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event_sink::{EngineEvent, EventSink};
use crate::render_output::{extract_partial_html, looks_like_document, PartialRenderThrottle};

/// Terminal state of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Done,
    OverflowFailed,
    ProviderError,
    MissingPublishFailed,
    Cancelled,
    /// Setup or unexpected internal failure
    Failed,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Done => "done",
            TurnOutcome::OverflowFailed => "overflow_failed",
            TurnOutcome::ProviderError => "provider_error",
            TurnOutcome::MissingPublishFailed => "missing_publish_failed",
            TurnOutcome::Cancelled => "cancelled",
            TurnOutcome::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == TurnOutcome::Done
    }
}

impl std::fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State tracked across streaming iterations of one turn.
#[derive(Debug)]
pub struct StreamingState {
    pub full_text: String,
    pub iteration_count: u32,
    pub tool_calls_executed: u32,
    pub tools_used: Vec<String>,
    pub overflow_retry_used: bool,
    pub publish_retry_used: bool,
    /// Usage summed over every iteration
    pub usage: Option<Usage>,
    pub stream_start: Instant,
}

impl StreamingState {
    pub fn new() -> Self {
        Self {
            full_text: String::new(),
            iteration_count: 0,
            tool_calls_executed: 0,
            tools_used: Vec::new(),
            overflow_retry_used: false,
            publish_retry_used: false,
            usage: None,
            stream_start: Instant::now(),
        }
    }

    pub fn record_tool(&mut self, name: &str) {
        self.tool_calls_executed += 1;
        if !self.tools_used.iter().any(|t| t == name) {
            self.tools_used.push(name.to_string());
        }
    }

    pub fn add_usage(&mut self, usage: Option<&Usage>) {
        let Some(usage) = usage else { return };
        let total = self.usage.get_or_insert_with(Usage::default);
        total.prompt_tokens += usage.prompt_tokens;
        total.completion_tokens += usage.completion_tokens;
        total.total_tokens += usage.total_tokens;
    }

    pub fn elapsed(&self) -> Duration {
        self.stream_start.elapsed()
    }
}

impl Default for StreamingState {
    fn default() -> Self {
        Self::new()
    }
}

struct PartialCall {
    id: String,
    name: String,
    args: String,
    throttle: PartialRenderThrottle,
}

/// Tracks streamed `emit_screen` arguments per tool-call index.
pub struct PartialPublishTracker {
    template: PartialRenderThrottle,
    calls: HashMap<usize, PartialCall>,
}

impl PartialPublishTracker {
    pub fn new(render: &RenderConfig) -> Self {
        Self {
            template: PartialRenderThrottle::new(render),
            calls: HashMap::new(),
        }
    }

    pub fn start(&mut self, index: usize, id: &str, name: &str) {
        self.calls.insert(
            index,
            PartialCall {
                id: id.to_string(),
                name: name.to_string(),
                args: String::new(),
                throttle: self.template.clone(),
            },
        );
    }

    /// Add an argument fragment; returns `(tool_call_id, html)` when a partial should go out.
    pub fn push(&mut self, index: usize, fragment: &str, now: Instant) -> Option<(String, String)> {
        let call = self.calls.get_mut(&index)?;
        if call.name != "emit_screen" {
            return None;
        }
        call.args.push_str(fragment);

        let html = extract_partial_html(&call.args)?;
        if !looks_like_document(&html) {
            return None;
        }
        if call.throttle.should_emit(html.chars().count(), now) {
            Some((call.id.clone(), html))
        } else {
            None
        }
    }
}

/// How one provider stream ended.
#[derive(Debug)]
pub enum StreamOutcome {
    Completed {
        message: AssistantMessage,
        /// Text streamed during this iteration
        streamed_text: String,
    },
    Cancelled,
}

/// Drain a provider stream, forwarding events as they arrive.
pub async fn consume_stream(
    mut stream: CompletionStream,
    events: &dyn EventSink,
    render: &RenderConfig,
    cancel: &CancellationToken,
) -> Result<StreamOutcome> {
    let mut tracker = PartialPublishTracker::new(render);
    let mut streamed_text = String::new();
    let mut chunks_received = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream cancelled after {} chunks", chunks_received);
                return Ok(StreamOutcome::Cancelled);
            }
            next = stream.next() => next,
        };
        let Some(event) = next else {
            anyhow::bail!("Provider stream ended without a final message");
        };
        chunks_received += 1;

        match event? {
            StreamEvent::TextDelta { text } => {
                streamed_text.push_str(&text);
                events.emit(EngineEvent::Chunk { text });
            }
            StreamEvent::ThinkingDelta { text } => events.emit(EngineEvent::Thought { text }),
            StreamEvent::ToolCallStart { index, id, name } => {
                tracker.start(index, &id, &name);
                events.emit(EngineEvent::ToolCallStart { id, name });
            }
            StreamEvent::ToolCallDelta { index, fragment } => {
                if let Some((tool_call_id, html)) = tracker.push(index, &fragment, Instant::now()) {
                    events.emit(EngineEvent::RenderOutputPartial { tool_call_id, html });
                }
            }
            StreamEvent::Done { mut message } => {
                if message.content.is_empty() && !streamed_text.is_empty() {
                    message.content = streamed_text.clone();
                }
                if message.stop_reason == neural_providers::StopReason::ToolUse && message.tool_calls.is_empty() {
                    warn!("Provider stopped for tool use without any tool calls");
                }
                debug!(
                    "Stream finished after {} chunks: {:?}, {} tool call(s)",
                    chunks_received,
                    message.stop_reason,
                    message.tool_calls.len()
                );
                return Ok(StreamOutcome::Completed {
                    message,
                    streamed_text,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sink::CollectingEventSink;
    use neural_providers::{LLMProvider, MockChunk, MockProvider, MockResponse, StopReason};

    fn render_config() -> RenderConfig {
        RenderConfig {
            partial_min_delta_chars: 10,
            partial_min_interval_ms: 0,
            partial_large_delta_chars: 1000,
            ..RenderConfig::default()
        }
    }

    async fn stream_of(response: MockResponse) -> CompletionStream {
        let provider = MockProvider::new().with_response(response);
        provider
            .stream(neural_providers::CompletionRequest::plain(Vec::new(), 100))
            .await
            .unwrap()
    }

    #[test]
    fn test_partial_tracker_ignores_other_tools_and_fragments() {
        let mut tracker = PartialPublishTracker::new(&render_config());
        let now = Instant::now();
        tracker.start(0, "a", "write");
        assert!(tracker.push(0, r#"{"path": "<main>...........</main>"}"#, now).is_none());

        tracker.start(1, "b", "emit_screen");
        assert!(tracker.push(1, r#"{"html": "hello"#, now).is_none());
        assert!(tracker.push(7, "x", now).is_none());
    }

    #[test]
    fn test_partial_tracker_throttles_by_delta() {
        let mut tracker = PartialPublishTracker::new(&render_config());
        let now = Instant::now();
        tracker.start(0, "call_1", "emit_screen");

        let first = tracker.push(0, r#"{"html": "<main><h1>Tasks</h1>"#, now);
        assert_eq!(first, Some(("call_1".to_string(), "<main><h1>Tasks</h1>".to_string())));
        assert!(tracker.push(0, "<p>", now).is_none());
        assert!(tracker.push(0, "<p>more text</p>", now).is_some());
    }

    #[tokio::test]
    async fn test_consume_forwards_text_thoughts_and_partials() {
        let response = MockResponse::custom(
            vec![
                MockChunk::thinking("planning"),
                MockChunk::content("Here"),
                MockChunk::tool_call_fragments(
                    "emit_screen",
                    vec![r#"{"html": "<main><h1>Hello world</h1>"#, r#"</main>"}"#],
                ),
                MockChunk::finished(StopReason::ToolUse),
            ],
            None,
        );
        let sink = CollectingEventSink::new();
        let outcome = consume_stream(
            stream_of(response).await,
            &sink,
            &render_config(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        match outcome {
            StreamOutcome::Completed { message, streamed_text } => {
                assert_eq!(streamed_text, "Here");
                assert_eq!(message.stop_reason, StopReason::ToolUse);
                assert_eq!(message.tool_calls.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let events = sink.events();
        assert_eq!(events[0], EngineEvent::Thought { text: "planning".into() });
        assert_eq!(events[1], EngineEvent::Chunk { text: "Here".into() });
        assert!(matches!(events[2], EngineEvent::ToolCallStart { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::RenderOutputPartial { html, .. } if html.starts_with("<main>"))));
        assert!(sink.revisions().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_stream() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = consume_stream(
            stream_of(MockResponse::text("hi")).await,
            &CollectingEventSink::new(),
            &render_config(),
            &cancel,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, StreamOutcome::Cancelled));
    }

    #[test]
    fn test_usage_accumulates() {
        let mut state = StreamingState::new();
        state.add_usage(None);
        assert!(state.usage.is_none());
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        state.add_usage(Some(&usage));
        state.add_usage(Some(&usage));
        assert_eq!(state.usage.unwrap().total_tokens, 30);
    }
}
