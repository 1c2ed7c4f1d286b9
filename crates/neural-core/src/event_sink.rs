//! Events streamed to the presentation layer.
//!
//! The engine reports everything through an [`EventSink`]; implementations
//! decide whether events go to a channel, a terminal, or a test buffer.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Visible assistant text
    Chunk { text: String },
    /// Ephemeral reasoning text; never recorded in memory
    Thought { text: String },
    RenderOutputPartial { tool_call_id: String, html: String },
    RenderOutput {
        revision: u32,
        html: String,
        is_final: bool,
        note: Option<String>,
        app_id: Option<String>,
    },
    ToolCallStart { id: String, name: String },
    ToolCallResult {
        id: String,
        name: String,
        is_error: bool,
        text: String,
    },
    Done { outcome: String, text: String, revisions: u32 },
    Error { code: String, message: String },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Forwards events into an unbounded channel; a closed receiver drops them.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory; used by tests and the CLI's summary output.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Committed revisions, in emission order.
    pub fn revisions(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::RenderOutput { revision, .. } => Some(revision),
                _ => None,
            })
            .collect()
    }

    pub fn text(&self) -> String {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Chunk { text } => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: EngineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = EngineEvent::RenderOutput {
            revision: 2,
            html: "<main/>".into(),
            is_final: true,
            note: None,
            app_id: Some("todo".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "render_output");
        assert_eq!(json["revision"], 2);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.emit(EngineEvent::Chunk { text: "a".into() });
        sink.emit(EngineEvent::Thought { text: "b".into() });
        assert_eq!(rx.recv().await, Some(EngineEvent::Chunk { text: "a".into() }));
        assert_eq!(rx.recv().await, Some(EngineEvent::Thought { text: "b".into() }));
    }
}
