//! Writes engine events to stdout as newline-delimited JSON.

use neural_core::{EngineEvent, EventSink};
use std::io::Write;
use std::sync::Mutex;

/// Serializes each event on its own line and remembers the last published screen.
pub struct NdjsonEventSink<W: Write + Send> {
    out: Mutex<W>,
    latest_html: Mutex<Option<String>>,
}

impl<W: Write + Send> NdjsonEventSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            latest_html: Mutex::new(None),
        }
    }

    /// Last committed screen, used to seed the next turn.
    pub fn latest_html(&self) -> Option<String> {
        self.latest_html.lock().ok().and_then(|html| html.clone())
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> EventSink for NdjsonEventSink<W> {
    fn emit(&self, event: EngineEvent) {
        if let EngineEvent::RenderOutput { html, .. } = &event {
            if let Ok(mut latest) = self.latest_html.lock() {
                *latest = Some(html.clone());
            }
        }

        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize event: {}", e);
                return;
            }
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_one_line_per_event() {
        let sink = NdjsonEventSink::new(Vec::new());
        sink.emit(EngineEvent::Chunk { text: "hi".into() });
        sink.emit(EngineEvent::RenderOutput {
            revision: 1,
            html: "<main>a</main>".into(),
            is_final: true,
            note: None,
            app_id: None,
        });
        assert_eq!(sink.latest_html().as_deref(), Some("<main>a</main>"));

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "chunk");
        assert_eq!(first["text"], "hi");
    }
}
