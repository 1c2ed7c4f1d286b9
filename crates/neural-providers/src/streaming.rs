//! Shared utilities for streaming SSE response parsing.
//!
//! This module provides common helpers used by providers
//! for handling Server-Sent Events (SSE) streaming responses.

use crate::ToolCall;

// ─────────────────────────────────────────────────────────────────────────────
// UTF-8 Streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Try to decode bytes as UTF-8, handling incomplete sequences at the end.
/// Returns the decoded string and leaves any incomplete bytes in the buffer.
pub fn decode_utf8_streaming(byte_buffer: &mut Vec<u8>) -> Option<String> {
    match std::str::from_utf8(byte_buffer) {
        Ok(s) => {
            let result = s.to_string();
            byte_buffer.clear();
            Some(result)
        }
        Err(e) => {
            let valid_up_to = e.valid_up_to();
            if valid_up_to > 0 {
                let valid_bytes: Vec<u8> = byte_buffer.drain(..valid_up_to).collect();
                Some(String::from_utf8_lossy(&valid_bytes).into_owned())
            } else {
                None // No valid UTF-8 yet, wait for more bytes
            }
        }
    }
}

/// Split complete lines off the front of an SSE text buffer.
pub fn drain_complete_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line_end) = buffer.find('\n') {
        let line = buffer[..line_end].trim().to_string();
        buffer.drain(..line_end + 1);
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Detection
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a provider error body describes a prompt that no longer fits the model.
pub fn is_context_overflow_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("context length")
        || lower.contains("prompt is too long")
        || lower.contains("too many tokens")
        || lower.contains("context window")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Call Accumulation
// ─────────────────────────────────────────────────────────────────────────────

/// Accumulates one tool call whose id, name and arguments arrive in fragments.
#[derive(Debug, Default, Clone)]
pub struct StreamingToolCall {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

impl StreamingToolCall {
    /// Finalize into a `ToolCall`. Unparseable arguments become `Null` so the
    /// dispatcher can report a validation error instead of dropping the call.
    pub fn to_tool_call(&self) -> Option<ToolCall> {
        let id = self.id.as_ref()?;
        let name = self.name.as_ref()?;

        let args = if self.arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.arguments).unwrap_or(serde_json::Value::Null)
        };

        Some(ToolCall {
            id: id.clone(),
            tool: name.clone(),
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_keeps_incomplete_multibyte_tail() {
        // "é" is 0xC3 0xA9; feed only the first byte after ASCII
        let mut buffer = vec![b'a', b'b', 0xC3];
        assert_eq!(decode_utf8_streaming(&mut buffer).as_deref(), Some("ab"));
        assert_eq!(buffer, vec![0xC3]);

        buffer.push(0xA9);
        assert_eq!(decode_utf8_streaming(&mut buffer).as_deref(), Some("é"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_complete_lines_leaves_partial_line() {
        let mut buffer = "data: one\n\ndata: two\ndata: thr".to_string();
        let lines = drain_complete_lines(&mut buffer);
        assert_eq!(lines, vec!["data: one", "data: two"]);
        assert_eq!(buffer, "data: thr");
    }

    #[test]
    fn test_overflow_detection() {
        assert!(is_context_overflow_message(
            "This model's maximum context length is 128000 tokens"
        ));
        assert!(is_context_overflow_message("{\"code\":\"context_length_exceeded\"}"));
        assert!(!is_context_overflow_message("rate limit reached"));
    }

    #[test]
    fn test_streaming_tool_call_with_empty_args() {
        let call = StreamingToolCall {
            id: Some("call_1".into()),
            name: Some("read_screen".into()),
            arguments: String::new(),
        };
        let tool_call = call.to_tool_call().unwrap();
        assert!(tool_call.args.is_object());
    }
}
