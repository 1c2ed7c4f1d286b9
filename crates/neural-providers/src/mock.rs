//! Mock LLM Provider for Testing
//!
//! This module provides a configurable mock provider that can simulate
//! various LLM behaviors for integration testing. It allows precise control
//! over streamed events, tool calls, stop reasons and transport failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use neural_providers::mock::{MockProvider, MockResponse};
//!
//! // Simple text-only response
//! let provider = MockProvider::new()
//!     .with_response(MockResponse::text("Hello, world!"));
//!
//! // Response with a tool call
//! let provider = MockProvider::new()
//!     .with_response(MockResponse::tool_call("bash", json!({"command": "ls"})));
//! ```

use crate::{
    AssistantMessage, CompletionRequest, CompletionResponse, CompletionStream, LLMProvider,
    StopReason, StreamEvent, ToolCall, Usage,
};
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Global counter for generating unique tool call IDs
static TOOL_CALL_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_tool_call_id() -> String {
    format!("call_{}", TOOL_CALL_COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// A single step in a mock streaming response
#[derive(Debug, Clone)]
pub enum MockChunk {
    Text(String),
    Thinking(String),
    /// A tool call streamed as one or more argument fragments
    ToolCall {
        id: String,
        name: String,
        fragments: Vec<String>,
    },
    /// Final stop reason, with optional provider error text
    Finish {
        stop_reason: StopReason,
        error_message: Option<String>,
    },
}

impl MockChunk {
    pub fn content(text: &str) -> Self {
        MockChunk::Text(text.to_string())
    }

    pub fn thinking(text: &str) -> Self {
        MockChunk::Thinking(text.to_string())
    }

    pub fn finished(stop_reason: StopReason) -> Self {
        MockChunk::Finish {
            stop_reason,
            error_message: None,
        }
    }

    /// A tool call whose serialized arguments arrive in one fragment.
    pub fn tool_call(tool: &str, args: serde_json::Value) -> Self {
        MockChunk::ToolCall {
            id: next_tool_call_id(),
            name: tool.to_string(),
            fragments: vec![args.to_string()],
        }
    }

    /// A tool call whose raw argument text is split into the given fragments.
    pub fn tool_call_fragments(tool: &str, fragments: Vec<&str>) -> Self {
        MockChunk::ToolCall {
            id: next_tool_call_id(),
            name: tool.to_string(),
            fragments: fragments.into_iter().map(str::to_string).collect(),
        }
    }
}

/// A mock response that can be configured for testing
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub chunks: Vec<MockChunk>,
    /// Usage stats to report
    pub usage: Option<Usage>,
    /// When set, `stream`/`complete` fail with this error before producing events
    pub fail_with: Option<String>,
}

fn usage_for(text_len: usize) -> Option<Usage> {
    let completion = (text_len / 4) as u32;
    Some(Usage {
        prompt_tokens: 100,
        completion_tokens: completion,
        total_tokens: 100 + completion,
    })
}

impl MockResponse {
    /// Create a simple text-only response
    pub fn text(content: &str) -> Self {
        Self {
            chunks: vec![
                MockChunk::content(content),
                MockChunk::finished(StopReason::EndTurn),
            ],
            usage: usage_for(content.len()),
            fail_with: None,
        }
    }

    /// Create a streaming text response with multiple chunks
    pub fn streaming(chunks: Vec<&str>) -> Self {
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let mut mock_chunks: Vec<MockChunk> = chunks.into_iter().map(MockChunk::content).collect();
        mock_chunks.push(MockChunk::finished(StopReason::EndTurn));
        Self {
            chunks: mock_chunks,
            usage: usage_for(total),
            fail_with: None,
        }
    }

    /// Create a response with a single tool call
    pub fn tool_call(tool: &str, args: serde_json::Value) -> Self {
        Self::tool_calls(vec![(tool, args)])
    }

    /// Create a response requesting several tool calls in order
    pub fn tool_calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        let mut chunks: Vec<MockChunk> = calls
            .into_iter()
            .map(|(tool, args)| MockChunk::tool_call(tool, args))
            .collect();
        chunks.push(MockChunk::finished(StopReason::ToolUse));
        Self {
            chunks,
            usage: usage_for(200),
            fail_with: None,
        }
    }

    /// Create a response with text followed by a tool call
    pub fn text_then_tool(text: &str, tool: &str, args: serde_json::Value) -> Self {
        Self {
            chunks: vec![
                MockChunk::content(text),
                MockChunk::tool_call(tool, args),
                MockChunk::finished(StopReason::ToolUse),
            ],
            usage: usage_for(text.len() + 200),
            fail_with: None,
        }
    }

    /// A provider-reported context overflow with no streamed text
    pub fn context_overflow() -> Self {
        Self {
            chunks: vec![MockChunk::Finish {
                stop_reason: StopReason::ContextOverflow,
                error_message: Some("maximum context length exceeded".to_string()),
            }],
            usage: None,
            fail_with: None,
        }
    }

    /// A provider-reported error stop condition
    pub fn provider_error(message: &str) -> Self {
        Self {
            chunks: vec![MockChunk::Finish {
                stop_reason: StopReason::Error,
                error_message: Some(message.to_string()),
            }],
            usage: None,
            fail_with: None,
        }
    }

    /// A transport-level failure returned from `stream`/`complete`
    pub fn failure(error: &str) -> Self {
        Self {
            chunks: Vec::new(),
            usage: None,
            fail_with: Some(error.to_string()),
        }
    }

    /// Create a custom response with explicit chunks
    pub fn custom(chunks: Vec<MockChunk>, usage: Option<Usage>) -> Self {
        Self {
            chunks,
            usage,
            fail_with: None,
        }
    }

    /// Builder: set custom usage
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Expand the chunks into the event sequence a real provider would emit.
    fn to_events(&self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut stop_reason = StopReason::EndTurn;
        let mut error_message = None;

        for chunk in &self.chunks {
            match chunk {
                MockChunk::Text(text) => {
                    content.push_str(text);
                    events.push(StreamEvent::TextDelta { text: text.clone() });
                }
                MockChunk::Thinking(text) => {
                    events.push(StreamEvent::ThinkingDelta { text: text.clone() });
                }
                MockChunk::ToolCall { id, name, fragments } => {
                    let index = tool_calls.len();
                    events.push(StreamEvent::ToolCallStart {
                        index,
                        id: id.clone(),
                        name: name.clone(),
                    });
                    for fragment in fragments {
                        events.push(StreamEvent::ToolCallDelta {
                            index,
                            fragment: fragment.clone(),
                        });
                    }
                    let raw: String = fragments.concat();
                    tool_calls.push(ToolCall {
                        id: id.clone(),
                        tool: name.clone(),
                        args: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
                    });
                }
                MockChunk::Finish {
                    stop_reason: reason,
                    error_message: message,
                } => {
                    stop_reason = *reason;
                    error_message = message.clone();
                }
            }
        }

        events.push(StreamEvent::Done {
            message: AssistantMessage {
                content,
                tool_calls,
                stop_reason,
                usage: self.usage.clone(),
                error_message,
            },
        });
        events
    }
}

/// A mock LLM provider for testing
///
/// The provider maintains a queue of responses that are returned in order.
/// It also tracks all requests made for verification in tests.
#[derive(Clone)]
pub struct MockProvider {
    name: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    context_window: Option<u32>,
    /// Queue of responses for `stream` (FIFO)
    responses: Arc<Mutex<Vec<MockResponse>>>,
    /// Queue of responses for `complete` (FIFO)
    completions: Arc<Mutex<Vec<MockResponse>>>,
    /// All requests received (for verification)
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    /// Default response when queue is empty
    default_response: Option<MockResponse>,
}

impl MockProvider {
    /// Create a new mock provider with default settings
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            model: "mock-model".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            context_window: None,
            responses: Arc::new(Mutex::new(Vec::new())),
            completions: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            default_response: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_context_window(mut self, context_window: u32) -> Self {
        self.context_window = Some(context_window);
        self
    }

    /// Add a streamed response to the queue
    pub fn with_response(self, response: MockResponse) -> Self {
        lock(&self.responses).push(response);
        self
    }

    /// Add multiple streamed responses to the queue
    pub fn with_responses(self, responses: Vec<MockResponse>) -> Self {
        lock(&self.responses).extend(responses);
        self
    }

    /// Add a non-streaming (`complete`) response to its own queue
    pub fn with_completion(self, response: MockResponse) -> Self {
        lock(&self.completions).push(response);
        self
    }

    /// Set a default response when queue is empty
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = Some(response);
        self
    }

    /// Get all requests that were made to this provider
    pub fn get_requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    /// Requests made through `stream`
    pub fn stream_requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).iter().filter(|r| r.stream).cloned().collect()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn clear_requests(&self) {
        lock(&self.requests).clear();
    }

    fn next_from(&self, queue: &Arc<Mutex<Vec<MockResponse>>>) -> MockResponse {
        let mut responses = lock(queue);
        if responses.is_empty() {
            self.default_response
                .clone()
                .unwrap_or_else(|| MockResponse::text("Mock response (no responses configured)"))
        } else {
            responses.remove(0)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LLMProvider for MockProvider {
    async fn complete(&self, mut request: CompletionRequest) -> Result<CompletionResponse> {
        request.stream = false;
        lock(&self.requests).push(request);

        let response = self.next_from(&self.completions);
        if let Some(error) = response.fail_with {
            anyhow::bail!(error);
        }

        let content: String = response
            .chunks
            .iter()
            .filter_map(|c| match c {
                MockChunk::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();

        Ok(CompletionResponse {
            content,
            usage: response.usage.unwrap_or_default(),
            model: self.model.clone(),
        })
    }

    async fn stream(&self, mut request: CompletionRequest) -> Result<CompletionStream> {
        request.stream = true;
        lock(&self.requests).push(request);

        let response = self.next_from(&self.responses);
        if let Some(error) = response.fail_with {
            anyhow::bail!(error);
        }

        let events = response.to_events();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        tokio::spawn(async move {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }

    fn context_window_size(&self) -> Option<u32> {
        self.context_window
    }
}
