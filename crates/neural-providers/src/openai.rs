use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::streaming::{decode_utf8_streaming, drain_complete_lines, is_context_overflow_message, StreamingToolCall};
use crate::{
    AssistantMessage, CompletionRequest, CompletionResponse, CompletionStream, LLMProvider, Message,
    MessageRole, StopReason, StreamEvent, Tool, Usage,
};

/// Provider for any OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    context_window: Option<u32>,
    name: String,
}

impl OpenAIProvider {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Self> {
        Self::new_with_name(
            "openai".to_string(),
            api_key,
            model,
            base_url,
            max_tokens,
            temperature,
        )
    }

    pub fn new_with_name(
        name: String,
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            api_key,
            model: model.unwrap_or_else(|| "gpt-4o".to_string()),
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            max_tokens,
            temperature,
            context_window: None,
            name,
        })
    }

    /// Attach the model's context window as reported by the catalog.
    pub fn with_context_window(mut self, context_window: Option<u32>) -> Self {
        self.context_window = context_window;
        self
    }

    fn create_request_body(
        &self,
        messages: &[Message],
        tools: Option<&[Tool]>,
        stream: bool,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": convert_messages(messages),
            "stream": stream,
        });

        if let Some(max_tokens) = max_tokens.or(self.max_tokens) {
            body["max_completion_tokens"] = json!(max_tokens);
        }

        if let Some(temperature) = temperature.or(self.temperature) {
            body["temperature"] = json!(temperature);
        }

        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = json!(convert_tools(tools));
            }
        }

        if stream {
            body["stream_options"] = json!({
                "include_usage": true,
            });
        }

        body
    }

    async fn parse_streaming_response(
        &self,
        mut stream: impl futures_util::Stream<Item = reqwest::Result<Bytes>> + Unpin,
        tx: mpsc::Sender<Result<StreamEvent>>,
    ) -> Option<Usage> {
        let mut byte_buffer: Vec<u8> = Vec::new();
        let mut buffer = String::new();
        let mut accumulated_content = String::new();
        let mut accumulated_usage: Option<Usage> = None;
        let mut finish_reason: Option<String> = None;
        let mut current_tool_calls: Vec<StreamingToolCall> = Vec::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!("Stream error: {}", e);
                    let _ = tx.send(Err(anyhow::anyhow!("Stream error: {}", e))).await;
                    return accumulated_usage;
                }
            };

            byte_buffer.extend_from_slice(&chunk);
            let Some(text) = decode_utf8_streaming(&mut byte_buffer) else {
                continue;
            };
            buffer.push_str(&text);

            for line in drain_complete_lines(&mut buffer) {
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };

                if data == "[DONE]" {
                    debug!("Received stream completion marker");
                    let message = finalize_message(
                        accumulated_content,
                        &current_tool_calls,
                        finish_reason.as_deref(),
                        accumulated_usage.clone(),
                    );
                    let _ = tx.send(Ok(StreamEvent::Done { message })).await;
                    return accumulated_usage;
                }

                let chunk_data = match serde_json::from_str::<OpenAIStreamChunk>(data) {
                    Ok(chunk_data) => chunk_data,
                    Err(e) => {
                        debug!("Failed to parse stream chunk: {} - Data: {}", e, data);
                        continue;
                    }
                };

                if let Some(err) = chunk_data.error {
                    let message = error_message(err.message);
                    let _ = tx.send(Ok(StreamEvent::Done { message })).await;
                    return accumulated_usage;
                }

                for choice in &chunk_data.choices {
                    if let Some(reasoning) = &choice.delta.reasoning_content {
                        if !reasoning.is_empty()
                            && tx
                                .send(Ok(StreamEvent::ThinkingDelta {
                                    text: reasoning.clone(),
                                }))
                                .await
                                .is_err()
                        {
                            debug!("Receiver dropped, stopping stream");
                            return accumulated_usage;
                        }
                    }

                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            accumulated_content.push_str(content);
                            if tx
                                .send(Ok(StreamEvent::TextDelta {
                                    text: content.clone(),
                                }))
                                .await
                                .is_err()
                            {
                                debug!("Receiver dropped, stopping stream");
                                return accumulated_usage;
                            }
                        }
                    }

                    if let Some(delta_tool_calls) = &choice.delta.tool_calls {
                        for delta_tool_call in delta_tool_calls {
                            let index = delta_tool_call.index.unwrap_or(0);
                            while current_tool_calls.len() <= index {
                                current_tool_calls.push(StreamingToolCall::default());
                            }
                            let tool_call = &mut current_tool_calls[index];
                            let was_announced = tool_call.id.is_some() && tool_call.name.is_some();

                            if let Some(id) = &delta_tool_call.id {
                                tool_call.id = Some(id.clone());
                            }

                            let mut fragment = None;
                            if let Some(function) = &delta_tool_call.function {
                                if let Some(name) = &function.name {
                                    tool_call.name = Some(name.clone());
                                }
                                if let Some(arguments) = &function.arguments {
                                    tool_call.arguments.push_str(arguments);
                                    fragment = Some(arguments.clone());
                                }
                            }

                            if !was_announced {
                                if let (Some(id), Some(name)) = (&tool_call.id, &tool_call.name) {
                                    let _ = tx
                                        .send(Ok(StreamEvent::ToolCallStart {
                                            index,
                                            id: id.clone(),
                                            name: name.clone(),
                                        }))
                                        .await;
                                }
                            }

                            if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
                                let _ = tx
                                    .send(Ok(StreamEvent::ToolCallDelta { index, fragment }))
                                    .await;
                            }
                        }
                    }

                    if let Some(reason) = &choice.finish_reason {
                        finish_reason = Some(reason.clone());
                    }
                }

                if let Some(usage) = chunk_data.usage {
                    accumulated_usage = Some(Usage {
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        total_tokens: usage.total_tokens,
                    });
                }
            }
        }

        // Connection closed without [DONE]
        let message = finalize_message(
            accumulated_content,
            &current_tool_calls,
            finish_reason.as_deref(),
            accumulated_usage.clone(),
        );
        let _ = tx.send(Ok(StreamEvent::Done { message })).await;

        accumulated_usage
    }
}

fn finalize_message(
    content: String,
    tool_calls: &[StreamingToolCall],
    finish_reason: Option<&str>,
    usage: Option<Usage>,
) -> AssistantMessage {
    let tool_calls: Vec<_> = tool_calls.iter().filter_map(|tc| tc.to_tool_call()).collect();
    let stop_reason = match finish_reason {
        Some(reason) => StopReason::from_finish_reason(reason),
        None if !tool_calls.is_empty() => StopReason::ToolUse,
        None => StopReason::EndTurn,
    };
    AssistantMessage {
        content,
        tool_calls,
        stop_reason,
        usage,
        error_message: None,
    }
}

fn error_message(text: String) -> AssistantMessage {
    let stop_reason = if is_context_overflow_message(&text) {
        StopReason::ContextOverflow
    } else {
        StopReason::Error
    };
    AssistantMessage {
        stop_reason,
        error_message: Some(text),
        ..Default::default()
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        debug!(
            "Processing OpenAI completion request with {} messages",
            request.messages.len()
        );

        let body = self.create_request_body(
            &request.messages,
            request.tools.as_deref(),
            false,
            request.max_tokens,
            request.temperature,
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "OpenAI API error {}: {}",
                status,
                error_text
            ));
        }

        let openai_response: OpenAIResponse = response.json().await?;

        let content = openai_response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        let usage = openai_response
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        debug!(
            "OpenAI completion successful: {} tokens generated",
            usage.completion_tokens
        );

        Ok(CompletionResponse {
            content,
            usage,
            model: self.model.clone(),
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        debug!(
            "Processing OpenAI streaming request with {} messages",
            request.messages.len()
        );

        let body = self.create_request_body(
            &request.messages,
            request.tools.as_deref(),
            true,
            request.max_tokens,
            request.temperature,
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            // Overflow is a stop condition the agent loop can recover from,
            // so surface it in-band rather than as a transport error.
            if status.as_u16() == 400 && is_context_overflow_message(&error_text) {
                warn!("OpenAI rejected request: context overflow");
                let (tx, rx) = mpsc::channel(1);
                let _ = tx
                    .send(Ok(StreamEvent::Done {
                        message: error_message(error_text),
                    }))
                    .await;
                return Ok(ReceiverStream::new(rx));
            }

            return Err(anyhow::anyhow!(
                "OpenAI API error {}: {}",
                status,
                error_text
            ));
        }

        let stream = response.bytes_stream();
        let (tx, rx) = mpsc::channel(100);

        let provider = self.clone();
        tokio::spawn(async move {
            let usage = provider.parse_streaming_response(stream, tx).await;
            if let Some(usage) = usage {
                debug!(
                    "Stream completed with usage - prompt: {}, completion: {}, total: {}",
                    usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
                );
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
        self.max_tokens.unwrap_or(16000)
    }

    fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(0.1)
    }

    fn context_window_size(&self) -> Option<u32> {
        self.context_window
    }
}

fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            MessageRole::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": msg.content,
            }),
            MessageRole::Assistant if !msg.tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": msg.content,
                "tool_calls": msg.tool_calls.iter().map(|tc| json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.tool,
                        "arguments": tc.args.to_string(),
                    }
                })).collect::<Vec<_>>(),
            }),
            role => json!({
                "role": match role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    _ => "assistant",
                },
                "content": msg.content,
            }),
        })
        .collect()
}

fn convert_tools(tools: &[Tool]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

// OpenAI API response structures
#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// Streaming response structures
#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    usage: Option<OpenAIUsage>,
    error: Option<OpenAIStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIDeltaToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<OpenAIDeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAIDeltaFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;

    fn provider() -> OpenAIProvider {
        OpenAIProvider::new("key".into(), Some("m".into()), None, Some(512), None).unwrap()
    }

    async fn collect(sse: &str) -> Vec<StreamEvent> {
        let bytes: Vec<reqwest::Result<Bytes>> = vec![Ok(Bytes::from(sse.to_string()))];
        let (tx, mut rx) = mpsc::channel(100);
        provider()
            .parse_streaming_response(futures_util::stream::iter(bytes), tx)
            .await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_text_stream_ends_with_done() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":2,\"total_tokens\":12}}\n\n",
            "data: [DONE]\n\n",
        );
        let events = collect(sse).await;
        assert_eq!(events.len(), 3);
        match events.last().unwrap() {
            StreamEvent::Done { message } => {
                assert_eq!(message.content, "Hello");
                assert_eq!(message.stop_reason, StopReason::EndTurn);
                assert_eq!(message.usage.as_ref().unwrap().total_tokens, 12);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_call_fragments_are_announced_and_accumulated() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"emit_screen\",\"arguments\":\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"html\\\":\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"<p>x</p>\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n",
            "data: [DONE]\n",
        );
        let events = collect(sse).await;
        assert!(matches!(
            &events[0],
            StreamEvent::ToolCallStart { index: 0, name, .. } if name == "emit_screen"
        ));
        let fragments: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallDelta { fragment, .. } => Some(fragment.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments, "{\"html\":\"<p>x</p>\"}");

        match events.last().unwrap() {
            StreamEvent::Done { message } => {
                assert_eq!(message.stop_reason, StopReason::ToolUse);
                assert_eq!(
                    message.tool_calls,
                    vec![ToolCall {
                        id: "call_a".into(),
                        tool: "emit_screen".into(),
                        args: json!({"html": "<p>x</p>"}),
                    }]
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_convert_messages_includes_tool_linkage() {
        let call = ToolCall {
            id: "call_1".into(),
            tool: "read".into(),
            args: json!({"path": "a.txt"}),
        };
        let converted = convert_messages(&[
            Message::assistant_with_tools(String::new(), vec![call]),
            Message::tool_result("call_1", "contents".into(), false),
        ]);
        assert_eq!(converted[0]["tool_calls"][0]["function"]["name"], "read");
        assert_eq!(converted[1]["role"], "tool");
        assert_eq!(converted[1]["tool_call_id"], "call_1");
    }
}
