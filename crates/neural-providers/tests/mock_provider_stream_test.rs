//! Stream shape tests for the mock provider.
//!
//! The agent loop relies on every stream ending with exactly one `Done`
//! event, and on tool calls being announced before their argument fragments.

use futures_util::StreamExt;
use neural_providers::mock::{MockChunk, MockProvider, MockResponse};
use neural_providers::{CompletionRequest, LLMProvider, Message, StopReason, StreamEvent};
use serde_json::json;

fn request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message::user("hi")],
        max_tokens: None,
        temperature: None,
        stream: true,
        tools: None,
    }
}

async fn drain(provider: &MockProvider) -> Vec<StreamEvent> {
    let mut stream = provider.stream(request()).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.unwrap());
    }
    events
}

#[tokio::test]
async fn test_fragmented_tool_call_reassembles_arguments() {
    let provider = MockProvider::new().with_response(MockResponse::custom(
        vec![
            MockChunk::thinking("planning"),
            MockChunk::tool_call_fragments("emit_screen", vec!["{\"html\":\"<main>", "hi</main>\"}"]),
            MockChunk::finished(StopReason::ToolUse),
        ],
        None,
    ));

    let events = drain(&provider).await;
    assert!(matches!(events[0], StreamEvent::ThinkingDelta { .. }));
    assert!(matches!(events[1], StreamEvent::ToolCallStart { index: 0, .. }));
    assert!(matches!(events[2], StreamEvent::ToolCallDelta { index: 0, .. }));
    assert!(matches!(events[3], StreamEvent::ToolCallDelta { index: 0, .. }));

    let done_count = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Done { .. }))
        .count();
    assert_eq!(done_count, 1);

    match events.last().unwrap() {
        StreamEvent::Done { message } => {
            assert_eq!(message.stop_reason, StopReason::ToolUse);
            assert_eq!(message.tool_calls[0].args, json!({"html": "<main>hi</main>"}));
        }
        other => panic!("expected Done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failure_response_errors_before_streaming() {
    let provider = MockProvider::new()
        .with_response(MockResponse::failure("connection refused"))
        .with_response(MockResponse::text("recovered"));

    assert!(provider.stream(request()).await.is_err());
    let events = drain(&provider).await;
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    assert_eq!(provider.stream_requests().len(), 2);
}

#[tokio::test]
async fn test_complete_uses_its_own_queue() {
    let provider = MockProvider::new()
        .with_response(MockResponse::text("streamed"))
        .with_completion(MockResponse::text("summary text"));

    let response = provider.complete(request()).await.unwrap();
    assert_eq!(response.content, "summary text");

    let events = drain(&provider).await;
    assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "streamed"));
}
