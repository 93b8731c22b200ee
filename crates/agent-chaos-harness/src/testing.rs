//! Scripted executors and simple agents for tests.

use crate::context::ChaosContext;
use crate::scenario::Agent;
use agent_chaos_contract::{ChaosError, LlmEventStream, LlmExecutor, Role};
use async_trait::async_trait;
use futures::StreamExt;
use genai::chat::{
    ChatMessage, ChatOptions, ChatRequest, ChatResponse, ChatStreamEvent, ContentPart,
    MessageContent, StreamChunk, StreamEnd, ToolResponse, Usage,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Usage block with consistent totals.
pub fn usage(prompt_tokens: i32, completion_tokens: i32) -> Usage {
    Usage {
        prompt_tokens: Some(prompt_tokens),
        prompt_tokens_details: None,
        completion_tokens: Some(completion_tokens),
        completion_tokens_details: None,
        total_tokens: Some(prompt_tokens + completion_tokens),
    }
}

/// Plain-text response with token usage.
pub fn text_chat_response(text: &str, prompt_tokens: i32, completion_tokens: i32) -> ChatResponse {
    let model_iden = genai::ModelIden::new(genai::adapter::AdapterKind::OpenAI, "mock");
    ChatResponse {
        content: MessageContent::from_text(text.to_string()),
        reasoning_content: None,
        model_iden: model_iden.clone(),
        provider_model_iden: model_iden,
        stop_reason: None,
        usage: usage(prompt_tokens, completion_tokens),
        captured_raw_body: None,
        response_id: None,
    }
}

/// Response requesting a single tool call.
pub fn tool_call_chat_response(call_id: &str, name: &str) -> ChatResponse {
    let model_iden = genai::ModelIden::new(genai::adapter::AdapterKind::OpenAI, "mock");
    ChatResponse {
        content: MessageContent::from_tool_calls(vec![genai::chat::ToolCall {
            call_id: call_id.to_string(),
            fn_name: name.to_string(),
            fn_arguments: json!({"location": "Berlin"}),
            thought_signatures: None,
        }]),
        reasoning_content: None,
        model_iden: model_iden.clone(),
        provider_model_iden: model_iden,
        stop_reason: None,
        usage: Usage::default(),
        captured_raw_body: None,
        response_id: None,
    }
}

/// Script of stream events: Start, one chunk per text, End.
pub fn text_stream_script(chunks: &[&str]) -> Vec<genai::Result<ChatStreamEvent>> {
    let mut events: Vec<genai::Result<ChatStreamEvent>> = vec![Ok(ChatStreamEvent::Start)];
    for chunk in chunks {
        events.push(Ok(ChatStreamEvent::Chunk(StreamChunk {
            content: (*chunk).to_string(),
        })));
    }
    events.push(Ok(ChatStreamEvent::End(StreamEnd::default())));
    events
}

/// Like [`text_stream_script`] but with captured usage on the End event.
pub fn text_stream_script_with_usage(
    chunks: &[&str],
    prompt_tokens: i32,
    completion_tokens: i32,
) -> Vec<genai::Result<ChatStreamEvent>> {
    let mut events = text_stream_script(chunks);
    events.pop();
    events.push(Ok(ChatStreamEvent::End(StreamEnd {
        captured_usage: Some(usage(prompt_tokens, completion_tokens)),
        ..Default::default()
    })));
    events
}

/// Non-streaming executor that replays scripted responses in order. Once the
/// script is exhausted it answers `"done"`.
#[derive(Default)]
pub struct MockChatExecutor {
    responses: Mutex<Vec<genai::Result<ChatResponse>>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<ChatRequest>>,
}

impl MockChatExecutor {
    pub fn new(responses: Vec<genai::Result<ChatResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Number of calls that reached this executor.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// The most recent request seen, after any interception rewrites.
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().ok().and_then(|g| g.clone())
    }
}

#[async_trait]
impl LlmExecutor for MockChatExecutor {
    async fn exec_chat_response(
        &self,
        _model: &str,
        chat_req: ChatRequest,
        _options: Option<&ChatOptions>,
    ) -> genai::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(chat_req);
        }
        let mut responses = match self.responses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if responses.is_empty() {
            Ok(text_chat_response("done", 0, 0))
        } else {
            responses.remove(0)
        }
    }

    async fn exec_chat_stream_events(
        &self,
        _model: &str,
        _chat_req: ChatRequest,
        _options: Option<&ChatOptions>,
    ) -> genai::Result<LlmEventStream> {
        Err(genai::Error::Internal(
            "streaming is not scripted for this executor".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Streaming executor replaying scripted event sequences, one per call.
/// Exhausted scripts yield a single `"done"` chunk.
#[derive(Default)]
pub struct MockStreamExecutor {
    scripts: Mutex<Vec<Vec<genai::Result<ChatStreamEvent>>>>,
    calls: AtomicUsize,
}

impl MockStreamExecutor {
    pub fn new(scripts: Vec<Vec<genai::Result<ChatStreamEvent>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmExecutor for MockStreamExecutor {
    async fn exec_chat_response(
        &self,
        _model: &str,
        _chat_req: ChatRequest,
        _options: Option<&ChatOptions>,
    ) -> genai::Result<ChatResponse> {
        Err(genai::Error::Internal(
            "non-streaming calls are not scripted for this executor".to_string(),
        ))
    }

    async fn exec_chat_stream_events(
        &self,
        _model: &str,
        _chat_req: ChatRequest,
        _options: Option<&ChatOptions>,
    ) -> genai::Result<LlmEventStream> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut scripts = match self.scripts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let events = if scripts.is_empty() {
            text_stream_script(&["done"])
        } else {
            scripts.remove(0)
        };
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn name(&self) -> &'static str {
        "mock_stream"
    }
}

fn chat_messages(cx: &ChaosContext, input: &str) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = cx
        .history()
        .iter()
        .map(|m| match m.role {
            Role::System => ChatMessage::system(&m.content),
            Role::User => ChatMessage::user(&m.content),
            Role::Assistant | Role::Tool => ChatMessage::assistant(&m.content),
        })
        .collect();
    messages.push(ChatMessage::user(input));
    messages
}

/// Issues one non-streaming call per turn and returns its text.
#[derive(Default)]
pub struct ChatOnceAgent;

#[async_trait]
impl Agent for ChatOnceAgent {
    async fn handle_turn(&self, cx: &ChaosContext, input: &str) -> Result<String, ChaosError> {
        let req = ChatRequest::new(chat_messages(cx, input));
        let resp = cx
            .llm()
            .exec_chat_response(cx.model(), req, None)
            .await
            .map_err(|e| ChaosError::agent(e.to_string()))?;
        Ok(resp.first_text().unwrap_or_default().to_string())
    }
}

/// Retries failed calls up to `max_attempts` before giving up.
pub struct RetryingChatAgent {
    pub max_attempts: usize,
}

#[async_trait]
impl Agent for RetryingChatAgent {
    async fn handle_turn(&self, cx: &ChaosContext, input: &str) -> Result<String, ChaosError> {
        let mut last_error = String::new();
        for _ in 0..self.max_attempts.max(1) {
            let req = ChatRequest::new(chat_messages(cx, input));
            match cx.llm().exec_chat_response(cx.model(), req, None).await {
                Ok(resp) => return Ok(resp.first_text().unwrap_or_default().to_string()),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(ChaosError::agent(last_error))
    }
}

/// Consumes a streaming call, concatenating text chunks; a stream error
/// fails the turn.
#[derive(Default)]
pub struct StreamingCollectAgent;

#[async_trait]
impl Agent for StreamingCollectAgent {
    async fn handle_turn(&self, cx: &ChaosContext, input: &str) -> Result<String, ChaosError> {
        let req = ChatRequest::new(chat_messages(cx, input));
        let mut stream = cx
            .llm()
            .exec_chat_stream_events(cx.model(), req, None)
            .await
            .map_err(|e| ChaosError::agent(e.to_string()))?;

        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(ChatStreamEvent::Chunk(chunk)) => text.push_str(&chunk.content),
                Ok(_) => {}
                Err(e) => return Err(ChaosError::agent(e.to_string())),
            }
        }
        Ok(text)
    }
}

/// Runs the request → tool call → tool result → response loop with canned
/// tool outputs, like a minimal tool-using agent.
pub struct ToolLoopAgent {
    pub tool_results: HashMap<String, String>,
    pub max_steps: usize,
}

impl Default for ToolLoopAgent {
    fn default() -> Self {
        Self {
            tool_results: HashMap::new(),
            max_steps: 4,
        }
    }
}

impl ToolLoopAgent {
    pub fn with_tool(mut self, name: &str, result: &str) -> Self {
        self.tool_results.insert(name.to_string(), result.to_string());
        self
    }
}

#[async_trait]
impl Agent for ToolLoopAgent {
    async fn handle_turn(&self, cx: &ChaosContext, input: &str) -> Result<String, ChaosError> {
        let mut messages = chat_messages(cx, input);

        for _ in 0..self.max_steps.max(1) {
            let resp = cx
                .llm()
                .exec_chat_response(cx.model(), ChatRequest::new(messages.clone()), None)
                .await
                .map_err(|e| ChaosError::agent(e.to_string()))?;

            let tool_calls: Vec<genai::chat::ToolCall> =
                resp.tool_calls().into_iter().cloned().collect();
            if tool_calls.is_empty() {
                return Ok(resp.first_text().unwrap_or_default().to_string());
            }

            let text = resp.first_text().unwrap_or_default().to_string();
            let mut content = MessageContent::from(text.as_str());
            for tool_call in tool_calls.clone() {
                content.push(ContentPart::ToolCall(tool_call));
            }
            messages.push(ChatMessage::assistant(content));

            for tool_call in &tool_calls {
                let result = self
                    .tool_results
                    .get(&tool_call.fn_name)
                    .cloned()
                    .unwrap_or_else(|| "{}".to_string());
                messages.push(ChatMessage::from(ToolResponse {
                    call_id: tool_call.call_id.clone(),
                    fn_name: None,
                    content: result,
                }));
            }
        }
        Err(ChaosError::agent("tool loop exceeded max steps"))
    }
}
