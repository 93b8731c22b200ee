//! Provider interception.
//!
//! The agent under test issues calls through an [`ExecutorSlot`]. Installing
//! the [`SlotProviderAdapter`] swaps the slot's executor for a
//! [`ChaosLlmExecutor`] that decorates the original: it opens a span per
//! call, consults the injector at the LLM and TOOL points, wraps streaming
//! responses, and feeds the recorder, all without the agent's knowledge.
//! Uninstalling restores the original executor reference.

use crate::context::RunState;
use crate::injector::ConsultProbe;
use crate::recorder::FaultDetail;
use crate::stream::{wrap_stream, StreamSettings};
use agent_chaos_contract::{
    ChaosError, ChaosPoint, Fault, LlmEventStream, LlmExecutor, ProviderAdapter,
};
use async_trait::async_trait;
use genai::chat::{
    ChatOptions, ChatRequest, ChatResponse, ChatRole, ChatStreamEvent, MessageContent,
    StreamChunk, StreamEnd, Usage,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// Truncated-JSON payload returned for `MalformedResponse` faults.
const MALFORMED_PAYLOAD: &str = "{\"message\":{\"content\":[{\"ty";

/// Holds the executor the agent calls through.
pub struct ExecutorSlot {
    current: Mutex<Arc<dyn LlmExecutor>>,
}

impl ExecutorSlot {
    pub fn new(executor: Arc<dyn LlmExecutor>) -> Self {
        Self {
            current: Mutex::new(executor),
        }
    }

    /// The executor currently installed.
    pub fn current(&self) -> Arc<dyn LlmExecutor> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, executor: Arc<dyn LlmExecutor>) -> Arc<dyn LlmExecutor> {
        let mut guard = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, executor)
    }
}

impl std::fmt::Debug for ExecutorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSlot").finish()
    }
}

/// Installs/removes the chaos decorator on an [`ExecutorSlot`].
pub struct SlotProviderAdapter {
    slot: Arc<ExecutorSlot>,
    state: Arc<RunState>,
    original: Mutex<Option<Arc<dyn LlmExecutor>>>,
}

impl SlotProviderAdapter {
    /// Standalone adapter owning its own run state; the scenario runner uses
    /// [`SlotProviderAdapter::with_state`] to share state with the turn
    /// executor.
    pub fn new(
        slot: Arc<ExecutorSlot>,
        injector: crate::injector::Injector,
        recorder: crate::recorder::Recorder,
    ) -> Self {
        Self::with_state(slot, Arc::new(RunState::new(injector, recorder)))
    }

    pub(crate) fn with_state(slot: Arc<ExecutorSlot>, state: Arc<RunState>) -> Self {
        Self {
            slot,
            state,
            original: Mutex::new(None),
        }
    }
}

impl ProviderAdapter for SlotProviderAdapter {
    fn install(&self) -> Result<(), ChaosError> {
        let mut original = self
            .original
            .lock()
            .map_err(|_| ChaosError::scenario("provider adapter state poisoned"))?;
        if original.is_some() {
            return Ok(());
        }
        let inner = self.slot.current();
        let wrapped: Arc<dyn LlmExecutor> =
            Arc::new(ChaosLlmExecutor::new(inner.clone(), self.state.clone()));
        self.slot.replace(wrapped);
        *original = Some(inner);
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ChaosError> {
        let mut original = self
            .original
            .lock()
            .map_err(|_| ChaosError::scenario("provider adapter state poisoned"))?;
        if let Some(inner) = original.take() {
            self.slot.replace(inner);
        }
        Ok(())
    }
}

/// Ensures every opened span is closed exactly once, including when the call
/// future or the wrapped stream is dropped mid-flight.
pub(crate) struct SpanGuard {
    state: Arc<RunState>,
    call_id: String,
    closed: bool,
}

impl SpanGuard {
    pub(crate) fn new(state: Arc<RunState>, call_id: String) -> Self {
        Self {
            state,
            call_id,
            closed: false,
        }
    }

    pub(crate) fn call_id(&self) -> &str {
        &self.call_id
    }

    pub(crate) fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub(crate) fn close(&mut self, success: bool, injected: bool, error: Option<String>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state
            .recorder
            .end_call(&self.call_id, success, injected, error);
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if !self.closed {
            self.state.recorder.end_call(
                &self.call_id,
                false,
                false,
                Some("call dropped before completion".to_string()),
            );
        }
    }
}

enum LlmGate {
    Proceed,
    Fail(String),
    Malformed,
}

/// Decorator applying the injection engine's verdicts to one executor.
pub struct ChaosLlmExecutor {
    inner: Arc<dyn LlmExecutor>,
    state: Arc<RunState>,
}

impl ChaosLlmExecutor {
    pub(crate) fn new(inner: Arc<dyn LlmExecutor>, state: Arc<RunState>) -> Self {
        Self { inner, state }
    }

    fn provider(&self) -> &'static str {
        self.inner.name()
    }

    /// Capture the system prompt from the first request that carries one.
    fn capture_system_prompt(&self, chat_req: &ChatRequest) {
        if let Some(system) = chat_req.system.as_deref() {
            self.state.recorder.record_system_prompt(system);
            return;
        }
        for msg in &chat_req.messages {
            if matches!(msg.role, ChatRole::System) {
                if let Some(text) = msg.content.texts().first() {
                    self.state.recorder.record_system_prompt(text);
                }
                return;
            }
        }
    }

    /// Rewrite tool responses in the outgoing request per TOOL-point
    /// verdicts, and resolve the tracked tool lifecycles against this call.
    fn apply_tool_stage(
        &self,
        chat_req: &mut ChatRequest,
        call_id: &str,
        call_in_turn: usize,
        call_in_run: usize,
    ) -> Result<(), ChaosError> {
        let turn_index = self.state.turn_index.load(Ordering::Relaxed);
        let provider = self.provider();

        for msg in chat_req.messages.iter_mut() {
            let responses: Vec<&mut genai::chat::ToolResponse> = msg
                .content
                .iter_mut()
                .filter_map(|part| match part {
                    genai::chat::ContentPart::ToolResponse(tr) => Some(tr),
                    _ => None,
                })
                .collect();
            if responses.is_empty() {
                continue;
            }
            for response in responses {
                let already_ended = self
                    .state
                    .recorder
                    .with_metrics(|m| m.tools.is_ended(&response.call_id));
                if already_ended {
                    continue;
                }
                let tool_name = self
                    .state
                    .recorder
                    .with_metrics(|m| m.tools.name_of(&response.call_id).map(str::to_string))
                    .unwrap_or_else(|| response.call_id.clone());

                let probe = ConsultProbe {
                    turn_index,
                    call_in_turn,
                    call_in_run,
                    tool_name: Some(&tool_name),
                };
                let verdict = self.state.injector.consult(ChaosPoint::Tool, probe)?;

                let mut success = true;
                let mut fault_error = None;
                if let Some(verdict) = verdict {
                    let original = response.content.clone();
                    let mutated = match &verdict.fault {
                        Fault::ToolError { message } => {
                            success = false;
                            fault_error = Some(message.clone());
                            Some(serde_json::json!({ "error": message }).to_string())
                        }
                        Fault::ToolEmpty => Some(String::new()),
                        Fault::ToolTimeout { timeout } => Some(format!(
                            "Tool execution timed out after {}s",
                            timeout.as_secs_f64()
                        )),
                        Fault::ToolMutate { mutator } => {
                            Some(mutator.apply(&tool_name, &original))
                        }
                        other => {
                            tracing::warn!(fault = other.label(), "unexpected fault at TOOL point");
                            None
                        }
                    };
                    // Only an actual rewrite counts as an injection.
                    if let Some(mutated) = mutated.filter(|m| *m != original) {
                        response.content = mutated.clone();
                        self.state.recorder.record_fault(
                            Some(call_id),
                            &verdict,
                            FaultDetail {
                                target_tool: Some(tool_name.clone()),
                                original: Some(original),
                                mutated: Some(mutated),
                                ..FaultDetail::default()
                            },
                        );
                        self.state.recorder.mark_tool_faulted(&response.call_id);
                    }
                }

                self.state.recorder.record_tool_end(
                    &response.call_id,
                    call_id,
                    provider,
                    success,
                    Some(response.content.len()),
                    fault_error,
                );
            }
        }
        Ok(())
    }

    /// Consult the LLM point. Records the fault (choke point) when a verdict
    /// fires; the caller surfaces the matching error or payload.
    fn consult_llm_gate(&self, call_id: &str, call_in_turn: usize, call_in_run: usize) -> LlmGate {
        let probe = ConsultProbe {
            turn_index: self.state.turn_index.load(Ordering::Relaxed),
            call_in_turn,
            call_in_run,
            tool_name: None,
        };
        let verdict = match self.state.injector.consult(ChaosPoint::Llm, probe) {
            Ok(verdict) => verdict,
            Err(e) => {
                let message = e.to_string();
                self.state.fail_scenario(e);
                return LlmGate::Fail(message);
            }
        };
        let Some(verdict) = verdict else {
            return LlmGate::Proceed;
        };
        match &verdict.fault {
            Fault::MalformedResponse => {
                self.state
                    .recorder
                    .record_fault(Some(call_id), &verdict, FaultDetail::default());
                LlmGate::Malformed
            }
            Fault::RateLimit | Fault::Timeout | Fault::ServerError | Fault::AuthError => {
                let message = injected_error_message(&verdict.fault).to_string();
                self.state
                    .recorder
                    .record_fault(Some(call_id), &verdict, FaultDetail::default());
                LlmGate::Fail(message)
            }
            other => {
                tracing::warn!(fault = other.label(), "unexpected fault at LLM point");
                LlmGate::Proceed
            }
        }
    }

    fn record_response_metadata(&self, call_id: &str, model: &str, resp: &ChatResponse) {
        let usage = &resp.usage;
        self.state.recorder.record_token_usage(
            call_id,
            self.provider(),
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
            Some(model.to_string()),
        );
        for tool_call in resp.tool_calls() {
            let arg_bytes = serde_json::to_string(&tool_call.fn_arguments)
                .ok()
                .map(|s| s.len());
            self.state.recorder.record_tool_use(
                call_id,
                self.provider(),
                &tool_call.fn_name,
                &tool_call.call_id,
                arg_bytes,
            );
        }
    }
}

fn injected_error_message(fault: &Fault) -> &'static str {
    match fault {
        Fault::RateLimit => "429 rate limit exceeded",
        Fault::Timeout => "408 request timed out",
        Fault::ServerError => "500 internal server error",
        Fault::AuthError => "401 invalid api key",
        _ => "injected provider error",
    }
}

fn malformed_chat_response(model: &str) -> ChatResponse {
    let model_iden = genai::ModelIden::new(genai::adapter::AdapterKind::OpenAI, model);
    ChatResponse {
        content: MessageContent::from_text(MALFORMED_PAYLOAD.to_string()),
        reasoning_content: None,
        model_iden: model_iden.clone(),
        provider_model_iden: model_iden,
        stop_reason: None,
        usage: Usage::default(),
        captured_raw_body: None,
        response_id: None,
    }
}

#[async_trait]
impl LlmExecutor for ChaosLlmExecutor {
    async fn exec_chat_response(
        &self,
        model: &str,
        chat_req: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> genai::Result<ChatResponse> {
        if self.state.cancel.is_cancelled() {
            return Err(genai::Error::Internal("run cancelled".to_string()));
        }
        let call_id = self.state.recorder.start_call(self.provider());
        let mut guard = SpanGuard::new(self.state.clone(), call_id.clone());
        let (call_in_turn, call_in_run) = self.state.next_call_indices();

        let mut chat_req = chat_req;
        self.capture_system_prompt(&chat_req);
        if let Err(e) = self.apply_tool_stage(&mut chat_req, &call_id, call_in_turn, call_in_run) {
            let message = e.to_string();
            self.state.fail_scenario(e);
            guard.close(false, false, Some(message.clone()));
            return Err(genai::Error::Internal(message));
        }

        match self.consult_llm_gate(&call_id, call_in_turn, call_in_run) {
            LlmGate::Proceed => {}
            LlmGate::Fail(message) => {
                guard.close(false, true, Some(message.clone()));
                return Err(genai::Error::Internal(message));
            }
            LlmGate::Malformed => {
                guard.close(false, true, Some("malformed response payload".to_string()));
                return Ok(malformed_chat_response(model));
            }
        }

        match self.inner.exec_chat_response(model, chat_req, options).await {
            Ok(resp) => {
                self.record_response_metadata(&call_id, model, &resp);
                guard.close(true, false, None);
                Ok(resp)
            }
            Err(e) => {
                guard.close(false, false, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn exec_chat_stream_events(
        &self,
        model: &str,
        chat_req: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> genai::Result<LlmEventStream> {
        if self.state.cancel.is_cancelled() {
            return Err(genai::Error::Internal("run cancelled".to_string()));
        }
        let call_id = self.state.recorder.start_call(self.provider());
        let mut guard = SpanGuard::new(self.state.clone(), call_id.clone());
        let (call_in_turn, call_in_run) = self.state.next_call_indices();

        let mut chat_req = chat_req;
        self.capture_system_prompt(&chat_req);
        if let Err(e) = self.apply_tool_stage(&mut chat_req, &call_id, call_in_turn, call_in_run) {
            let message = e.to_string();
            self.state.fail_scenario(e);
            guard.close(false, false, Some(message.clone()));
            return Err(genai::Error::Internal(message));
        }

        match self.consult_llm_gate(&call_id, call_in_turn, call_in_run) {
            LlmGate::Proceed => {}
            LlmGate::Fail(message) => {
                guard.close(false, true, Some(message.clone()));
                return Err(genai::Error::Internal(message));
            }
            LlmGate::Malformed => {
                let events: Vec<genai::Result<ChatStreamEvent>> = vec![
                    Ok(ChatStreamEvent::Start),
                    Ok(ChatStreamEvent::Chunk(StreamChunk {
                        content: MALFORMED_PAYLOAD.to_string(),
                    })),
                    Ok(ChatStreamEvent::End(StreamEnd::default())),
                ];
                let inner: LlmEventStream = Box::pin(futures::stream::iter(events));
                return Ok(wrap_stream(
                    inner,
                    guard,
                    self.provider().to_string(),
                    StreamSettings {
                        verdict: None,
                        malformed: true,
                    },
                ));
            }
        }

        let inner_stream = match self
            .inner
            .exec_chat_stream_events(model, chat_req, options)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                guard.close(false, false, Some(e.to_string()));
                return Err(e);
            }
        };

        let probe = ConsultProbe {
            turn_index: self.state.turn_index.load(Ordering::Relaxed),
            call_in_turn,
            call_in_run,
            tool_name: None,
        };
        let verdict = match self.state.injector.consult(ChaosPoint::Stream, probe) {
            Ok(verdict) => verdict,
            Err(e) => {
                let message = e.to_string();
                self.state.fail_scenario(e);
                guard.close(false, false, Some(message.clone()));
                return Err(genai::Error::Internal(message));
            }
        };

        Ok(wrap_stream(
            inner_stream,
            guard,
            self.provider().to_string(),
            StreamSettings {
                verdict,
                malformed: false,
            },
        ))
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
