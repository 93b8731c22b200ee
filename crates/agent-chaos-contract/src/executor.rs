//! Provider capabilities.
//!
//! [`LlmExecutor`] is the provider-neutral execution seam: one non-streaming
//! and one streaming entry point over the `genai` chat types. The harness
//! intercepts by decorating an executor; [`ProviderAdapter`] is the
//! install/uninstall surface that swaps the decoration in and out.

use crate::error::ChaosError;
use async_trait::async_trait;
use futures::Stream;
use genai::chat::{ChatOptions, ChatRequest, ChatResponse, ChatStreamEvent};
use std::pin::Pin;

/// Boxed stream of chat events returned by streaming executors.
pub type LlmEventStream =
    Pin<Box<dyn Stream<Item = genai::Result<ChatStreamEvent>> + Send>>;

/// Provider-neutral LLM execution contract.
#[async_trait]
pub trait LlmExecutor: Send + Sync {
    /// Execute one non-streaming chat call.
    async fn exec_chat_response(
        &self,
        model: &str,
        chat_req: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> genai::Result<ChatResponse>;

    /// Execute one streaming chat call.
    async fn exec_chat_stream_events(
        &self,
        model: &str,
        chat_req: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> genai::Result<LlmEventStream>;

    /// Stable executor label for telemetry output.
    fn name(&self) -> &'static str {
        "llm_executor"
    }
}

/// Install/remove interception on a provider's execution surface.
///
/// Both operations are idempotent and reversible: after `uninstall`, the
/// intercepted references are identical (pointer-equal) to their pre-install
/// values, even if `install` was called twice or the run aborted.
pub trait ProviderAdapter: Send + Sync {
    fn install(&self) -> Result<(), ChaosError>;
    fn uninstall(&self) -> Result<(), ChaosError>;
}
