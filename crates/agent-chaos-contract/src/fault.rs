//! Typed fault payloads.
//!
//! Faults are a closed tagged enum: the stream wrapper and the provider
//! interceptor dispatch on the variant, never on stringly-typed kinds.

use crate::message::HistoryMessage;
use crate::point::ChaosPoint;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Pure `str -> String` mutator used for user-input mutation.
#[derive(Clone)]
pub struct TextMutator(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl TextMutator {
    pub fn new(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, input: &str) -> String {
        (self.0)(input)
    }
}

impl fmt::Debug for TextMutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TextMutator(..)")
    }
}

/// Pure `(tool_name, result) -> result` mutator for tool results.
#[derive(Clone)]
pub struct ToolMutator(Arc<dyn Fn(&str, &str) -> String + Send + Sync>);

impl ToolMutator {
    pub fn new(f: impl Fn(&str, &str) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, tool_name: &str, result: &str) -> String {
        (self.0)(tool_name, result)
    }
}

impl fmt::Debug for ToolMutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ToolMutator(..)")
    }
}

/// Pure rewrite of the whole conversation history.
#[derive(Clone)]
pub struct ContextMutator(Arc<dyn Fn(&[HistoryMessage]) -> Vec<HistoryMessage> + Send + Sync>);

impl ContextMutator {
    pub fn new(f: impl Fn(&[HistoryMessage]) -> Vec<HistoryMessage> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, messages: &[HistoryMessage]) -> Vec<HistoryMessage> {
        (self.0)(messages)
    }
}

impl fmt::Debug for ContextMutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextMutator(..)")
    }
}

/// Predicate selecting history entries for removal.
#[derive(Clone)]
pub struct MessagePredicate(Arc<dyn Fn(&HistoryMessage) -> bool + Send + Sync>);

impl MessagePredicate {
    pub fn new(f: impl Fn(&HistoryMessage) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, message: &HistoryMessage) -> bool {
        (self.0)(message)
    }
}

impl fmt::Debug for MessagePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessagePredicate(..)")
    }
}

/// How a stream event payload is corrupted.
#[derive(Debug, Clone)]
pub enum CorruptMode {
    /// Replace the chunk text wholesale.
    Replace(String),
    /// Keep only the first `n` bytes of the chunk text.
    Truncate(usize),
    /// Turn a text chunk into an empty tool-call chunk.
    Retype,
}

/// A typed perturbation applied at one interception point.
#[derive(Debug, Clone)]
pub enum Fault {
    // LLM-stage: surfaced to the agent as provider-shaped errors, except
    // `MalformedResponse` which returns a garbage payload.
    RateLimit,
    Timeout,
    ServerError,
    AuthError,
    MalformedResponse,

    // STREAM-stage.
    TtftDelay { delay: Duration },
    StreamHang { after_chunks: usize },
    StreamCut { after_chunks: usize },
    SlowChunks { per_chunk_delay: Duration },
    Corrupt { after_chunks: usize, mode: CorruptMode },

    // TOOL-stage: rewrite the tool result before the LLM sees it.
    ToolError { message: String },
    ToolTimeout { timeout: Duration },
    ToolEmpty,
    ToolMutate { mutator: ToolMutator },

    // USER_INPUT-stage.
    UserMutate { mutator: TextMutator },

    // CONTEXT-stage: operate on the pre-turn conversation history.
    ContextTruncate { keep_last: usize },
    ContextInject { messages: Vec<HistoryMessage> },
    ContextRemove { predicate: MessagePredicate },
    ContextMutate { mutator: ContextMutator },
}

impl Fault {
    /// The interception point this fault is valid at.
    pub fn point(&self) -> ChaosPoint {
        match self {
            Fault::RateLimit
            | Fault::Timeout
            | Fault::ServerError
            | Fault::AuthError
            | Fault::MalformedResponse => ChaosPoint::Llm,
            Fault::TtftDelay { .. }
            | Fault::StreamHang { .. }
            | Fault::StreamCut { .. }
            | Fault::SlowChunks { .. }
            | Fault::Corrupt { .. } => ChaosPoint::Stream,
            Fault::ToolError { .. }
            | Fault::ToolTimeout { .. }
            | Fault::ToolEmpty
            | Fault::ToolMutate { .. } => ChaosPoint::Tool,
            Fault::UserMutate { .. } => ChaosPoint::UserInput,
            Fault::ContextTruncate { .. }
            | Fault::ContextInject { .. }
            | Fault::ContextRemove { .. }
            | Fault::ContextMutate { .. } => ChaosPoint::Context,
        }
    }

    /// Stable kind label used in fault records and events.
    pub fn label(&self) -> &'static str {
        match self {
            Fault::RateLimit => "rate_limit",
            Fault::Timeout => "timeout",
            Fault::ServerError => "server_error",
            Fault::AuthError => "auth_error",
            Fault::MalformedResponse => "malformed_response",
            Fault::TtftDelay { .. } => "slow_ttft",
            Fault::StreamHang { .. } => "stream_hang",
            Fault::StreamCut { .. } => "stream_cut",
            Fault::SlowChunks { .. } => "slow_chunks",
            Fault::Corrupt { .. } => "corrupt",
            Fault::ToolError { .. } => "tool_error",
            Fault::ToolTimeout { .. } => "tool_timeout",
            Fault::ToolEmpty => "tool_empty",
            Fault::ToolMutate { .. } => "tool_mutate",
            Fault::UserMutate { .. } => "user_mutate",
            Fault::ContextTruncate { .. } => "context_truncate",
            Fault::ContextInject { .. } => "context_inject",
            Fault::ContextRemove { .. } => "context_remove",
            Fault::ContextMutate { .. } => "context_mutate",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
