//! Shared contracts for the agent-chaos harness.
//!
//! This crate defines the types that flow between the injection engine, the
//! provider interception layer, and downstream consumers of the event stream:
//! chaos points, fault payloads, triggers, rules, the event schema, sink
//! capabilities, report types, and the provider-executor capability.

pub mod error;
pub mod event;
pub mod executor;
pub mod fault;
pub mod message;
pub mod point;
pub mod report;
pub mod rule;
pub mod sink;
pub mod trigger;

pub use error::ChaosError;
pub use event::{EventEnvelope, EventPayload};
pub use executor::{LlmEventStream, LlmExecutor, ProviderAdapter};
pub use fault::{ContextMutator, CorruptMode, Fault, MessagePredicate, TextMutator, ToolMutator};
pub use message::{HistoryMessage, Role};
pub use point::ChaosPoint;
pub use report::{
    AssertionOutcome, ConversationEntry, EntryKind, RunReport, Scorecard, TurnRecord,
};
pub use rule::{
    context_inject, context_mutate, context_remove, context_truncate, llm_auth_error,
    llm_malformed_response, llm_rate_limit, llm_server_error, llm_timeout, stream_corrupt,
    stream_cut, stream_hang, stream_slow_chunks, stream_ttft_delay, tool_empty, tool_error,
    tool_mutate, tool_timeout, user_input_mutate, ChaosRule, FaultFactory,
};
pub use sink::{read_events, BroadcastSink, EventSink, JsonlSink, MemorySink, NullSink};
pub use trigger::{Trigger, TriggerCx};
