//! Wire schema for the harness event stream.
//!
//! Every event is an envelope with trace/span/provider tags plus a typed
//! payload serialized as `{"type": ..., "data": {...}}`. One JSON line per
//! event in artifact logs.

use crate::message::HistoryMessage;
use crate::point::ChaosPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope shared by all events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// ISO-8601 UTC, nondecreasing within a run.
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    /// Call (span) id; absent for trace-scoped events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Type-specific event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    TraceStart {
        scenario: String,
    },
    TraceEnd {
        total_calls: usize,
        failed_calls: usize,
        fault_count: usize,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        duration_ms: f64,
    },
    SpanStart {},
    SpanEnd {
        success: bool,
        /// Whether the failure (if any) was an injected fault.
        injected: bool,
        latency_ms: f64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    FaultInjected {
        fault_type: String,
        chaos_point: ChaosPoint,
        /// Fingerprint of the rule that produced the verdict.
        rule: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        target_tool: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        original: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        mutated: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        added_messages: Option<Vec<HistoryMessage>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        removed_messages: Option<Vec<HistoryMessage>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        added_count: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        removed_count: Option<usize>,
    },
    Ttft {
        ttft_ms: f64,
        is_delayed: bool,
    },
    StreamCut {
        chunk_count: usize,
    },
    StreamStats {
        chunk_count: usize,
        duration_ms: f64,
    },
    TokenUsage {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        input_tokens: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        output_tokens: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        total_tokens: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        model: Option<String>,
        cumulative_input_tokens: u64,
        cumulative_output_tokens: u64,
    },
    ToolUse {
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tool_call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        arg_bytes: Option<usize>,
    },
    ToolStart {
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tool_call_id: Option<String>,
    },
    ToolEnd {
        tool_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tool_call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        duration_ms: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result_bytes: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        resolved_in_call_id: Option<String>,
    },
}

impl EventPayload {
    /// Stable name matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::TraceStart { .. } => "trace_start",
            EventPayload::TraceEnd { .. } => "trace_end",
            EventPayload::SpanStart {} => "span_start",
            EventPayload::SpanEnd { .. } => "span_end",
            EventPayload::FaultInjected { .. } => "fault_injected",
            EventPayload::Ttft { .. } => "ttft",
            EventPayload::StreamCut { .. } => "stream_cut",
            EventPayload::StreamStats { .. } => "stream_stats",
            EventPayload::TokenUsage { .. } => "token_usage",
            EventPayload::ToolUse { .. } => "tool_use",
            EventPayload::ToolStart { .. } => "tool_start",
            EventPayload::ToolEnd { .. } => "tool_end",
        }
    }
}
