//! Typed metrics for one scenario run.
//!
//! The store is written only by the [`Recorder`](crate::Recorder); everything
//! here is plain data so the store itself stays clock-free and deterministic
//! to drive from tests.

use agent_chaos_contract::{ChaosPoint, ConversationEntry, EntryKind, Scorecard};
use std::collections::{BTreeMap, BTreeSet};

/// Call counting and latency statistics.
#[derive(Debug, Clone, Default)]
pub struct CallStats {
    pub count: usize,
    pub retries: usize,
    pub by_provider: BTreeMap<String, usize>,
    pub latencies_ms: Vec<f64>,
}

/// Cumulative token counts.
#[derive(Debug, Clone, Default)]
pub struct TokenStats {
    pub input: u64,
    pub output: u64,
}

/// Streaming observations.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub ttft_ms: Vec<f64>,
    pub hang_events: Vec<usize>,
    pub stream_cuts: Vec<usize>,
    pub corruption_events: Vec<usize>,
    pub chunk_counts: Vec<usize>,
}

/// Lifecycle of one tool use: requested → (optionally faulted) → resolved.
///
/// Entries are inserted when the LLM requests the tool and never removed;
/// the arena is dropped with the store at scenario end.
#[derive(Debug, Clone)]
pub struct ToolUseRecord {
    pub name: String,
    pub requested_in: String,
    pub resolved_in: Option<String>,
    pub arg_bytes: Option<usize>,
    pub result_bytes: Option<usize>,
    pub duration_ms: Option<f64>,
    pub success: Option<bool>,
    pub faulted: bool,
    requested_at_ms: f64,
}

/// Tool tracking arena keyed by tool-call id.
#[derive(Debug, Clone, Default)]
pub struct ToolTracking {
    pub entries: BTreeMap<String, ToolUseRecord>,
    ended: BTreeSet<String>,
}

impl ToolTracking {
    pub fn is_ended(&self, tool_call_id: &str) -> bool {
        self.ended.contains(tool_call_id)
    }

    pub fn name_of(&self, tool_call_id: &str) -> Option<&str> {
        self.entries.get(tool_call_id).map(|r| r.name.as_str())
    }
}

/// Immutable per-call outcome.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: String,
    pub provider: String,
    pub success: bool,
    /// Whether the failure was an injected fault rather than a real one.
    pub injected: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub model: Option<String>,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub stream_chunks: usize,
    pub tool_calls: Vec<String>,
}

/// Immutable record of one injection.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub call_id: Option<String>,
    pub fault_type: String,
    pub point: ChaosPoint,
    pub fingerprint: String,
}

/// In-flight call state. Every entry must leave this table by scenario end.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub provider: String,
    pub started_at_ms: f64,
    pub model: Option<String>,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub stream_chunks: usize,
    pub tool_calls: Vec<String>,
}

/// Central metrics collection for a run.
#[derive(Debug, Clone, Default)]
pub struct MetricsStore {
    pub calls: CallStats,
    pub tokens: TokenStats,
    pub stream: StreamStats,
    pub tools: ToolTracking,
    pub conversation: Vec<ConversationEntry>,
    pub history: Vec<CallRecord>,
    pub faults: Vec<FaultRecord>,
    pub system_prompt: Option<String>,
    active: BTreeMap<String, ActiveCall>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a call. Returns the allocated call id.
    pub fn start_call(&mut self, provider: &str, now_ms: f64) -> String {
        let call_id = format!("{provider}_{}", self.calls.count);
        self.calls.count += 1;
        *self
            .calls
            .by_provider
            .entry(provider.to_string())
            .or_default() += 1;
        self.active.insert(
            call_id.clone(),
            ActiveCall {
                provider: provider.to_string(),
                started_at_ms: now_ms,
                model: None,
                input_tokens: None,
                output_tokens: None,
                stream_chunks: 0,
                tool_calls: Vec::new(),
            },
        );
        call_id
    }

    /// Close a call, moving it from the active table into history.
    pub fn end_call(
        &mut self,
        call_id: &str,
        success: bool,
        injected: bool,
        error: Option<String>,
        now_ms: f64,
    ) -> Option<CallRecord> {
        let active = self.active.remove(call_id)?;
        let latency_ms = now_ms - active.started_at_ms;
        if success {
            self.calls.latencies_ms.push(latency_ms);
        } else if let Some(error) = error.as_deref() {
            let lowered = error.to_ascii_lowercase();
            if ["rate", "timeout", "429", "503"]
                .iter()
                .any(|needle| lowered.contains(needle))
            {
                self.calls.retries += 1;
            }
        }
        let record = CallRecord {
            call_id: call_id.to_string(),
            provider: active.provider,
            success,
            injected,
            latency_ms,
            error,
            model: active.model,
            input_tokens: active.input_tokens,
            output_tokens: active.output_tokens,
            stream_chunks: active.stream_chunks,
            tool_calls: active.tool_calls,
        };
        self.history.push(record.clone());
        Some(record)
    }

    pub fn record_usage(
        &mut self,
        call_id: &str,
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        model: Option<String>,
    ) {
        self.tokens.input += input_tokens.unwrap_or(0).max(0) as u64;
        self.tokens.output += output_tokens.unwrap_or(0).max(0) as u64;
        if let Some(active) = self.active.get_mut(call_id) {
            active.input_tokens = input_tokens.or(active.input_tokens);
            active.output_tokens = output_tokens.or(active.output_tokens);
            active.model = model.or(active.model.take());
        }
    }

    /// The LLM requested a tool in `call_id`.
    pub fn register_tool_use(
        &mut self,
        tool_call_id: &str,
        name: &str,
        call_id: &str,
        arg_bytes: Option<usize>,
        now_ms: f64,
    ) {
        if let Some(active) = self.active.get_mut(call_id) {
            active.tool_calls.push(name.to_string());
        }
        self.tools
            .entries
            .entry(tool_call_id.to_string())
            .or_insert(ToolUseRecord {
                name: name.to_string(),
                requested_in: call_id.to_string(),
                resolved_in: None,
                arg_bytes,
                result_bytes: None,
                duration_ms: None,
                success: None,
                faulted: false,
                requested_at_ms: now_ms,
            });
    }

    pub fn mark_tool_faulted(&mut self, tool_call_id: &str) {
        if let Some(record) = self.tools.entries.get_mut(tool_call_id) {
            record.faulted = true;
        }
    }

    /// A tool result for `tool_call_id` was observed in `resolved_in`.
    ///
    /// Returns the updated record once; repeated resolutions are ignored so
    /// each tool-use id gets at most one end record.
    pub fn resolve_tool(
        &mut self,
        tool_call_id: &str,
        resolved_in: &str,
        success: bool,
        result_bytes: Option<usize>,
        now_ms: f64,
    ) -> Option<ToolUseRecord> {
        if self.tools.is_ended(tool_call_id) {
            return None;
        }
        self.tools.ended.insert(tool_call_id.to_string());
        let record = self.tools.entries.get_mut(tool_call_id)?;
        record.resolved_in = Some(resolved_in.to_string());
        record.success = Some(success);
        record.result_bytes = result_bytes;
        record.duration_ms = Some(now_ms - record.requested_at_ms);
        Some(record.clone())
    }

    pub fn record_ttft(&mut self, ttft_ms: f64) {
        self.stream.ttft_ms.push(ttft_ms);
    }

    pub fn record_hang(&mut self, chunk_count: usize) {
        self.stream.hang_events.push(chunk_count);
    }

    pub fn record_stream_cut(&mut self, chunk_count: usize) {
        self.stream.stream_cuts.push(chunk_count);
    }

    pub fn record_corruption(&mut self, chunk_count: usize) {
        self.stream.corruption_events.push(chunk_count);
    }

    pub fn record_stream_stats(&mut self, call_id: &str, chunk_count: usize) {
        self.stream.chunk_counts.push(chunk_count);
        if let Some(active) = self.active.get_mut(call_id) {
            active.stream_chunks = chunk_count;
        }
    }

    pub fn record_fault(&mut self, record: FaultRecord) {
        self.faults.push(record);
    }

    pub fn record_system_prompt(&mut self, prompt: &str) {
        if self.system_prompt.is_some() {
            return;
        }
        self.system_prompt = Some(prompt.to_string());
        self.conversation.insert(
            0,
            ConversationEntry {
                kind: EntryKind::System,
                content: prompt.to_string(),
                turn_index: None,
                timestamp_ms: 0.0,
            },
        );
    }

    pub fn push_entry(
        &mut self,
        kind: EntryKind,
        content: impl Into<String>,
        turn_index: Option<usize>,
        now_ms: f64,
    ) {
        self.conversation.push(ConversationEntry {
            kind,
            content: content.into(),
            turn_index,
            timestamp_ms: now_ms,
        });
    }

    pub fn total_calls(&self) -> usize {
        self.calls.count
    }

    pub fn failed_calls(&self) -> usize {
        self.history.iter().filter(|c| !c.success).count()
    }

    pub fn injected_calls(&self) -> usize {
        self.history.iter().filter(|c| c.injected).count()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn avg_latency_ms(&self) -> f64 {
        average(&self.calls.latencies_ms)
    }

    pub fn avg_ttft_ms(&self) -> f64 {
        average(&self.stream.ttft_ms)
    }

    /// 1.0 when no calls completed.
    pub fn success_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 1.0;
        }
        let ok = self.history.iter().filter(|c| c.success).count();
        ok as f64 / self.history.len() as f64
    }

    /// Aggregate the run scorecard.
    pub fn scorecard(&self) -> Scorecard {
        let mut faults_by_kind: BTreeMap<String, usize> = BTreeMap::new();
        for fault in &self.faults {
            *faults_by_kind.entry(fault.fault_type.clone()).or_default() += 1;
        }
        Scorecard {
            total_calls: self.total_calls(),
            failed_calls: self.failed_calls(),
            injected_calls: self.injected_calls(),
            fault_count: self.faults.len(),
            faults_by_kind,
            input_tokens: self.tokens.input,
            output_tokens: self.tokens.output,
            retries: self.calls.retries,
            avg_latency_ms: self.avg_latency_ms(),
            avg_ttft_ms: self.avg_ttft_ms(),
            success_rate: self.success_rate(),
        }
    }
}

fn average(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}
