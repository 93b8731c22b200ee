//! The single funnel between run execution and observers.
//!
//! The recorder is the only writer to the metrics store and the only emitter
//! to sinks. Every event is stamped from one monotonic clock (a wall-clock
//! anchor plus `Instant` elapsed), so timestamps within a run never go
//! backwards. Metrics updates and event emission happen under the same lock:
//! an observer that sees event `e` sees every state change `e` implies.

use crate::injector::Verdict;
use crate::metrics::{FaultRecord, MetricsStore, ToolUseRecord};
use agent_chaos_contract::{
    EntryKind, EventEnvelope, EventPayload, EventSink, HistoryMessage, NullSink,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Kind-specific context attached to a fault record.
#[derive(Debug, Clone, Default)]
pub struct FaultDetail {
    pub target_tool: Option<String>,
    pub original: Option<String>,
    pub mutated: Option<String>,
    pub added_messages: Option<Vec<HistoryMessage>>,
    pub removed_messages: Option<Vec<HistoryMessage>>,
    pub added_count: Option<usize>,
    pub removed_count: Option<usize>,
}

struct RecorderInner {
    metrics: MetricsStore,
    trace_id: String,
    wall_anchor: DateTime<Utc>,
    mono_anchor: Instant,
}

/// Orchestrates metrics storage and event emission for one run.
pub struct Recorder {
    sink: Arc<dyn EventSink>,
    turn: AtomicUsize,
    inner: Mutex<RecorderInner>,
}

impl Recorder {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            turn: AtomicUsize::new(0),
            inner: Mutex::new(RecorderInner {
                metrics: MetricsStore::new(),
                trace_id: String::new(),
                wall_anchor: Utc::now(),
                mono_anchor: Instant::now(),
            }),
        }
    }

    /// A recorder that discards events; used when no sinks are configured.
    pub fn disconnected() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn set_turn_index(&self, turn: usize) {
        self.turn.store(turn, Ordering::Relaxed);
    }

    fn turn_index(&self) -> usize {
        self.turn.load(Ordering::Relaxed)
    }

    pub fn trace_id(&self) -> String {
        self.lock().trace_id.clone()
    }

    /// Milliseconds since trace start on the monotonic clock.
    pub fn now_ms(&self) -> f64 {
        self.lock().mono_anchor.elapsed().as_secs_f64() * 1000.0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderInner> {
        // A poisoned recorder lock means a panic mid-update; propagating the
        // inner state is still the best option for teardown paths.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn stamp(inner: &RecorderInner) -> DateTime<Utc> {
        let elapsed = inner.mono_anchor.elapsed();
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| inner.wall_anchor.checked_add_signed(d))
            .unwrap_or(inner.wall_anchor)
    }

    fn emit(
        &self,
        inner: &RecorderInner,
        span_id: Option<String>,
        provider: Option<String>,
        payload: EventPayload,
    ) {
        self.sink.emit(&EventEnvelope {
            timestamp: Self::stamp(inner),
            trace_id: inner.trace_id.clone(),
            span_id,
            provider,
            payload,
        });
    }

    /// Start a new trace. Returns the trace id.
    pub fn start_trace(&self, scenario: &str, trace_id: &str) -> String {
        let mut inner = self.lock();
        inner.trace_id = trace_id.to_string();
        inner.wall_anchor = Utc::now();
        inner.mono_anchor = Instant::now();
        self.emit(
            &inner,
            None,
            None,
            EventPayload::TraceStart {
                scenario: scenario.to_string(),
            },
        );
        inner.trace_id.clone()
    }

    pub fn end_trace(&self, success: bool, error: Option<&str>) {
        let inner = self.lock();
        if inner.trace_id.is_empty() {
            return;
        }
        let duration_ms = inner.mono_anchor.elapsed().as_secs_f64() * 1000.0;
        self.emit(
            &inner,
            None,
            None,
            EventPayload::TraceEnd {
                total_calls: inner.metrics.total_calls(),
                failed_calls: inner.metrics.failed_calls(),
                fault_count: inner.metrics.faults.len(),
                success,
                error: error.map(str::to_string),
                duration_ms,
            },
        );
    }

    /// Open a span for a new LLM call. Returns the call id.
    pub fn start_call(&self, provider: &str) -> String {
        let mut inner = self.lock();
        let now_ms = inner.mono_anchor.elapsed().as_secs_f64() * 1000.0;
        let call_id = inner.metrics.start_call(provider, now_ms);
        self.emit(
            &inner,
            Some(call_id.clone()),
            Some(provider.to_string()),
            EventPayload::SpanStart {},
        );
        call_id
    }

    /// Close a span. No-op when the call id is unknown or already closed, so
    /// each call produces at most one span end.
    pub fn end_call(&self, call_id: &str, success: bool, injected: bool, error: Option<String>) {
        let mut inner = self.lock();
        let now_ms = inner.mono_anchor.elapsed().as_secs_f64() * 1000.0;
        let Some(record) = inner
            .metrics
            .end_call(call_id, success, injected, error, now_ms)
        else {
            return;
        };
        self.emit(
            &inner,
            Some(call_id.to_string()),
            Some(record.provider.clone()),
            EventPayload::SpanEnd {
                success,
                injected,
                latency_ms: record.latency_ms,
                error: record.error.clone(),
            },
        );
    }

    /// The single choke-point for injections: appends the fault record and
    /// emits `fault_injected` under one lock so the telemetry channel can
    /// never drift from the error channel.
    pub fn record_fault(&self, call_id: Option<&str>, verdict: &Verdict, detail: FaultDetail) {
        let mut inner = self.lock();
        let now_ms = inner.mono_anchor.elapsed().as_secs_f64() * 1000.0;
        inner.metrics.record_fault(FaultRecord {
            call_id: call_id.map(str::to_string),
            fault_type: verdict.fault.label().to_string(),
            point: verdict.point,
            fingerprint: verdict.fingerprint.clone(),
        });
        inner.metrics.push_entry(
            EntryKind::Chaos,
            format!("{} at {}", verdict.fault.label(), verdict.point),
            Some(self.turn_index()),
            now_ms,
        );
        self.emit(
            &inner,
            call_id.map(str::to_string),
            None,
            EventPayload::FaultInjected {
                fault_type: verdict.fault.label().to_string(),
                chaos_point: verdict.point,
                rule: verdict.fingerprint.clone(),
                target_tool: detail.target_tool,
                original: detail.original,
                mutated: detail.mutated,
                added_messages: detail.added_messages,
                removed_messages: detail.removed_messages,
                added_count: detail.added_count,
                removed_count: detail.removed_count,
            },
        );
    }

    pub fn record_token_usage(
        &self,
        call_id: &str,
        provider: &str,
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
        model: Option<String>,
    ) {
        let mut inner = self.lock();
        inner
            .metrics
            .record_usage(call_id, input_tokens, output_tokens, model.clone());
        let cumulative_input = inner.metrics.tokens.input;
        let cumulative_output = inner.metrics.tokens.output;
        self.emit(
            &inner,
            Some(call_id.to_string()),
            Some(provider.to_string()),
            EventPayload::TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens,
                model,
                cumulative_input_tokens: cumulative_input,
                cumulative_output_tokens: cumulative_output,
            },
        );
    }

    /// The LLM requested a tool: register the use and open its lifecycle.
    pub fn record_tool_use(
        &self,
        call_id: &str,
        provider: &str,
        tool_name: &str,
        tool_call_id: &str,
        arg_bytes: Option<usize>,
    ) {
        let mut inner = self.lock();
        let now_ms = inner.mono_anchor.elapsed().as_secs_f64() * 1000.0;
        inner
            .metrics
            .register_tool_use(tool_call_id, tool_name, call_id, arg_bytes, now_ms);
        inner.metrics.push_entry(
            EntryKind::ToolCall,
            tool_name,
            Some(self.turn_index()),
            now_ms,
        );
        self.emit(
            &inner,
            Some(call_id.to_string()),
            Some(provider.to_string()),
            EventPayload::ToolUse {
                tool_name: tool_name.to_string(),
                tool_call_id: Some(tool_call_id.to_string()),
                arg_bytes,
            },
        );
        self.emit(
            &inner,
            Some(call_id.to_string()),
            Some(provider.to_string()),
            EventPayload::ToolStart {
                tool_name: tool_name.to_string(),
                tool_call_id: Some(tool_call_id.to_string()),
            },
        );
    }

    pub fn mark_tool_faulted(&self, tool_call_id: &str) {
        self.lock().metrics.mark_tool_faulted(tool_call_id);
    }

    /// A tool result was observed in `resolved_in`. Emits at most one
    /// `tool_end` per tool-call id.
    pub fn record_tool_end(
        &self,
        tool_call_id: &str,
        resolved_in: &str,
        provider: &str,
        success: bool,
        result_bytes: Option<usize>,
        error: Option<String>,
    ) -> Option<ToolUseRecord> {
        let mut inner = self.lock();
        let now_ms = inner.mono_anchor.elapsed().as_secs_f64() * 1000.0;
        let record =
            inner
                .metrics
                .resolve_tool(tool_call_id, resolved_in, success, result_bytes, now_ms)?;
        inner.metrics.push_entry(
            EntryKind::ToolResult,
            record.name.clone(),
            Some(self.turn_index()),
            now_ms,
        );
        self.emit(
            &inner,
            Some(record.requested_in.clone()),
            Some(provider.to_string()),
            EventPayload::ToolEnd {
                tool_name: record.name.clone(),
                success,
                tool_call_id: Some(tool_call_id.to_string()),
                duration_ms: record.duration_ms,
                result_bytes,
                error,
                resolved_in_call_id: Some(resolved_in.to_string()),
            },
        );
        Some(record)
    }

    pub fn record_ttft(&self, call_id: &str, provider: &str, ttft_ms: f64, is_delayed: bool) {
        let mut inner = self.lock();
        inner.metrics.record_ttft(ttft_ms);
        self.emit(
            &inner,
            Some(call_id.to_string()),
            Some(provider.to_string()),
            EventPayload::Ttft {
                ttft_ms,
                is_delayed,
            },
        );
    }

    pub fn record_stream_cut(&self, call_id: &str, provider: &str, chunk_count: usize) {
        let mut inner = self.lock();
        inner.metrics.record_stream_cut(chunk_count);
        self.emit(
            &inner,
            Some(call_id.to_string()),
            Some(provider.to_string()),
            EventPayload::StreamCut { chunk_count },
        );
    }

    pub fn record_stream_hang(&self, chunk_count: usize) {
        self.lock().metrics.record_hang(chunk_count);
    }

    pub fn record_corruption(&self, chunk_count: usize) {
        self.lock().metrics.record_corruption(chunk_count);
    }

    pub fn record_stream_stats(
        &self,
        call_id: &str,
        provider: &str,
        chunk_count: usize,
        duration_ms: f64,
    ) {
        let mut inner = self.lock();
        inner.metrics.record_stream_stats(call_id, chunk_count);
        self.emit(
            &inner,
            Some(call_id.to_string()),
            Some(provider.to_string()),
            EventPayload::StreamStats {
                chunk_count,
                duration_ms,
            },
        );
    }

    pub fn record_system_prompt(&self, prompt: &str) {
        self.lock().metrics.record_system_prompt(prompt);
    }

    pub fn push_conversation(&self, kind: EntryKind, content: &str, turn_index: Option<usize>) {
        let mut inner = self.lock();
        let now_ms = inner.mono_anchor.elapsed().as_secs_f64() * 1000.0;
        inner.metrics.push_entry(kind, content, turn_index, now_ms);
    }

    /// Read-only access to the metrics store.
    pub fn with_metrics<R>(&self, f: impl FnOnce(&MetricsStore) -> R) -> R {
        f(&self.lock().metrics)
    }

    /// Clone the current metrics state, e.g. to build a report.
    pub fn metrics_snapshot(&self) -> MetricsStore {
        self.lock().metrics.clone()
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("trace_id", &self.lock().trace_id)
            .finish_non_exhaustive()
    }
}
