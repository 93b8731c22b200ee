//! Chunk-by-chunk stream perturbation.
//!
//! Wraps a provider event stream and applies the stream-stage fault of the
//! current call in a fixed stage order per content chunk: TTFT delay, slow
//! chunks, hang, cut, corrupt. Start/End envelopes pass through uncounted;
//! "chunks" are content-bearing events. TTFT is measured exactly once at the
//! first content chunk; stream stats are recorded when the stream finishes.

use crate::executor::SpanGuard;
use crate::injector::Verdict;
use crate::recorder::FaultDetail;
use agent_chaos_contract::{CorruptMode, Fault, LlmEventStream};
use futures::StreamExt;
use genai::chat::{ChatStreamEvent, StreamChunk, ToolChunk};
use std::time::{Duration, Instant};

const CONNECTION_LOST: &str = "connection lost: stream terminated unexpectedly";

pub(crate) struct StreamSettings {
    /// STREAM-point verdict for this call, if one fired.
    pub verdict: Option<Verdict>,
    /// Synthetic malformed-payload stream: span ends failed/injected.
    pub malformed: bool,
}

struct StagePlan {
    ttft_delay: Option<Duration>,
    per_chunk_delay: Option<Duration>,
    hang_after: Option<usize>,
    cut_after: Option<usize>,
    corrupt: Option<(usize, CorruptMode)>,
}

impl StagePlan {
    fn from_verdict(verdict: Option<&Verdict>) -> Self {
        let mut plan = Self {
            ttft_delay: None,
            per_chunk_delay: None,
            hang_after: None,
            cut_after: None,
            corrupt: None,
        };
        if let Some(verdict) = verdict {
            match &verdict.fault {
                Fault::TtftDelay { delay } => plan.ttft_delay = Some(*delay),
                Fault::SlowChunks { per_chunk_delay } => {
                    plan.per_chunk_delay = Some(*per_chunk_delay);
                }
                Fault::StreamHang { after_chunks } => plan.hang_after = Some(*after_chunks),
                Fault::StreamCut { after_chunks } => plan.cut_after = Some(*after_chunks),
                Fault::Corrupt { after_chunks, mode } => {
                    plan.corrupt = Some((*after_chunks, mode.clone()));
                }
                other => {
                    tracing::warn!(fault = other.label(), "unexpected fault at STREAM point");
                }
            }
        }
        plan
    }
}

fn is_content_chunk(event: &ChatStreamEvent) -> bool {
    matches!(
        event,
        ChatStreamEvent::Chunk(_) | ChatStreamEvent::ToolCallChunk(_)
    )
}

/// Corrupt a text chunk per `mode`. Returns `None` when the event would be
/// left byte-identical, so no-op corruption never counts as an injection.
fn corrupt_event(event: &ChatStreamEvent, mode: &CorruptMode) -> Option<ChatStreamEvent> {
    let ChatStreamEvent::Chunk(chunk) = event else {
        return None;
    };
    match mode {
        CorruptMode::Replace(text) => {
            if *text == chunk.content {
                return None;
            }
            Some(ChatStreamEvent::Chunk(StreamChunk {
                content: text.clone(),
            }))
        }
        CorruptMode::Truncate(keep) => {
            let mut end = (*keep).min(chunk.content.len());
            while end > 0 && !chunk.content.is_char_boundary(end) {
                end -= 1;
            }
            if end == chunk.content.len() {
                return None;
            }
            Some(ChatStreamEvent::Chunk(StreamChunk {
                content: chunk.content[..end].to_string(),
            }))
        }
        CorruptMode::Retype => Some(ChatStreamEvent::ToolCallChunk(ToolChunk {
            tool_call: genai::chat::ToolCall {
                call_id: String::new(),
                fn_name: String::new(),
                fn_arguments: serde_json::Value::Null,
                thought_signatures: None,
            },
        })),
    }
}

enum Pulled {
    Cancelled,
    Event(Option<genai::Result<ChatStreamEvent>>),
}

/// Wrap `inner`, applying `settings` and closing the span when the stream
/// finishes, errors, is cut, or is dropped.
pub(crate) fn wrap_stream(
    inner: LlmEventStream,
    guard: SpanGuard,
    provider: String,
    settings: StreamSettings,
) -> LlmEventStream {
    let stream = async_stream::stream! {
        let mut guard = guard;
        let mut inner = inner;
        let state = guard.state().clone();
        let call_id = guard.call_id().to_string();
        let cancel = state.cancel.clone();
        let plan = StagePlan::from_verdict(settings.verdict.as_ref());
        let started = Instant::now();

        let mut chunks: usize = 0;
        let mut ttft_seen = false;
        let mut ttft_delayed = false;
        let mut fault_recorded = false;
        let mut finished = false;

        while !finished {
            let pulled = tokio::select! {
                () = cancel.cancelled() => Pulled::Cancelled,
                event = inner.next() => Pulled::Event(event),
            };

            let event = match pulled {
                Pulled::Cancelled => {
                    guard.close(false, false, Some("run cancelled".to_string()));
                    yield Err(genai::Error::Internal("run cancelled".to_string()));
                    break;
                }
                Pulled::Event(None) => {
                    // Provider ended without an End envelope.
                    state
                        .recorder
                        .record_stream_stats(&call_id, &provider, chunks, elapsed_ms(started));
                    close_at_stream_end(&mut guard, settings.malformed);
                    break;
                }
                Pulled::Event(Some(Err(e))) => {
                    guard.close(false, false, Some(e.to_string()));
                    yield Err(e);
                    break;
                }
                Pulled::Event(Some(Ok(event))) => event,
            };

            if !is_content_chunk(&event) {
                if let ChatStreamEvent::End(end) = &event {
                    if let Some(usage) = &end.captured_usage {
                        state.recorder.record_token_usage(
                            &call_id,
                            &provider,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                            usage.total_tokens,
                            None,
                        );
                    }
                    if let Some(tool_calls) = end.captured_tool_calls() {
                        for tool_call in tool_calls {
                            let arg_bytes = serde_json::to_string(&tool_call.fn_arguments)
                                .ok()
                                .map(|s| s.len());
                            state.recorder.record_tool_use(
                                &call_id,
                                &provider,
                                &tool_call.fn_name,
                                &tool_call.call_id,
                                arg_bytes,
                            );
                        }
                    }
                    state
                        .recorder
                        .record_stream_stats(&call_id, &provider, chunks, elapsed_ms(started));
                    close_at_stream_end(&mut guard, settings.malformed);
                    finished = true;
                }
                yield Ok(event);
                continue;
            }

            let mut event = event;

            // Stage 1: TTFT delay before the first chunk.
            if chunks == 0 {
                if let Some(delay) = plan.ttft_delay {
                    record_fault_once(&mut fault_recorded, &settings, &state, &call_id);
                    tokio::time::sleep(delay).await;
                    ttft_delayed = true;
                }
            } else if let Some(delay) = plan.per_chunk_delay {
                // Stage 2: pacing before each subsequent chunk.
                record_fault_once(&mut fault_recorded, &settings, &state, &call_id);
                tokio::time::sleep(delay).await;
            }

            // Stage 3: hang until cancelled.
            if plan.hang_after.is_some_and(|n| chunks >= n) {
                record_fault_once(&mut fault_recorded, &settings, &state, &call_id);
                state.recorder.record_stream_hang(chunks);
                cancel.cancelled().await;
                guard.close(false, true, Some("stream hang".to_string()));
                yield Err(genai::Error::Internal(
                    "stream cancelled during injected hang".to_string(),
                ));
                break;
            }

            // Stage 4: cut by signalling a lost connection.
            if plan.cut_after.is_some_and(|n| chunks >= n) {
                record_fault_once(&mut fault_recorded, &settings, &state, &call_id);
                state.recorder.record_stream_cut(&call_id, &provider, chunks);
                guard.close(false, true, Some(CONNECTION_LOST.to_string()));
                yield Err(genai::Error::Internal(CONNECTION_LOST.to_string()));
                break;
            }

            // Stage 5: corrupt the current payload. Only an actual rewrite
            // counts as an injection.
            if let Some((after, mode)) = &plan.corrupt {
                if chunks >= *after {
                    if let Some(corrupted) = corrupt_event(&event, mode) {
                        record_fault_once(&mut fault_recorded, &settings, &state, &call_id);
                        state.recorder.record_corruption(chunks);
                        event = corrupted;
                    }
                }
            }

            if !ttft_seen {
                ttft_seen = true;
                state
                    .recorder
                    .record_ttft(&call_id, &provider, elapsed_ms(started), ttft_delayed);
            }

            chunks += 1;
            yield Ok(event);
        }
    };
    Box::pin(stream)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn close_at_stream_end(guard: &mut SpanGuard, malformed: bool) {
    if malformed {
        guard.close(false, true, Some("malformed response payload".to_string()));
    } else {
        guard.close(true, false, None);
    }
}

fn record_fault_once(
    recorded: &mut bool,
    settings: &StreamSettings,
    state: &std::sync::Arc<crate::context::RunState>,
    call_id: &str,
) {
    if *recorded {
        return;
    }
    if let Some(verdict) = &settings.verdict {
        state
            .recorder
            .record_fault(Some(call_id), verdict, FaultDetail::default());
        *recorded = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunState;
    use crate::executor::SpanGuard;
    use crate::injector::Injector;
    use crate::recorder::Recorder;
    use crate::testing::{text_stream_script, text_stream_script_with_usage};
    use agent_chaos_contract::MemorySink;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<RunState>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let recorder = Recorder::new(sink.clone());
        recorder.start_trace("stream-test", "trace-1");
        let state = Arc::new(RunState::new(Injector::new(Vec::new(), Some(1)), recorder));
        (state, sink)
    }

    fn verdict(fault: Fault) -> Verdict {
        let point = fault.point();
        let fingerprint = format!("{}#0:{}", point.label(), fault.label());
        Verdict {
            fault,
            point,
            fingerprint,
        }
    }

    fn wrapped(
        state: &Arc<RunState>,
        script: Vec<genai::Result<ChatStreamEvent>>,
        fault: Option<Fault>,
    ) -> (LlmEventStream, String) {
        let call_id = state.recorder.start_call("mock_stream");
        let guard = SpanGuard::new(state.clone(), call_id.clone());
        let stream = wrap_stream(
            Box::pin(futures::stream::iter(script)),
            guard,
            "mock_stream".to_string(),
            StreamSettings {
                verdict: fault.map(verdict),
                malformed: false,
            },
        );
        (stream, call_id)
    }

    async fn collect_texts(mut stream: LlmEventStream) -> (Vec<String>, Option<String>) {
        let mut texts = Vec::new();
        let mut error = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(ChatStreamEvent::Chunk(chunk)) => texts.push(chunk.content),
                Ok(_) => {}
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }
        (texts, error)
    }

    #[tokio::test]
    async fn passthrough_records_stats_usage_and_ttft() {
        let (state, _sink) = setup();
        let (stream, _call_id) = wrapped(
            &state,
            text_stream_script_with_usage(&["hel", "lo"], 3, 4),
            None,
        );
        let (texts, error) = collect_texts(stream).await;
        assert_eq!(texts, vec!["hel".to_string(), "lo".to_string()]);
        assert!(error.is_none());

        state.recorder.with_metrics(|m| {
            assert_eq!(m.stream.chunk_counts, vec![2]);
            assert_eq!(m.stream.ttft_ms.len(), 1);
            assert_eq!(m.tokens.input, 3);
            assert_eq!(m.tokens.output, 4);
            assert_eq!(m.history.len(), 1);
            assert!(m.history[0].success);
            assert_eq!(m.active_count(), 0);
        });
    }

    #[tokio::test]
    async fn cut_after_two_chunks_signals_connection_lost() {
        let (state, _sink) = setup();
        let (stream, _call_id) = wrapped(
            &state,
            text_stream_script(&["a", "b", "c", "d", "e"]),
            Some(Fault::StreamCut { after_chunks: 2 }),
        );
        let (texts, error) = collect_texts(stream).await;
        assert_eq!(texts, vec!["a".to_string(), "b".to_string()]);
        assert!(error.is_some_and(|e| e.contains("connection lost")));

        state.recorder.with_metrics(|m| {
            assert_eq!(m.stream.stream_cuts, vec![2]);
            assert_eq!(m.faults.len(), 1);
            assert_eq!(m.faults[0].fault_type, "stream_cut");
            assert!(!m.history[0].success);
            assert!(m.history[0].injected);
        });
    }

    #[tokio::test]
    async fn cut_at_zero_yields_no_chunks_at_all() {
        let (state, _sink) = setup();
        let (stream, _call_id) = wrapped(
            &state,
            text_stream_script(&["a", "b"]),
            Some(Fault::StreamCut { after_chunks: 0 }),
        );
        let (texts, error) = collect_texts(stream).await;
        assert!(texts.is_empty());
        assert!(error.is_some());
        state
            .recorder
            .with_metrics(|m| assert_eq!(m.stream.stream_cuts, vec![0]));
    }

    #[tokio::test]
    async fn cut_never_fires_on_a_short_stream() {
        let (state, _sink) = setup();
        let (stream, _call_id) = wrapped(
            &state,
            text_stream_script(&["a", "b"]),
            Some(Fault::StreamCut { after_chunks: 10 }),
        );
        let (texts, error) = collect_texts(stream).await;
        assert_eq!(texts.len(), 2);
        assert!(error.is_none());
        state.recorder.with_metrics(|m| {
            assert!(m.faults.is_empty(), "no behavior change, no fault record");
            assert!(m.history[0].success);
        });
    }

    #[tokio::test]
    async fn corruption_truncates_later_chunks() {
        let (state, _sink) = setup();
        let (stream, _call_id) = wrapped(
            &state,
            text_stream_script(&["hello", "world"]),
            Some(Fault::Corrupt {
                after_chunks: 1,
                mode: CorruptMode::Truncate(1),
            }),
        );
        let (texts, _error) = collect_texts(stream).await;
        assert_eq!(texts, vec!["hello".to_string(), "w".to_string()]);
        state.recorder.with_metrics(|m| {
            assert_eq!(m.stream.corruption_events, vec![1]);
            assert_eq!(m.faults.len(), 1);
        });
    }

    #[tokio::test]
    async fn corruption_that_leaves_chunks_intact_records_nothing() {
        let (state, _sink) = setup();
        let (stream, _call_id) = wrapped(
            &state,
            text_stream_script(&["hi", "yo"]),
            Some(Fault::Corrupt {
                after_chunks: 0,
                mode: CorruptMode::Truncate(100),
            }),
        );
        let (texts, error) = collect_texts(stream).await;
        assert_eq!(texts, vec!["hi".to_string(), "yo".to_string()]);
        assert!(error.is_none());
        state.recorder.with_metrics(|m| {
            assert!(m.faults.is_empty(), "no behavior change, no fault record");
            assert!(m.stream.corruption_events.is_empty());
            assert!(m.history[0].success);
        });
    }

    #[tokio::test]
    async fn hang_suspends_until_cancelled() {
        let (state, _sink) = setup();
        let (stream, _call_id) = wrapped(
            &state,
            text_stream_script(&["a", "b", "c"]),
            Some(Fault::StreamHang { after_chunks: 1 }),
        );

        let consumer = tokio::spawn(collect_texts(stream));
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.cancel.cancel();

        let (texts, error) = tokio::time::timeout(Duration::from_millis(500), consumer)
            .await
            .expect("hang must resolve promptly after cancellation")
            .expect("consumer must not panic");
        assert_eq!(texts, vec!["a".to_string()]);
        assert!(error.is_some_and(|e| e.contains("hang")));

        state.recorder.with_metrics(|m| {
            assert_eq!(m.stream.hang_events, vec![1]);
            assert!(!m.history[0].success);
            assert!(m.history[0].injected);
            assert_eq!(m.active_count(), 0);
        });
    }

    #[tokio::test]
    async fn dropping_the_stream_still_closes_the_span() {
        let (state, _sink) = setup();
        let (mut stream, _call_id) = wrapped(&state, text_stream_script(&["a", "b", "c"]), None);
        let first = stream.next().await;
        assert!(first.is_some());
        drop(stream);

        state.recorder.with_metrics(|m| {
            assert_eq!(m.active_count(), 0, "dropped streams must not leak calls");
            assert_eq!(m.history.len(), 1);
            assert!(!m.history[0].success);
        });
    }
}
