//! The per-turn state machine.
//!
//! One turn: resolve the input, consult USER_INPUT and CONTEXT, call the
//! agent under the scenario deadline, stamp the turn record, close the turn.

use crate::context::ChaosContext;
use crate::recorder::FaultDetail;
use crate::scenario::{Agent, TurnInput};
use agent_chaos_contract::{ChaosPoint, EntryKind, Fault, HistoryMessage, TurnRecord};
use std::sync::Arc;
use std::time::Instant;

/// Execute one turn and return its record. The record is also appended to
/// the context.
pub(crate) async fn run_turn(
    ctx: &ChaosContext,
    agent: &Arc<dyn Agent>,
    turn_index: usize,
    input_spec: &TurnInput,
    deadline_at: Option<Instant>,
) -> TurnRecord {
    let state = ctx.run_state().clone();
    state.start_turn(turn_index);

    let turn_started = Instant::now();
    let (calls_before, history_before) = state
        .recorder
        .with_metrics(|m| (m.total_calls(), m.history.len()));

    let prior = ctx.turn_records();
    let mut input = input_spec.resolve(&prior);

    // USER_INPUT stage.
    match state.injector.consult(ChaosPoint::UserInput, state.boundary_probe()) {
        Ok(Some(verdict)) => {
            if let Fault::UserMutate { mutator } = &verdict.fault {
                let mutated = mutator.apply(&input);
                if mutated != input {
                    state.recorder.record_fault(
                        None,
                        &verdict,
                        FaultDetail {
                            original: Some(input.clone()),
                            mutated: Some(mutated.clone()),
                            ..FaultDetail::default()
                        },
                    );
                    input = mutated;
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            let message = e.to_string();
            state.fail_scenario(e);
            return finish_turn(ctx, turn_index, input, None, false, false, Some(message), turn_started, calls_before, history_before);
        }
    }

    // CONTEXT stage, against the pre-turn conversation state.
    match state.injector.consult(ChaosPoint::Context, state.boundary_probe()) {
        Ok(Some(verdict)) => apply_context_fault(ctx, &verdict),
        Ok(None) => {}
        Err(e) => {
            let message = e.to_string();
            state.fail_scenario(e);
            return finish_turn(ctx, turn_index, input, None, false, false, Some(message), turn_started, calls_before, history_before);
        }
    }

    state
        .recorder
        .push_conversation(EntryKind::User, &input, Some(turn_index));

    // Drive the agent, bounded by the remaining scenario deadline.
    let remaining = deadline_at.map(|at| at.saturating_duration_since(Instant::now()));
    let outcome = match remaining {
        Some(remaining) if remaining.is_zero() => None,
        Some(remaining) => match tokio::time::timeout(remaining, agent.handle_turn(ctx, &input)).await
        {
            Ok(result) => Some(result),
            Err(_) => None,
        },
        None => Some(agent.handle_turn(ctx, &input).await),
    };

    let (response, success, timed_out, error) = match outcome {
        Some(Ok(response)) => (Some(response), true, false, None),
        Some(Err(e)) => (None, false, false, Some(e.to_string())),
        None => {
            // Deadline exceeded: cancel outstanding operations (this also
            // aborts an injected stream hang) and stamp a timeout result.
            state.cancel.cancel();
            (None, false, true, Some("turn timed out".to_string()))
        }
    };

    finish_turn(
        ctx,
        turn_index,
        input,
        response,
        success,
        timed_out,
        error,
        turn_started,
        calls_before,
        history_before,
    )
}

fn apply_context_fault(ctx: &ChaosContext, verdict: &crate::injector::Verdict) {
    let state = ctx.run_state().clone();
    let detail = ctx.with_history_mut(|history| match &verdict.fault {
        Fault::ContextTruncate { keep_last } => {
            if history.len() <= *keep_last {
                return None;
            }
            let removed: Vec<HistoryMessage> =
                history.drain(..history.len() - keep_last).collect();
            Some(FaultDetail {
                removed_count: Some(removed.len()),
                removed_messages: Some(removed),
                ..FaultDetail::default()
            })
        }
        Fault::ContextInject { messages } => {
            if messages.is_empty() {
                return None;
            }
            history.extend(messages.iter().cloned());
            Some(FaultDetail {
                added_count: Some(messages.len()),
                added_messages: Some(messages.clone()),
                ..FaultDetail::default()
            })
        }
        Fault::ContextRemove { predicate } => {
            let mut removed = Vec::new();
            history.retain(|message| {
                if predicate.matches(message) {
                    removed.push(message.clone());
                    false
                } else {
                    true
                }
            });
            if removed.is_empty() {
                return None;
            }
            Some(FaultDetail {
                removed_count: Some(removed.len()),
                removed_messages: Some(removed),
                ..FaultDetail::default()
            })
        }
        Fault::ContextMutate { mutator } => {
            let mutated = mutator.apply(history);
            if mutated == *history {
                return None;
            }
            let before = history.len();
            *history = mutated;
            Some(FaultDetail {
                removed_count: Some(before),
                added_count: Some(history.len()),
                ..FaultDetail::default()
            })
        }
        other => {
            tracing::warn!(fault = other.label(), "unexpected fault at CONTEXT point");
            None
        }
    });

    // A no-op edit (nothing added or removed) is not an injection.
    if let Some(detail) = detail {
        state.recorder.record_fault(None, verdict, detail);
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_turn(
    ctx: &ChaosContext,
    turn_index: usize,
    input: String,
    response: Option<String>,
    success: bool,
    timed_out: bool,
    error: Option<String>,
    turn_started: Instant,
    calls_before: usize,
    history_before: usize,
) -> TurnRecord {
    let state = ctx.run_state().clone();

    // History grows by the user input always, and the response when the
    // turn succeeded, so later turns keep the user's side of failed turns.
    ctx.with_history_mut(|history| {
        history.push(HistoryMessage::user(&input));
        if let Some(response) = response.as_deref().filter(|_| success) {
            history.push(HistoryMessage::assistant(response));
        }
    });
    if let Some(response) = response.as_deref() {
        state
            .recorder
            .push_conversation(EntryKind::Assistant, response, Some(turn_index));
    }

    let (llm_calls, input_tokens, output_tokens) = state.recorder.with_metrics(|m| {
        let llm_calls = m.total_calls() - calls_before;
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        for call in &m.history[history_before..] {
            input_tokens += call.input_tokens.unwrap_or(0).max(0) as u64;
            output_tokens += call.output_tokens.unwrap_or(0).max(0) as u64;
        }
        (llm_calls, input_tokens, output_tokens)
    });

    let record = TurnRecord {
        index: turn_index,
        input,
        response,
        success,
        timed_out,
        error,
        duration_ms: turn_started.elapsed().as_secs_f64() * 1000.0,
        llm_calls,
        input_tokens,
        output_tokens,
    };
    ctx.push_turn(record.clone());
    record
}
