//! Shared per-run state and the context handed to the agent.

use crate::executor::ExecutorSlot;
use crate::injector::{ConsultProbe, Injector};
use crate::metrics::MetricsStore;
use crate::recorder::Recorder;
use agent_chaos_contract::{ChaosError, HistoryMessage, LlmExecutor, TurnRecord};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// State threaded through the injector, recorder, interceptor, and turn
/// executor. Single-writer: only the turn executor's task mutates it.
pub(crate) struct RunState {
    pub injector: Injector,
    pub recorder: Recorder,
    pub cancel: CancellationToken,
    pub turn_index: AtomicUsize,
    pub calls_in_turn: AtomicUsize,
    pub calls_in_run: AtomicUsize,
    scenario_error: Mutex<Option<ChaosError>>,
}

impl RunState {
    pub fn new(injector: Injector, recorder: Recorder) -> Self {
        Self {
            injector,
            recorder,
            cancel: CancellationToken::new(),
            turn_index: AtomicUsize::new(0),
            calls_in_turn: AtomicUsize::new(0),
            calls_in_run: AtomicUsize::new(0),
            scenario_error: Mutex::new(None),
        }
    }

    /// Allocate (call_in_turn, call_in_run) indices for a new LLM call.
    pub fn next_call_indices(&self) -> (usize, usize) {
        (
            self.calls_in_turn.fetch_add(1, Ordering::Relaxed),
            self.calls_in_run.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Probe for turn-boundary consultations (no call in flight).
    pub fn boundary_probe(&self) -> ConsultProbe<'static> {
        ConsultProbe {
            turn_index: self.turn_index.load(Ordering::Relaxed),
            call_in_turn: self.calls_in_turn.load(Ordering::Relaxed),
            call_in_run: self.calls_in_run.load(Ordering::Relaxed),
            tool_name: None,
        }
    }

    pub fn start_turn(&self, turn_index: usize) {
        self.turn_index.store(turn_index, Ordering::Relaxed);
        self.calls_in_turn.store(0, Ordering::Relaxed);
        self.recorder.set_turn_index(turn_index);
    }

    /// Record a fatal scenario error (first one wins) and cancel the run.
    pub fn fail_scenario(&self, error: ChaosError) {
        if let Ok(mut slot) = self.scenario_error.lock() {
            if slot.is_none() {
                tracing::warn!(error = %error, "fatal scenario error");
                *slot = Some(error);
            }
        }
        self.cancel.cancel();
    }

    pub fn take_scenario_error(&self) -> Option<ChaosError> {
        self.scenario_error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Per-run context available to the agent callback.
///
/// The context is owned by the turn executor; the agent only reads from it.
/// `llm()` returns the executor currently installed in the slot, which is the
/// chaos interceptor while the run is active.
pub struct ChaosContext {
    name: String,
    session_id: String,
    model: String,
    state: Arc<RunState>,
    slot: Arc<ExecutorSlot>,
    history: Mutex<Vec<HistoryMessage>>,
    turns: Mutex<Vec<TurnRecord>>,
}

impl ChaosContext {
    pub(crate) fn new(
        name: String,
        session_id: String,
        model: String,
        state: Arc<RunState>,
        slot: Arc<ExecutorSlot>,
    ) -> Self {
        Self {
            name,
            session_id,
            model,
            state,
            slot,
            history: Mutex::new(Vec::new()),
            turns: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Model identifier the agent should pass to the executor.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The LLM executor to issue calls through.
    pub fn llm(&self) -> Arc<dyn LlmExecutor> {
        self.slot.current()
    }

    /// Conversation history accumulated over completed turns. Includes every
    /// user input (even for failed turns) and the responses of successful
    /// ones, after any CONTEXT-stage faults.
    pub fn history(&self) -> Vec<HistoryMessage> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Records of completed turns.
    pub fn turn_records(&self) -> Vec<TurnRecord> {
        self.turns.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// 0-based index of the turn currently executing.
    pub fn turn_index(&self) -> usize {
        self.state.turn_index.load(Ordering::Relaxed)
    }

    /// Token observing run cancellation (deadline or abort).
    pub fn cancel_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    /// Snapshot of the metrics store, e.g. for custom assertions.
    pub fn metrics(&self) -> MetricsStore {
        self.state.recorder.metrics_snapshot()
    }

    pub(crate) fn run_state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub(crate) fn with_history_mut<R>(&self, f: impl FnOnce(&mut Vec<HistoryMessage>) -> R) -> R {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut history)
    }

    pub(crate) fn push_turn(&self, record: TurnRecord) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push(record);
        }
    }
}

impl std::fmt::Debug for ChaosContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosContext")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("turn_index", &self.turn_index())
            .finish_non_exhaustive()
    }
}
