//! Pure trigger predicates.
//!
//! A trigger decides fire/skip from run state alone: no I/O, no side effects
//! beyond consuming draws from the seeded random source. Given the same
//! inputs and seed state, the decision is deterministic.

use rand::rngs::StdRng;
use rand::Rng;

/// Inputs a trigger may inspect. All indices are 0-based.
pub struct TriggerCx<'a> {
    /// Index of the current turn within the scenario.
    pub turn_index: usize,
    /// Index of the current LLM call within the turn.
    pub call_in_turn: usize,
    /// Index of the current LLM call within the whole run.
    pub call_in_run: usize,
    /// Tool name, present only at TOOL-point consultations.
    pub tool_name: Option<&'a str>,
    /// Reproducible random source owned by the injector.
    pub rng: &'a mut StdRng,
}

/// When a chaos rule fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Fire on every eligible consultation.
    Always,
    /// Fire on turn `n`.
    OnTurn(usize),
    /// Fire on the call with global index `n`.
    OnCall(usize),
    /// Fire on every call once `n` calls have been issued, i.e. first on
    /// global call index `n` (the (n+1)-th call).
    AfterCalls(usize),
    /// Fire on the call with index `n` within the current turn. The index
    /// resets to 0 at each turn boundary; combine with [`Trigger::OnTurn`]
    /// to pinpoint one call of one turn.
    OnCallInTurn(usize),
    /// Fire on every call of the current turn once it has issued `n` calls.
    AfterCallsInTurn(usize),
    /// Fire with probability `p` per consultation, drawn from the seeded rng.
    WithProbability(f64),
    /// Fire only when consulting for the named tool.
    ForTool(String),
    /// Fire when any inner trigger fires.
    AnyOf(Vec<Trigger>),
    /// Fire when all inner triggers fire.
    AllOf(Vec<Trigger>),
    /// Invert the inner trigger.
    Not(Box<Trigger>),
}

impl Trigger {
    /// Evaluate the trigger against the current run state.
    pub fn fires(&self, cx: &mut TriggerCx<'_>) -> bool {
        match self {
            Trigger::Always => true,
            Trigger::OnTurn(n) => cx.turn_index == *n,
            Trigger::OnCall(n) => cx.call_in_run == *n,
            Trigger::AfterCalls(n) => cx.call_in_run >= *n,
            Trigger::OnCallInTurn(n) => cx.call_in_turn == *n,
            Trigger::AfterCallsInTurn(n) => cx.call_in_turn >= *n,
            Trigger::WithProbability(p) => cx.rng.gen::<f64>() < *p,
            Trigger::ForTool(name) => cx.tool_name == Some(name.as_str()),
            Trigger::AnyOf(inner) => inner.iter().any(|t| t.fires(cx)),
            Trigger::AllOf(inner) => inner.iter().all(|t| t.fires(cx)),
            Trigger::Not(inner) => !inner.fires(cx),
        }
    }
}
