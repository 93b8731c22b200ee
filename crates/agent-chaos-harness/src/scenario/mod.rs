//! Scenario model: a named bundle of agent, turns, rules, and assertions.

pub mod assertions;
pub mod runner;
pub(crate) mod turns;

use crate::context::ChaosContext;
use agent_chaos_contract::{ChaosError, ChaosRule, LlmExecutor, TurnRecord};
use async_trait::async_trait;
use futures::future::BoxFuture;
use self::assertions::Assertion;
use std::sync::Arc;
use std::time::Duration;

/// One turn's user input: a literal, or a function of the prior turns.
#[derive(Clone)]
pub enum TurnInput {
    Static(String),
    Dynamic(Arc<dyn Fn(&[TurnRecord]) -> String + Send + Sync>),
}

impl TurnInput {
    pub fn dynamic(f: impl Fn(&[TurnRecord]) -> String + Send + Sync + 'static) -> Self {
        Self::Dynamic(Arc::new(f))
    }

    /// Resolve the concrete input given the completed turns so far.
    pub fn resolve(&self, prior: &[TurnRecord]) -> String {
        match self {
            TurnInput::Static(input) => input.clone(),
            TurnInput::Dynamic(f) => f(prior),
        }
    }
}

impl From<&str> for TurnInput {
    fn from(input: &str) -> Self {
        Self::Static(input.to_string())
    }
}

impl From<String> for TurnInput {
    fn from(input: String) -> Self {
        Self::Static(input)
    }
}

impl std::fmt::Debug for TurnInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnInput::Static(input) => f.debug_tuple("Static").field(input).finish(),
            TurnInput::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// The callable under test: performs one turn of LLM-driven work.
///
/// The context is read-only for the agent; LLM calls go through
/// [`ChaosContext::llm`] so the harness can observe and perturb them.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn handle_turn(&self, cx: &ChaosContext, input: &str) -> Result<String, ChaosError>;
}

/// Adapter turning a closure into an [`Agent`].
pub struct FnAgent<F>(F);

impl<F> FnAgent<F>
where
    F: for<'a> Fn(&'a ChaosContext, &'a str) -> BoxFuture<'a, Result<String, ChaosError>>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Agent for FnAgent<F>
where
    F: for<'a> Fn(&'a ChaosContext, &'a str) -> BoxFuture<'a, Result<String, ChaosError>>
        + Send
        + Sync,
{
    async fn handle_turn(&self, cx: &ChaosContext, input: &str) -> Result<String, ChaosError> {
        (self.0)(cx, input).await
    }
}

/// A named, immutable scenario declaration.
#[derive(Clone)]
pub struct Scenario {
    name: String,
    description: String,
    agent: Arc<dyn Agent>,
    executor: Option<Arc<dyn LlmExecutor>>,
    model: String,
    turns: Vec<TurnInput>,
    rules: Vec<ChaosRule>,
    assertions: Vec<Arc<dyn Assertion>>,
    seed: Option<u64>,
    deadline: Option<Duration>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            agent,
            executor: None,
            model: "mock-model".to_string(),
            turns: Vec::new(),
            rules: Vec::new(),
            assertions: Vec::new(),
            seed: None,
            deadline: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The provider executor the agent's calls are routed through (and
    /// intercepted on). Required.
    pub fn with_executor(mut self, executor: Arc<dyn LlmExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Model identifier exposed to the agent via the context.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_turn(mut self, turn: impl Into<TurnInput>) -> Self {
        self.turns.push(turn.into());
        self
    }

    pub fn with_turns(mut self, turns: impl IntoIterator<Item = TurnInput>) -> Self {
        self.turns.extend(turns);
        self
    }

    pub fn with_rule(mut self, rule: ChaosRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = ChaosRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn with_assertion(mut self, assertion: impl Assertion + 'static) -> Self {
        self.assertions.push(Arc::new(assertion));
        self
    }

    /// Seed for the reproducible random source behind probabilistic
    /// triggers.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Cap on total elapsed time; when exceeded, outstanding operations are
    /// cancelled and the running turn is stamped as timed out.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn executor(&self) -> Option<&Arc<dyn LlmExecutor>> {
        self.executor.as_ref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn turns(&self) -> &[TurnInput] {
        &self.turns
    }

    pub fn rules(&self) -> &[ChaosRule] {
        &self.rules
    }

    pub fn assertions(&self) -> &[Arc<dyn Assertion>] {
        &self.assertions
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Copy of this scenario with the rule set emptied; used for baseline
    /// runs. The seed is preserved so non-chaos variance stays controlled.
    pub fn without_rules(&self) -> Self {
        let mut baseline = self.clone();
        baseline.rules.clear();
        baseline
    }
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("turns", &self.turns.len())
            .field("rules", &self.rules.len())
            .field("assertions", &self.assertions.len())
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}
