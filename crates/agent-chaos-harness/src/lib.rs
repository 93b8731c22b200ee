//! Chaos-engineering harness for LLM agents.
//!
//! A scenario bundles an agent, a list of turns, a declarative fault
//! schedule, and assertions. The harness installs a transparent interception
//! layer on the provider executor, drives the turns, records every LLM call,
//! stream chunk, tool use, and injected fault into a totally-ordered event
//! stream, and evaluates the assertions into a pass/fail report.
//!
//! ```no_run
//! use agent_chaos_harness::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo(agent: Arc<dyn Agent>, executor: Arc<dyn LlmExecutor>) {
//! let scenario = Scenario::new("rate-limit-recovery", agent)
//!     .with_executor(executor)
//!     .with_turn("What's the weather?")
//!     .with_rule(llm_rate_limit().on_call(0))
//!     .with_assertion(MaxLlmCalls(3));
//!
//! let report = run_scenario(&scenario, &RunnerConfig::default())
//!     .await
//!     .expect("run");
//! assert!(report.passed);
//! # }
//! ```

pub mod context;
pub mod executor;
pub mod injector;
pub mod metrics;
pub mod recorder;
pub mod scenario;
pub(crate) mod stream;
pub mod testing;

pub use agent_chaos_contract as contracts;

pub use context::ChaosContext;
pub use executor::{ChaosLlmExecutor, ExecutorSlot, SlotProviderAdapter};
pub use injector::{ConsultProbe, Injector, Verdict};
pub use metrics::{ActiveCall, CallRecord, FaultRecord, MetricsStore, ToolUseRecord};
pub use recorder::Recorder;
pub use scenario::assertions::{
    AllTurnsComplete, Assertion, AssertionScope, CompletesWithin, ExpectError, MaxFailedCalls,
    MaxLlmCalls, MaxTokens, MinFaultsInjected, MinLlmCalls, TurnCompletes, TurnCompletesWithin,
    TurnResponseContains,
};
pub use scenario::runner::{
    run_baseline_pair, run_many, run_scenario, RunnerConfig, DEFAULT_RUNS_DIR,
};
pub use scenario::{Agent, FnAgent, Scenario, TurnInput};

/// Common imports for scenario authors.
pub mod prelude {
    pub use crate::contracts::{
        context_inject, context_mutate, context_remove, context_truncate, llm_auth_error,
        llm_malformed_response, llm_rate_limit, llm_server_error, llm_timeout, stream_corrupt,
        stream_cut, stream_hang, stream_slow_chunks, stream_ttft_delay, tool_empty, tool_error,
        tool_mutate, tool_timeout, user_input_mutate,
    };
    pub use crate::contracts::{
        ChaosError, ChaosPoint, ChaosRule, CorruptMode, EventSink, Fault, HistoryMessage,
        LlmExecutor, MemorySink, ProviderAdapter, Role, RunReport, Trigger,
    };
    pub use crate::scenario::assertions::*;
    pub use crate::scenario::runner::{
        run_baseline_pair, run_many, run_scenario, RunnerConfig, DEFAULT_RUNS_DIR,
    };
    pub use crate::scenario::{Agent, FnAgent, Scenario, TurnInput};
    pub use crate::ChaosContext;
}
