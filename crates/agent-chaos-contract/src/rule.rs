//! Chaos rules: an interception point, a trigger, and a fault factory.
//!
//! Rules are declared with fluent constructors and trigger refinement:
//!
//! ```
//! use agent_chaos_contract::{llm_rate_limit, stream_cut, tool_error};
//!
//! let rules = vec![
//!     llm_rate_limit().on_call(0),
//!     stream_cut(10),
//!     tool_error("service down").for_tool("get_weather"),
//! ];
//! ```

use crate::fault::{
    ContextMutator, CorruptMode, Fault, MessagePredicate, TextMutator, ToolMutator,
};
use crate::message::HistoryMessage;
use crate::point::ChaosPoint;
use crate::trigger::Trigger;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Parameter-bound producer of fault payloads.
///
/// Factories must be pure and idempotent: two invocations with identical
/// injector state yield equivalent payloads.
pub type FaultFactory = Arc<dyn Fn() -> Fault + Send + Sync>;

/// One declarative chaos rule.
#[derive(Clone)]
pub struct ChaosRule {
    point: ChaosPoint,
    trigger: Trigger,
    factory: FaultFactory,
}

impl ChaosRule {
    pub fn new(
        point: ChaosPoint,
        trigger: Trigger,
        factory: impl Fn() -> Fault + Send + Sync + 'static,
    ) -> Self {
        Self {
            point,
            trigger,
            factory: Arc::new(factory),
        }
    }

    pub fn point(&self) -> ChaosPoint {
        self.point
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Invoke the fault factory.
    pub fn build_fault(&self) -> Fault {
        (self.factory)()
    }

    /// Replace the trigger wholesale.
    pub fn when(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Fire on the call with global index `n` (0-based).
    pub fn on_call(self, n: usize) -> Self {
        self.and(Trigger::OnCall(n))
    }

    /// Fire once `n` calls have been issued.
    pub fn after_calls(self, n: usize) -> Self {
        self.and(Trigger::AfterCalls(n))
    }

    /// Fire on the call with index `n` within the current turn.
    pub fn on_call_in_turn(self, n: usize) -> Self {
        self.and(Trigger::OnCallInTurn(n))
    }

    /// Fire once the current turn has issued `n` calls.
    pub fn after_calls_in_turn(self, n: usize) -> Self {
        self.and(Trigger::AfterCallsInTurn(n))
    }

    /// Fire on turn `n` (0-based).
    pub fn on_turn(self, n: usize) -> Self {
        self.and(Trigger::OnTurn(n))
    }

    /// Fire with probability `p` per consultation.
    pub fn with_probability(self, p: f64) -> Self {
        self.and(Trigger::WithProbability(p))
    }

    /// Fire only for the named tool.
    pub fn for_tool(self, tool: impl Into<String>) -> Self {
        self.and(Trigger::ForTool(tool.into()))
    }

    fn and(mut self, extra: Trigger) -> Self {
        self.trigger = match self.trigger {
            Trigger::Always => extra,
            Trigger::AllOf(mut inner) => {
                inner.push(extra);
                Trigger::AllOf(inner)
            }
            current => Trigger::AllOf(vec![current, extra]),
        };
        self
    }
}

impl fmt::Debug for ChaosRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaosRule")
            .field("point", &self.point)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

// LLM-stage constructors.

pub fn llm_rate_limit() -> ChaosRule {
    ChaosRule::new(ChaosPoint::Llm, Trigger::Always, || Fault::RateLimit)
}

pub fn llm_timeout() -> ChaosRule {
    ChaosRule::new(ChaosPoint::Llm, Trigger::Always, || Fault::Timeout)
}

pub fn llm_server_error() -> ChaosRule {
    ChaosRule::new(ChaosPoint::Llm, Trigger::Always, || Fault::ServerError)
}

pub fn llm_auth_error() -> ChaosRule {
    ChaosRule::new(ChaosPoint::Llm, Trigger::Always, || Fault::AuthError)
}

pub fn llm_malformed_response() -> ChaosRule {
    ChaosRule::new(ChaosPoint::Llm, Trigger::Always, || Fault::MalformedResponse)
}

// STREAM-stage constructors.

pub fn stream_ttft_delay(delay: Duration) -> ChaosRule {
    ChaosRule::new(ChaosPoint::Stream, Trigger::Always, move || {
        Fault::TtftDelay { delay }
    })
}

pub fn stream_hang(after_chunks: usize) -> ChaosRule {
    ChaosRule::new(ChaosPoint::Stream, Trigger::Always, move || {
        Fault::StreamHang { after_chunks }
    })
}

pub fn stream_cut(after_chunks: usize) -> ChaosRule {
    ChaosRule::new(ChaosPoint::Stream, Trigger::Always, move || {
        Fault::StreamCut { after_chunks }
    })
}

pub fn stream_slow_chunks(per_chunk_delay: Duration) -> ChaosRule {
    ChaosRule::new(ChaosPoint::Stream, Trigger::Always, move || {
        Fault::SlowChunks { per_chunk_delay }
    })
}

pub fn stream_corrupt(after_chunks: usize, mode: CorruptMode) -> ChaosRule {
    ChaosRule::new(ChaosPoint::Stream, Trigger::Always, move || Fault::Corrupt {
        after_chunks,
        mode: mode.clone(),
    })
}

// TOOL-stage constructors.

pub fn tool_error(message: impl Into<String>) -> ChaosRule {
    let message = message.into();
    ChaosRule::new(ChaosPoint::Tool, Trigger::Always, move || Fault::ToolError {
        message: message.clone(),
    })
}

pub fn tool_timeout(timeout: Duration) -> ChaosRule {
    ChaosRule::new(ChaosPoint::Tool, Trigger::Always, move || Fault::ToolTimeout {
        timeout,
    })
}

pub fn tool_empty() -> ChaosRule {
    ChaosRule::new(ChaosPoint::Tool, Trigger::Always, || Fault::ToolEmpty)
}

pub fn tool_mutate(f: impl Fn(&str, &str) -> String + Send + Sync + 'static) -> ChaosRule {
    let mutator = ToolMutator::new(f);
    ChaosRule::new(ChaosPoint::Tool, Trigger::Always, move || Fault::ToolMutate {
        mutator: mutator.clone(),
    })
}

// USER_INPUT-stage constructor.

pub fn user_input_mutate(f: impl Fn(&str) -> String + Send + Sync + 'static) -> ChaosRule {
    let mutator = TextMutator::new(f);
    ChaosRule::new(ChaosPoint::UserInput, Trigger::Always, move || {
        Fault::UserMutate {
            mutator: mutator.clone(),
        }
    })
}

// CONTEXT-stage constructors.

pub fn context_truncate(keep_last: usize) -> ChaosRule {
    ChaosRule::new(ChaosPoint::Context, Trigger::Always, move || {
        Fault::ContextTruncate { keep_last }
    })
}

pub fn context_inject(messages: Vec<HistoryMessage>) -> ChaosRule {
    ChaosRule::new(ChaosPoint::Context, Trigger::Always, move || {
        Fault::ContextInject {
            messages: messages.clone(),
        }
    })
}

pub fn context_remove(f: impl Fn(&HistoryMessage) -> bool + Send + Sync + 'static) -> ChaosRule {
    let predicate = MessagePredicate::new(f);
    ChaosRule::new(ChaosPoint::Context, Trigger::Always, move || {
        Fault::ContextRemove {
            predicate: predicate.clone(),
        }
    })
}

pub fn context_mutate(
    f: impl Fn(&[HistoryMessage]) -> Vec<HistoryMessage> + Send + Sync + 'static,
) -> ChaosRule {
    let mutator = ContextMutator::new(f);
    ChaosRule::new(ChaosPoint::Context, Trigger::Always, move || {
        Fault::ContextMutate {
            mutator: mutator.clone(),
        }
    })
}
