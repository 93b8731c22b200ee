//! Interception points for chaos injection.

use serde::{Deserialize, Serialize};

/// Where in the agent/provider round trip a fault can be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChaosPoint {
    /// Before the agent processes the user query.
    UserInput,
    /// Before the LLM request is sent.
    Llm,
    /// While a streaming response is being consumed.
    Stream,
    /// When a tool result is about to be handed back to the LLM.
    Tool,
    /// Against the conversation history between turns.
    Context,
}

impl ChaosPoint {
    /// All interception points, in pipeline order.
    pub const ALL: [ChaosPoint; 5] = [
        ChaosPoint::UserInput,
        ChaosPoint::Llm,
        ChaosPoint::Stream,
        ChaosPoint::Tool,
        ChaosPoint::Context,
    ];

    /// Stable label used in events and fingerprints.
    pub fn label(self) -> &'static str {
        match self {
            ChaosPoint::UserInput => "USER_INPUT",
            ChaosPoint::Llm => "LLM",
            ChaosPoint::Stream => "STREAM",
            ChaosPoint::Tool => "TOOL",
            ChaosPoint::Context => "CONTEXT",
        }
    }
}

impl std::fmt::Display for ChaosPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
