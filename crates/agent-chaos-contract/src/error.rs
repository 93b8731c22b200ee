//! Error types shared across the harness.

use crate::point::ChaosPoint;
use thiserror::Error;

/// Harness-level error taxonomy.
///
/// Injected faults are not errors of the harness itself; they surface to the
/// agent through the provider error channel and are recorded separately.
#[derive(Debug, Error)]
pub enum ChaosError {
    /// Misconfigured scenario: malformed factory, missing provider executor,
    /// unusable rule set. Fatal to the run.
    #[error("scenario error: {0}")]
    Scenario(String),

    /// Unhandled failure escaping the agent callable.
    #[error("agent error: {0}")]
    Agent(String),

    /// A fault factory produced a payload invalid at the rule's point.
    #[error("fault {fault} is not valid at point {point}")]
    FaultPointMismatch { point: ChaosPoint, fault: String },

    /// Scenario deadline exceeded.
    #[error("scenario deadline exceeded")]
    DeadlineExceeded,

    /// Run cancelled from the outside.
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ChaosError {
    pub fn scenario(message: impl Into<String>) -> Self {
        Self::Scenario(message.into())
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent(message.into())
    }
}
