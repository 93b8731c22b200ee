//! Immutable run summaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of one assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

/// Outcome of one user→assistant cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// 0-based turn index.
    pub index: usize,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<String>,
    pub success: bool,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub duration_ms: f64,
    /// LLM calls issued during this turn.
    pub llm_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Numeric summary aggregated over a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Scorecard {
    pub total_calls: usize,
    pub failed_calls: usize,
    pub injected_calls: usize,
    pub fault_count: usize,
    pub faults_by_kind: BTreeMap<String, usize>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub retries: usize,
    pub avg_latency_ms: f64,
    pub avg_ttft_ms: f64,
    /// 1.0 when no calls were made.
    pub success_rate: f64,
}

/// Kind of a conversation timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    System,
    User,
    Assistant,
    ToolCall,
    ToolResult,
    Chaos,
}

/// Ordered conversation view entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub kind: EntryKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub turn_index: Option<usize>,
    /// Milliseconds since trace start.
    pub timestamp_ms: f64,
}

/// Immutable summary of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: String,
    pub trace_id: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_output: Option<String>,
    pub elapsed_ms: f64,
    pub scorecard: Scorecard,
    pub assertions: Vec<AssertionOutcome>,
    pub turns: Vec<TurnRecord>,
    pub conversation: Vec<ConversationEntry>,
}

impl RunReport {
    /// Pretty JSON for the `scorecard.json` artifact.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> RunReport {
        RunReport {
            scenario: "weather".to_string(),
            trace_id: "abc123".to_string(),
            passed: true,
            error: None,
            agent_input: Some("What's the weather?".to_string()),
            agent_output: Some("Sunny.".to_string()),
            elapsed_ms: 12.5,
            scorecard: Scorecard {
                total_calls: 2,
                failed_calls: 1,
                injected_calls: 1,
                fault_count: 1,
                faults_by_kind: BTreeMap::from([("rate_limit".to_string(), 1)]),
                input_tokens: 10,
                output_tokens: 20,
                retries: 1,
                avg_latency_ms: 3.0,
                avg_ttft_ms: 0.0,
                success_rate: 0.5,
            },
            assertions: vec![AssertionOutcome {
                name: "max_llm_calls".to_string(),
                passed: true,
                message: "llm_calls=2 (max 3)".to_string(),
            }],
            turns: vec![TurnRecord {
                index: 0,
                input: "What's the weather?".to_string(),
                response: Some("Sunny.".to_string()),
                success: true,
                timed_out: false,
                error: None,
                duration_ms: 12.0,
                llm_calls: 2,
                input_tokens: 10,
                output_tokens: 20,
            }],
            conversation: vec![ConversationEntry {
                kind: EntryKind::User,
                content: "What's the weather?".to_string(),
                turn_index: Some(0),
                timestamp_ms: 0.1,
            }],
        }
    }

    #[test]
    fn report_round_trips_through_json() {
        let report = sample_report();
        let json = report.to_json().expect("serialize");
        let parsed: RunReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, report);
    }
}
