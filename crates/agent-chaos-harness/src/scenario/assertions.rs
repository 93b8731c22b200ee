//! Assertion library: pure predicates over the run report.

use agent_chaos_contract::{AssertionOutcome, RunReport, TurnRecord};
use std::time::Duration;

/// Whether an assertion reads the whole run or one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionScope {
    Run,
    Turn(usize),
}

/// A pure predicate over the run report.
pub trait Assertion: Send + Sync {
    fn name(&self) -> String;

    fn scope(&self) -> AssertionScope {
        AssertionScope::Run
    }

    /// When true, an unhandled agent error does not by itself fail the
    /// scenario; this assertion is expected to judge it.
    fn allows_error(&self) -> bool {
        false
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome;
}

fn outcome(name: String, passed: bool, message: String) -> AssertionOutcome {
    AssertionOutcome {
        name,
        passed,
        message,
    }
}

fn turn<'a>(report: &'a RunReport, index: usize) -> Option<&'a TurnRecord> {
    report.turns.iter().find(|t| t.index == index)
}

/// Total elapsed time must be within the budget.
#[derive(Debug, Clone)]
pub struct CompletesWithin(pub Duration);

impl Assertion for CompletesWithin {
    fn name(&self) -> String {
        "completes_within".to_string()
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        let budget_ms = self.0.as_secs_f64() * 1000.0;
        let passed = report.elapsed_ms <= budget_ms;
        outcome(
            self.name(),
            passed,
            format!(
                "completed in {:.2}ms (budget {:.2}ms)",
                report.elapsed_ms, budget_ms
            ),
        )
    }
}

/// Total LLM calls must be `<= n`.
#[derive(Debug, Clone)]
pub struct MaxLlmCalls(pub usize);

impl Assertion for MaxLlmCalls {
    fn name(&self) -> String {
        "max_llm_calls".to_string()
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        let total = report.scorecard.total_calls;
        outcome(
            self.name(),
            total <= self.0,
            format!("llm_calls={total} (max {})", self.0),
        )
    }
}

/// Total LLM calls must be `>= n`.
#[derive(Debug, Clone)]
pub struct MinLlmCalls(pub usize);

impl Assertion for MinLlmCalls {
    fn name(&self) -> String {
        "min_llm_calls".to_string()
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        let total = report.scorecard.total_calls;
        outcome(
            self.name(),
            total >= self.0,
            format!("llm_calls={total} (min {})", self.0),
        )
    }
}

/// Cumulative input+output tokens must be `<= n`.
#[derive(Debug, Clone)]
pub struct MaxTokens(pub u64);

impl Assertion for MaxTokens {
    fn name(&self) -> String {
        "max_tokens".to_string()
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        let total = report.scorecard.input_tokens + report.scorecard.output_tokens;
        outcome(
            self.name(),
            total <= self.0,
            format!("tokens={total} (max {})", self.0),
        )
    }
}

/// Failed LLM calls must be `<= n`.
#[derive(Debug, Clone)]
pub struct MaxFailedCalls(pub usize);

impl Assertion for MaxFailedCalls {
    fn name(&self) -> String {
        "max_failed_calls".to_string()
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        let failed = report.scorecard.failed_calls;
        outcome(
            self.name(),
            failed <= self.0,
            format!("failed_calls={failed} (max {})", self.0),
        )
    }
}

/// Injected faults must be `>= n`.
#[derive(Debug, Clone)]
pub struct MinFaultsInjected(pub usize);

impl Assertion for MinFaultsInjected {
    fn name(&self) -> String {
        "min_faults_injected".to_string()
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        let count = report.scorecard.fault_count;
        outcome(
            self.name(),
            count >= self.0,
            format!("faults_injected={count} (min {})", self.0),
        )
    }
}

/// Every declared turn completed successfully.
#[derive(Debug, Clone)]
pub struct AllTurnsComplete;

impl Assertion for AllTurnsComplete {
    fn name(&self) -> String {
        "all_turns_complete".to_string()
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        let failed: Vec<usize> = report
            .turns
            .iter()
            .filter(|t| !t.success)
            .map(|t| t.index)
            .collect();
        let passed = failed.is_empty() && !report.turns.is_empty();
        let message = if report.turns.is_empty() {
            "no turns ran".to_string()
        } else if passed {
            format!("all {} turns completed", report.turns.len())
        } else {
            format!("failed turns: {failed:?}")
        };
        outcome(self.name(), passed, message)
    }
}

/// Turn `k` completed successfully.
#[derive(Debug, Clone)]
pub struct TurnCompletes(pub usize);

impl Assertion for TurnCompletes {
    fn name(&self) -> String {
        format!("turn_completes({})", self.0)
    }

    fn scope(&self) -> AssertionScope {
        AssertionScope::Turn(self.0)
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        match turn(report, self.0) {
            Some(t) => outcome(
                self.name(),
                t.success,
                format!("turn {} success={}", self.0, t.success),
            ),
            None => outcome(self.name(), false, format!("turn {} never ran", self.0)),
        }
    }
}

/// Turn `k` completed within the budget.
#[derive(Debug, Clone)]
pub struct TurnCompletesWithin(pub usize, pub Duration);

impl Assertion for TurnCompletesWithin {
    fn name(&self) -> String {
        format!("turn_completes_within({})", self.0)
    }

    fn scope(&self) -> AssertionScope {
        AssertionScope::Turn(self.0)
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        let budget_ms = self.1.as_secs_f64() * 1000.0;
        match turn(report, self.0) {
            Some(t) => outcome(
                self.name(),
                t.success && t.duration_ms <= budget_ms,
                format!(
                    "turn {} success={} in {:.2}ms (budget {:.2}ms)",
                    self.0, t.success, t.duration_ms, budget_ms
                ),
            ),
            None => outcome(self.name(), false, format!("turn {} never ran", self.0)),
        }
    }
}

/// Turn `k`'s response contains the given substring.
#[derive(Debug, Clone)]
pub struct TurnResponseContains(pub usize, pub String);

impl Assertion for TurnResponseContains {
    fn name(&self) -> String {
        format!("turn_response_contains({})", self.0)
    }

    fn scope(&self) -> AssertionScope {
        AssertionScope::Turn(self.0)
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        match turn(report, self.0).and_then(|t| t.response.as_deref()) {
            Some(response) => {
                let passed = response.contains(&self.1);
                outcome(
                    self.name(),
                    passed,
                    format!(
                        "turn {} response {} {:?}",
                        self.0,
                        if passed { "contains" } else { "does not contain" },
                        self.1
                    ),
                )
            }
            None => outcome(
                self.name(),
                false,
                format!("turn {} produced no response", self.0),
            ),
        }
    }
}

/// The scenario is expected to fail with an error containing the pattern.
///
/// Presence of this assertion lets an agent error count as a pass when it
/// matches, turning failure-mode scenarios into green runs.
#[derive(Debug, Clone)]
pub struct ExpectError(pub String);

impl Assertion for ExpectError {
    fn name(&self) -> String {
        "expect_error".to_string()
    }

    fn allows_error(&self) -> bool {
        true
    }

    fn check(&self, report: &RunReport) -> AssertionOutcome {
        match report.error.as_deref() {
            None => outcome(
                self.name(),
                false,
                format!("expected error containing {:?} but run succeeded", self.0),
            ),
            Some(error) => {
                let passed = error.contains(&self.0);
                outcome(
                    self.name(),
                    passed,
                    format!(
                        "error {} {:?}: {error}",
                        if passed { "matched" } else { "did not match" },
                        self.0
                    ),
                )
            }
        }
    }
}
