//! Scenario runner: single runs, baseline pairs, and bounded worker pools.

use crate::context::{ChaosContext, RunState};
use crate::executor::{ExecutorSlot, SlotProviderAdapter};
use crate::injector::Injector;
use crate::recorder::Recorder;
use crate::scenario::assertions::AssertionScope;
use crate::scenario::{turns, Scenario};
use agent_chaos_contract::{
    AssertionOutcome, BroadcastSink, ChaosError, EventSink, JsonlSink, NullSink, ProviderAdapter,
    RunReport, Scorecard,
};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Default runs directory for artifacts.
pub const DEFAULT_RUNS_DIR: &str = ".agent_chaos_runs";

/// Runner options shared by all run modes.
#[derive(Clone)]
pub struct RunnerConfig {
    /// Artifact root; each run writes to `<runs_dir>/<scenario>-<session>/`.
    /// `None` disables artifacts.
    pub runs_dir: Option<PathBuf>,
    /// Write `events.jsonl` alongside `scorecard.json`.
    pub record_events: bool,
    /// Additional sink receiving the live event stream (e.g. a dashboard
    /// bridge). Shared sinks must be internally synchronised.
    pub extra_sink: Option<Arc<dyn EventSink>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runs_dir: None,
            record_events: true,
            extra_sink: None,
        }
    }
}

impl RunnerConfig {
    /// Config writing artifacts under the default runs directory.
    pub fn with_default_runs_dir() -> Self {
        Self {
            runs_dir: Some(PathBuf::from(DEFAULT_RUNS_DIR)),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("runs_dir", &self.runs_dir)
            .field("record_events", &self.record_events)
            .field("extra_sink", &self.extra_sink.is_some())
            .finish()
    }
}

/// Run one scenario to a report, writing artifacts when configured.
///
/// Scenario errors (missing executor, malformed fault factory) produce a
/// failed report rather than an `Err`; `Err` is reserved for artifact I/O.
pub async fn run_scenario(
    scenario: &Scenario,
    config: &RunnerConfig,
) -> Result<RunReport, ChaosError> {
    let session_id = Uuid::now_v7().simple().to_string();
    let run_dir = config
        .runs_dir
        .as_ref()
        .map(|dir| dir.join(format!("{}-{}", scenario.name(), session_id)));

    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if let Some(run_dir) = &run_dir {
        std::fs::create_dir_all(run_dir)?;
        if config.record_events {
            sinks.push(Arc::new(JsonlSink::new(run_dir.join("events.jsonl"))?));
        }
    }
    if let Some(extra) = &config.extra_sink {
        sinks.push(extra.clone());
    }
    let sink: Arc<dyn EventSink> = if sinks.is_empty() {
        Arc::new(NullSink)
    } else {
        Arc::new(BroadcastSink::new(sinks))
    };

    let started = Instant::now();
    let recorder = Recorder::new(sink.clone());

    let Some(executor) = scenario.executor().cloned() else {
        let report = unrunnable_report(
            scenario,
            &session_id,
            "scenario error: no provider executor configured",
        );
        write_scorecard(run_dir.as_deref(), &report)?;
        sink.close();
        return Ok(report);
    };

    let injector = Injector::new(scenario.rules().to_vec(), scenario.seed());
    let state = Arc::new(RunState::new(injector, recorder));
    state.recorder.start_trace(scenario.name(), &session_id);

    let slot = Arc::new(ExecutorSlot::new(executor));
    let adapter = SlotProviderAdapter::with_state(slot.clone(), state.clone());
    let ctx = ChaosContext::new(
        scenario.name().to_string(),
        session_id,
        scenario.model().to_string(),
        state.clone(),
        slot,
    );

    let deadline_at = scenario.deadline().map(|deadline| started + deadline);
    let mut turn_outcomes: Vec<Option<AssertionOutcome>> =
        vec![None; scenario.assertions().len()];

    match adapter.install() {
        Ok(()) => {
            for (turn_index, input_spec) in scenario.turns().iter().enumerate() {
                let record =
                    turns::run_turn(&ctx, scenario.agent(), turn_index, input_spec, deadline_at)
                        .await;

                // Turn-scoped assertions run against the partial report as
                // soon as their turn closes.
                let pending: Vec<usize> = scenario
                    .assertions()
                    .iter()
                    .enumerate()
                    .filter(|(i, a)| {
                        turn_outcomes[*i].is_none() && a.scope() == AssertionScope::Turn(turn_index)
                    })
                    .map(|(i, _)| i)
                    .collect();
                if !pending.is_empty() {
                    let partial = build_report(
                        scenario,
                        &ctx,
                        &state,
                        None,
                        started.elapsed().as_secs_f64() * 1000.0,
                        Vec::new(),
                        false,
                    );
                    for i in pending {
                        turn_outcomes[i] = Some(scenario.assertions()[i].check(&partial));
                    }
                }

                if record.timed_out || state.cancel.is_cancelled() {
                    break;
                }
            }
        }
        Err(e) => state.fail_scenario(e),
    }

    // Teardown runs on every exit path.
    if let Err(e) = adapter.uninstall() {
        tracing::warn!(error = %e, "provider uninstall failed");
    }

    let turn_records = ctx.turn_records();
    let timed_out = turn_records.iter().any(|t| t.timed_out);
    let error = state
        .take_scenario_error()
        .map(|e| e.to_string())
        .or_else(|| timed_out.then(|| "scenario deadline exceeded".to_string()))
        .or_else(|| turn_records.iter().find_map(|t| t.error.clone()));

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let base = build_report(scenario, &ctx, &state, error.clone(), elapsed_ms, Vec::new(), false);

    let outcomes: Vec<AssertionOutcome> = scenario
        .assertions()
        .iter()
        .zip(turn_outcomes)
        .map(|(assertion, cached)| cached.unwrap_or_else(|| assertion.check(&base)))
        .collect();
    let error_allowed = scenario.assertions().iter().any(|a| a.allows_error());
    let passed = outcomes.iter().all(|o| o.passed) && (error.is_none() || error_allowed);

    state.recorder.end_trace(passed, error.as_deref());

    let report = RunReport {
        passed,
        assertions: outcomes,
        ..base
    };
    write_scorecard(run_dir.as_deref(), &report)?;
    sink.close();
    Ok(report)
}

/// Run the scenario twice with the same seed: once with an empty rule set,
/// then with the declared rules. Returns `(baseline, chaos)`.
pub async fn run_baseline_pair(
    scenario: &Scenario,
    config: &RunnerConfig,
) -> Result<(RunReport, RunReport), ChaosError> {
    let baseline_scenario = scenario
        .without_rules()
        .with_name(format!("{}-baseline", scenario.name()));
    let baseline = run_scenario(&baseline_scenario, config).await?;
    let chaos = run_scenario(scenario, config).await?;
    Ok((baseline, chaos))
}

/// Run independent scenarios across a bounded worker pool, preserving input
/// order in the result.
pub async fn run_many(
    scenarios: Vec<Scenario>,
    workers: usize,
    config: &RunnerConfig,
) -> Result<Vec<RunReport>, ChaosError> {
    let workers = workers.max(1);
    let reports: Vec<Result<RunReport, ChaosError>> = futures::stream::iter(
        scenarios.into_iter().map(|scenario| {
            let config = config.clone();
            async move { run_scenario(&scenario, &config).await }
        }),
    )
    .buffered(workers)
    .collect()
    .await;
    reports.into_iter().collect()
}

fn build_report(
    scenario: &Scenario,
    ctx: &ChaosContext,
    state: &Arc<RunState>,
    error: Option<String>,
    elapsed_ms: f64,
    assertions: Vec<AssertionOutcome>,
    passed: bool,
) -> RunReport {
    let metrics = state.recorder.metrics_snapshot();
    let turns = ctx.turn_records();
    RunReport {
        scenario: scenario.name().to_string(),
        trace_id: state.recorder.trace_id(),
        passed,
        error,
        agent_input: turns.first().map(|t| t.input.clone()),
        agent_output: turns.iter().rev().find_map(|t| t.response.clone()),
        elapsed_ms,
        scorecard: metrics.scorecard(),
        assertions,
        turns,
        conversation: metrics.conversation,
    }
}

fn unrunnable_report(scenario: &Scenario, session_id: &str, error: &str) -> RunReport {
    RunReport {
        scenario: scenario.name().to_string(),
        trace_id: session_id.to_string(),
        passed: false,
        error: Some(error.to_string()),
        agent_input: None,
        agent_output: None,
        elapsed_ms: 0.0,
        scorecard: Scorecard::default(),
        assertions: Vec::new(),
        turns: Vec::new(),
        conversation: Vec::new(),
    }
}

fn write_scorecard(run_dir: Option<&std::path::Path>, report: &RunReport) -> Result<(), ChaosError> {
    let Some(run_dir) = run_dir else {
        return Ok(());
    };
    std::fs::create_dir_all(run_dir)?;
    std::fs::write(run_dir.join("scorecard.json"), report.to_json()?)?;
    Ok(())
}
