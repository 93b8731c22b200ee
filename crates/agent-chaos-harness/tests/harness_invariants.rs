//! Cross-cutting guarantees of the run machinery: span pairing, fault/record
//! correspondence, seed determinism, adapter reversibility, artifact layout.

use agent_chaos_harness::contracts::{
    llm_rate_limit, read_events, stream_cut, tool_error, EventPayload, LlmExecutor, MemorySink,
    ProviderAdapter, RunReport,
};
use agent_chaos_harness::prelude::*;
use agent_chaos_harness::testing::{
    text_chat_response, text_stream_script, tool_call_chat_response, ChatOnceAgent,
    MockChatExecutor, MockStreamExecutor, RetryingChatAgent, StreamingCollectAgent, ToolLoopAgent,
};
use agent_chaos_harness::{ExecutorSlot, Injector, Recorder, SlotProviderAdapter};
use std::sync::Arc;

fn busy_scenario(sink: Arc<MemorySink>) -> (Scenario, RunnerConfig) {
    let executor = Arc::new(MockChatExecutor::new(vec![
        Ok(tool_call_chat_response("toolu_1", "get_weather")),
        Ok(text_chat_response("cloudy", 3, 4)),
        Ok(text_chat_response("bye", 1, 1)),
    ]));
    let agent = ToolLoopAgent::default().with_tool("get_weather", "{\"temp_c\": 9}");
    let scenario = Scenario::new("invariants", Arc::new(agent))
        .with_executor(executor)
        .with_turn("What's the weather?")
        .with_turn("thanks")
        .with_rule(tool_error("flaky").for_tool("get_weather").on_turn(0))
        .with_seed(7);
    let config = RunnerConfig {
        extra_sink: Some(sink),
        ..RunnerConfig::default()
    };
    (scenario, config)
}

#[tokio::test]
async fn spans_pair_and_events_stay_ordered() {
    let sink = Arc::new(MemorySink::new());
    let (scenario, config) = busy_scenario(sink.clone());
    run_scenario(&scenario, &config).await.expect("run");

    let events = sink.events();
    let mut open: Vec<String> = Vec::new();
    let mut starts = 0usize;
    let mut ends = 0usize;
    for event in &events {
        match &event.payload {
            EventPayload::SpanStart {} => {
                starts += 1;
                open.push(event.span_id.clone().expect("span_start has a span id"));
            }
            EventPayload::SpanEnd { .. } => {
                ends += 1;
                let span_id = event.span_id.clone().expect("span_end has a span id");
                let idx = open
                    .iter()
                    .position(|s| *s == span_id)
                    .expect("span_end pairs with an open span");
                open.remove(idx);
            }
            _ => {}
        }
    }
    assert_eq!(starts, ends);
    assert!(open.is_empty(), "unclosed spans: {open:?}");

    for pair in events.windows(2) {
        assert!(
            pair[0].timestamp <= pair[1].timestamp,
            "timestamps regressed: {:?} then {:?}",
            pair[0].timestamp,
            pair[1].timestamp
        );
    }
}

#[tokio::test]
async fn injected_failures_match_fault_events_one_to_one() {
    let sink = Arc::new(MemorySink::new());
    let executor = Arc::new(MockChatExecutor::new(vec![Ok(text_chat_response(
        "ok", 1, 1,
    ))]));
    let scenario = Scenario::new("fault-correspondence", Arc::new(RetryingChatAgent {
        max_attempts: 2,
    }))
    .with_executor(executor)
    .with_turn("hi")
    .with_rule(llm_rate_limit().on_call(0));
    let config = RunnerConfig {
        extra_sink: Some(sink.clone()),
        ..RunnerConfig::default()
    };
    run_scenario(&scenario, &config).await.expect("run");

    let events = sink.events();
    let injected_spans: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::SpanEnd { injected: true, .. } => e.span_id.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(injected_spans.len(), 1);

    for span_id in &injected_spans {
        let faults = events
            .iter()
            .filter(|e| {
                matches!(e.payload, EventPayload::FaultInjected { .. })
                    && e.span_id.as_deref() == Some(span_id.as_str())
            })
            .count();
        assert_eq!(faults, 1, "span {span_id} needs exactly one fault record");
    }
}

#[tokio::test]
async fn tool_lifecycles_end_at_most_once_and_in_order() {
    let sink = Arc::new(MemorySink::new());
    let (scenario, config) = busy_scenario(sink.clone());
    run_scenario(&scenario, &config).await.expect("run");

    let mut started: Vec<String> = Vec::new();
    let mut ended: Vec<String> = Vec::new();
    for event in sink.events() {
        match event.payload {
            EventPayload::ToolStart { tool_call_id, .. } => {
                started.extend(tool_call_id);
            }
            EventPayload::ToolEnd { tool_call_id, .. } => {
                let id = tool_call_id.expect("tool_end carries its id");
                assert!(
                    started.contains(&id),
                    "tool_end for {id} before its tool_start"
                );
                assert!(!ended.contains(&id), "second tool_end for {id}");
                ended.push(id);
            }
            _ => {}
        }
    }
    assert!(!ended.is_empty());
}

/// Two runs with the same seed and scenario produce the same sequence of
/// (event type, fault kind, tool name); timestamps may differ.
#[tokio::test]
async fn runs_are_reproducible_under_a_fixed_seed() {
    async fn fingerprint() -> Vec<String> {
        let sink = Arc::new(MemorySink::new());
        let executor = Arc::new(MockChatExecutor::new(
            (0..10)
                .map(|_| Ok(text_chat_response("ok", 1, 1)))
                .collect(),
        ));
        let scenario = Scenario::new("determinism", Arc::new(RetryingChatAgent {
            max_attempts: 10,
        }))
        .with_executor(executor)
        .with_turn("first")
        .with_turn("second")
        .with_rule(llm_rate_limit().with_probability(0.5))
        .with_seed(42);
        let config = RunnerConfig {
            extra_sink: Some(sink.clone()),
            ..RunnerConfig::default()
        };
        run_scenario(&scenario, &config).await.expect("run");

        sink.events()
            .into_iter()
            .map(|e| match e.payload {
                EventPayload::FaultInjected { fault_type, .. } => {
                    format!("fault_injected:{fault_type}")
                }
                EventPayload::ToolEnd { tool_name, .. } => format!("tool_end:{tool_name}"),
                other => other.kind().to_string(),
            })
            .collect()
    }

    let first = fingerprint().await;
    let second = fingerprint().await;
    assert_eq!(first, second);
    assert!(first.iter().any(|k| k == "span_start"));
}

#[tokio::test]
async fn adapter_round_trip_restores_the_executor_identity() {
    let original: Arc<dyn LlmExecutor> = Arc::new(MockChatExecutor::default());
    let slot = Arc::new(ExecutorSlot::new(original.clone()));
    let adapter = SlotProviderAdapter::new(
        slot.clone(),
        Injector::new(Vec::new(), Some(1)),
        Recorder::disconnected(),
    );

    adapter.install().expect("install");
    adapter.uninstall().expect("uninstall");
    adapter.install().expect("install again");
    adapter.uninstall().expect("uninstall again");

    assert!(
        Arc::ptr_eq(&slot.current(), &original),
        "uninstall must restore the pre-install reference"
    );
}

#[tokio::test]
async fn artifacts_round_trip_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = Arc::new(MockStreamExecutor::new(vec![text_stream_script(&[
        "a", "b", "c", "d", "e", "f",
    ])]));
    let scenario = Scenario::new("artifacts", Arc::new(StreamingCollectAgent))
        .with_executor(executor)
        .with_turn("go")
        .with_rule(stream_cut(3))
        .with_assertion(ExpectError("connection lost".to_string()));
    let config = RunnerConfig {
        runs_dir: Some(dir.path().to_path_buf()),
        ..RunnerConfig::default()
    };

    let report = run_scenario(&scenario, &config).await.expect("run");

    let run_dir = std::fs::read_dir(dir.path())
        .expect("runs dir")
        .next()
        .expect("one run dir")
        .expect("entry")
        .path();
    assert!(run_dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("artifacts-")));

    let scorecard_raw =
        std::fs::read_to_string(run_dir.join("scorecard.json")).expect("scorecard.json");
    let parsed: RunReport = serde_json::from_str(&scorecard_raw).expect("parse scorecard");
    assert_eq!(parsed, report);

    let events = read_events(run_dir.join("events.jsonl")).expect("events.jsonl");
    assert_eq!(events.first().map(|e| e.payload.kind()), Some("trace_start"));
    assert_eq!(events.last().map(|e| e.payload.kind()), Some("trace_end"));
    let starts = events
        .iter()
        .filter(|e| e.payload.kind() == "span_start")
        .count();
    let ends = events
        .iter()
        .filter(|e| e.payload.kind() == "span_end")
        .count();
    assert_eq!(starts, ends);
}

#[tokio::test]
async fn missing_executor_is_a_failed_scenario_not_a_crash() {
    let scenario = Scenario::new("no-provider", Arc::new(ChatOnceAgent)).with_turn("hi");
    let report = run_scenario(&scenario, &RunnerConfig::default())
        .await
        .expect("run returns a report");
    assert!(!report.passed);
    assert!(report
        .error
        .as_deref()
        .is_some_and(|e| e.contains("no provider executor")));
}

#[tokio::test]
async fn worker_pool_preserves_result_order() {
    let scenarios: Vec<Scenario> = (0..4)
        .map(|i| {
            Scenario::new(format!("pool-{i}"), Arc::new(ChatOnceAgent))
                .with_executor(Arc::new(MockChatExecutor::default()) as Arc<dyn LlmExecutor>)
                .with_turn("hi")
        })
        .collect();

    let reports = run_many(scenarios, 2, &RunnerConfig::default())
        .await
        .expect("pool run");
    let names: Vec<&str> = reports.iter().map(|r| r.scenario.as_str()).collect();
    assert_eq!(names, vec!["pool-0", "pool-1", "pool-2", "pool-3"]);
    assert!(reports.iter().all(|r| r.passed));
}

#[tokio::test]
async fn rogue_fault_factory_fails_the_run_but_tears_down() {
    use agent_chaos_harness::contracts::{ChaosPoint, ChaosRule, Fault, Trigger};

    let rogue = ChaosRule::new(ChaosPoint::Llm, Trigger::Always, || Fault::ToolEmpty);
    let executor = Arc::new(MockChatExecutor::default());
    let scenario = Scenario::new("rogue-factory", Arc::new(ChatOnceAgent))
        .with_executor(executor)
        .with_turn("hi")
        .with_rule(rogue);

    let report = run_scenario(&scenario, &RunnerConfig::default())
        .await
        .expect("run returns a report");
    assert!(!report.passed);
    assert!(report
        .error
        .as_deref()
        .is_some_and(|e| e.contains("not valid at point")));
}
