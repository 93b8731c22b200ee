//! End-to-end scenario runs against scripted executors.

use agent_chaos_harness::contracts::{
    context_inject, context_truncate, llm_rate_limit, stream_cut, stream_hang, stream_ttft_delay,
    tool_error, user_input_mutate, EventPayload, MemorySink,
};
use agent_chaos_harness::prelude::*;
use agent_chaos_harness::testing::{
    text_chat_response, text_stream_script, text_stream_script_with_usage, tool_call_chat_response,
    ChatOnceAgent, MockChatExecutor, MockStreamExecutor, RetryingChatAgent, StreamingCollectAgent,
    ToolLoopAgent,
};
use std::sync::Arc;
use std::time::Duration;

fn config_with(sink: Arc<MemorySink>) -> RunnerConfig {
    RunnerConfig {
        extra_sink: Some(sink),
        ..RunnerConfig::default()
    }
}

#[tokio::test]
async fn rate_limit_recovery_retries_to_success() {
    let executor = Arc::new(MockChatExecutor::new(vec![Ok(text_chat_response(
        "Sunny, 21C", 12, 8,
    ))]));
    let scenario = Scenario::new("rate-limit-recovery", Arc::new(RetryingChatAgent { max_attempts: 2 }))
        .with_executor(executor.clone())
        .with_turn("What's the weather?")
        .with_rule(llm_rate_limit().on_call(0))
        .with_assertion(MaxLlmCalls(3));

    let report = run_scenario(&scenario, &RunnerConfig::default())
        .await
        .expect("run");

    assert!(report.passed, "report: {report:?}");
    assert_eq!(report.scorecard.total_calls, 2);
    assert_eq!(report.scorecard.failed_calls, 1);
    assert_eq!(report.scorecard.injected_calls, 1);
    assert_eq!(report.scorecard.fault_count, 1);
    assert_eq!(report.scorecard.faults_by_kind.get("rate_limit"), Some(&1));
    assert_eq!(executor.calls(), 1, "injected call must not reach the provider");
    assert_eq!(report.agent_output.as_deref(), Some("Sunny, 21C"));
}

#[tokio::test]
async fn stream_cut_after_five_chunks_fails_the_call() {
    let executor = Arc::new(MockStreamExecutor::new(vec![text_stream_script(&[
        "a", "b", "c", "d", "e", "f", "g", "h",
    ])]));
    let sink = Arc::new(MemorySink::new());
    let scenario = Scenario::new("stream-cut", Arc::new(StreamingCollectAgent))
        .with_executor(executor)
        .with_turn("tell me a story")
        .with_rule(stream_cut(5))
        .with_assertion(ExpectError("connection lost".to_string()));

    let report = run_scenario(&scenario, &config_with(sink.clone()))
        .await
        .expect("run");

    assert!(report.passed, "report: {report:?}");
    assert_eq!(report.scorecard.failed_calls, 1);
    assert_eq!(report.scorecard.injected_calls, 1);
    assert_eq!(report.scorecard.faults_by_kind.get("stream_cut"), Some(&1));

    let cut = sink
        .events()
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::StreamCut { chunk_count } => Some(chunk_count),
            _ => None,
        })
        .expect("stream_cut event");
    assert_eq!(cut, 5, "exactly five chunks observed before the cut");
}

#[tokio::test]
async fn tool_error_targets_only_the_named_tool() {
    let executor = Arc::new(MockChatExecutor::new(vec![
        // Turn 0: weather tool requested, then a final answer.
        Ok(tool_call_chat_response("toolu_1", "get_weather")),
        Ok(text_chat_response("The weather service is down.", 4, 6)),
        // Turn 1: a different tool goes through untouched.
        Ok(tool_call_chat_response("toolu_2", "search")),
        Ok(text_chat_response("Found it.", 4, 6)),
    ]));
    let sink = Arc::new(MemorySink::new());
    let agent = ToolLoopAgent::default()
        .with_tool("get_weather", "{\"temp_c\": 21}")
        .with_tool("search", "{\"hits\": 3}");
    let scenario = Scenario::new("tool-error-targeted", Arc::new(agent))
        .with_executor(executor)
        .with_turn("What's the weather?")
        .with_turn("Search for rust streams")
        .with_rule(tool_error("service down").for_tool("get_weather"))
        .with_assertion(AllTurnsComplete);

    let report = run_scenario(&scenario, &config_with(sink.clone()))
        .await
        .expect("run");

    assert!(report.passed, "report: {report:?}");
    assert_eq!(report.scorecard.fault_count, 1);
    assert_eq!(report.scorecard.faults_by_kind.get("tool_error"), Some(&1));

    let tool_ends: Vec<(String, bool)> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::ToolEnd {
                tool_name, success, ..
            } => Some((tool_name, success)),
            _ => None,
        })
        .collect();
    assert_eq!(tool_ends.len(), 2);
    assert!(tool_ends.contains(&("get_weather".to_string(), false)));
    assert!(tool_ends.contains(&("search".to_string(), true)));
}

#[tokio::test]
async fn context_truncation_between_turns() {
    let executor = Arc::new(MockChatExecutor::new(vec![
        Ok(text_chat_response("one", 1, 1)),
        Ok(text_chat_response("two", 1, 1)),
        Ok(text_chat_response("three", 1, 1)),
    ]));
    let sink = Arc::new(MemorySink::new());
    let scenario = Scenario::new("context-truncation", Arc::new(ChatOnceAgent))
        .with_executor(executor.clone())
        .with_turn("first")
        .with_turn("second")
        .with_turn("third")
        .with_rule(context_truncate(1).on_turn(2))
        .with_assertion(AllTurnsComplete);

    let report = run_scenario(&scenario, &config_with(sink.clone()))
        .await
        .expect("run");
    assert!(report.passed, "report: {report:?}");

    // Pre-turn-3 history had four entries; one survives, plus the new input.
    let last = executor.last_request().expect("request captured");
    assert_eq!(last.messages.len(), 2);

    let removed = sink
        .events()
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::FaultInjected {
                fault_type,
                removed_count,
                ..
            } if fault_type == "context_truncate" => removed_count,
            _ => None,
        })
        .expect("truncation fault event");
    assert!(removed >= 1, "removed {removed} entries");
}

#[tokio::test]
async fn injecting_no_messages_is_a_noop() {
    let executor = Arc::new(MockChatExecutor::default());
    let scenario = Scenario::new("empty-inject", Arc::new(ChatOnceAgent))
        .with_executor(executor)
        .with_turn("hello")
        .with_rule(context_inject(Vec::new()));

    let report = run_scenario(&scenario, &RunnerConfig::default())
        .await
        .expect("run");
    assert!(report.passed);
    assert_eq!(report.scorecard.fault_count, 0, "no-op edits emit no fault");
}

#[tokio::test]
async fn user_input_mutation_reaches_the_provider() {
    let executor = Arc::new(MockChatExecutor::default());
    let sink = Arc::new(MemorySink::new());
    let scenario = Scenario::new("user-mutation", Arc::new(ChatOnceAgent))
        .with_executor(executor.clone())
        .with_turn("What's the weather?")
        .with_rule(user_input_mutate(|input| format!("{input} Reply in haiku.")));

    let report = run_scenario(&scenario, &config_with(sink.clone()))
        .await
        .expect("run");
    assert!(report.passed, "report: {report:?}");

    assert_eq!(
        report.turns[0].input,
        "What's the weather? Reply in haiku."
    );
    let request = executor.last_request().expect("request captured");
    let first = request.messages.first().expect("one message");
    match &first.content {
        genai::chat::MessageContent::Text(text) => {
            assert!(text.contains("Reply in haiku."), "got: {text}");
        }
        other => panic!("expected text content, got {other:?}"),
    }

    let (original, mutated) = sink
        .events()
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::FaultInjected {
                original, mutated, ..
            } => Some((original, mutated)),
            _ => None,
        })
        .expect("mutation fault event");
    assert_eq!(original.as_deref(), Some("What's the weather?"));
    assert_eq!(
        mutated.as_deref(),
        Some("What's the weather? Reply in haiku.")
    );
}

#[tokio::test]
async fn delayed_ttft_is_marked_on_the_event() {
    let executor = Arc::new(MockStreamExecutor::new(vec![
        text_stream_script_with_usage(&["hi", "there"], 3, 5),
    ]));
    let sink = Arc::new(MemorySink::new());
    let scenario = Scenario::new("slow-ttft", Arc::new(StreamingCollectAgent))
        .with_executor(executor)
        .with_turn("hello")
        .with_rule(stream_ttft_delay(Duration::from_millis(30)));

    let started = std::time::Instant::now();
    let report = run_scenario(&scenario, &config_with(sink.clone()))
        .await
        .expect("run");
    assert!(report.passed, "report: {report:?}");
    assert!(started.elapsed() >= Duration::from_millis(30));

    let (ttft_ms, is_delayed) = sink
        .events()
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::Ttft { ttft_ms, is_delayed } => Some((ttft_ms, is_delayed)),
            _ => None,
        })
        .expect("ttft event");
    assert!(is_delayed);
    assert!(ttft_ms >= 30.0);
    assert_eq!(report.scorecard.faults_by_kind.get("slow_ttft"), Some(&1));
    assert_eq!(report.scorecard.input_tokens, 3);
    assert_eq!(report.scorecard.output_tokens, 5);
}

#[tokio::test]
async fn deadline_cancels_an_injected_hang() {
    let executor = Arc::new(MockStreamExecutor::new(vec![text_stream_script(&[
        "a", "b", "c", "d",
    ])]));
    let scenario = Scenario::new("hang-deadline", Arc::new(StreamingCollectAgent))
        .with_executor(executor)
        .with_turn("hello")
        .with_rule(stream_hang(2))
        .with_deadline(Duration::from_millis(200))
        .with_assertion(ExpectError("deadline".to_string()));

    let started = std::time::Instant::now();
    let report = run_scenario(&scenario, &RunnerConfig::default())
        .await
        .expect("run");

    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation must be bounded"
    );
    assert!(report.turns[0].timed_out);
    assert_eq!(
        report.error.as_deref(),
        Some("scenario deadline exceeded")
    );
    assert!(report.passed, "expect_error permits the timeout");
    assert_eq!(report.scorecard.faults_by_kind.get("stream_hang"), Some(&1));
}

#[tokio::test]
async fn per_turn_call_trigger_fires_on_the_right_turn() {
    let executor = Arc::new(MockChatExecutor::new(vec![
        Ok(text_chat_response("first", 1, 1)),
        Ok(text_chat_response("second", 1, 1)),
    ]));
    let scenario = Scenario::new(
        "per-turn-trigger",
        Arc::new(RetryingChatAgent { max_attempts: 2 }),
    )
    .with_executor(executor.clone())
    .with_turn("one")
    .with_turn("two")
    .with_rule(llm_rate_limit().on_turn(1).on_call_in_turn(0))
    .with_assertion(AllTurnsComplete);

    let report = run_scenario(&scenario, &RunnerConfig::default())
        .await
        .expect("run");

    assert!(report.passed, "report: {report:?}");
    // Turn 0 goes through untouched; turn 1's first call is injected and
    // the retry (second call of that turn) succeeds.
    assert_eq!(report.turns[0].llm_calls, 1);
    assert_eq!(report.turns[1].llm_calls, 2);
    assert_eq!(report.scorecard.fault_count, 1);
    assert_eq!(report.scorecard.faults_by_kind.get("rate_limit"), Some(&1));
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn baseline_pair_controls_for_chaos() {
    let executor = Arc::new(MockChatExecutor::new(vec![
        Ok(text_chat_response("ok", 2, 2)),
        Ok(text_chat_response("ok", 2, 2)),
    ]));
    let scenario = Scenario::new("baseline-pair", Arc::new(RetryingChatAgent { max_attempts: 2 }))
        .with_executor(executor)
        .with_turn("first")
        .with_turn("second")
        .with_rule(llm_rate_limit().on_call(0))
        .with_seed(42);

    let (baseline, chaos) = run_baseline_pair(&scenario, &RunnerConfig::default())
        .await
        .expect("pair");

    assert_eq!(baseline.scorecard.fault_count, 0, "baseline injects nothing");
    assert_eq!(chaos.scorecard.fault_count, 1);
    let baseline_inputs: Vec<&str> = baseline.turns.iter().map(|t| t.input.as_str()).collect();
    let chaos_inputs: Vec<&str> = chaos.turns.iter().map(|t| t.input.as_str()).collect();
    assert_eq!(baseline_inputs, chaos_inputs);
}

#[tokio::test]
async fn dynamic_turn_inputs_see_prior_results() {
    let executor = Arc::new(MockChatExecutor::new(vec![
        Ok(text_chat_response("Paris", 1, 1)),
        Ok(text_chat_response("2.1 million", 1, 1)),
    ]));
    let scenario = Scenario::new("dynamic-turns", Arc::new(ChatOnceAgent))
        .with_executor(executor.clone())
        .with_turn("What's the capital of France?")
        .with_turn(TurnInput::dynamic(|prior| {
            let city = prior
                .last()
                .and_then(|t| t.response.as_deref())
                .unwrap_or("that city");
            format!("What's the population of {city}?")
        }))
        .with_assertion(TurnResponseContains(1, "million".to_string()));

    let report = run_scenario(&scenario, &RunnerConfig::default())
        .await
        .expect("run");
    assert!(report.passed, "report: {report:?}");
    assert_eq!(
        report.turns[1].input,
        "What's the population of Paris?"
    );
}
