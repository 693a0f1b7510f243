use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use stepwise_core::config::EngineConfig;
use stepwise_core::error::{InvokerErrorKind, StepwiseError};
use stepwise_core::event::EventKind;
use stepwise_core::types::{RunId, ToolOutput};
use stepwise_engine::{LlmInvoker, ResumeSignal, RunOutcome, WorkflowEngine, WorkflowGraph};
use stepwise_script::RhaiScriptRunner;
use stepwise_test_utils::*;

fn engine_with(
    engine_config: EngineConfig,
    llm: MockLlmClient,
    tools: MockToolProvider,
) -> WorkflowEngine {
    let config = test_config();
    let tools = Arc::new(tools);
    let invoker = LlmInvoker::from_config(Arc::new(llm), tools.clone(), &config);
    WorkflowEngine::new(
        engine_config,
        Arc::new(RhaiScriptRunner::new()),
        Arc::new(invoker),
        tools,
    )
}

fn mock_engine(llm: MockLlmClient) -> WorkflowEngine {
    engine_with(test_config().engine, llm, MockToolProvider::new())
}

fn inputs(value: Value) -> Map<String, Value> {
    serde_json::from_value(value).unwrap()
}

async fn start(
    engine: &WorkflowEngine,
    doc: Value,
    input: Value,
    sink: &CollectingSink,
) -> RunOutcome {
    let graph = WorkflowGraph::from_value(doc).unwrap();
    engine
        .start(&RunId::new(), graph, inputs(input), sink, CancellationToken::new())
        .await
        .unwrap()
}

fn started_count(sink: &CollectingSink, node: &str) -> usize {
    sink.trace()
        .iter()
        .filter(|(kind, id)| *kind == EventKind::Started && id == node)
        .count()
}

fn expect_failed(outcome: RunOutcome) -> (String, StepwiseError) {
    match outcome {
        RunOutcome::Failed { node_id, error } => (node_id, error),
        other => panic!("expected failure, got {other:?}"),
    }
}

fn expect_output(outcome: RunOutcome) -> Value {
    match outcome {
        RunOutcome::Completed { output } => output,
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_agent_scenario_event_order() {
    let llm = MockLlmClient::new().with_text_response("4");
    let recorder = llm.clone();
    let engine = mock_engine(llm);
    let sink = CollectingSink::new();

    let outcome = start(&engine, agent_graph(), json!({"question": "2+2"}), &sink).await;
    assert_eq!(expect_output(outcome), json!("4"));

    let trace = sink.trace();
    let expected = vec![
        (EventKind::Started, "start".to_string()),
        (EventKind::Output, "start".to_string()),
        (EventKind::Started, "agent".to_string()),
        (EventKind::Output, "agent".to_string()),
        (EventKind::Started, "end".to_string()),
        (EventKind::Output, "end".to_string()),
    ];
    assert_eq!(trace, expected);

    let events = sink.events();
    assert_eq!(events[3].payload, json!("4"));
    assert_eq!(events[5].payload, json!("4"));
    assert_eq!(recorder.requests()[0].last().unwrap().text(), "Answer: 2+2");
}

#[tokio::test]
async fn test_if_else_takes_false_branch() {
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();

    let outcome = start(&engine, branch_graph("input.x > 10"), json!({"x": 5}), &sink).await;
    assert_eq!(expect_output(outcome), json!("small"));
    assert_eq!(started_count(&sink, "no"), 1);
    assert_eq!(started_count(&sink, "yes"), 0);

    let check_output = sink
        .events()
        .into_iter()
        .find(|e| e.node_id == "check" && e.event_kind == EventKind::Output)
        .unwrap();
    assert_eq!(check_output.payload["branch"], "false");
}

#[tokio::test]
async fn test_if_else_with_string_number_input() {
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();
    let outcome = start(&engine, branch_graph("input.x > 10"), json!({"x": "15"}), &sink).await;
    assert_eq!(expect_output(outcome), json!("big"));
}

#[tokio::test]
async fn test_while_zero_iterations_skips_body() {
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();
    let outcome = start(&engine, loop_graph("true", 0), json!({}), &sink).await;

    assert_eq!(expect_output(outcome), Value::Null);
    assert_eq!(started_count(&sink, "body"), 0);
    assert_eq!(started_count(&sink, "loop"), 1);
}

#[tokio::test]
async fn test_while_one_iteration() {
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();
    let outcome = start(&engine, loop_graph("true", 1), json!({}), &sink).await;

    assert_eq!(expect_output(outcome), json!(1));
    assert_eq!(started_count(&sink, "body"), 1);
}

#[tokio::test]
async fn test_while_always_true_runs_exactly_max() {
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();
    let outcome = start(&engine, loop_graph("true", 3), json!({}), &sink).await;

    assert_eq!(expect_output(outcome), json!(3));
    assert_eq!(started_count(&sink, "body"), 3);
    // the exit visit reports the completed count
    let last_loop = sink
        .events()
        .into_iter()
        .filter(|e| e.node_id == "loop" && e.event_kind == EventKind::Output)
        .last()
        .unwrap();
    assert_eq!(last_loop.payload, json!({"branch": "exit", "iteration": 3}));
}

#[tokio::test]
async fn test_while_condition_sees_iteration() {
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();
    let outcome = start(&engine, loop_graph("iteration <= 2", 10), json!({}), &sink).await;

    assert_eq!(expect_output(outcome), json!(2));
    assert_eq!(started_count(&sink, "body"), 2);
}

#[tokio::test]
async fn test_while_clamped_to_ceiling() {
    let mut config = test_config().engine;
    config.loop_ceiling = 2;
    let engine = engine_with(config, MockLlmClient::new(), MockToolProvider::new());
    let sink = CollectingSink::new();

    let outcome = start(&engine, loop_graph("true", 50), json!({}), &sink).await;
    assert_eq!(expect_output(outcome), json!(2));
}

#[tokio::test]
async fn test_step_budget_is_loop_safety_violation() {
    let mut config = test_config().engine;
    config.max_steps = 4;
    let engine = engine_with(config, MockLlmClient::new(), MockToolProvider::new());
    let sink = CollectingSink::new();

    let outcome = start(&engine, loop_graph("true", 10), json!({}), &sink).await;
    let (_, error) = expect_failed(outcome);
    assert!(matches!(error, StepwiseError::LoopSafety { .. }));
    assert_eq!(sink.last().unwrap().payload["kind"], "loop_safety_violation");
}

#[tokio::test]
async fn test_script_timeout_fails_run_at_node() {
    let doc = graph(
        vec![
            node("start", "start", json!({})),
            node("spin", "transform", json!({"script": "loop {}", "timeoutMs": 100})),
            node("end", "end", json!({})),
        ],
        vec![
            edge("e1", "start", "spin", None),
            edge("e2", "spin", "end", None),
        ],
    );
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();

    let (node_id, error) = expect_failed(start(&engine, doc, json!({}), &sink).await);
    assert_eq!(node_id, "spin");
    assert_eq!(error.kind(), "script_error");

    let last = sink.last().unwrap();
    assert_eq!(last.event_kind, EventKind::Error);
    assert_eq!(last.node_id, "spin");
    assert_eq!(started_count(&sink, "end"), 0);
}

#[tokio::test]
async fn test_script_error_stops_run() {
    let doc = graph(
        vec![
            node("start", "start", json!({})),
            node("bad", "transform", json!({"script": "throw \"nope\""})),
            node("end", "end", json!({})),
        ],
        vec![edge("e1", "start", "bad", None), edge("e2", "bad", "end", None)],
    );
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();

    let (node_id, error) = expect_failed(start(&engine, doc, json!({}), &sink).await);
    assert_eq!(node_id, "bad");
    assert!(error.to_string().contains("nope"));
}

#[tokio::test]
async fn test_missing_required_input_fails_before_any_node() {
    let llm = MockLlmClient::new().with_text_response("unused");
    let calls = llm.call_counter();
    let engine = mock_engine(llm);
    let sink = CollectingSink::new();

    let (node_id, error) = expect_failed(start(&engine, agent_graph(), json!({}), &sink).await);
    assert_eq!(node_id, "start");
    assert!(matches!(error, StepwiseError::Input { .. }));
    assert_eq!(sink.trace(), vec![(EventKind::Error, "start".to_string())]);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_graph_never_starts() {
    let mut doc = agent_graph();
    doc["edges"] = json!([]);
    let graph = WorkflowGraph::from_value(doc).unwrap();
    let sink = CollectingSink::new();
    let err = mock_engine(MockLlmClient::new())
        .start(&RunId::new(), graph, Map::new(), &sink, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StepwiseError::Validation { .. }));
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn test_approval_suspends_then_resumes() {
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();

    let outcome = start(&engine, approval_graph(), json!({"item": "widget"}), &sink).await;
    let suspended = match outcome {
        RunOutcome::Suspended(run) => *run,
        other => panic!("expected suspension, got {other:?}"),
    };
    assert_eq!(suspended.cursor, "approve");
    assert_eq!(suspended.prompt, "Publish draft of widget?");

    let last = sink.last().unwrap();
    assert_eq!(last.event_kind, EventKind::Suspended);
    assert_eq!(last.payload["prompt"], "Publish draft of widget?");
    assert_eq!(started_count(&sink, "publish"), 0);

    sink.clear();
    let signal = ResumeSignal::approve(suspended.run_id.clone());
    let outcome = engine
        .resume(suspended, signal, &sink, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(expect_output(outcome), json!("published draft of widget"));

    let trace = sink.trace();
    assert_eq!(trace[0], (EventKind::Resumed, "approve".to_string()));
    assert_eq!(trace[1], (EventKind::Output, "approve".to_string()));
    assert_eq!(trace[2], (EventKind::Started, "publish".to_string()));
}

#[tokio::test]
async fn test_approval_rejected_fails_run() {
    let engine = mock_engine(MockLlmClient::new());
    let sink = CollectingSink::new();

    let outcome = start(&engine, approval_graph(), json!({"item": "widget"}), &sink).await;
    let RunOutcome::Suspended(suspended) = outcome else {
        panic!("expected suspension")
    };
    let signal = ResumeSignal::reject(suspended.run_id.clone()).with_note("not yet");
    let (node_id, error) = expect_failed(
        engine
            .resume(*suspended, signal, &sink, CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(node_id, "approve");
    assert!(matches!(error, StepwiseError::ApprovalRejected { .. }));

    let last = sink.last().unwrap();
    assert_eq!(last.event_kind, EventKind::Error);
    assert_eq!(last.payload["kind"], "approval_rejected");
    assert_eq!(last.payload["note"], "not yet");
    assert_eq!(started_count(&sink, "publish"), 0);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let engine = mock_engine(MockLlmClient::new().with_text_response("x"));
    let sink = CollectingSink::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let graph = WorkflowGraph::from_value(agent_graph()).unwrap();
    let outcome = engine
        .start(&RunId::new(), graph, inputs(json!({"question": "q"})), &sink, cancel)
        .await
        .unwrap();
    let (node_id, error) = expect_failed(outcome);
    assert_eq!(node_id, "start");
    assert!(matches!(error, StepwiseError::Cancelled));
    assert_eq!(sink.last().unwrap().payload["kind"], "cancelled");
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_agent() {
    let llm = MockLlmClient::new()
        .with_delay(Duration::from_secs(30))
        .with_text_response("too late");
    let engine = mock_engine(llm);
    let sink = CollectingSink::new();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let graph = WorkflowGraph::from_value(agent_graph()).unwrap();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        engine.start(&RunId::new(), graph, inputs(json!({"question": "q"})), &sink, cancel),
    )
    .await
    .expect("cancellation should end the run promptly")
    .unwrap();

    let (node_id, error) = expect_failed(outcome);
    assert_eq!(node_id, "agent");
    assert!(matches!(error, StepwiseError::Cancelled));
    assert_eq!(sink.last().unwrap().event_kind, EventKind::Error);
}

fn tool_graph() -> Value {
    graph(
        vec![
            start_with("q"),
            node(
                "lookup",
                "tool",
                json!({"server": "search", "tool": "query", "arguments": {"q": "{{input.q}}", "limit": 2}}),
            ),
            node("end", "end", json!({})),
        ],
        vec![
            edge("e1", "start", "lookup", None),
            edge("e2", "lookup", "end", None),
        ],
    )
}

#[tokio::test]
async fn test_tool_node_resolves_arguments() {
    let tools = MockToolProvider::new().with_tool(
        "search",
        "query",
        ToolOutput::success(r#"{"hits": 2}"#),
    );
    let calls = tools.clone();
    let engine = engine_with(test_config().engine, MockLlmClient::new(), tools);
    let sink = CollectingSink::new();

    let outcome = start(&engine, tool_graph(), json!({"q": "rust"}), &sink).await;
    assert_eq!(expect_output(outcome), json!({"hits": 2}));
    assert_eq!(
        calls.calls(),
        vec![("mcp__search__query".to_string(), json!({"q": "rust", "limit": 2}))]
    );
}

#[tokio::test]
async fn test_tool_node_error_result_fails() {
    let tools =
        MockToolProvider::new().with_tool("search", "query", ToolOutput::error("quota exceeded"));
    let engine = engine_with(test_config().engine, MockLlmClient::new(), tools);
    let sink = CollectingSink::new();

    let (node_id, error) =
        expect_failed(start(&engine, tool_graph(), json!({"q": "rust"}), &sink).await);
    assert_eq!(node_id, "lookup");
    assert!(matches!(
        error,
        StepwiseError::Invoker { kind: InvokerErrorKind::ToolFailed, .. }
    ));
    assert_eq!(sink.last().unwrap().payload["invokerKind"], "tool_failed");
}

#[tokio::test]
async fn test_structured_agent_output() {
    let mut doc = agent_graph();
    doc["nodes"][1]["config"]["outputFormat"] = json!({
        "type": "json",
        "schema": {"type": "object", "required": ["answer"]}
    });

    let engine = mock_engine(MockLlmClient::new().with_text_response("```json\n{\"answer\": 4}\n```"));
    let sink = CollectingSink::new();
    let outcome = start(&engine, doc.clone(), json!({"question": "2+2"}), &sink).await;
    assert_eq!(expect_output(outcome), json!({"answer": 4}));

    let engine = mock_engine(MockLlmClient::new().with_text_response("four"));
    let sink = CollectingSink::new();
    let (node_id, _) = expect_failed(start(&engine, doc, json!({"question": "2+2"}), &sink).await);
    assert_eq!(node_id, "agent");
    let payload = sink.last().unwrap().payload;
    assert_eq!(payload["invokerKind"], "malformed_output");
    assert_eq!(payload["raw"], "four");
}

#[tokio::test]
async fn test_agent_tool_rounds_exhausted_fails_run() {
    let mut doc = agent_graph();
    doc["nodes"][1]["config"]["tools"] = json!([{"server": "search"}]);
    doc["nodes"][1]["config"]["maxToolRounds"] = json!(1);

    let llm = MockLlmClient::new()
        .with_tool_call("c1", "mcp__search__query", json!({"q": "a"}))
        .with_tool_call("c2", "mcp__search__query", json!({"q": "b"}));
    let tools = MockToolProvider::new().with_tool("search", "query", ToolOutput::success("r"));
    let engine = engine_with(test_config().engine, llm, tools);
    let sink = CollectingSink::new();

    let (node_id, error) =
        expect_failed(start(&engine, doc, json!({"question": "q"}), &sink).await);
    assert_eq!(node_id, "agent");
    assert!(matches!(
        error,
        StepwiseError::Invoker { kind: InvokerErrorKind::ToolRoundsExhausted, .. }
    ));
}

#[tokio::test]
async fn test_last_output_flows_into_next_node() {
    let doc = graph(
        vec![
            start_with("question"),
            node("agent", "agent", json!({"instructions": "{{input.question}}"})),
            node("shout", "transform", json!({"script": "lastOutput + \"!\""})),
            node("echo", "agent", json!({"instructions": "Repeat: {{lastOutput}}"})),
            node("end", "end", json!({})),
        ],
        vec![
            edge("e1", "start", "agent", None),
            edge("e2", "agent", "shout", None),
            edge("e3", "shout", "echo", None),
            edge("e4", "echo", "end", None),
        ],
    );
    let llm = MockLlmClient::new()
        .with_text_response("hello")
        .with_text_response("hello!");
    let recorder = llm.clone();
    let engine = mock_engine(llm);
    let sink = CollectingSink::new();

    let outcome = start(&engine, doc, json!({"question": "hi"}), &sink).await;
    assert_eq!(expect_output(outcome), json!("hello!"));
    assert_eq!(recorder.requests()[1].last().unwrap().text(), "Repeat: hello!");
}
