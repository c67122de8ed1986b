use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use flowdeck_core::config::{FlowConfig, LogConfig, ParallelJoinPolicy};
use flowdeck_core::types::{
    DefinitionKind, ExecutionEvent, ExecutionRecord, ExecutionStatus, GraphDefinition,
};
use flowdeck_core::FlowError;
use flowdeck_engine::{Engine, ScenarioExecutionRequest};
use flowdeck_store::SqliteStore;
use flowdeck_test_utils::{
    branch_edge, edge, graph, linear_agent_graph, llm_node, memory_store, node, seed_definition,
    MockLlmProvider, MockToolExecutor,
};

fn build(store: &Arc<SqliteStore>, llm: MockLlmProvider, config: FlowConfig) -> Engine {
    Engine::with_store(
        store.clone(),
        Arc::new(llm),
        Arc::new(MockToolExecutor::new()),
        config,
    )
}

async fn agent(store: &SqliteStore, name: &str, provider: &str, prompt: &str) -> String {
    seed_definition(
        store,
        DefinitionKind::Agent,
        name,
        linear_agent_graph(vec![llm_node("reply", provider, prompt)]),
    )
    .await
    .unwrap()
    .definition_id
}

async fn scenario(store: &SqliteStore, name: &str, g: GraphDefinition) -> String {
    seed_definition(store, DefinitionKind::Scenario, name, g)
        .await
        .unwrap()
        .definition_id
}

fn scenario_record(record: ExecutionRecord) -> (flowdeck_core::types::ScenarioExecution, Vec<flowdeck_core::types::AgentExecution>) {
    match record {
        ExecutionRecord::Scenario { execution, agents } => (execution, agents),
        other => panic!("expected scenario record, got {:?}", other),
    }
}

/// Classifier -> decision -> billing (branch 0, ends) | general (branch 1).
async fn routing_fixture(classifier_reply: &str) -> (Arc<SqliteStore>, Engine, String) {
    let store = memory_store();
    let llm = MockLlmProvider::new()
        .with_reply("classifier", classifier_reply)
        .with_reply("billing", "Your invoice is attached")
        .with_reply("general", "Happy to help");
    let engine = build(&store, llm, FlowConfig::default());

    let classifier = agent(&store, "classifier", "classifier", "{{input.message}}").await;
    let billing = agent(&store, "billing", "billing", "Invoice help: {{input.message}}").await;
    let general = agent(&store, "general", "general", "{{input.message}}").await;

    let g = graph(
        vec![
            node("start", "scenario-trigger", json!({})),
            node(
                "classify",
                "scenario-agent",
                json!({"agentId": classifier, "input": {"message": "{{input.message}}"}}),
            ),
            node(
                "route",
                "scenario-decision",
                json!({"branches": [
                    {"condition": "{{classify.output.result}} == \"billing\"", "label": "billing"},
                    {"condition": "default", "label": "general"}
                ]}),
            ),
            node("billing", "scenario-agent", json!({"agentId": billing})),
            node("general", "scenario-agent", json!({"agentId": general})),
            node(
                "done",
                "scenario-end",
                json!({"output": {"answer": "{{billing.output.result}}", "route": "{{route.label}}"}}),
            ),
        ],
        vec![
            edge("start", "classify"),
            edge("classify", "route"),
            branch_edge("route", "billing", 0),
            branch_edge("route", "general", 1),
            edge("billing", "done"),
        ],
    );
    let scenario_id = scenario(&store, "support", g).await;
    (store, engine, scenario_id)
}

#[tokio::test]
async fn test_decision_routes_to_matching_branch() {
    let (_store, engine, scenario_id) = routing_fixture("billing").await;

    let result = engine
        .execute_scenario(ScenarioExecutionRequest::new(
            &scenario_id,
            json!({"message": "where is my invoice"}),
        ))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(
        result.output,
        json!({"answer": "Your invoice is attached", "route": "billing"})
    );
    assert_eq!(result.results["route"]["branchIndex"], json!(0));
    assert!(!result.results.contains_key("general"));

    let nodes: Vec<&str> = result
        .agent_executions
        .iter()
        .map(|a| a.node_id.as_str())
        .collect();
    assert_eq!(nodes, vec!["classify", "billing"]);
    assert!(result
        .agent_executions
        .iter()
        .all(|a| a.status == ExecutionStatus::Completed));

    let (execution, agents) = scenario_record(engine.get_execution(&result.execution_id).await.unwrap());
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output, Some(result.output.clone()));
    assert_eq!(execution.definition_version_id, result.scenario_version_id);
    assert_eq!(agents.len(), 2);
    assert!(agents
        .iter()
        .all(|a| a.scenario_execution_id.as_deref() == Some(result.execution_id.as_str())));
    assert_eq!(agents[0].orchestration_node_id.as_deref(), Some("classify"));
    assert_eq!(agents[0].input, json!({"message": "where is my invoice"}));
}

#[tokio::test]
async fn test_default_branch_without_end_node_returns_context() {
    let (_store, engine, scenario_id) = routing_fixture("other").await;
    let mut events = engine.subscribe();

    let result = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({"message": "hello"})))
        .await
        .unwrap();

    assert_eq!(result.results["route"]["branchIndex"], json!(1));
    assert!(result.results.contains_key("general"));
    assert!(!result.results.contains_key("billing"));
    assert!(!result.results.contains_key("done"));
    // No end node ran: the payload is the accumulated context.
    assert_eq!(result.output, result.final_context);
    assert_eq!(result.output["general"]["output"]["result"], json!("Happy to help"));

    let mut selected = None;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::BranchSelected {
            branch_index,
            label,
            ..
        } = event
        {
            selected = Some((branch_index, label));
        }
    }
    assert_eq!(selected, Some((Some(1), Some("general".to_string()))));
}

#[tokio::test]
async fn test_no_matching_branch_releases_nothing() {
    let store = memory_store();
    let engine = build(&store, MockLlmProvider::new(), FlowConfig::default());
    let follow_up = agent(&store, "follow-up", "p", "hi").await;

    let g = graph(
        vec![
            node("start", "scenario-trigger", json!({})),
            node(
                "route",
                "scenario-decision",
                json!({"branches": [{"condition": "{{input.score}} > 10"}]}),
            ),
            node("next", "scenario-agent", json!({"agentId": follow_up})),
        ],
        vec![
            edge("start", "route"),
            branch_edge("route", "next", 0),
            edge("route", "next"),
        ],
    );
    let scenario_id = scenario(&store, "gate", g).await;

    let result = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({"score": 3})))
        .await
        .unwrap();
    assert_eq!(result.results["route"]["branchIndex"], Value::Null);
    assert!(!result.results.contains_key("next"));
    assert!(result.agent_executions.is_empty());
}

async fn fan_out_fixture(join_policy: Option<&str>, config: FlowConfig) -> (Engine, String) {
    let store = memory_store();
    let llm = MockLlmProvider::new()
        .with_reply("fast", "done")
        .with_failure("down");
    let engine = build(&store, llm, config);

    let healthy = agent(&store, "healthy", "fast", "{{input.q}}").await;
    let broken = agent(&store, "broken", "down", "{{input.q}}").await;

    let mut fan_config = json!({
        "agents": [
            {"agentId": healthy, "input": {"q": "{{input.q}}"}},
            {"agentId": broken}
        ]
    });
    if let Some(policy) = join_policy {
        fan_config["joinPolicy"] = json!(policy);
    }
    let g = graph(
        vec![
            node("start", "scenario-trigger", json!({})),
            node("fanout", "scenario-parallel", fan_config),
            node("done", "scenario-end", json!({"output": {"ok": "{{fanout.succeeded}}"}})),
        ],
        vec![edge("start", "fanout"), edge("fanout", "done")],
    );
    let scenario_id = scenario(&store, "fan", g).await;
    (engine, scenario_id)
}

#[tokio::test]
async fn test_parallel_settle_all_records_each_outcome() {
    let (engine, scenario_id) = fan_out_fixture(None, FlowConfig::default()).await;

    let result = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({"q": "status?"})))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    let fanout = &result.results["fanout"];
    assert_eq!(fanout["succeeded"], json!(1));
    assert_eq!(fanout["failed"], json!(1));
    assert_eq!(fanout["results"][0]["status"], json!("completed"));
    assert_eq!(fanout["results"][0]["output"]["result"], json!("done"));
    assert_eq!(fanout["results"][1]["status"], json!("failed"));
    assert!(fanout["results"][1]["executionId"].is_string());
    assert_eq!(result.output, json!({"ok": "1"}));

    let statuses: Vec<ExecutionStatus> = result
        .agent_executions
        .iter()
        .map(|a| a.status)
        .collect();
    assert_eq!(statuses, vec![ExecutionStatus::Completed, ExecutionStatus::Failed]);
    assert!(result.agent_executions[1].error.is_some());
    assert!(result.agent_executions.iter().all(|a| a.node_id == "fanout"));
}

#[tokio::test]
async fn test_parallel_all_or_nothing_fails_scenario() {
    let (engine, scenario_id) =
        fan_out_fixture(Some("all-or-nothing"), FlowConfig::default()).await;

    let err = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({"q": "status?"})))
        .await
        .unwrap_err();
    let execution_id = match err {
        FlowError::ScenarioFailed {
            execution_id,
            message,
        } => {
            assert!(message.contains("Parallel node fanout failed: 1 of 2"));
            execution_id
        }
        other => panic!("unexpected error: {:?}", other),
    };

    let (execution, agents) = scenario_record(engine.get_execution(&execution_id).await.unwrap());
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.output.is_none());
    // The sibling that finished keeps its completed record.
    let mut statuses: Vec<ExecutionStatus> = agents.iter().map(|a| a.status).collect();
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![ExecutionStatus::Completed, ExecutionStatus::Failed]);
}

#[tokio::test]
async fn test_configured_join_policy_applies_without_override() {
    let mut config = FlowConfig::default();
    config.engine.parallel_join = ParallelJoinPolicy::AllOrNothing;
    let (engine, scenario_id) = fan_out_fixture(None, config).await;

    let err = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({"q": "x"})))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::ScenarioFailed { .. }));

    // A node-level policy still wins over the engine default.
    let mut config = FlowConfig::default();
    config.engine.parallel_join = ParallelJoinPolicy::AllOrNothing;
    let (engine, scenario_id) = fan_out_fixture(Some("settle-all"), config).await;
    let result = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({"q": "x"})))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_failing_agent_fails_scenario() {
    let store = memory_store();
    let engine = build(
        &store,
        MockLlmProvider::new().with_failure("down"),
        FlowConfig::default(),
    );
    let broken = agent(&store, "broken", "down", "hi").await;
    let g = graph(
        vec![
            node("start", "scenario-trigger", json!({})),
            node("call", "scenario-agent", json!({"agentId": broken})),
            node("done", "scenario-end", json!({})),
        ],
        vec![edge("start", "call"), edge("call", "done")],
    );
    let scenario_id = scenario(&store, "fragile", g).await;

    let err = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({})))
        .await
        .unwrap_err();
    let execution_id = match err {
        FlowError::ScenarioFailed { execution_id, .. } => execution_id,
        other => panic!("unexpected error: {:?}", other),
    };

    let (execution, agents) = scenario_record(engine.get_execution(&execution_id).await.unwrap());
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].status, ExecutionStatus::Failed);

    let steps = engine.get_execution_steps(&agents[0].id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].node_id, "reply");
    assert_eq!(steps[1].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_transform_and_first_end_node_wins() {
    let store = memory_store();
    let engine = build(
        &store,
        MockLlmProvider::new().with_reply("p", "42"),
        FlowConfig::default(),
    );
    let answerer = agent(&store, "answerer", "p", "{{input.question}}").await;
    let g = graph(
        vec![
            node("start", "scenario-trigger", json!({})),
            node("ask", "scenario-agent", json!({"agentId": answerer})),
            node(
                "shape",
                "scenario-transform",
                json!({"strategy": "map", "mapping": {
                    "answer": "ask.output.result",
                    "asked": "input.question",
                    "missing": "nowhere.at.all"
                }}),
            ),
            node(
                "pick",
                "scenario-transform",
                json!({"strategy": "select", "fields": ["shape.answer", "input.user"]}),
            ),
            node("done", "scenario-end", json!({"output": {"reply": "{{shape.answer}}"}})),
            node("late", "scenario-end", json!({"output": {"reply": "ignored"}})),
        ],
        vec![
            edge("start", "ask"),
            edge("ask", "shape"),
            edge("shape", "pick"),
            edge("pick", "done"),
            edge("pick", "late"),
        ],
    );
    let scenario_id = scenario(&store, "shaper", g).await;

    let result = engine
        .execute_scenario(
            ScenarioExecutionRequest::new(
                &scenario_id,
                json!({"question": "meaning of life?", "user": "ada"}),
            )
            .with_conversation("conv-1")
            .with_trigger("api"),
        )
        .await
        .unwrap();

    assert_eq!(
        result.results["shape"],
        json!({"answer": "42", "asked": "meaning of life?"})
    );
    assert_eq!(
        result.results["pick"],
        json!({"shape.answer": "42", "input.user": "ada"})
    );
    assert_eq!(result.output, json!({"reply": "42"}));
    assert_eq!(result.results["late"], json!({"reply": "ignored"}));

    let (execution, _) = scenario_record(engine.get_execution(&result.execution_id).await.unwrap());
    assert_eq!(execution.conversation_id.as_deref(), Some("conv-1"));
    assert_eq!(execution.triggered_by.as_deref(), Some("api"));
    assert_eq!(execution.output, Some(json!({"reply": "42"})));
}

#[tokio::test]
async fn test_scenario_back_edge_visits_each_node_once() {
    let store = memory_store();
    let engine = build(&store, MockLlmProvider::new(), FlowConfig::default());
    let g = graph(
        vec![
            node("start", "scenario-trigger", json!({})),
            node("a", "scenario-transform", json!({})),
            node("b", "scenario-transform", json!({})),
        ],
        vec![edge("start", "a"), edge("a", "b"), edge("b", "a")],
    );
    let scenario_id = scenario(&store, "looped", g).await;

    let result = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({"n": 1})))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.results.len(), 3);
    for id in ["start", "a", "b"] {
        assert!(result.results.contains_key(id), "missing {id}");
    }
    assert_eq!(result.output, result.final_context);
}

#[tokio::test]
async fn test_pinned_agent_version_ignores_newer_activation() {
    let store = memory_store();
    let engine = build(&store, MockLlmProvider::new(), FlowConfig::default());

    let v1 = seed_definition(
        &store,
        DefinitionKind::Agent,
        "announcer",
        linear_agent_graph(vec![node("say", "action", json!({"action": "first"}))]),
    )
    .await
    .unwrap();
    let v2 = engine
        .save_definition(
            &v1.definition_id,
            linear_agent_graph(vec![node("say", "action", json!({"action": "second"}))]),
        )
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let g = graph(
        vec![
            node("start", "scenario-trigger", json!({})),
            node("pinned", "scenario-agent", json!({"agentVersionId": v1.id})),
            node("latest", "scenario-agent", json!({"agentId": v1.definition_id})),
        ],
        vec![edge("start", "pinned"), edge("pinned", "latest")],
    );
    let scenario_id = scenario(&store, "versions", g).await;

    let result = engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({})))
        .await
        .unwrap();
    assert_eq!(result.results["pinned"]["output"]["action"], json!("first"));
    assert_eq!(result.results["latest"]["output"]["action"], json!("second"));
}

#[tokio::test]
async fn test_scenario_lookup_errors() {
    let store = memory_store();
    let engine = build(&store, MockLlmProvider::new(), FlowConfig::default());

    let err = engine
        .execute_scenario(ScenarioExecutionRequest::new("nope", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::DefinitionNotFound(_)));

    let agent_id = agent(&store, "solo", "p", "hi").await;
    let err = engine
        .execute_scenario(ScenarioExecutionRequest::new(&agent_id, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::WrongDefinitionKind { .. }));

    let draft = flowdeck_core::traits::DefinitionStore::create_definition(
        store.as_ref(),
        DefinitionKind::Scenario,
        "unsaved",
        graph(vec![node("start", "scenario-trigger", json!({}))], vec![]),
    )
    .await
    .unwrap();
    let err = engine
        .execute_scenario(ScenarioExecutionRequest::new(&draft.id, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NoActiveVersion(_)));
}

#[tokio::test]
async fn test_logger_writes_scenario_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store();
    let mut config = FlowConfig::default();
    config.log = Some(LogConfig {
        enabled: true,
        log_dir: dir.path().display().to_string(),
        level: 3,
    });
    let engine = build(&store, MockLlmProvider::new(), config);
    let solo = agent(&store, "solo", "p", "hi").await;
    let scenario_id = scenario(
        &store,
        "logged",
        graph(
            vec![
                node("start", "scenario-trigger", json!({})),
                node("call", "scenario-agent", json!({"agentId": solo})),
            ],
            vec![edge("start", "call")],
        ),
    )
    .await;

    let handle = engine.spawn_logger(CancellationToken::new()).unwrap();
    engine
        .execute_scenario(ScenarioExecutionRequest::new(&scenario_id, json!({})))
        .await
        .unwrap();
    drop(engine);
    handle.await.unwrap();

    let path = std::fs::read_dir(dir.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let text = std::fs::read_to_string(path).unwrap();
    let kinds: Vec<String> = text
        .lines()
        .map(|l| {
            let v: Value = serde_json::from_str(l).unwrap();
            v["event_type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("scenario_started"));
    assert_eq!(kinds.last().map(String::as_str), Some("scenario_finished"));
    assert!(kinds.iter().any(|k| k == "step_finished"));
}

#[tokio::test]
async fn test_logger_disabled_without_log_section() {
    let store = memory_store();
    let engine = build(&store, MockLlmProvider::new(), FlowConfig::default());
    assert!(engine.spawn_logger(CancellationToken::new()).is_none());
}
