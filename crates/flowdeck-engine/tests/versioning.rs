use std::sync::Arc;

use serde_json::json;

use flowdeck_core::config::FlowConfig;
use flowdeck_core::traits::DefinitionStore;
use flowdeck_core::types::DefinitionKind;
use flowdeck_core::FlowError;
use flowdeck_engine::Engine;
use flowdeck_test_utils::{
    linear_agent_graph, memory_store, node, seed_definition, MockLlmProvider, MockToolExecutor,
};

fn action_graph(action: &str) -> flowdeck_core::types::GraphDefinition {
    linear_agent_graph(vec![node("act", "action", json!({"action": action}))])
}

#[tokio::test]
async fn test_save_and_rollback_switch_running_version() {
    let store = memory_store();
    let engine = Engine::with_store(
        store.clone(),
        Arc::new(MockLlmProvider::new()),
        Arc::new(MockToolExecutor::new()),
        FlowConfig::default(),
    );

    let v1 = seed_definition(&store, DefinitionKind::Agent, "greeter", action_graph("v1"))
        .await
        .unwrap();
    let agent_id = v1.definition_id.clone();

    let first = engine.execute_active_agent(&agent_id, json!({})).await.unwrap();
    assert_eq!(first.output["action"], json!("v1"));

    let v2 = engine
        .save_definition(&agent_id, action_graph("v2"))
        .await
        .unwrap();
    let v3 = engine
        .save_definition(&agent_id, action_graph("v3"))
        .await
        .unwrap();
    assert_eq!((v2.version, v3.version), (2, 3));

    let versions = store.list_versions(&agent_id).await.unwrap();
    assert_eq!(versions.len(), 3);
    let active: Vec<u32> = versions
        .iter()
        .filter(|v| v.is_active)
        .map(|v| v.version)
        .collect();
    assert_eq!(active, vec![3]);

    let latest = engine.execute_active_agent(&agent_id, json!({})).await.unwrap();
    assert_eq!(latest.agent_version_id, v3.id);
    assert_eq!(latest.output["action"], json!("v3"));

    let rolled_back = engine.activate_version(&v1.id).await.unwrap();
    assert!(rolled_back.is_active);
    let again = engine.execute_active_agent(&agent_id, json!({})).await.unwrap();
    assert_eq!(again.agent_version_id, v1.id);
    assert_eq!(again.output["action"], json!("v1"));

    // Saved versions are immutable; the old run still reads its own graph.
    let stored_v1 = store.get_version(&v1.id).await.unwrap().unwrap();
    assert_eq!(stored_v1.graph, v1.graph);
}

#[tokio::test]
async fn test_clear_cache_keeps_runs_working() {
    let store = memory_store();
    let engine = Engine::with_store(
        store.clone(),
        Arc::new(MockLlmProvider::new()),
        Arc::new(MockToolExecutor::new()),
        FlowConfig::default(),
    );
    let v1 = seed_definition(&store, DefinitionKind::Agent, "cached", action_graph("once"))
        .await
        .unwrap();

    engine.execute_active_agent(&v1.definition_id, json!({})).await.unwrap();
    engine.clear_cache(Some(&v1.id));
    engine.execute_active_agent(&v1.definition_id, json!({})).await.unwrap();
    engine.clear_cache(None);
    let result = engine
        .execute_active_agent(&v1.definition_id, json!({}))
        .await
        .unwrap();
    assert_eq!(result.output["action"], json!("once"));
}

#[tokio::test]
async fn test_unknown_definition_and_version() {
    let store = memory_store();
    let engine = Engine::with_store(
        store,
        Arc::new(MockLlmProvider::new()),
        Arc::new(MockToolExecutor::new()),
        FlowConfig::default(),
    );

    let err = engine
        .save_definition("missing", action_graph("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::DefinitionNotFound(_)));

    let err = engine.activate_version("missing").await.unwrap_err();
    assert!(matches!(err, FlowError::VersionNotFound(_)));

    let err = engine
        .execute_active_agent("missing", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::DefinitionNotFound(_)));

    let err = engine.get_execution("missing").await.unwrap_err();
    assert!(matches!(err, FlowError::ExecutionNotFound(_)));
}

#[tokio::test]
async fn test_zero_event_capacity_engine_still_runs() {
    let store = memory_store();
    let mut config = FlowConfig::default();
    config.engine.event_capacity = 0;
    let engine = Engine::with_store(
        store.clone(),
        Arc::new(MockLlmProvider::new()),
        Arc::new(MockToolExecutor::new()),
        config,
    );
    let v1 = seed_definition(&store, DefinitionKind::Agent, "tiny-bus", action_graph("ok"))
        .await
        .unwrap();

    let result = engine
        .execute_active_agent(&v1.definition_id, json!({}))
        .await
        .unwrap();
    assert_eq!(result.output["action"], json!("ok"));
}
