//! Shared test utilities for flowdeck crates: scripted collaborators, graph
//! builders, and an in-memory store factory.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::traits::{DefinitionStore, LlmProvider, ToolExecutor};
use flowdeck_core::types::{
    DefinitionKind, DefinitionVersion, EdgeDefinition, GenerateRequest, GenerateResponse,
    GraphDefinition, NodeDefinition, Role, ToolOutcome, ToolRequest, Usage,
};
use flowdeck_store::SqliteStore;

// ── LLM ─────────────────────────────────────────────────────────

/// Scripted LLM provider.
///
/// Providers without a scripted reply echo the last user message back as
/// `echo: <content>`. Every request is recorded for later inspection.
#[derive(Default)]
pub struct MockLlmProvider {
    replies: HashMap<String, String>,
    failing: HashSet<String>,
    latency: Option<Duration>,
    calls: Mutex<Vec<(String, GenerateRequest)>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `text` for `provider_id`.
    pub fn with_reply(mut self, provider_id: &str, text: &str) -> Self {
        self.replies.insert(provider_id.to_string(), text.to_string());
        self
    }

    /// Make every call to `provider_id` fail.
    pub fn with_failure(mut self, provider_id: &str) -> Self {
        self.failing.insert(provider_id.to_string());
        self
    }

    /// Sleep before answering (use with paused tokio time).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<(String, GenerateRequest)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

impl LlmProvider for MockLlmProvider {
    fn generate(
        &self,
        provider_id: &str,
        request: GenerateRequest,
    ) -> BoxFuture<'_, Result<GenerateResponse>> {
        let provider_id = provider_id.to_string();

        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((provider_id.clone(), request.clone()));
            }
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            if self.failing.contains(&provider_id) {
                return Err(FlowError::LlmRequest(format!(
                    "provider {} unavailable",
                    provider_id
                )));
            }

            let text = match self.replies.get(&provider_id) {
                Some(reply) => reply.clone(),
                None => {
                    let last_user = request
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::User)
                        .map(|m| m.content.as_str())
                        .unwrap_or_default();
                    format!("echo: {}", last_user)
                }
            };

            Ok(GenerateResponse {
                text,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        })
    }
}

// ── Tools ───────────────────────────────────────────────────────

/// Scripted tool executor. Unregistered tools are `ToolNotFound`.
#[derive(Default)]
pub struct MockToolExecutor {
    outcomes: HashMap<String, ToolOutcome>,
    calls: Mutex<Vec<(String, ToolRequest)>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, tool_id: &str, output: Value) -> Self {
        self.outcomes
            .insert(tool_id.to_string(), ToolOutcome::success(output));
        self
    }

    /// Register a tool that reports `success: false`.
    pub fn with_failure(mut self, tool_id: &str, message: &str) -> Self {
        self.outcomes
            .insert(tool_id.to_string(), ToolOutcome::error(message));
        self
    }

    pub fn calls(&self) -> Vec<(String, ToolRequest)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ToolExecutor for MockToolExecutor {
    fn execute_tool(
        &self,
        tool_id: &str,
        request: ToolRequest,
    ) -> BoxFuture<'_, Result<ToolOutcome>> {
        let tool_id = tool_id.to_string();

        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((tool_id.clone(), request));
            }
            self.outcomes
                .get(&tool_id)
                .cloned()
                .ok_or(FlowError::ToolNotFound(tool_id))
        })
    }
}

// ── Graph builders ──────────────────────────────────────────────

pub fn node(id: &str, node_type: &str, config: Value) -> NodeDefinition {
    NodeDefinition::new(id, node_type)
        .with_label(id)
        .with_config(config)
}

pub fn edge(source: &str, target: &str) -> EdgeDefinition {
    EdgeDefinition::new(source, target)
}

pub fn branch_edge(source: &str, target: &str, branch_index: usize) -> EdgeDefinition {
    EdgeDefinition::new(source, target).with_branch(branch_index)
}

pub fn graph(nodes: Vec<NodeDefinition>, edges: Vec<EdgeDefinition>) -> GraphDefinition {
    GraphDefinition { nodes, edges }
}

/// An LLM step answered by `provider_id`, prompting with `prompt`.
pub fn llm_node(id: &str, provider_id: &str, prompt: &str) -> NodeDefinition {
    node(
        id,
        "agent",
        json!({ "providerId": provider_id, "prompt": prompt }),
    )
}

/// `trigger` followed by `steps`, chained in order.
pub fn linear_agent_graph(steps: Vec<NodeDefinition>) -> GraphDefinition {
    let mut nodes = vec![node("trigger", "trigger", json!({}))];
    let mut edges = Vec::new();
    let mut previous = "trigger".to_string();
    for step in steps {
        edges.push(edge(&previous, &step.id));
        previous = step.id.clone();
        nodes.push(step);
    }
    graph(nodes, edges)
}

// ── Store ───────────────────────────────────────────────────────

/// Fresh in-memory SQLite store.
pub fn memory_store() -> Arc<SqliteStore> {
    match SqliteStore::in_memory() {
        Ok(store) => Arc::new(store),
        Err(e) => panic!("in-memory store: {}", e),
    }
}

/// Create a definition and save its draft as the active version 1.
pub async fn seed_definition(
    store: &SqliteStore,
    kind: DefinitionKind,
    name: &str,
    graph: GraphDefinition,
) -> Result<DefinitionVersion> {
    let definition = store.create_definition(kind, name, graph).await?;
    let saved = store.save_version(&definition.id).await?;
    Ok(saved.version)
}
