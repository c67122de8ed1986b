use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use flowdeck_core::config::ParallelJoinPolicy;
use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::event::EventBus;
use flowdeck_core::traits::{DefinitionStore, ExecutionStore};
use flowdeck_core::types::{
    new_id, AgentExecutionSummary, Completion, DefinitionKind, ExecutionEvent, ExecutionRecord,
    ExecutionStatus, ScenarioExecution,
};

use crate::agent::{panic_message, AgentEngine, AgentExecutionRequest, AgentExecutionResult};
use crate::cache::GraphCache;
use crate::graph::node::{AgentCall, AgentTarget, EndStep, ParallelStep, TransformStrategy};
use crate::graph::{
    lookup_path, resolve_deep, select_branch, Branch, CompiledGraph, CompiledNode,
    ExecutionContext, ScenarioNode,
};

/// A request to run a Scenario's active version.
#[derive(Debug, Clone)]
pub struct ScenarioExecutionRequest {
    pub scenario_id: String,
    pub input: Value,
    pub conversation_id: Option<String>,
    /// Free-form trigger source: `chat`, `api`, `webhook`, `schedule`, ...
    pub triggered_by: Option<String>,
}

impl ScenarioExecutionRequest {
    pub fn new(scenario_id: impl Into<String>, input: Value) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            input,
            conversation_id: None,
            triggered_by: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_trigger(mut self, triggered_by: impl Into<String>) -> Self {
        self.triggered_by = Some(triggered_by.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioExecutionResult {
    pub execution_id: String,
    pub scenario_id: String,
    pub scenario_version_id: String,
    /// `completed`, or `cancelled` if the record was cancelled mid-run.
    pub status: ExecutionStatus,
    /// The end node's resolved output, or the final context without one.
    pub output: Value,
    pub results: Map<String, Value>,
    pub final_context: Value,
    pub agent_executions: Vec<AgentExecutionSummary>,
    pub duration_ms: u64,
}

/// Which successors a node releases.
#[derive(Debug, Clone, Copy)]
enum Next {
    All,
    /// Only edges tagged with this branch index; nothing when `None`.
    Branch(Option<usize>),
}

struct ScenarioRun {
    context: ExecutionContext,
    results: Map<String, Value>,
    agents: Vec<AgentExecutionSummary>,
    payload: Option<Value>,
}

/// Executes Scenario graphs, delegating `scenario-agent` and
/// `scenario-parallel` work to the agent engine.
pub struct ScenarioEngine {
    definitions: Arc<dyn DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    agents: Arc<AgentEngine>,
    cache: Arc<GraphCache<ScenarioNode>>,
    events: Arc<EventBus>,
    default_join: ParallelJoinPolicy,
}

impl ScenarioEngine {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        agents: Arc<AgentEngine>,
        cache: Arc<GraphCache<ScenarioNode>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            definitions,
            executions,
            agents,
            cache,
            events,
            default_join: ParallelJoinPolicy::default(),
        }
    }

    /// Join policy for parallel nodes that don't set `joinPolicy`.
    pub fn with_default_join(mut self, policy: ParallelJoinPolicy) -> Self {
        self.default_join = policy;
        self
    }

    /// Run the newest active version of a Scenario.
    ///
    /// Any node failure aborts the run; the record is marked failed and
    /// `ScenarioFailed` is returned. The record is finalized exactly once.
    pub async fn execute_scenario(
        &self,
        request: ScenarioExecutionRequest,
    ) -> Result<ScenarioExecutionResult> {
        let definition = self
            .definitions
            .get_definition(&request.scenario_id)
            .await?
            .ok_or_else(|| FlowError::DefinitionNotFound(request.scenario_id.clone()))?;
        if definition.kind != DefinitionKind::Scenario {
            return Err(FlowError::WrongDefinitionKind {
                definition_id: definition.id,
                expected: DefinitionKind::Scenario.to_string(),
                actual: definition.kind.to_string(),
            });
        }
        let version = self
            .definitions
            .active_version(&request.scenario_id)
            .await?
            .ok_or_else(|| FlowError::NoActiveVersion(request.scenario_id.clone()))?;
        let graph = self.cache.get_or_compile(&version)?;

        let execution = ScenarioExecution {
            id: new_id(),
            scenario_id: request.scenario_id.clone(),
            definition_version_id: version.id.clone(),
            status: ExecutionStatus::Running,
            input: request.input.clone(),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            conversation_id: request.conversation_id.clone(),
            triggered_by: request.triggered_by.clone(),
        };
        self.executions.create_scenario_execution(&execution).await?;
        self.events.publish(ExecutionEvent::ScenarioStarted {
            execution_id: execution.id.clone(),
            scenario_id: execution.scenario_id.clone(),
            version_id: version.id.clone(),
        });
        info!(
            execution_id = %execution.id,
            scenario_id = %execution.scenario_id,
            version_id = %version.id,
            triggered_by = execution.triggered_by.as_deref().unwrap_or("unknown"),
            "Scenario execution started"
        );

        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.traverse(&execution.id, &graph, request.input))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FlowError::Panicked(panic_message(panic.as_ref()))));
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(run) => {
                let output = run.payload.unwrap_or_else(|| run.context.snapshot());
                let applied = self
                    .executions
                    .complete_scenario_execution(
                        &execution.id,
                        Completion::completed(output.clone(), duration_ms),
                    )
                    .await?;
                let status = if applied {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Cancelled
                };
                self.events.publish(ExecutionEvent::ScenarioFinished {
                    execution_id: execution.id.clone(),
                    status,
                    duration_ms,
                    error: None,
                });
                info!(
                    execution_id = %execution.id,
                    status = %status,
                    agents = run.agents.len(),
                    duration_ms,
                    "Scenario execution finished"
                );

                Ok(ScenarioExecutionResult {
                    execution_id: execution.id,
                    scenario_id: execution.scenario_id,
                    scenario_version_id: version.id.clone(),
                    status,
                    output,
                    results: run.results,
                    final_context: run.context.into_value(),
                    agent_executions: run.agents,
                    duration_ms,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.executions
                    .complete_scenario_execution(
                        &execution.id,
                        Completion::failed(message.clone(), duration_ms),
                    )
                    .await?;
                self.events.publish(ExecutionEvent::ScenarioFinished {
                    execution_id: execution.id.clone(),
                    status: ExecutionStatus::Failed,
                    duration_ms,
                    error: Some(message.clone()),
                });
                error!(execution_id = %execution.id, error = %message, "Scenario execution failed");

                Err(FlowError::ScenarioFailed {
                    execution_id: execution.id,
                    message,
                })
            }
        }
    }

    async fn traverse(
        &self,
        execution_id: &str,
        graph: &CompiledGraph<ScenarioNode>,
        input: Value,
    ) -> Result<ScenarioRun> {
        let mut run = ScenarioRun {
            context: ExecutionContext::new(input),
            results: Map::new(),
            agents: Vec::new(),
            payload: None,
        };
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(graph.entry_node_id().to_string());

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id.clone()) {
                continue;
            }
            let node = graph.node(&node_id).ok_or_else(|| FlowError::StepFailed {
                node_id: node_id.clone(),
                message: "node missing from compiled graph".to_string(),
            })?;
            debug!(execution_id, node_id = %node.id, node_type = %node.node_type, "Scenario node");

            let (output, next) = self.run_node(execution_id, node, &mut run).await?;
            run.context.insert(node.id.clone(), output.clone());
            run.results.insert(node.id.clone(), output);

            for successor in graph.successors(&node.id) {
                let released = match next {
                    Next::All => true,
                    Next::Branch(selected) => {
                        selected.is_some() && successor.branch_index == selected
                    }
                };
                if released && !visited.contains(&successor.target) {
                    queue.push_back(successor.target.clone());
                }
            }
        }

        Ok(run)
    }

    async fn run_node(
        &self,
        execution_id: &str,
        node: &CompiledNode<ScenarioNode>,
        run: &mut ScenarioRun,
    ) -> Result<(Value, Next)> {
        match &node.kind {
            ScenarioNode::Trigger => Ok((
                json!({ "triggered": true, "input": run.context.input() }),
                Next::All,
            )),
            ScenarioNode::Agent(call) => {
                let outcome = self
                    .run_agent(execution_id, &node.id, call, &run.context)
                    .await;
                if let Some(summary) = self.summarize(&outcome, &node.id).await? {
                    run.agents.push(summary);
                }
                let result = outcome?;
                Ok((
                    json!({
                        "executionId": result.execution_id,
                        "output": result.output,
                        "results": result.results,
                    }),
                    Next::All,
                ))
            }
            ScenarioNode::Decision(branches) => {
                let selected = self.decide(execution_id, node, branches, &run.context);
                let output = match selected {
                    Some((index, branch)) => json!({
                        "branchIndex": index,
                        "label": branch.label,
                        "condition": branch.condition,
                    }),
                    None => json!({ "branchIndex": null }),
                };
                Ok((output, Next::Branch(selected.map(|(index, _)| index))))
            }
            ScenarioNode::Parallel(step) => {
                let output = self.run_parallel(execution_id, node, step, run).await?;
                Ok((output, Next::All))
            }
            ScenarioNode::Transform(strategy) => {
                Ok((transform(strategy, &run.context), Next::All))
            }
            ScenarioNode::End(end) => {
                let output = end_output(end, &run.context);
                if run.payload.is_none() {
                    run.payload = Some(output.clone());
                } else {
                    warn!(execution_id, node_id = %node.id, "Scenario already ended, payload kept");
                }
                Ok((output, Next::All))
            }
        }
    }

    fn decide<'a>(
        &self,
        execution_id: &str,
        node: &CompiledNode<ScenarioNode>,
        branches: &'a [Branch],
        context: &ExecutionContext,
    ) -> Option<(usize, &'a Branch)> {
        let selected = select_branch(branches, context.as_value());
        match selected {
            Some((index, branch)) => debug!(
                execution_id,
                node_id = %node.id,
                branch_index = index,
                label = branch.label.as_deref().unwrap_or(""),
                "Branch selected"
            ),
            None => warn!(execution_id, node_id = %node.id, "No branch matched"),
        }
        self.events.publish(ExecutionEvent::BranchSelected {
            scenario_execution_id: execution_id.to_string(),
            node_id: node.id.clone(),
            branch_index: selected.map(|(index, _)| index),
            label: selected.and_then(|(_, branch)| branch.label.clone()),
        });
        selected
    }

    async fn run_parallel(
        &self,
        execution_id: &str,
        node: &CompiledNode<ScenarioNode>,
        step: &ParallelStep,
        run: &mut ScenarioRun,
    ) -> Result<Value> {
        let policy = step.join_policy.unwrap_or(self.default_join);
        let context = &run.context;
        let outcomes = join_all(
            step.agents
                .iter()
                .map(|call| self.run_agent(execution_id, &node.id, call, context)),
        )
        .await;

        let total = outcomes.len();
        let mut entries = Vec::with_capacity(total);
        let mut summaries = Vec::new();
        let mut succeeded = 0;
        let mut failed = 0;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            if let Some(summary) = self.summarize(&outcome, &node.id).await? {
                summaries.push(summary);
            }
            match outcome {
                Ok(result) => {
                    succeeded += 1;
                    entries.push(json!({
                        "index": index,
                        "status": "completed",
                        "executionId": result.execution_id,
                        "output": result.output,
                    }));
                }
                Err(e) => {
                    failed += 1;
                    let execution_id = match &e {
                        FlowError::AgentFailed { execution_id, .. } => Some(execution_id.clone()),
                        _ => None,
                    };
                    entries.push(json!({
                        "index": index,
                        "status": "failed",
                        "executionId": execution_id,
                        "error": e.to_string(),
                    }));
                }
            }
        }
        run.agents.extend(summaries);

        self.events.publish(ExecutionEvent::ParallelJoined {
            scenario_execution_id: execution_id.to_string(),
            node_id: node.id.clone(),
            succeeded,
            failed,
        });
        info!(
            execution_id,
            node_id = %node.id,
            succeeded,
            failed,
            policy = ?policy,
            "Parallel branches joined"
        );

        if failed > 0 && policy == ParallelJoinPolicy::AllOrNothing {
            return Err(FlowError::ParallelFailed {
                node_id: node.id.clone(),
                failed,
                total,
            });
        }

        Ok(json!({
            "results": entries,
            "succeeded": succeeded,
            "failed": failed,
        }))
    }

    async fn run_agent(
        &self,
        execution_id: &str,
        node_id: &str,
        call: &AgentCall,
        context: &ExecutionContext,
    ) -> Result<AgentExecutionResult> {
        let input = match &call.input {
            Some(template) => resolve_deep(template, context.as_value()),
            None => context.input().clone(),
        };
        let version_id = match &call.target {
            AgentTarget::Active(agent_id) => self.agents.resolve_active_version(agent_id).await?.id,
            AgentTarget::Pinned(version_id) => version_id.clone(),
        };

        self.agents
            .execute_agent(AgentExecutionRequest::new(version_id, input).with_parent(execution_id, node_id))
            .await
    }

    /// Summary line for an agent run that produced a record. Runs that failed
    /// before a record existed have none.
    async fn summarize(
        &self,
        outcome: &Result<AgentExecutionResult>,
        node_id: &str,
    ) -> Result<Option<AgentExecutionSummary>> {
        let agent_execution_id = match outcome {
            Ok(result) => &result.execution_id,
            Err(FlowError::AgentFailed { execution_id, .. }) => execution_id,
            Err(_) => return Ok(None),
        };

        match self.executions.get_execution(agent_execution_id).await? {
            Some(ExecutionRecord::Agent(record)) => Ok(Some(AgentExecutionSummary {
                execution_id: record.id,
                agent_id: record.agent_id,
                node_id: node_id.to_string(),
                status: record.status,
                duration_ms: record.duration_ms.unwrap_or_default(),
                error: record.error,
            })),
            _ => Err(FlowError::ExecutionNotFound(agent_execution_id.clone())),
        }
    }
}

fn transform(strategy: &TransformStrategy, context: &ExecutionContext) -> Value {
    let root = context.as_value();
    match strategy {
        TransformStrategy::Select(fields) => {
            let mut selected = Map::new();
            for field in fields {
                if let Some(value) = lookup_path(root, field) {
                    selected.insert(field.clone(), value.clone());
                }
            }
            Value::Object(selected)
        }
        TransformStrategy::Map(pairs) => {
            let mut mapped = Map::new();
            for (key, path) in pairs {
                if let Some(value) = lookup_path(root, path) {
                    mapped.insert(key.clone(), value.clone());
                }
            }
            Value::Object(mapped)
        }
        TransformStrategy::PassThrough => context.snapshot(),
    }
}

fn end_output(end: &EndStep, context: &ExecutionContext) -> Value {
    match &end.output {
        Some(template) => resolve_deep(template, context.as_value()),
        None => context.snapshot(),
    }
}
