use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::event::EventBus;
use flowdeck_core::traits::{DefinitionStore, ExecutionStore};
use flowdeck_core::types::{
    new_id, AgentExecution, Completion, DefinitionKind, DefinitionVersion, ExecutionEvent,
    ExecutionStatus, StepExecution,
};

use crate::cache::GraphCache;
use crate::graph::{CompiledGraph, CompiledNode, ExecutionContext, StepNode};
use crate::step::StepExecutor;

/// What to run: a specific Agent version, optionally as part of a scenario.
#[derive(Debug, Clone)]
pub struct AgentExecutionRequest {
    pub agent_version_id: String,
    pub input: Value,
    pub parent_scenario_execution_id: Option<String>,
    pub orchestration_node_id: Option<String>,
}

impl AgentExecutionRequest {
    pub fn new(agent_version_id: impl Into<String>, input: Value) -> Self {
        Self {
            agent_version_id: agent_version_id.into(),
            input,
            parent_scenario_execution_id: None,
            orchestration_node_id: None,
        }
    }

    /// Attach the run to the scenario execution and node that launched it.
    pub fn with_parent(
        mut self,
        scenario_execution_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        self.parent_scenario_execution_id = Some(scenario_execution_id.into());
        self.orchestration_node_id = Some(node_id.into());
        self
    }
}

/// Outcome of a successful Agent run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecutionResult {
    pub execution_id: String,
    pub agent_id: String,
    pub agent_version_id: String,
    /// `completed`, or `cancelled` if the record was cancelled mid-run.
    pub status: ExecutionStatus,
    /// Output of every executed node, keyed by node id.
    pub results: Map<String, Value>,
    pub final_context: Value,
    /// Output of the last executed step.
    pub output: Value,
    pub duration_ms: u64,
}

struct Traversal {
    results: Map<String, Value>,
    context: ExecutionContext,
    output: Value,
}

/// Executes Agent graphs step by step and records the audit trail.
pub struct AgentEngine {
    definitions: Arc<dyn DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    steps: StepExecutor,
    cache: Arc<GraphCache<StepNode>>,
    events: Arc<EventBus>,
    recover_missing_active_version: bool,
}

impl AgentEngine {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        steps: StepExecutor,
        cache: Arc<GraphCache<StepNode>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            definitions,
            executions,
            steps,
            cache,
            events,
            recover_missing_active_version: false,
        }
    }

    /// Create a version from the draft when an Agent has no active version.
    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recover_missing_active_version = enabled;
        self
    }

    /// Newest active version of `agent_id`.
    ///
    /// Without an active version this is `NoActiveVersion`, unless recovery
    /// is enabled, in which case the current draft is saved as a new version.
    pub async fn resolve_active_version(&self, agent_id: &str) -> Result<DefinitionVersion> {
        if let Some(version) = self.definitions.active_version(agent_id).await? {
            return Ok(version);
        }

        let definition = self
            .definitions
            .get_definition(agent_id)
            .await?
            .ok_or_else(|| FlowError::DefinitionNotFound(agent_id.to_string()))?;
        if definition.kind != DefinitionKind::Agent {
            return Err(FlowError::WrongDefinitionKind {
                definition_id: agent_id.to_string(),
                expected: DefinitionKind::Agent.to_string(),
                actual: definition.kind.to_string(),
            });
        }

        if !self.recover_missing_active_version {
            error!(agent_id, "Agent has no active version");
            return Err(FlowError::NoActiveVersion(agent_id.to_string()));
        }

        let saved = self.definitions.save_version(agent_id).await?;
        for stale in &saved.deactivated {
            self.cache.invalidate(stale);
        }
        warn!(
            agent_id,
            version_id = %saved.version.id,
            version = saved.version.version,
            "Agent had no active version, created recovery version from draft"
        );
        self.events.publish(ExecutionEvent::RecoveryVersionCreated {
            definition_id: agent_id.to_string(),
            version_id: saved.version.id.clone(),
        });
        Ok(saved.version)
    }

    /// Run the newest active version of `agent_id` standalone.
    pub async fn execute_active_agent(
        &self,
        agent_id: &str,
        input: Value,
    ) -> Result<AgentExecutionResult> {
        let version = self.resolve_active_version(agent_id).await?;
        self.execute_agent(AgentExecutionRequest::new(version.id, input))
            .await
    }

    /// Run one Agent version to completion.
    ///
    /// A step failure aborts the run; the execution record is marked failed
    /// and `AgentFailed` is returned. The record is finalized exactly once.
    pub async fn execute_agent(
        &self,
        request: AgentExecutionRequest,
    ) -> Result<AgentExecutionResult> {
        let version = self
            .definitions
            .get_version(&request.agent_version_id)
            .await?
            .ok_or_else(|| FlowError::VersionNotFound(request.agent_version_id.clone()))?;
        let definition = self
            .definitions
            .get_definition(&version.definition_id)
            .await?
            .ok_or_else(|| FlowError::DefinitionNotFound(version.definition_id.clone()))?;
        if definition.kind != DefinitionKind::Agent {
            return Err(FlowError::WrongDefinitionKind {
                definition_id: definition.id,
                expected: DefinitionKind::Agent.to_string(),
                actual: definition.kind.to_string(),
            });
        }
        let graph = self.cache.get_or_compile(&version)?;

        let execution = AgentExecution {
            id: new_id(),
            scenario_execution_id: request.parent_scenario_execution_id.clone(),
            agent_id: version.definition_id.clone(),
            definition_version_id: version.id.clone(),
            orchestration_node_id: request.orchestration_node_id.clone(),
            status: ExecutionStatus::Running,
            input: request.input.clone(),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        self.executions.create_agent_execution(&execution).await?;
        self.events.publish(ExecutionEvent::AgentStarted {
            execution_id: execution.id.clone(),
            version_id: version.id.clone(),
            scenario_execution_id: execution.scenario_execution_id.clone(),
        });
        info!(
            execution_id = %execution.id,
            agent_id = %execution.agent_id,
            version_id = %version.id,
            "Agent execution started"
        );

        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.traverse(&execution.id, &graph, request.input))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FlowError::Panicked(panic_message(panic.as_ref()))));
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(run) => {
                let applied = self
                    .executions
                    .complete_agent_execution(
                        &execution.id,
                        Completion::completed(run.output.clone(), duration_ms),
                    )
                    .await?;
                let status = if applied {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Cancelled
                };
                self.events.publish(ExecutionEvent::AgentFinished {
                    execution_id: execution.id.clone(),
                    status,
                    duration_ms,
                    error: None,
                });
                info!(
                    execution_id = %execution.id,
                    status = %status,
                    steps = run.results.len(),
                    duration_ms,
                    "Agent execution finished"
                );

                Ok(AgentExecutionResult {
                    execution_id: execution.id,
                    agent_id: execution.agent_id,
                    agent_version_id: version.id.clone(),
                    status,
                    results: run.results,
                    final_context: run.context.into_value(),
                    output: run.output,
                    duration_ms,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.executions
                    .complete_agent_execution(
                        &execution.id,
                        Completion::failed(message.clone(), duration_ms),
                    )
                    .await?;
                self.events.publish(ExecutionEvent::AgentFinished {
                    execution_id: execution.id.clone(),
                    status: ExecutionStatus::Failed,
                    duration_ms,
                    error: Some(message.clone()),
                });
                error!(execution_id = %execution.id, error = %message, "Agent execution failed");

                Err(FlowError::AgentFailed {
                    execution_id: execution.id,
                    message,
                })
            }
        }
    }

    /// Breadth-first walk from the entry node. Each node runs at most once.
    ///
    /// The entry node itself is dequeued first and runs as step 0, so its
    /// output gets a step row plus a `results` and context entry under its
    /// id. Traversal does not start at its successors. A back edge to a
    /// visited node is ignored, which keeps cyclic graphs finite.
    async fn traverse(
        &self,
        execution_id: &str,
        graph: &CompiledGraph<StepNode>,
        input: Value,
    ) -> Result<Traversal> {
        let mut context = ExecutionContext::new(input);
        let mut results = Map::new();
        let mut output = Value::Null;
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut step_index: u32 = 0;

        queue.push_back(graph.entry_node_id().to_string());

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id.clone()) {
                continue;
            }
            let node = graph.node(&node_id).ok_or_else(|| FlowError::StepFailed {
                node_id: node_id.clone(),
                message: "node missing from compiled graph".to_string(),
            })?;

            let node_output = self
                .run_step(execution_id, step_index, node, &context)
                .await?;
            step_index += 1;

            context.insert(node.id.clone(), node_output.clone());
            results.insert(node.id.clone(), node_output.clone());
            output = node_output;

            for successor in graph.successors(&node.id) {
                if !visited.contains(&successor.target) {
                    queue.push_back(successor.target.clone());
                }
            }
        }

        Ok(Traversal {
            results,
            context,
            output,
        })
    }

    async fn run_step(
        &self,
        execution_id: &str,
        step_index: u32,
        node: &CompiledNode<StepNode>,
        context: &ExecutionContext,
    ) -> Result<Value> {
        let step = StepExecution {
            id: new_id(),
            agent_execution_id: execution_id.to_string(),
            step_index,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            status: ExecutionStatus::Running,
            input: context.snapshot(),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        self.executions.create_step_execution(&step).await?;
        self.events.publish(ExecutionEvent::StepStarted {
            agent_execution_id: execution_id.to_string(),
            step_index,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        });

        let start = Instant::now();
        let result = self.steps.execute(node, context).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                self.executions
                    .complete_step_execution(
                        &step.id,
                        Completion::completed(output.clone(), duration_ms),
                    )
                    .await?;
                self.events.publish(ExecutionEvent::StepFinished {
                    agent_execution_id: execution_id.to_string(),
                    step_index,
                    node_id: node.id.clone(),
                    status: ExecutionStatus::Completed,
                    duration_ms,
                    error: None,
                });
                debug!(
                    execution_id,
                    step_index,
                    node_id = %node.id,
                    duration_ms,
                    "Step completed"
                );
                Ok(output)
            }
            Err(e) => {
                let message = e.to_string();
                self.executions
                    .complete_step_execution(&step.id, Completion::failed(message.clone(), duration_ms))
                    .await?;
                self.events.publish(ExecutionEvent::StepFinished {
                    agent_execution_id: execution_id.to_string(),
                    step_index,
                    node_id: node.id.clone(),
                    status: ExecutionStatus::Failed,
                    duration_ms,
                    error: Some(message.clone()),
                });
                warn!(
                    execution_id,
                    step_index,
                    node_id = %node.id,
                    error = %message,
                    "Step failed"
                );
                Err(FlowError::StepFailed {
                    node_id: node.id.clone(),
                    message,
                })
            }
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
