use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flowdeck_core::config::FlowConfig;
use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::event::EventBus;
use flowdeck_core::traits::{DefinitionStore, ExecutionStore, LlmProvider, ToolExecutor};
use flowdeck_core::types::{
    DefinitionVersion, ExecutionEvent, ExecutionRecord, GraphDefinition, SavedVersion,
    StepExecution,
};
use flowdeck_store::SqliteStore;

use crate::agent::{AgentEngine, AgentExecutionRequest, AgentExecutionResult};
use crate::cache::GraphCache;
use crate::graph::{ScenarioNode, StepNode};
use crate::run_log::ExecutionLogger;
use crate::scenario::{ScenarioEngine, ScenarioExecutionRequest, ScenarioExecutionResult};
use crate::step::StepExecutor;

/// Entry point for triggering and inspecting executions.
///
/// Owns one compiled-graph cache per level and keeps them in step with
/// definition saves and activations made through it.
pub struct Engine {
    definitions: Arc<dyn DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    agents: Arc<AgentEngine>,
    scenarios: ScenarioEngine,
    agent_cache: Arc<GraphCache<StepNode>>,
    scenario_cache: Arc<GraphCache<ScenarioNode>>,
    events: Arc<EventBus>,
    config: FlowConfig,
}

impl Engine {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
        config: FlowConfig,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.engine.event_capacity));
        let agent_cache = Arc::new(GraphCache::new());
        let scenario_cache = Arc::new(GraphCache::new());

        let steps = StepExecutor::new(llm, tools).with_default_delay(config.engine.default_delay_ms);
        let agents = Arc::new(
            AgentEngine::new(
                definitions.clone(),
                executions.clone(),
                steps,
                agent_cache.clone(),
                events.clone(),
            )
            .with_recovery(config.engine.recover_missing_active_version),
        );
        let scenarios = ScenarioEngine::new(
            definitions.clone(),
            executions.clone(),
            agents.clone(),
            scenario_cache.clone(),
            events.clone(),
        )
        .with_default_join(config.engine.parallel_join);

        Self {
            definitions,
            executions,
            agents,
            scenarios,
            agent_cache,
            scenario_cache,
            events,
            config,
        }
    }

    /// Build an engine backed by one SQLite store for both definitions and
    /// execution records.
    pub fn with_store(
        store: Arc<SqliteStore>,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
        config: FlowConfig,
    ) -> Self {
        Self::new(store.clone(), store, llm, tools, config)
    }

    /// Open the SQLite database named by `config.storage`.
    pub fn open(
        config: FlowConfig,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.database_path())?);
        Ok(Self::with_store(store, llm, tools, config))
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Start the JSONL execution logger if `[log]` is enabled.
    pub fn spawn_logger(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let log_dir = self.config.log_dir()?;
        let level = self.config.log.as_ref().map(|log| log.level).unwrap_or(1);
        let logger = ExecutionLogger::new(log_dir, level);
        Some(tokio::spawn(logger.run(self.events.subscribe(), cancel)))
    }

    // ── Execution ───────────────────────────────────────────────

    pub async fn execute_scenario(
        &self,
        request: ScenarioExecutionRequest,
    ) -> Result<ScenarioExecutionResult> {
        self.scenarios.execute_scenario(request).await
    }

    pub async fn execute_agent(
        &self,
        request: AgentExecutionRequest,
    ) -> Result<AgentExecutionResult> {
        self.agents.execute_agent(request).await
    }

    /// Run an Agent's newest active version standalone.
    pub async fn execute_active_agent(
        &self,
        agent_id: &str,
        input: Value,
    ) -> Result<AgentExecutionResult> {
        self.agents.execute_active_agent(agent_id, input).await
    }

    /// Look up a Scenario, Agent, or Step record by id.
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| FlowError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Steps of an Agent execution, in step-index order.
    pub async fn get_execution_steps(&self, agent_execution_id: &str) -> Result<Vec<StepExecution>> {
        self.executions.list_steps(agent_execution_id).await
    }

    /// Mark a running record cancelled. The traversal itself is not
    /// interrupted; its later completion is ignored.
    ///
    /// Returns `false` if the record had already finished.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<bool> {
        let cancelled = self.executions.cancel_execution(execution_id).await?;
        if cancelled {
            info!(execution_id, "Execution cancelled");
        } else {
            info!(execution_id, "Execution already finished, cancel ignored");
        }
        Ok(cancelled)
    }

    // ── Definitions & cache ─────────────────────────────────────

    /// Drop one compiled version from both caches, or everything.
    pub fn clear_cache(&self, version_id: Option<&str>) {
        match version_id {
            Some(version_id) => {
                self.agent_cache.invalidate(version_id);
                self.scenario_cache.invalidate(version_id);
            }
            None => {
                self.agent_cache.clear();
                self.scenario_cache.clear();
            }
        }
    }

    /// Replace a definition's draft and publish it as the new active version.
    pub async fn save_definition(
        &self,
        definition_id: &str,
        graph: GraphDefinition,
    ) -> Result<DefinitionVersion> {
        self.definitions.update_draft(definition_id, graph).await?;
        let saved = self.definitions.save_version(definition_id).await?;
        self.evict(&saved);
        info!(
            definition_id,
            version_id = %saved.version.id,
            version = saved.version.version,
            "Definition saved"
        );
        Ok(saved.version)
    }

    /// Make an existing version the active one (rollback or roll-forward).
    pub async fn activate_version(&self, version_id: &str) -> Result<DefinitionVersion> {
        let saved = self.definitions.activate_version(version_id).await?;
        self.evict(&saved);
        info!(
            definition_id = %saved.version.definition_id,
            version_id,
            "Version activated"
        );
        Ok(saved.version)
    }

    fn evict(&self, saved: &SavedVersion) {
        for stale in &saved.deactivated {
            self.clear_cache(Some(stale));
        }
    }
}
