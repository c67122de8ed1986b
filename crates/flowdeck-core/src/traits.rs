use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// LLM provider. The engine only sees this call contract.
pub trait LlmProvider: Send + Sync + 'static {
    /// Run a single completion against the provider registered as `provider_id`.
    fn generate(
        &self,
        provider_id: &str,
        request: GenerateRequest,
    ) -> BoxFuture<'_, Result<GenerateResponse>>;
}

/// Runs the tool registered as `tool_id`.
///
/// A `ToolOutcome` with `success == false` is a failed call; transport-level
/// problems may also surface as `Err`.
pub trait ToolExecutor: Send + Sync + 'static {
    fn execute_tool(&self, tool_id: &str, request: ToolRequest)
        -> BoxFuture<'_, Result<ToolOutcome>>;
}

/// Agents, Scenarios and their immutable versions.
pub trait DefinitionStore: Send + Sync + 'static {
    /// Create a definition with an initial draft graph and no versions.
    fn create_definition(
        &self,
        kind: DefinitionKind,
        name: &str,
        draft: GraphDefinition,
    ) -> BoxFuture<'_, Result<Definition>>;

    fn get_definition(&self, definition_id: &str) -> BoxFuture<'_, Result<Option<Definition>>>;

    /// Replace the edit-in-progress graph.
    fn update_draft(
        &self,
        definition_id: &str,
        draft: GraphDefinition,
    ) -> BoxFuture<'_, Result<()>>;

    /// Snapshot the current draft as a new version and make it the only
    /// active one. Must be a single transaction.
    fn save_version(&self, definition_id: &str) -> BoxFuture<'_, Result<SavedVersion>>;

    /// Make an existing version the only active one. Must be a single transaction.
    fn activate_version(&self, version_id: &str) -> BoxFuture<'_, Result<SavedVersion>>;

    fn get_version(&self, version_id: &str) -> BoxFuture<'_, Result<Option<DefinitionVersion>>>;

    /// Newest active version (ordered by creation, descending).
    fn active_version(
        &self,
        definition_id: &str,
    ) -> BoxFuture<'_, Result<Option<DefinitionVersion>>>;

    /// All versions, newest first.
    fn list_versions(&self, definition_id: &str)
        -> BoxFuture<'_, Result<Vec<DefinitionVersion>>>;
}

/// The three-level execution audit trail.
///
/// `complete_*` calls return `false` when the record was already terminal
/// (typically cancelled) and was therefore left untouched.
pub trait ExecutionStore: Send + Sync + 'static {
    fn create_scenario_execution(&self, execution: &ScenarioExecution)
        -> BoxFuture<'_, Result<()>>;

    fn complete_scenario_execution(
        &self,
        execution_id: &str,
        completion: Completion,
    ) -> BoxFuture<'_, Result<bool>>;

    fn create_agent_execution(&self, execution: &AgentExecution) -> BoxFuture<'_, Result<()>>;

    fn complete_agent_execution(
        &self,
        execution_id: &str,
        completion: Completion,
    ) -> BoxFuture<'_, Result<bool>>;

    fn create_step_execution(&self, step: &StepExecution) -> BoxFuture<'_, Result<()>>;

    fn complete_step_execution(
        &self,
        step_id: &str,
        completion: Completion,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Look up a record of any level by id.
    fn get_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<Option<ExecutionRecord>>>;

    /// Steps of an agent execution, ordered by step index.
    fn list_steps(&self, agent_execution_id: &str) -> BoxFuture<'_, Result<Vec<StepExecution>>>;

    /// Agent executions launched by a scenario execution, in start order.
    fn list_agent_executions(
        &self,
        scenario_execution_id: &str,
    ) -> BoxFuture<'_, Result<Vec<AgentExecution>>>;

    /// Flip a non-terminal record to `cancelled`. Returns `false` if it was
    /// already terminal, `ExecutionNotFound` if no record has this id.
    fn cancel_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<bool>>;
}
