use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh record identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ── Graph definitions ───────────────────────────────────────────

/// A raw, persisted graph: the shape the editor saves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

/// A node as stored: `type` is an open string and `config` is interpreted
/// per type by the compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Editor coordinates. Never read by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            label: String::new(),
            config: serde_json::Value::Object(Default::default()),
            position: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    /// Which branch of a decision node this edge belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl EdgeDefinition {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            branch_index: None,
            condition: None,
            label: None,
        }
    }

    pub fn with_branch(mut self, branch_index: usize) -> Self {
        self.branch_index = Some(branch_index);
        self
    }
}

// ── Definitions & versions ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Agent,
    Scenario,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Scenario => "scenario",
        }
    }
}

impl FromStr for DefinitionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "scenario" => Ok(Self::Scenario),
            other => Err(format!("unknown definition kind '{}'", other)),
        }
    }
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An editable Agent or Scenario. `draft` is the edit-in-progress graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    pub id: String,
    pub kind: DefinitionKind,
    pub name: String,
    pub draft: GraphDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable snapshot of a definition's graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionVersion {
    pub id: String,
    pub definition_id: String,
    pub version: u32,
    pub graph: GraphDefinition,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of saving a new version: the new active version plus the ids of
/// versions that were active before and have now been deactivated.
#[derive(Debug, Clone)]
pub struct SavedVersion {
    pub version: DefinitionVersion,
    pub deactivated: Vec<String>,
}

// ── Execution records ───────────────────────────────────────────

/// Lifecycle of every execution record.
///
/// `pending → running → {completed | failed | cancelled}`. Terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal update applied once to a record when its run ends.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: ExecutionStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Completion {
    pub fn completed(output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            output: Some(output),
            error: None,
            completed_at: Utc::now(),
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioExecution {
    pub id: String,
    pub scenario_id: String,
    pub definition_version_id: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub conversation_id: Option<String>,
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecution {
    pub id: String,
    /// `None` for standalone and test runs.
    pub scenario_execution_id: Option<String>,
    pub agent_id: String,
    pub definition_version_id: String,
    /// The orchestration node that launched this run.
    pub orchestration_node_id: Option<String>,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub id: String,
    pub agent_execution_id: String,
    /// Dequeue order within the agent run, starting at 0.
    pub step_index: u32,
    pub node_id: String,
    pub node_type: String,
    pub status: ExecutionStatus,
    /// Context as it was when the step started.
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// Per-agent line in a scenario's final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecutionSummary {
    pub execution_id: String,
    pub agent_id: String,
    pub node_id: String,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Any persisted execution record, looked up by id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "level", rename_all = "lowercase")]
pub enum ExecutionRecord {
    Scenario {
        execution: ScenarioExecution,
        agents: Vec<AgentExecution>,
    },
    Agent(AgentExecution),
    Step(StepExecution),
}

impl ExecutionRecord {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Scenario { execution, .. } => execution.status,
            Self::Agent(execution) => execution.status,
            Self::Step(step) => step.status,
        }
    }
}

// ── LLM & tool collaborator payloads ────────────────────────────

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    #[serde(default)]
    pub usage: Usage,
}

/// Input handed to a tool: the resolved payload plus a read-only snapshot of
/// the execution context.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRequest {
    pub input: serde_json::Value,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────

/// Execution lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ScenarioStarted {
        execution_id: String,
        scenario_id: String,
        version_id: String,
    },
    ScenarioFinished {
        execution_id: String,
        status: ExecutionStatus,
        duration_ms: u64,
        error: Option<String>,
    },
    AgentStarted {
        execution_id: String,
        version_id: String,
        scenario_execution_id: Option<String>,
    },
    AgentFinished {
        execution_id: String,
        status: ExecutionStatus,
        duration_ms: u64,
        error: Option<String>,
    },
    StepStarted {
        agent_execution_id: String,
        step_index: u32,
        node_id: String,
        node_type: String,
    },
    StepFinished {
        agent_execution_id: String,
        step_index: u32,
        node_id: String,
        status: ExecutionStatus,
        duration_ms: u64,
        error: Option<String>,
    },
    /// A scenario decision picked a branch (`None` when nothing matched).
    BranchSelected {
        scenario_execution_id: String,
        node_id: String,
        branch_index: Option<usize>,
        label: Option<String>,
    },
    ParallelJoined {
        scenario_execution_id: String,
        node_id: String,
        succeeded: usize,
        failed: usize,
    },
    RecoveryVersionCreated {
        definition_id: String,
        version_id: String,
    },
}
