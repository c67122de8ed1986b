use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM provider not found: {0}")]
    ProviderNotFound(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    // Definition errors
    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Definition version not found: {0}")]
    VersionNotFound(String),

    #[error("No active version for definition: {0}")]
    NoActiveVersion(String),

    #[error("Definition {definition_id} is a {actual} definition, expected {expected}")]
    WrongDefinitionKind {
        definition_id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid graph for version {version_id}: {errors}")]
    InvalidGraph { version_id: String, errors: String },

    // Execution errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Step {node_id} failed: {message}")]
    StepFailed { node_id: String, message: String },

    #[error("Agent execution {execution_id} failed: {message}")]
    AgentFailed {
        execution_id: String,
        message: String,
    },

    #[error("Parallel node {node_id} failed: {failed} of {total} branches failed")]
    ParallelFailed {
        node_id: String,
        failed: usize,
        total: usize,
    },

    #[error("Scenario execution {execution_id} failed: {message}")]
    ScenarioFailed {
        execution_id: String,
        message: String,
    },

    #[error("Execution panicked: {0}")]
    Panicked(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
