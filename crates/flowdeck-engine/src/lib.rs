//! Hierarchical graph execution engine.
//!
//! Scenarios orchestrate Agents; Agents are graphs of Steps. Both levels are
//! compiled from persisted graph definitions, walked breadth-first over a
//! shared append-only context, and recorded as a three-level audit trail.

pub mod agent;
pub mod cache;
pub mod engine;
pub mod graph;
pub mod run_log;
pub mod scenario;
pub mod step;

pub use agent::{AgentEngine, AgentExecutionRequest, AgentExecutionResult};
pub use cache::GraphCache;
pub use engine::Engine;
pub use graph::{compile, CompiledGraph, ValidationError, ValidationErrors};
pub use run_log::ExecutionLogger;
pub use scenario::{ScenarioEngine, ScenarioExecutionRequest, ScenarioExecutionResult};
pub use step::StepExecutor;
