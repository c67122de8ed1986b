//! Graph layer shared by both execution levels.
//!
//! A persisted `GraphDefinition` is compiled into a `CompiledGraph<K>`, where
//! `K` is the closed node-kind enum of the level (`StepNode` for Agent graphs,
//! `ScenarioNode` for Scenario graphs). The engines walk the compiled form
//! breadth-first, reading and writing an `ExecutionContext` and resolving
//! `{{ path }}` templates against it.

pub mod compiler;
pub mod context;
pub mod edge;
pub mod node;
pub mod template;

pub use compiler::{compile, CompiledGraph, CompiledNode, Successor, ValidationError, ValidationErrors};
pub use context::ExecutionContext;
pub use edge::{evaluate_condition, select_branch, Branch};
pub use node::{NodeKind, ScenarioNode, StepNode};
pub use template::{lookup_path, resolve, resolve_deep};
