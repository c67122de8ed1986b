use std::collections::{HashMap, HashSet};

use thiserror::Error;

use flowdeck_core::types::GraphDefinition;

use super::node::{NodeKind, NodeParseError};

/// A single problem found while compiling a graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("graph has no nodes")]
    Empty,

    #[error("graph has no '{entry_type}' entry node")]
    MissingEntry { entry_type: String },

    #[error("graph has {} '{entry_type}' entry nodes: {}", .node_ids.len(), .node_ids.join(", "))]
    MultipleEntries {
        entry_type: String,
        node_ids: Vec<String>,
    },

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("node '{node_id}' ({node_type}) has invalid config: {message}")]
    InvalidNodeConfig {
        node_id: String,
        node_type: String,
        message: String,
    },

    #[error("edge {from} -> {to} references missing node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },
}

/// Every problem found in one compile pass.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", display_all(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

fn display_all(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A typed node plus the presentation fields the engine still reports.
#[derive(Debug, Clone)]
pub struct CompiledNode<K> {
    pub id: String,
    /// The `type` string as written in the definition.
    pub node_type: String,
    pub label: String,
    pub kind: K,
}

/// An outgoing edge, reduced to what traversal needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Successor {
    pub target: String,
    pub branch_index: Option<usize>,
}

/// Executable form of a graph. Immutable once built.
#[derive(Debug)]
pub struct CompiledGraph<K> {
    nodes: HashMap<String, CompiledNode<K>>,
    adjacency: HashMap<String, Vec<Successor>>,
    entry_node_id: String,
}

impl<K> CompiledGraph<K> {
    pub fn node(&self, id: &str) -> Option<&CompiledNode<K>> {
        self.nodes.get(id)
    }

    pub fn entry_node_id(&self) -> &str {
        &self.entry_node_id
    }

    /// Outgoing edges of `id`, in definition order.
    pub fn successors(&self, id: &str) -> &[Successor] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Validate `definition` and build the executable graph for level `K`.
///
/// All checks run to completion so that every problem is reported at once.
/// Cycles are not detected.
pub fn compile<K: NodeKind>(
    definition: &GraphDefinition,
) -> Result<CompiledGraph<K>, ValidationErrors> {
    let mut errors = Vec::new();

    if definition.nodes.is_empty() {
        errors.push(ValidationError::Empty);
    }

    let mut nodes = HashMap::with_capacity(definition.nodes.len());
    let mut seen = HashSet::with_capacity(definition.nodes.len());
    let mut entries = Vec::new();

    for node in &definition.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNode(node.id.clone()));
            continue;
        }
        if node.node_type == K::ENTRY_TYPE {
            entries.push(node.id.clone());
        }

        match K::parse(&node.node_type, &node.config) {
            Ok(kind) => {
                nodes.insert(
                    node.id.clone(),
                    CompiledNode {
                        id: node.id.clone(),
                        node_type: node.node_type.clone(),
                        label: node.label.clone(),
                        kind,
                    },
                );
            }
            Err(NodeParseError::UnknownType) => errors.push(ValidationError::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            }),
            Err(NodeParseError::InvalidConfig(message)) => {
                errors.push(ValidationError::InvalidNodeConfig {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    message,
                })
            }
        }
    }

    if !definition.nodes.is_empty() {
        match entries.len() {
            0 => errors.push(ValidationError::MissingEntry {
                entry_type: K::ENTRY_TYPE.to_string(),
            }),
            1 => {}
            _ => errors.push(ValidationError::MultipleEntries {
                entry_type: K::ENTRY_TYPE.to_string(),
                node_ids: entries.clone(),
            }),
        }
    }

    let mut adjacency: HashMap<String, Vec<Successor>> = HashMap::new();
    for edge in &definition.edges {
        let mut dangling = false;
        for endpoint in [&edge.source, &edge.target] {
            if !seen.contains(endpoint.as_str()) {
                dangling = true;
                errors.push(ValidationError::DanglingEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        if dangling {
            continue;
        }
        adjacency
            .entry(edge.source.clone())
            .or_default()
            .push(Successor {
                target: edge.target.clone(),
                branch_index: edge.branch_index,
            });
    }

    if !errors.is_empty() {
        return Err(ValidationErrors(errors));
    }

    let entry_node_id = entries.into_iter().next().ok_or_else(|| {
        ValidationErrors(vec![ValidationError::MissingEntry {
            entry_type: K::ENTRY_TYPE.to_string(),
        }])
    })?;

    Ok(CompiledGraph {
        nodes,
        adjacency,
        entry_node_id,
    })
}
