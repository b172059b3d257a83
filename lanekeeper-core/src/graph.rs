//! Submitted computation graphs and their syntactic validation
//!
//! Only the structure of a graph is checked here. Whether its ops exist or
//! its shapes line up is the executor's business.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// One node of a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    /// `name`, `name:N` for a specific output, or `^name` for a control edge
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Requested placement, empty for no preference
    #[serde(default)]
    pub device: String,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            device: String::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }
}

/// A graph as submitted by a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub version: u32,
}

impl GraphDef {
    /// Chain `ops` into a line of nodes `n0 -> n1 -> ...`
    pub fn linear<I, S>(ops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes: Vec<NodeDef> = Vec::new();
        for (i, op) in ops.into_iter().enumerate() {
            let mut node = NodeDef::new(format!("n{i}"), op);
            if let Some(prev) = nodes.last() {
                node = node.with_input(prev.name.clone());
            }
            nodes.push(node);
        }
        Self { nodes, version: 1 }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Checks a graph before anything is reserved for it
pub trait GraphValidator: Send + Sync {
    fn validate(&self, graph: &GraphDef) -> Result<(), GraphError>;
}

/// Structural checks: names, ops and input references
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntaxValidator;

impl SyntaxValidator {
    fn valid_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() || first == '.' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'))
    }

    /// Node name referenced by an input string
    fn input_source(input: &str) -> Option<&str> {
        let name = input.strip_prefix('^').unwrap_or(input);
        let name = match name.rsplit_once(':') {
            Some((node, index)) => {
                if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                node
            }
            None => name,
        };
        Self::valid_name(name).then_some(name)
    }
}

impl GraphValidator for SyntaxValidator {
    fn validate(&self, graph: &GraphDef) -> Result<(), GraphError> {
        if graph.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut names = HashSet::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            if !Self::valid_name(&node.name) {
                return Err(GraphError::InvalidNodeName(node.name.clone()));
            }
            if node.op.trim().is_empty() {
                return Err(GraphError::MissingOp(node.name.clone()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        for node in &graph.nodes {
            for input in &node.inputs {
                let source = Self::input_source(input).ok_or_else(|| GraphError::MalformedInput {
                    node: node.name.clone(),
                    input: input.clone(),
                })?;
                if !names.contains(source) {
                    return Err(GraphError::UnknownInput {
                        node: node.name.clone(),
                        input: input.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(graph: &GraphDef) -> Result<(), GraphError> {
        SyntaxValidator.validate(graph)
    }

    #[test]
    fn linear_graph_is_valid() {
        let graph = GraphDef::linear(["Const", "MatMul", "Identity"]);

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.nodes[2].inputs, vec!["n1".to_string()]);
        assert!(validate(&graph).is_ok());
    }

    #[test]
    fn empty_graph_is_rejected() {
        assert_eq!(validate(&GraphDef::default()), Err(GraphError::Empty));
    }

    #[test]
    fn illegal_node_name_is_rejected() {
        let graph = GraphDef {
            nodes: vec![NodeDef::new("_hidden", "Const")],
            version: 1,
        };

        assert_eq!(
            validate(&graph),
            Err(GraphError::InvalidNodeName("_hidden".to_string()))
        );
    }

    #[test]
    fn missing_op_is_rejected() {
        let graph = GraphDef {
            nodes: vec![NodeDef::new("a", " ")],
            version: 1,
        };

        assert_eq!(validate(&graph), Err(GraphError::MissingOp("a".to_string())));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let graph = GraphDef {
            nodes: vec![NodeDef::new("a", "Const"), NodeDef::new("a", "Const")],
            version: 1,
        };

        assert_eq!(validate(&graph), Err(GraphError::DuplicateNode("a".to_string())));
    }

    #[test]
    fn output_and_control_inputs_are_accepted() {
        let graph = GraphDef {
            nodes: vec![
                NodeDef::new("scope/a", "Split"),
                NodeDef::new("b", "Add")
                    .with_input("scope/a:1")
                    .with_input("^scope/a"),
            ],
            version: 1,
        };

        assert!(validate(&graph).is_ok());
    }

    #[test]
    fn malformed_input_is_rejected() {
        let graph = GraphDef {
            nodes: vec![NodeDef::new("a", "Const"), NodeDef::new("b", "Add").with_input("a:x")],
            version: 1,
        };

        assert!(matches!(validate(&graph), Err(GraphError::MalformedInput { .. })));
    }

    #[test]
    fn unknown_input_is_rejected() {
        let graph = GraphDef {
            nodes: vec![NodeDef::new("b", "Add").with_input("missing")],
            version: 1,
        };

        assert!(matches!(
            validate(&graph),
            Err(GraphError::UnknownInput { ref input, .. }) if input == "missing"
        ));
    }
}
