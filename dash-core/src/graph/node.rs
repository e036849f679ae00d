//! Graph Nodes
//!
//! This module defines the node type that lives in the callback graph.

use std::collections::HashSet;
use std::fmt;

use crate::dependency::Dependency;

/// Identifier of a node, unique within the graph that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the callback behind a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Runs in the request that triggered it.
    Server,

    /// Runs in the browser; the server only lists it.
    Clientside,

    /// Runs as a background job polled to completion.
    Background,
}

/// A registered callback in the graph.
#[derive(Debug)]
pub struct CallbackNode {
    id: NodeId,

    kind: NodeKind,

    /// Id of the registered callback.
    callback_id: String,

    outputs: Vec<Dependency>,

    inputs: Vec<Dependency>,

    /// Callbacks whose outputs feed this one.
    dependencies: HashSet<NodeId>,

    /// Callbacks fed by this one's outputs.
    dependents: HashSet<NodeId>,
}

impl CallbackNode {
    pub(crate) fn new(
        id: NodeId,
        kind: NodeKind,
        callback_id: impl Into<String>,
        outputs: Vec<Dependency>,
        inputs: Vec<Dependency>,
    ) -> Self {
        Self {
            id,
            kind,
            callback_id: callback_id.into(),
            outputs,
            inputs,
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    pub fn outputs(&self) -> &[Dependency] {
        &self.outputs
    }

    pub fn inputs(&self) -> &[Dependency] {
        &self.inputs
    }

    /// True when one of this node's outputs can reach one of `other`'s inputs.
    pub fn feeds(&self, other: &CallbackNode) -> bool {
        self.outputs
            .iter()
            .any(|out| other.inputs.iter().any(|input| out.matches(input)))
    }

    pub(crate) fn link_upstream(&mut self, producer: NodeId) {
        self.dependencies.insert(producer);
    }

    pub(crate) fn unlink_upstream(&mut self, producer: NodeId) {
        self.dependencies.remove(&producer);
    }

    /// Callbacks feeding this one.
    pub fn dependencies(&self) -> &HashSet<NodeId> {
        &self.dependencies
    }

    pub(crate) fn link_downstream(&mut self, consumer: NodeId) {
        self.dependents.insert(consumer);
    }

    pub(crate) fn unlink_downstream(&mut self, consumer: NodeId) {
        self.dependents.remove(&consumer);
    }

    /// Callbacks this one feeds.
    pub fn dependents(&self) -> &HashSet<NodeId> {
        &self.dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{ComponentId, IdValue, Input, Output, ALL, MATCH};

    #[test]
    fn links_are_tracked_per_direction() {
        let mut node = CallbackNode::new(NodeId(0), NodeKind::Server, "out.children", vec![], vec![]);
        node.link_upstream(NodeId(1));
        node.link_upstream(NodeId(2));
        node.link_downstream(NodeId(3));

        assert_eq!(node.dependencies().len(), 2);
        assert!(node.dependents().contains(&NodeId(3)));

        node.unlink_upstream(NodeId(1));
        node.unlink_downstream(NodeId(3));
        assert!(!node.dependencies().contains(&NodeId(1)));
        assert!(node.dependents().is_empty());
        assert_eq!(NodeId(7).to_string(), "#7");
    }

    #[test]
    fn feeds_uses_wildcard_matching() {
        let row = |index: IdValue| ComponentId::dict([("type", IdValue::from("row")), ("index", index)]);
        let producer = CallbackNode::new(
            NodeId(0),
            NodeKind::Server,
            "p",
            vec![Output::new(row(MATCH.into()), "value")],
            vec![Input::new("source", "value")],
        );
        let consumer = CallbackNode::new(
            NodeId(1),
            NodeKind::Server,
            "c",
            vec![Output::new("total", "children")],
            vec![Input::new(row(ALL.into()), "value")],
        );
        assert!(producer.feeds(&consumer));
        assert!(!consumer.feeds(&producer));
    }
}
