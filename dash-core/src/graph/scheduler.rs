//! Callback Ordering
//!
//! [`CallbackGraph`] owns the nodes and edges and answers ordering
//! questions about them.
//!
//! # Algorithm
//!
//! Firing order for a set of changed properties:
//!
//! 1. Find the callbacks with an input matching a changed prop id
//! 2. Walk dependents breadth-first to collect everything downstream
//! 3. Sort the collected callbacks topologically (producers before consumers)
//!
//! Cycle detection runs Kahn's algorithm over the whole graph: any node left
//! with a non-zero in-degree sits on a cycle.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use tracing::trace;

use super::node::{CallbackNode, NodeId, NodeKind};
use crate::dependency::{ComponentId, Dependency, Input};

/// Data-flow graph of registered callbacks.
#[derive(Debug, Default)]
pub struct CallbackGraph {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, CallbackNode>,

    /// Registration order.
    by_callback: IndexMap<String, NodeId>,

    next_id: u64,
}

/// Reads a prop id (`<id_str>.<property>`) back into an input dependency.
fn parse_prop_id(prop_id: &str) -> Option<Dependency> {
    let (id, property) = prop_id.rsplit_once('.')?;
    Some(Input::new(ComponentId::parse(id), property))
}

impl CallbackGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback and connect it to every callback it feeds or is fed by.
    pub fn add_callback(
        &mut self,
        kind: NodeKind,
        callback_id: impl Into<String>,
        outputs: Vec<Dependency>,
        inputs: Vec<Dependency>,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let node = CallbackNode::new(id, kind, callback_id, outputs, inputs);

        let mut upstream = Vec::new();
        let mut downstream = Vec::new();
        for (other_id, other) in &self.nodes {
            if other.feeds(&node) {
                upstream.push(*other_id);
            }
            if node.feeds(other) {
                downstream.push(*other_id);
            }
        }

        self.by_callback.insert(node.callback_id().to_string(), id);
        self.nodes.insert(id, node);
        for other in upstream {
            self.add_edge(other, id);
        }
        for other in downstream {
            self.add_edge(id, other);
        }
        id
    }

    /// Remove a callback.
    ///
    /// Also removes all edges involving its node.
    pub fn remove_callback(&mut self, callback_id: &str) {
        let Some(node_id) = self.by_callback.shift_remove(callback_id) else {
            return;
        };
        if let Some(node) = self.nodes.remove(&node_id) {
            for dep_id in node.dependencies() {
                if let Some(dep) = self.nodes.get_mut(dep_id) {
                    dep.unlink_downstream(node_id);
                }
            }
            for dependent_id in node.dependents() {
                if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                    dependent.unlink_upstream(node_id);
                }
            }
        }
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&CallbackNode> {
        self.nodes.get(&node_id)
    }

    pub fn node_for(&self, callback_id: &str) -> Option<&CallbackNode> {
        self.by_callback.get(callback_id).and_then(|id| self.nodes.get(id))
    }

    /// Add an edge: `dependent` reads what `dependency` writes.
    fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if dependency == dependent {
            return;
        }
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.link_downstream(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.link_upstream(dependency);
        }
    }

    /// A pair of callbacks on a cycle, if the graph has one.
    pub fn find_cycle(&self) -> Option<(String, String)> {
        let mut in_degree: HashMap<NodeId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.dependencies().len()))
            .collect();
        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(node_id) = queue.pop_front() {
            in_degree.remove(&node_id);
            if let Some(node) = self.nodes.get(&node_id) {
                for dependent_id in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(*dependent_id);
                        }
                    }
                }
            }
        }

        // Leftovers all sit on or behind a cycle; walk upstream within them
        // until a node repeats.
        let leftover: HashSet<NodeId> = in_degree.keys().copied().collect();
        let start = *leftover.iter().min()?;
        let mut seen = vec![start];
        let mut current = start;
        loop {
            let next = self
                .nodes
                .get(&current)?
                .dependencies()
                .iter()
                .copied()
                .filter(|d| leftover.contains(d))
                .min()?;
            if let Some(pos) = seen.iter().position(|n| *n == next) {
                let a = seen[pos];
                let b = *seen.get(pos + 1).unwrap_or(&current);
                let name = |id: NodeId| self.nodes.get(&id).map(|n| n.callback_id().to_string());
                return Some((name(a)?, name(b)?));
            }
            seen.push(next);
            current = next;
        }
    }

    /// Callbacks with an input matching one of the changed prop ids, in
    /// registration order.
    pub fn triggered_by(&self, changed: &[String]) -> Vec<String> {
        let changed: Vec<Dependency> = changed.iter().filter_map(|p| parse_prop_id(p)).collect();
        self.by_callback
            .iter()
            .filter(|(_, node_id)| {
                self.nodes.get(node_id).is_some_and(|node| {
                    node.inputs()
                        .iter()
                        .any(|input| changed.iter().any(|c| input.matches(c)))
                })
            })
            .map(|(callback_id, _)| callback_id.clone())
            .collect()
    }

    /// Every callback that runs, directly or downstream, when the given
    /// props change, producers before consumers.
    pub fn execution_order(&self, changed: &[String]) -> Vec<String> {
        let mut to_process = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<NodeId> = self
            .triggered_by(changed)
            .iter()
            .filter_map(|id| self.by_callback.get(id).copied())
            .collect();

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&node_id) {
                to_process.push(node_id);
                queue.extend(node.dependents().iter().copied());
            }
        }

        let order = self.topological_sort(to_process);
        trace!(changed = changed.len(), fired = order.len(), "computed execution order");
        order
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|n| n.callback_id().to_string()))
            .collect()
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that dependencies come before dependents.
    fn topological_sort(&self, nodes: Vec<NodeId>) -> Vec<NodeId> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut result = Vec::new();
        let mut queue = VecDeque::new();

        // Calculate in-degrees (only counting edges within the node set)
        for &node_id in &nodes {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies()
                    .iter()
                    .filter(|d| node_set.contains(d))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                let mut next: Vec<NodeId> = node.dependents().iter().copied().collect();
                next.sort();
                for dependent_id in next {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent_id);
                        }
                    }
                }
            }
        }

        result
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{IdValue, Output, ALL, MATCH};

    fn add(graph: &mut CallbackGraph, output: (&str, &str), input: (&str, &str)) -> NodeId {
        graph.add_callback(
            NodeKind::Server,
            format!("{}.{}", output.0, output.1),
            vec![Output::new(output.0, output.1)],
            vec![Input::new(input.0, input.1)],
        )
    }

    #[test]
    fn add_and_remove_callbacks() {
        let mut graph = CallbackGraph::new();
        let a = add(&mut graph, ("b", "value"), ("a", "value"));
        let b = add(&mut graph, ("c", "value"), ("b", "value"));

        assert_eq!(graph.node_count(), 2);
        assert!(graph.get_node(a).unwrap().dependents().contains(&b));
        assert!(graph.get_node(b).unwrap().dependencies().contains(&a));

        graph.remove_callback("b.value");
        assert_eq!(graph.node_count(), 1);
        assert!(graph.get_node(b).unwrap().dependencies().is_empty());
        assert!(graph.node_for("b.value").is_none());
    }

    #[test]
    fn edges_are_added_in_both_directions() {
        let mut graph = CallbackGraph::new();
        // Consumer registered before producer.
        let consumer = add(&mut graph, ("c", "value"), ("b", "value"));
        let producer = add(&mut graph, ("b", "value"), ("a", "value"));
        assert!(graph.get_node(producer).unwrap().dependents().contains(&consumer));
    }

    #[test]
    fn execution_order_is_topological() {
        let mut graph = CallbackGraph::new();
        add(&mut graph, ("c", "value"), ("b", "value"));
        add(&mut graph, ("b", "value"), ("a", "value"));
        add(&mut graph, ("z", "value"), ("y", "value"));

        let order = graph.execution_order(&["a.value".to_string()]);
        assert_eq!(order, vec!["b.value", "c.value"]);
        assert_eq!(graph.triggered_by(&["a.value".to_string()]), vec!["b.value"]);
    }

    #[test]
    fn self_loops_are_not_cycles() {
        let mut graph = CallbackGraph::new();
        add(&mut graph, ("a", "value"), ("a", "value"));
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn cycles_between_callbacks_are_found() {
        let mut graph = CallbackGraph::new();
        add(&mut graph, ("b", "value"), ("a", "value"));
        assert_eq!(graph.find_cycle(), None);
        add(&mut graph, ("a", "value"), ("b", "value"));
        let (x, y) = graph.find_cycle().unwrap();
        let mut pair = vec![x, y];
        pair.sort();
        assert_eq!(pair, vec!["a.value", "b.value"]);
    }

    #[test]
    fn pattern_props_trigger_callbacks() {
        let mut graph = CallbackGraph::new();
        let row = |index: IdValue| ComponentId::dict([("type", IdValue::from("row")), ("index", index)]);
        graph.add_callback(
            NodeKind::Server,
            "total.children",
            vec![Output::new("total", "children")],
            vec![Input::new(row(ALL.into()), "value")],
        );
        graph.add_callback(
            NodeKind::Server,
            "echo",
            vec![Output::new(row(MATCH.into()), "title")],
            vec![Input::new(row(MATCH.into()), "value")],
        );
        let changed = vec![format!("{}.value", row(IdValue::from(2_i64)).stringify())];
        assert_eq!(graph.triggered_by(&changed), vec!["total.children", "echo"]);
    }
}
