//! Callback Graph
//!
//! The callback graph tracks how registered callbacks feed each other
//! through component properties.
//!
//! # Overview
//!
//! The graph is a directed graph where:
//!
//! - Nodes represent registered callbacks
//! - Edges represent data flow: if an output of A matches an input of B,
//!   there is an edge from A to B
//!
//! Matching is wildcard-aware (see [`Dependency::matches`]), so a pattern
//! output `{"type": "row", "index": MATCH}` feeds an input on
//! `{"type": "row", "index": 3}`.
//!
//! # Uses
//!
//! 1. Registration rejects a callback that would close a cycle between
//!    distinct callbacks. A callback reading one of its own outputs is
//!    allowed and never produces an edge.
//!
//! 2. For a set of changed prop ids, the graph answers which callbacks fire
//!    directly and the order in which the whole downstream chain runs.
//!
//! Both forward (dependencies) and reverse (dependents) edges are kept so
//! either direction can be walked without a scan.
//!
//! [`Dependency::matches`]: crate::dependency::Dependency::matches

mod node;
mod scheduler;

pub use node::{CallbackNode, NodeId, NodeKind};
pub use scheduler::CallbackGraph;
