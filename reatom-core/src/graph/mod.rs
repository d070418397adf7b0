//! Dependency Graph
//!
//! This module holds the per-context state of the atom graph.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are atoms and actions, one [`Slot`](node::Slot) per atom per context
//! - Edges point from a dependency ("pub") to a dependent ("sub")
//!
//! Dependencies are recorded on every computation and kept in read order.
//! Dependents are only recorded while the dependent is connected, so the
//! eager part of propagation never touches cold or warm nodes.
//!
//! # Design Decisions
//!
//! 1. Slots live in a sparse vector indexed by the atom id assigned at
//!    declaration, not in a hash map keyed by the atom itself.
//!
//! 2. Caches are immutable and shared by `Arc`. A transaction builds new
//!    caches next to the committed ones and swaps them in on commit.
//!
//! 3. Each cache carries a version that only moves on a real state change.
//!    Dirty checking compares versions instead of values.

pub(crate) mod node;
pub(crate) mod scheduler;

pub use node::NodeState;
