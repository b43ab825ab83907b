// Graph module for the lowering pass
//
// Provides the mutable dataflow IR the rewrite operates on: nodes keyed by
// unique name, ordered input lists, consumer tracking, and bulk parse/dump of
// the whole graph.

pub mod ir;

// Re-exports for convenience
pub use ir::{Dependency, Graph, GraphDoc, GraphMeta, InputRef, Node, NodeId};
