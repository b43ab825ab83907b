//! Error types for the lowering pass

use thiserror::Error;

/// Result type for graph lowering operations
pub type Result<T> = std::result::Result<T, LowerError>;

/// Errors that can occur while rewriting a graph
#[derive(Debug, Error)]
pub enum LowerError {
    /// A node (or synthesized cast) name is already taken. For synthesized
    /// casts this is an invariant violation: either the naming scheme is
    /// broken or the pass was re-run over an already-converted graph.
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("failed to parse graph document: {0}")]
    ParseError(String),

    #[error("failed to serialize graph document: {0}")]
    SerializationError(String),

    #[error("invalid graph structure: {0}")]
    InvalidGraph(String),
}
