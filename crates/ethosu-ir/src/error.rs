//! Error types for the graph IR.

/// Errors that can occur when constructing or validating a graph.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A tensor id does not exist in the graph.
    #[error("tensor t{0} is not registered in the graph")]
    UnknownTensor(u32),

    /// A node id does not exist in the graph.
    #[error("node n{0} is not part of the graph")]
    UnknownNode(u32),

    /// Two nodes produce the same tensor.
    #[error("tensor '{tensor}' has more than one producer")]
    DuplicateProducer { tensor: String },

    /// The graph is not acyclic.
    #[error("graph contains a cycle ({visited} of {total} nodes ordered)")]
    Cycle { visited: usize, total: usize },

    /// A shape or element count does not line up.
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    /// An operator received inputs it cannot accept.
    #[error("invalid operand for '{node}': {reason}")]
    InvalidOperand { node: String, reason: String },

    /// A region id has no begin marker.
    #[error("region r{0} does not exist")]
    UnknownRegion(u32),

    /// A region's markers are missing or duplicated.
    #[error("region r{region}: {reason}")]
    MalformedRegion { region: u32, reason: String },
}
