//! Result and error types for decompilation.

use declift_pcode::GraphError;
use thiserror::Error;

/// A fatal decompilation error.
///
/// Only failures that abort the current function end up here. The non-fatal conditions of the
/// pipeline (unresolved call targets, type conflicts, fixed-point divergence) are recorded as
/// diagnostics on the graph instead: the call node is marked ambiguous, the cast is implicit,
/// the graph is tagged imprecise.
#[derive(Debug, Error)]
pub enum DecompileError {
    /// The PCode graph is structurally broken at the given place.
    #[error("graph structure error: {0}")]
    Graph(#[from] GraphError),

    /// The function graph has no start block to interpret from.
    #[error("function graph has no start block")]
    NoStartBlock,

    /// An internal invariant did not hold. In debug builds the offending site asserts instead.
    #[error("integrity violation: {0}")]
    Integrity(&'static str),
}

/// A convenient alias for a `Result` over [`DecompileError`].
pub type DecompileResult<T> = Result<T, DecompileError>;
