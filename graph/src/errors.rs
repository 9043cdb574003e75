//! Error types for block graph operations.

use forkscout_common::{BlockHash, RpcError};

/// Errors returned by [`BlockGraph`](crate::BlockGraph) operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A block hash referenced by an operation is not in the graph.
    #[error("block not in graph: {hash}")]
    UnknownBlock { hash: BlockHash },

    /// A replica re-reported a known hash at a different height. The graph
    /// is inconsistent with the network; nothing sensible can continue.
    #[error("height mismatch for {hash}: recorded {recorded}, reported {reported}")]
    HeightMismatch {
        hash: BlockHash,
        recorded: u64,
        reported: u64,
    },

    /// A block's parent does not sit exactly one height below it.
    #[error("parent {parent} of {hash} is at height {parent_height}, expected {expected}")]
    ParentHeightMismatch {
        hash: BlockHash,
        parent: BlockHash,
        parent_height: u64,
        expected: u64,
    },

    /// `branch_point` called with twice the same block.
    #[error("branch point of a block with itself")]
    SameBlock,

    /// `branch_point` called with two blocks on one branch.
    #[error("blocks are on the same branch")]
    SameBranch,

    /// An ancestor walk ran out of retained history.
    #[error("no common ancestor within retained history")]
    NoCommonAncestor,

    /// A replica call issued during ancestor resolution failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}
