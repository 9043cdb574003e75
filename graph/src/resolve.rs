//! Ancestor resolution: walking a block's parent links down through the
//! graph, fetching what is missing from the reporting replica.

use forkscout_common::{
    BlockData, BlockHash, BlockVerbosity, HeaderData, ReplicaId, ReplicaRpc, RpcError,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::block_graph::BlockGraph;
use crate::errors::GraphError;

/// Validity stamp applied to every block visited by a resolution walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkAs {
    Valid,
    Invalid,
}

/// Walk parent links from `tip`, fetching unknown ancestors from `rpc`.
///
/// Stops at the retained floor, at `until_height`, or on reaching a block
/// already known to be connected. A pruned ancestor degrades to a
/// headers-only record instead of failing. When the walk reaches the floor
/// or a connected block, every visited block is marked connected; a walk
/// cut short by `until_height` in an unconnected region leaves the flags
/// untouched.
///
/// The caller holds the writer across the fetches, so this is for the
/// reconciliation pass only; everyone else goes through
/// [`stage_ancestors`] and keeps the replica calls outside the lock.
pub async fn resolve_ancestors(
    graph: &mut BlockGraph,
    rpc: &dyn ReplicaRpc,
    replica: ReplicaId,
    tip: BlockHash,
    until_height: Option<u64>,
    mark: Option<MarkAs>,
) -> Result<(), GraphError> {
    let mut visited: Vec<BlockHash> = Vec::new();
    let mut current = tip;
    let reached_anchor;

    loop {
        let block = graph
            .get(&current)
            .ok_or(GraphError::UnknownBlock { hash: current })?;
        let height = block.height;
        let parent_hash = block.parent;
        visited.push(current);
        if let Some(stamp) = mark {
            match stamp {
                MarkAs::Valid => graph.mark_valid(&current, replica)?,
                MarkAs::Invalid => graph.mark_invalid(&current, replica)?,
            }
        }

        if height <= graph.min_retained_height() {
            reached_anchor = true;
            break;
        }
        if until_height == Some(height) {
            reached_anchor = false;
            break;
        }
        let Some(parent_hash) = parent_hash else {
            // Nothing above the floor should be parentless; treat it like
            // running out of history
            reached_anchor = false;
            break;
        };

        if let Some(parent) = graph.get(&parent_hash) {
            if parent.connected {
                reached_anchor = true;
                break;
            }
        } else {
            fetch_ancestor(graph, rpc, replica, &parent_hash).await?;
        }
        current = parent_hash;
    }

    if reached_anchor {
        debug!(%tip, steps = visited.len(), "ancestor walk connected");
        for hash in &visited {
            graph.set_connected(hash);
        }
    }
    Ok(())
}

async fn fetch_ancestor(
    graph: &mut BlockGraph,
    rpc: &dyn ReplicaRpc,
    replica: ReplicaId,
    hash: &BlockHash,
) -> Result<(), GraphError> {
    match rpc.get_block(hash, BlockVerbosity::Summary).await {
        Ok(data) => {
            graph.upsert_block(&data, Some(replica))?;
        }
        Err(RpcError::BlockPruned) => {
            // The replica discarded the body but still serves the header
            let header = rpc.get_block_header(hash).await?;
            graph.insert_headers_only(&header, Some(replica))?;
            graph.mark_pruned(hash)?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Blocks fetched ahead of a writer section by [`stage_ancestors`].
pub struct StagedAncestors {
    fetched: Vec<Staged>,
    visited: Vec<BlockHash>,
    anchored: bool,
}

enum Staged {
    Body(BlockData),
    PrunedHeader(HeaderData),
}

impl StagedAncestors {
    /// Insert the fetched blocks oldest first and, when the walk reached
    /// the floor or a connected block, mark the whole path connected.
    /// Pure graph mutation; the caller holds the writer only for this.
    pub fn apply(self, graph: &mut BlockGraph, replica: ReplicaId) -> Result<(), GraphError> {
        for staged in self.fetched.iter().rev() {
            match staged {
                Staged::Body(data) => {
                    graph.upsert_block(data, Some(replica))?;
                }
                Staged::PrunedHeader(header) => {
                    graph.insert_headers_only(header, Some(replica))?;
                    graph.mark_pruned(&header.hash)?;
                }
            }
        }
        if self.anchored {
            for hash in &self.visited {
                graph.set_connected(hash);
            }
        }
        Ok(())
    }
}

/// The lock-friendly counterpart of [`resolve_ancestors`]: walk parent
/// links down from `tip` fetching what is missing, taking only short read
/// locks, so a stuck replica never stalls the writer. The stop rules are
/// the same; the result is applied under one writer section with
/// [`StagedAncestors::apply`].
pub async fn stage_ancestors(
    graph: &RwLock<BlockGraph>,
    rpc: &dyn ReplicaRpc,
    tip: &BlockData,
) -> Result<StagedAncestors, RpcError> {
    let floor = graph.read().await.min_retained_height();
    let mut staged = StagedAncestors {
        fetched: vec![Staged::Body(tip.clone())],
        visited: vec![tip.hash],
        anchored: false,
    };
    let mut height = tip.height;
    let mut parent = tip.previous_block_hash;
    loop {
        if height <= floor {
            staged.anchored = true;
            break;
        }
        let Some(hash) = parent else {
            break;
        };
        let known = {
            let graph = graph.read().await;
            graph.get(&hash).map(|b| (b.connected, b.height, b.parent))
        };
        match known {
            Some((true, _, _)) => {
                staged.anchored = true;
                break;
            }
            Some((false, h, p)) => {
                staged.visited.push(hash);
                height = h;
                parent = p;
            }
            None => match rpc.get_block(&hash, BlockVerbosity::Summary).await {
                Ok(data) => {
                    staged.visited.push(hash);
                    height = data.height;
                    parent = data.previous_block_hash;
                    staged.fetched.push(Staged::Body(data));
                }
                Err(RpcError::BlockPruned) => {
                    let header = rpc.get_block_header(&hash).await?;
                    staged.visited.push(hash);
                    height = header.height;
                    parent = header.previous_block_hash;
                    staged.fetched.push(Staged::PrunedHeader(header));
                }
                Err(e) => return Err(e),
            },
        }
    }
    Ok(staged)
}
