//! The rollback driver: invalidateblock until the target is the mirror's
//! active tip, then undo.

use crate::MirrorConfig;
use forkscout_common::{
    BlockHash, BlockVerbosity, ReplicaId, ReplicaRpc, RpcError, TipInfo, TipStatus,
};
use forkscout_graph::{stage_ancestors, BlockGraph, GraphError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{info, info_span, warn, Instrument};

/// The ordered list of blocks invalidated on the mirror. Must be handed
/// back to [`MirrorRollbackController::undo_rollback`] once measurements
/// at the rolled-back tip are done.
#[derive(Debug, Default)]
pub struct RollbackSession {
    pub invalidated: Vec<BlockHash>,
}

impl RollbackSession {
    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("mirror has no active chaintip")]
    NoActiveTip,

    /// An iteration proposed only blocks that were already invalidated;
    /// more invalidateblock calls cannot make progress.
    #[error(
        "rollback to {target} stuck: nothing new to invalidate\n\
         chaintips: {chaintips}\ninvalidated: {invalidated}\nproposed: {proposed}"
    )]
    Stuck {
        target: BlockHash,
        chaintips: String,
        invalidated: String,
        proposed: String,
    },

    #[error(
        "rollback to {target} did not converge after {iterations} iterations\n\
         chaintips: {chaintips}\ninvalidated: {invalidated}"
    )]
    IterationLimit {
        target: BlockHash,
        iterations: u32,
        chaintips: String,
        invalidated: String,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Drives one mirror replica. The graph lock is taken per iteration, never
/// held across the settle delays.
pub struct MirrorRollbackController {
    config: MirrorConfig,
    graph: Arc<RwLock<BlockGraph>>,
    rpc: Arc<dyn ReplicaRpc>,
    replica: ReplicaId,
}

impl MirrorRollbackController {
    pub fn new(
        config: MirrorConfig,
        graph: Arc<RwLock<BlockGraph>>,
        rpc: Arc<dyn ReplicaRpc>,
        replica: ReplicaId,
    ) -> Self {
        Self {
            config,
            graph,
            rpc,
            replica,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub(crate) fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub(crate) fn rpc(&self) -> &Arc<dyn ReplicaRpc> {
        &self.rpc
    }

    pub(crate) fn graph(&self) -> &Arc<RwLock<BlockGraph>> {
        &self.graph
    }

    /// Invalidate blocks on the mirror until `target` is its active tip.
    ///
    /// Bounded loop: each iteration reads the mirror's active tip,
    /// proposes invalidations (the active tip itself at equal height,
    /// otherwise the first block of the active branch past the branch
    /// point, plus any children of the target the mirror knows), and
    /// applies them. An iteration that proposes nothing new is fatal.
    pub async fn roll_back_to(
        &self,
        target: &BlockHash,
    ) -> Result<RollbackSession, RollbackError> {
        let span = info_span!("roll_back_to", target = %target, replica = %self.replica);
        async move {
            let mut session = RollbackSession::default();
            let mut iterations: u32 = 0;
            loop {
                let tips = self.rpc.get_chain_tips().await?;
                let Some(active) = tips.iter().find(|t| t.status == TipStatus::Active).cloned()
                else {
                    return Err(RollbackError::NoActiveTip);
                };
                if active.hash == *target {
                    info!(invalidated = session.invalidated.len(), "target is active");
                    return Ok(session);
                }
                if iterations >= self.config.max_iterations {
                    return Err(RollbackError::IterationLimit {
                        target: *target,
                        iterations,
                        chaintips: self.tip_diagnostics(&tips, target).await,
                        invalidated: self.block_list(&session.invalidated).await,
                    });
                }
                info!(tip = %active.hash, height = active.height, "current mirror tip");

                let proposed = self.propose_invalidations(&active, target, &session).await?;
                let fresh: Vec<BlockHash> = proposed
                    .iter()
                    .filter(|h| !session.invalidated.contains(h))
                    .copied()
                    .collect();
                if fresh.is_empty() {
                    return Err(RollbackError::Stuck {
                        target: *target,
                        chaintips: self.tip_diagnostics(&tips, target).await,
                        invalidated: self.block_list(&session.invalidated).await,
                        proposed: self.block_list(&proposed).await,
                    });
                }
                for hash in fresh {
                    info!(%hash, "invalidate block on mirror");
                    self.rpc.invalidate_block(&hash).await?;
                    session.invalidated.push(hash);
                }
                iterations += 1;
                // Give the mirror time to update its internals; without
                // this, measurements occasionally land on a child block
                sleep(Duration::from_millis(self.config.iteration_delay_ms)).await;
            }
        }
        .instrument(span)
        .await
    }

    /// All mirror fetches here run before the writer is taken; the writer
    /// section is pure graph work.
    async fn propose_invalidations(
        &self,
        active: &TipInfo,
        target: &BlockHash,
        session: &RollbackSession,
    ) -> Result<Vec<BlockHash>, RollbackError> {
        // Invalidating can activate forks we have never seen; pick the new
        // active chain up from the mirror before reasoning about it
        let staged = if self.graph.read().await.contains(&active.hash) {
            None
        } else {
            let data = self.rpc.get_block(&active.hash, BlockVerbosity::Summary).await?;
            Some(stage_ancestors(&self.graph, self.rpc.as_ref(), &data).await?)
        };

        let (target_height, children) = {
            let graph = self.graph.read().await;
            let target_block = graph
                .get(target)
                .ok_or(GraphError::UnknownBlock { hash: *target })?;
            (target_block.height, target_block.children.clone())
        };

        // The target must not keep a viable child, or the mirror will
        // re-activate past it; a header probe confirms the mirror knows
        // the child
        let mut known_children = Vec::new();
        if active.height != target_height {
            for child in children {
                if session.invalidated.contains(&child) {
                    continue;
                }
                match self.rpc.get_block_header(&child).await {
                    Ok(_) => known_children.push(child),
                    Err(e) => {
                        warn!(%child, error = %e, "mirror does not have child block, skipping");
                    }
                }
            }
        }

        let mut graph = self.graph.write().await;
        if let Some(staged) = staged {
            staged.apply(&mut graph, self.replica)?;
        }

        let mut proposed = Vec::new();
        if active.height == target_height {
            // Same height, different hash: jump to the other fork
            proposed.push(active.hash);
        } else {
            let descends_from_target = graph.chain_contains(target, &active.hash);
            if active.height > target_height && !descends_from_target {
                let branch_point = graph.branch_point(&active.hash, target)?;
                proposed.push(graph.first_block_after(&branch_point, &active.hash)?);
            }
            proposed.extend(known_children);
        }
        Ok(proposed)
    }

    /// Reconsider every invalidated block, newest first.
    pub async fn undo_rollback(&self, mut session: RollbackSession) -> Result<(), RpcError> {
        for hash in session.invalidated.iter().rev() {
            info!(%hash, "reconsider block on mirror");
            self.rpc.reconsider_block(hash).await?;
            sleep(Duration::from_millis(self.config.reconsider_delay_ms)).await;
        }
        session.invalidated.clear();
        Ok(())
    }

    /// Re-enable the mirror's networking and reconsider every invalid
    /// chaintip at or above its active height. Returns false when the
    /// mirror cannot be reached at all.
    pub async fn restore_mirror(&self) -> Result<bool, RpcError> {
        if let Err(e) = self.rpc.set_network_active(true).await {
            warn!(replica = %self.replica, error = %e, "mirror unreachable during restore");
            return Ok(false);
        }
        let tips = self.rpc.get_chain_tips().await?;
        let Some(active) = tips.iter().find(|t| t.status == TipStatus::Active) else {
            return Ok(true);
        };
        for tip in tips
            .iter()
            .filter(|t| t.status == TipStatus::Invalid && t.height >= active.height)
        {
            info!(hash = %tip.hash, "reconsider invalid chaintip");
            self.rpc.reconsider_block(&tip.hash).await?;
        }
        Ok(true)
    }

    async fn tip_diagnostics(&self, tips: &[TipInfo], target: &BlockHash) -> String {
        let graph = self.graph.read().await;
        let target_height = graph.get(target).map(|b| b.height).unwrap_or(0);
        tips.iter()
            .filter(|t| t.height > target_height.saturating_sub(100))
            .map(|t| format!("{} ({})={}", t.hash, t.height, t.status))
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn block_list(&self, hashes: &[BlockHash]) -> String {
        let graph = self.graph.read().await;
        hashes
            .iter()
            .map(|h| match graph.get(h) {
                Some(b) => format!("{} ({})", h, b.height),
                None => format!("{h} (?)"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
