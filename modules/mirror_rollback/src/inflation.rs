//! Supply inflation audit: measure the UTXO-set total at every block since
//! the last audited one, by rolling the mirror back block by block.

use crate::controller::{MirrorRollbackController, RollbackError};
use forkscout_common::alerts::{AlertSink, Finding};
use forkscout_common::{params, BlockHash, BlockVerbosity, ReplicaId, RpcError};
use forkscout_graph::{stage_ancestors, GraphError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// UTXO-set totals measured with `block` as the mirror's active tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflationSnapshot {
    pub block: BlockHash,
    pub height: u64,
    pub tx_outs: u64,
    pub total_amount: u64,
    pub inflated: bool,
}

/// Snapshots per (replica, block).
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<(ReplicaId, BlockHash), InflationSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: ReplicaId, block: &BlockHash) -> Option<&InflationSnapshot> {
        self.snapshots.get(&(replica, *block))
    }

    pub fn insert(&mut self, replica: ReplicaId, snapshot: InflationSnapshot) {
        self.snapshots.insert((replica, snapshot.block), snapshot);
    }

    fn set_inflated(&mut self, replica: ReplicaId, block: &BlockHash) {
        if let Some(snapshot) = self.snapshots.get_mut(&(replica, *block)) {
            snapshot.inflated = true;
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Completed { checked: usize },
    /// The mirror is in its rest period after a previous audit.
    Resting,
    MirrorUnreachable,
    InitialBlockDownload,
    /// Totals for the current mirror tip are already on record.
    AlreadyChecked,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The walk back to the last audited block exceeded the bound; the
    /// blocks collected so far were still measured.
    #[error("more than {max} blocks behind for supply audit, check {behind} and earlier manually")]
    TooFarBehind { max: usize, behind: BlockHash },

    #[error("missing intermediate block below {tip}")]
    MissingIntermediateBlock { tip: BlockHash },

    #[error("utxo totals are for {got}, expected {expected}")]
    UnexpectedBestBlock { expected: BlockHash, got: BlockHash },

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Runs supply audits against one mirror replica.
///
/// Whatever happens mid-audit, the mirror leaves with networking enabled
/// and no blocks left invalidated; a failed audit additionally starts a
/// rest period.
pub struct InflationAuditor {
    controller: MirrorRollbackController,
    snapshots: SnapshotStore,
    rest_until: Option<Instant>,
}

impl InflationAuditor {
    pub fn new(controller: MirrorRollbackController) -> Self {
        Self {
            controller,
            snapshots: SnapshotStore::new(),
            rest_until: None,
        }
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn snapshots_mut(&mut self) -> &mut SnapshotStore {
        &mut self.snapshots
    }

    pub async fn check(&mut self, alerts: &AlertSink) -> Result<AuditOutcome, AuditError> {
        let replica = self.controller.replica();
        let span = info_span!("inflation_audit", replica = %replica);
        async move {
            if let Some(until) = self.rest_until {
                if Instant::now() < until {
                    return Ok(AuditOutcome::Resting);
                }
                self.rest_until = None;
            }
            if !self.controller.restore_mirror().await? {
                return Ok(AuditOutcome::MirrorUnreachable);
            }

            let rpc = self.controller.rpc().clone();
            let status = rpc.get_blockchain_info().await?;
            if status.initial_block_download {
                return Ok(AuditOutcome::InitialBlockDownload);
            }
            let tip = status.best_block_hash;

            // Sync the mirror tip into the graph with the fetches outside
            // the writer
            if !self.controller.graph().read().await.contains(&tip) {
                let data = rpc.get_block(&tip, BlockVerbosity::Summary).await?;
                let staged = stage_ancestors(self.controller.graph(), rpc.as_ref(), &data).await?;
                let mut graph = self.controller.graph().write().await;
                staged.apply(&mut graph, replica)?;
            }

            // gettxoutsetinfo is expensive; skip when this tip is done
            if self.snapshots.get(replica, &tip).is_some() {
                return Ok(AuditOutcome::AlreadyChecked);
            }

            info!(%tip, "freeze mirror networking for supply audit");
            rpc.set_network_active(false).await?;
            if let Ok(peers) = rpc.get_peer_info().await {
                for peer in peers {
                    let _ = rpc.disconnect_peer(peer.id).await;
                }
            }

            let result = self.run(&tip, alerts).await;
            self.cleanup().await;
            if self.controller.config().rest_secs > 0 {
                self.rest_until = Some(
                    Instant::now() + Duration::from_secs(self.controller.config().rest_secs),
                );
            }

            let (checked, exceeded_at) = result?;
            match exceeded_at {
                Some(behind) => Err(AuditError::TooFarBehind {
                    max: self.controller.config().audit_max_blocks,
                    behind,
                }),
                None => Ok(AuditOutcome::Completed { checked }),
            }
        }
        .instrument(span)
        .await
    }

    /// Measure totals per block, oldest first. Returns the number of
    /// blocks checked and, when the walk hit the bound, the earliest
    /// block that still needs a manual look.
    async fn run(
        &mut self,
        tip: &BlockHash,
        alerts: &AlertSink,
    ) -> Result<(usize, Option<BlockHash>), AuditError> {
        let replica = self.controller.replica();
        let max_blocks = self.controller.config().audit_max_blocks as u64;
        let tolerance = self.controller.config().inflation_tolerance;

        // Plan the walk under a read lock: tip, then parents, until the
        // previous snapshot or the bound
        let (blocks, exceeded_at) = {
            let graph = self.controller.graph().read().await;
            let tip_block = graph.get(tip).ok_or(GraphError::UnknownBlock { hash: *tip })?;
            let mut blocks = vec![(tip_block.hash, tip_block.height, tip_block.parent)];
            let mut comparison = tip_block;
            let mut exceeded_at = None;
            loop {
                if tip_block.height - comparison.height >= max_blocks {
                    exceeded_at = Some(comparison.hash);
                    break;
                }
                let parent_hash = comparison
                    .parent
                    .ok_or(AuditError::MissingIntermediateBlock { tip: *tip })?;
                let parent = graph
                    .get(&parent_hash)
                    .ok_or(AuditError::MissingIntermediateBlock { tip: *tip })?;
                comparison = parent;
                if self.snapshots.get(replica, &parent_hash).is_some() {
                    break;
                }
                blocks.insert(0, (parent.hash, parent.height, parent.parent));
            }
            (blocks, exceeded_at)
        };

        let rpc = self.controller.rpc().clone();
        let mut checked = 0;
        for (hash, height, parent) in blocks {
            let session = self.controller.roll_back_to(&hash).await?;
            info!(%hash, height, "measure utxo set totals");
            let totals = rpc.get_tx_out_set_info().await?;
            self.controller.undo_rollback(session).await?;

            if totals.best_block != hash {
                return Err(AuditError::UnexpectedBestBlock {
                    expected: hash,
                    got: totals.best_block,
                });
            }
            self.snapshots.insert(
                replica,
                InflationSnapshot {
                    block: hash,
                    height,
                    tx_outs: totals.tx_outs,
                    total_amount: totals.total_amount,
                    inflated: false,
                },
            );
            checked += 1;

            let Some(parent_hash) = parent else {
                continue;
            };
            let Some(previous) = self.snapshots.get(replica, &parent_hash) else {
                debug!(height, "no previous totals to compare against");
                continue;
            };
            let delta = totals.total_amount.saturating_sub(previous.total_amount);
            let ceiling = params::max_issuance(height);
            if delta > ceiling + tolerance {
                self.snapshots.set_inflated(replica, &hash);
                alerts.raise(Finding::Inflation {
                    replica,
                    block: hash,
                    height,
                    max_issuance: ceiling,
                    observed: delta,
                });
            }
        }
        Ok((checked, exceeded_at))
    }

    /// Leave the mirror usable no matter how the audit went.
    async fn cleanup(&self) {
        let rpc = self.controller.rpc();
        if let Err(e) = rpc.set_network_active(true).await {
            warn!(error = %e, "failed to re-enable mirror networking");
        }
        match rpc.get_chain_tips().await {
            Ok(tips) => {
                for tip in tips.iter().filter(|t| t.status == forkscout_common::TipStatus::Invalid)
                {
                    if let Err(e) = rpc.reconsider_block(&tip.hash).await {
                        warn!(hash = %tip.hash, error = %e, "failed to reconsider chaintip");
                    }
                    sleep(Duration::from_millis(
                        self.controller.config().reconsider_delay_ms,
                    ))
                    .await;
                }
            }
            Err(e) => warn!(error = %e, "failed to list chaintips during restore"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_config, MirrorConfig};
    use forkscout_common::params::COIN;
    use forkscout_common::{BlockData, ChainWork};
    use forkscout_graph::BlockGraph;
    use forkscout_test_utils::{hash, MockReplica};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn data(n: u8, height: u64, parent: Option<u8>) -> BlockData {
        BlockData {
            hash: hash(n),
            height,
            previous_block_hash: parent.map(hash),
            chain_work: Some(ChainWork::from(height + 1)),
            time: 1_600_000_000 + height,
            median_time: None,
            version: 0x2000_0000,
            tx_count: 1,
            size: 250,
            transactions: None,
        }
    }

    fn chain_setup(len: u8) -> (Arc<RwLock<BlockGraph>>, Arc<MockReplica>) {
        let mut graph = BlockGraph::new(100);
        let mirror = MockReplica::new();
        graph.upsert_block(&data(1, 100, None), None).unwrap();
        for i in 2..=len {
            graph.upsert_block(&data(i, 100 + i as u64 - 1, Some(i - 1)), None).unwrap();
        }
        mirror.extend_chain(100, len);
        (Arc::new(RwLock::new(graph)), Arc::new(mirror))
    }

    fn auditor_with(
        config: MirrorConfig,
        graph: Arc<RwLock<BlockGraph>>,
        mirror: Arc<MockReplica>,
    ) -> InflationAuditor {
        InflationAuditor::new(MirrorRollbackController::new(
            config,
            graph,
            mirror,
            forkscout_common::ReplicaId(9),
        ))
    }

    fn seed(auditor: &mut InflationAuditor, n: u8, height: u64, total: u64) {
        auditor.snapshots_mut().insert(
            forkscout_common::ReplicaId(9),
            InflationSnapshot {
                block: hash(n),
                height,
                tx_outs: height,
                total_amount: total,
                inflated: false,
            },
        );
    }

    #[tokio::test]
    async fn exact_subsidy_raises_nothing() {
        let (graph, mirror) = chain_setup(3);
        let base = 1_000 * COIN;
        mirror.set_supply(&hash(2), base + 50 * COIN);
        mirror.set_supply(&hash(3), base + 100 * COIN);
        let mut auditor = auditor_with(test_config(), graph, mirror.clone());
        seed(&mut auditor, 1, 100, base);

        let alerts = AlertSink::new();
        let mut rx = alerts.subscribe();
        let outcome = auditor.check(&alerts).await.unwrap();

        assert_eq!(outcome, AuditOutcome::Completed { checked: 2 });
        assert!(rx.try_recv().is_err());
        assert!(mirror.network_active());
        assert!(mirror.invalidated().is_empty());
    }

    #[tokio::test]
    async fn excess_issuance_raises_exactly_one_finding() {
        let (graph, mirror) = chain_setup(3);
        let base = 1_000 * COIN;
        mirror.set_supply(&hash(2), base + 50 * COIN);
        mirror.set_supply(&hash(3), base + 100 * COIN + 5);
        let mut auditor = auditor_with(test_config(), graph, mirror.clone());
        seed(&mut auditor, 1, 100, base);

        let alerts = AlertSink::new();
        let mut rx = alerts.subscribe();
        auditor.check(&alerts).await.unwrap();

        match rx.try_recv().unwrap() {
            Finding::Inflation { block, observed, max_issuance, .. } => {
                assert_eq!(block, hash(3));
                assert_eq!(observed, 50 * COIN + 5);
                assert_eq!(max_issuance, 50 * COIN);
            }
            other => panic!("expected inflation finding, got {other:?}"),
        }
        assert!(auditor.snapshots().get(forkscout_common::ReplicaId(9), &hash(3)).unwrap().inflated);

        // Tip already audited: no re-measurement, no duplicate finding
        let outcome = auditor.check(&alerts).await.unwrap();
        assert_eq!(outcome, AuditOutcome::AlreadyChecked);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bounded_walk_errors_but_still_measures() {
        let (graph, mirror) = chain_setup(5);
        let mut auditor = auditor_with(test_config(), graph, mirror.clone());

        let alerts = AlertSink::new();
        let err = auditor.check(&alerts).await.unwrap_err();

        match err {
            AuditError::TooFarBehind { behind, max } => {
                assert_eq!(behind, hash(3));
                assert_eq!(max, 2);
            }
            other => panic!("expected TooFarBehind, got {other:?}"),
        }
        // The collected blocks were measured before the error surfaced
        assert_eq!(auditor.snapshots().len(), 3);
        assert!(mirror.network_active());
        assert!(mirror.invalidated().is_empty());
    }

    #[tokio::test]
    async fn failed_rollback_restores_mirror_and_rests() {
        // Graph knows 1-2-3 but the mirror is missing block 2, so rolling
        // back to it can never converge
        let mut graph = BlockGraph::new(100);
        graph.upsert_block(&data(1, 100, None), None).unwrap();
        graph.upsert_block(&data(2, 101, Some(1)), None).unwrap();
        graph.upsert_block(&data(3, 102, Some(2)), None).unwrap();
        let mirror = MockReplica::new();
        mirror.add_block(1, 100, None);
        mirror.add_block(3, 102, Some(2));
        let mirror = Arc::new(mirror);

        let config = MirrorConfig {
            rest_secs: 60,
            ..test_config()
        };
        let mut auditor = auditor_with(config, Arc::new(RwLock::new(graph)), mirror.clone());
        seed(&mut auditor, 1, 100, 1_000 * COIN);

        let alerts = AlertSink::new();
        let err = auditor.check(&alerts).await.unwrap_err();
        assert!(matches!(err, AuditError::Rollback(RollbackError::Stuck { .. })));

        // Guaranteed cleanup and a rest period before the next attempt
        assert!(mirror.network_active());
        assert!(mirror.invalidated().is_empty());
        assert_eq!(auditor.check(&alerts).await.unwrap(), AuditOutcome::Resting);
    }
}
