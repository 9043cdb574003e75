//! Chaintip reconciler: folds every replica's advertised chain tips into
//! one linked record set over the shared block graph, and raises a finding
//! when replicas disagree about a block's validity.

mod tip_set;

pub use tip_set::{ChaintipRecord, TipSet};

use anyhow::Result;
use config::Config;
use forkscout_common::alerts::{AlertSink, Finding};
use forkscout_common::messages::{ReportStatus, TipReport};
use forkscout_common::{BlockVerbosity, ReplicaSpec, RpcError, TipInfo, TipStatus};
use forkscout_graph::{resolve_ancestors, BlockGraph, GraphError, MarkAs};
use tracing::{info_span, warn};
use tracing::Instrument;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReconcilerConfig {
    /// Valid-fork tips more than this far below a replica's active tip are
    /// ignored entirely.
    pub fork_depth_window: u64,
}

impl ReconcilerConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }
}

pub struct ChaintipReconciler {
    config: ReconcilerConfig,
    tips: TipSet,
}

impl ChaintipReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            tips: TipSet::new(),
        }
    }

    pub fn tip_set(&self) -> &TipSet {
        &self.tips
    }

    /// One reconciliation pass. The caller holds the graph writer lock for
    /// the duration; replica fetches for unknown ancestors are the only
    /// suspension points.
    pub async fn reconcile(
        &mut self,
        graph: &mut BlockGraph,
        reports: &[TipReport],
        alerts: &AlertSink,
    ) -> Result<()> {
        let span = info_span!("reconcile", replicas = reports.len());
        async {
            // Stale fork and invalid records never survive a pass
            for report in reports {
                let drop_all = !matches!(report.status, ReportStatus::Tips(_));
                self.tips.purge(report.replica.id, drop_all);
            }

            let fleet: Vec<ReplicaSpec> = reports.iter().map(|r| r.replica.clone()).collect();
            for report in reports {
                if let ReportStatus::Tips(tips) = &report.status {
                    if let Err(e) = self.apply_report(graph, report, tips).await {
                        match e {
                            GraphError::Rpc(rpc_err) => {
                                warn!(replica = %report.replica.id, error = %rpc_err,
                                      "tip set partially applied");
                            }
                            fatal => return Err(fatal.into()),
                        }
                    }
                }
            }

            let active_ids: Vec<u64> = fleet
                .iter()
                .filter_map(|spec| self.tips.active_of(spec.id).map(|r| r.id))
                .collect();
            for id in active_ids {
                self.tips.match_children(id, graph, &fleet);
                // Newly matched children must not consider their parent's
                // chain invalid
                self.tips.check_parent(id, graph);
                self.tips.match_parent(id, graph, &fleet);
            }

            let fleet_ids: Vec<_> = fleet.iter().map(|s| s.id).collect();
            self.tips.retain_replicas(&fleet_ids);

            self.raise_invalid_block_findings(graph, alerts);
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn apply_report(
        &mut self,
        graph: &mut BlockGraph,
        report: &TipReport,
        tips: &[TipInfo],
    ) -> Result<(), GraphError> {
        let replica = report.replica.id;
        let active_height = tips
            .iter()
            .find(|t| t.status == TipStatus::Active)
            .map(|t| t.height);

        for tip in tips {
            match tip.status {
                TipStatus::Active => {
                    // The block may have arrived between poll and report;
                    // if we have not seen it yet, pick it up next pass
                    if graph.contains(&tip.hash) {
                        graph.mark_valid(&tip.hash, replica)?;
                        self.tips.set_active(replica, tip.hash, tip.height);
                    }
                }
                TipStatus::ValidFork => {
                    if let Some(active) = active_height {
                        if tip.height + self.config.fork_depth_window < active {
                            continue;
                        }
                    }
                    if !graph.contains(&tip.hash) {
                        let data = report.rpc.get_block(&tip.hash, BlockVerbosity::Summary).await?;
                        graph.upsert_block(&data, Some(replica))?;
                    }
                    resolve_ancestors(
                        graph,
                        report.rpc.as_ref(),
                        replica,
                        tip.hash,
                        None,
                        Some(MarkAs::Valid),
                    )
                    .await?;
                    self.tips.add_tip(replica, tip.hash, tip.height, TipStatus::ValidFork);
                }
                TipStatus::ValidHeaders | TipStatus::HeadersOnly => {
                    if !graph.contains(&tip.hash) && tip.height >= graph.min_retained_height() {
                        match report.rpc.get_block_header(&tip.hash).await {
                            Ok(header) => {
                                graph.insert_headers_only(&header, Some(replica))?;
                            }
                            Err(e) => {
                                warn!(replica = %replica, hash = %tip.hash, error = %e,
                                      "header tip not recorded");
                            }
                        }
                    }
                }
                TipStatus::Invalid => {
                    if !graph.contains(&tip.hash) {
                        match report.rpc.get_block(&tip.hash, BlockVerbosity::Summary).await {
                            Ok(data) => {
                                graph.upsert_block(&data, Some(replica))?;
                            }
                            Err(RpcError::BlockPruned) => {
                                let header = report.rpc.get_block_header(&tip.hash).await?;
                                graph.insert_headers_only(&header, Some(replica))?;
                                graph.mark_pruned(&tip.hash)?;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    resolve_ancestors(graph, report.rpc.as_ref(), replica, tip.hash, None, None)
                        .await?;
                    graph.mark_invalid(&tip.hash, replica)?;
                    self.tips.add_tip(replica, tip.hash, tip.height, TipStatus::Invalid);
                }
            }
        }
        Ok(())
    }

    /// A block some replicas accepted and others rejected is the headline
    /// divergence signal. One finding per block, ever.
    fn raise_invalid_block_findings(&self, graph: &BlockGraph, alerts: &AlertSink) {
        for block in graph.iter() {
            if !block.marked_valid_by.is_empty() && !block.marked_invalid_by.is_empty() {
                alerts.raise(Finding::InvalidBlock {
                    block: block.hash,
                    height: block.height,
                    valid_by: block.marked_valid_by.iter().copied().collect(),
                    invalid_by: block.marked_invalid_by.iter().copied().collect(),
                });
            }
        }
    }
}
