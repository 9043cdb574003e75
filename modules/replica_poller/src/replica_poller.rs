//! Per-replica polling tasks. Each fleet replica gets its own task that
//! periodically fetches its chain state, keeps the shared graph current and
//! sends a [`TipReport`] to the reconciliation loop.

use anyhow::{Context, Result};
use config::Config;
use forkscout_common::alerts::{AlertSink, Finding};
use forkscout_common::messages::{ReportStatus, TipReport};
use forkscout_common::{BlockVerbosity, ChainWork, ReplicaId, ReplicaRpc, ReplicaSpec};
use forkscout_graph::{stage_ancestors, BlockGraph};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PollerConfig {
    /// Pause between polls of one replica.
    pub poll_interval_ms: u64,
    /// Consecutive polls a replica may trail the fleet's best work before a
    /// lag finding is raised.
    pub lag_grace_polls: u32,
}

impl PollerConfig {
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

/// Last observed tip per replica plus how long each has trailed the fleet.
#[derive(Default)]
struct LagTracker {
    tips: HashMap<ReplicaId, (ChainWork, u64)>,
    behind_polls: HashMap<ReplicaId, u32>,
}

impl LagTracker {
    fn forget(&mut self, replica: ReplicaId) {
        self.tips.remove(&replica);
        self.behind_polls.remove(&replica);
    }

    /// Record a replica's tip and decide whether it is lagging. Cumulative
    /// work decides, not height: a lower tip with more work is ahead.
    fn observe(
        &mut self,
        replica: ReplicaId,
        work: ChainWork,
        height: u64,
        grace: u32,
    ) -> LagState {
        self.tips.insert(replica, (work.clone(), height));
        let best = self
            .tips
            .values()
            .max_by(|a, b| a.0.cmp(&b.0))
            .cloned()
            .unwrap_or((ChainWork::zero(), 0));
        if work >= best.0 {
            self.behind_polls.remove(&replica);
            return LagState::CaughtUp;
        }
        let polls = self.behind_polls.entry(replica).or_insert(0);
        *polls += 1;
        if *polls > grace {
            LagState::Lagging {
                height,
                best_height: best.1,
            }
        } else {
            LagState::WithinGrace
        }
    }
}

enum LagState {
    CaughtUp,
    WithinGrace,
    Lagging { height: u64, best_height: u64 },
}

/// Spawns and runs the fleet polling tasks.
pub struct ReplicaPoller {
    config: PollerConfig,
    graph: Arc<RwLock<BlockGraph>>,
    alerts: Arc<AlertSink>,
    lag: Mutex<LagTracker>,
}

impl ReplicaPoller {
    pub fn new(
        config: PollerConfig,
        graph: Arc<RwLock<BlockGraph>>,
        alerts: Arc<AlertSink>,
    ) -> Self {
        Self {
            config,
            graph,
            alerts,
            lag: Mutex::new(LagTracker::default()),
        }
    }

    /// One polling task per non-mirror replica. Tasks stop when the report
    /// channel closes.
    pub fn spawn(
        self: &Arc<Self>,
        fleet: Vec<(ReplicaSpec, Arc<dyn ReplicaRpc>)>,
        reports: mpsc::Sender<TipReport>,
    ) -> Vec<JoinHandle<()>> {
        fleet
            .into_iter()
            .filter(|(spec, _)| !spec.mirror)
            .map(|(spec, rpc)| {
                let poller = Arc::clone(self);
                let reports = reports.clone();
                tokio::spawn(async move {
                    info!(replica = %spec.id, name = %spec.name, "polling task started");
                    let mut interval =
                        tokio::time::interval(Duration::from_millis(poller.config.poll_interval_ms));
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        if poller.poll_once(&spec, &rpc, &reports).await.is_err() {
                            debug!(replica = %spec.id, "report channel closed, stopping");
                            break;
                        }
                    }
                })
            })
            .collect()
    }

    /// One poll of one replica. Errs only when the report channel is closed.
    pub async fn poll_once(
        &self,
        spec: &ReplicaSpec,
        rpc: &Arc<dyn ReplicaRpc>,
        reports: &mpsc::Sender<TipReport>,
    ) -> Result<()> {
        let status = match rpc.get_blockchain_info().await {
            Ok(status) => status,
            Err(e) => {
                warn!(replica = %spec.id, error = %e, "replica poll failed");
                self.lock_lag().forget(spec.id);
                self.alerts
                    .raise(Finding::ReplicaUnreachable { replica: spec.id });
                return self
                    .send(reports, spec, rpc, ReportStatus::Unreachable)
                    .await;
            }
        };
        if status.initial_block_download {
            debug!(replica = %spec.id, "replica in initial block download");
            self.alerts.clear_unreachable(spec.id);
            self.lock_lag().forget(spec.id);
            return self
                .send(reports, spec, rpc, ReportStatus::InitialBlockDownload)
                .await;
        }

        // Stage the best block and its missing ancestors before taking the
        // writer; a slow replica must not stall the other pollers
        if !self.graph.read().await.contains(&status.best_block_hash) {
            match rpc.get_block(&status.best_block_hash, BlockVerbosity::Summary).await {
                Ok(data) => match stage_ancestors(&self.graph, rpc.as_ref(), &data).await {
                    Ok(staged) => {
                        let mut graph = self.graph.write().await;
                        if let Err(e) = staged.apply(&mut graph, spec.id) {
                            warn!(replica = %spec.id, error = %e, "failed to record best block");
                        }
                    }
                    Err(e) => {
                        warn!(replica = %spec.id, error = %e, "failed to resolve ancestors")
                    }
                },
                Err(e) => {
                    warn!(replica = %spec.id, error = %e, "failed to fetch best block")
                }
            }
        }

        let lag_state = self.lock_lag().observe(
            spec.id,
            status.chain_work.clone(),
            status.blocks,
            self.config.lag_grace_polls,
        );
        match lag_state {
            LagState::Lagging { height, best_height } => {
                self.alerts.raise(Finding::ReplicaLagging {
                    replica: spec.id,
                    height,
                    best_height,
                });
            }
            LagState::CaughtUp => self.alerts.clear_lagging(spec.id),
            LagState::WithinGrace => {}
        }

        match rpc.get_chain_tips().await {
            Ok(tips) => {
                self.alerts.clear_unreachable(spec.id);
                self.send(reports, spec, rpc, ReportStatus::Tips(tips)).await
            }
            Err(e) => {
                // Half-answering still means the reconciler drops this
                // replica's records; alert like a full outage
                warn!(replica = %spec.id, error = %e, "failed to fetch chaintips");
                self.lock_lag().forget(spec.id);
                self.alerts
                    .raise(Finding::ReplicaUnreachable { replica: spec.id });
                self.send(reports, spec, rpc, ReportStatus::Unreachable).await
            }
        }
    }

    async fn send(
        &self,
        reports: &mpsc::Sender<TipReport>,
        spec: &ReplicaSpec,
        rpc: &Arc<dyn ReplicaRpc>,
        status: ReportStatus,
    ) -> Result<()> {
        reports
            .send(TipReport {
                replica: spec.clone(),
                rpc: Arc::clone(rpc),
                status,
            })
            .await
            .context("report channel closed")
    }

    fn lock_lag(&self) -> std::sync::MutexGuard<'_, LagTracker> {
        match self.lag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkscout_common::ClientKind;
    use forkscout_test_utils::{hash, MockReplica};

    fn test_config() -> PollerConfig {
        PollerConfig {
            poll_interval_ms: 0,
            lag_grace_polls: 2,
        }
    }

    fn spec(id: u32, name: &str) -> ReplicaSpec {
        ReplicaSpec {
            id: ReplicaId(id),
            name: name.to_string(),
            client: ClientKind::Core,
            version: 270_000,
            mirror: false,
        }
    }

    fn poller() -> (Arc<ReplicaPoller>, Arc<RwLock<BlockGraph>>, Arc<AlertSink>) {
        let graph = Arc::new(RwLock::new(BlockGraph::new(100)));
        let alerts = Arc::new(AlertSink::new());
        let poller = Arc::new(ReplicaPoller::new(
            test_config(),
            Arc::clone(&graph),
            Arc::clone(&alerts),
        ));
        (poller, graph, alerts)
    }

    #[tokio::test]
    async fn poll_records_best_block_and_reports_tips() {
        let (poller, graph, _alerts) = poller();
        let replica = MockReplica::new();
        replica.extend_chain(100, 3);
        let rpc: Arc<dyn ReplicaRpc> = Arc::new(replica);
        let (tx, mut rx) = mpsc::channel(4);

        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();

        let report = rx.try_recv().unwrap();
        assert!(matches!(report.status, ReportStatus::Tips(ref tips) if tips.len() == 1));
        let graph = graph.read().await;
        assert!(graph.contains(&hash(3)));
        assert!(graph.contains(&hash(1)));
        assert!(graph.get(&hash(3)).unwrap().connected);
    }

    #[tokio::test]
    async fn unreachable_replica_is_reported_and_recovery_rearms_the_alert() {
        let (poller, _graph, alerts) = poller();
        let replica = Arc::new(MockReplica::new());
        replica.extend_chain(100, 2);
        replica.set_reachable(false);
        let rpc: Arc<dyn ReplicaRpc> = replica.clone();
        let (tx, mut rx) = mpsc::channel(8);
        let mut findings = alerts.subscribe();

        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap().status, ReportStatus::Unreachable));
        assert!(matches!(
            findings.try_recv().unwrap(),
            Finding::ReplicaUnreachable { replica } if replica == ReplicaId(1)
        ));
        // Repeat failure is not re-raised
        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();
        assert!(findings.try_recv().is_err());

        // Recovery, then a relapse alerts again
        replica.set_reachable(true);
        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap().status, ReportStatus::Unreachable));
        assert!(matches!(rx.try_recv().unwrap().status, ReportStatus::Tips(_)));
        replica.set_reachable(false);
        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();
        assert!(matches!(
            findings.try_recv().unwrap(),
            Finding::ReplicaUnreachable { .. }
        ));
    }

    #[tokio::test]
    async fn chaintip_failure_after_healthy_info_still_alerts() {
        let (poller, _graph, alerts) = poller();
        let replica = Arc::new(MockReplica::new());
        replica.extend_chain(100, 2);
        replica.set_tips_failing(true);
        let rpc: Arc<dyn ReplicaRpc> = replica.clone();
        let (tx, mut rx) = mpsc::channel(8);
        let mut findings = alerts.subscribe();

        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap().status, ReportStatus::Unreachable));
        assert!(matches!(
            findings.try_recv().unwrap(),
            Finding::ReplicaUnreachable { replica } if replica == ReplicaId(1)
        ));

        // Deduplicated while the failure persists
        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();
        assert!(findings.try_recv().is_err());

        // Recovery clears the alert state
        replica.set_tips_failing(false);
        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap().status, ReportStatus::Unreachable));
        assert!(matches!(rx.try_recv().unwrap().status, ReportStatus::Tips(_)));
    }

    #[tokio::test]
    async fn syncing_replica_reports_without_touching_the_graph() {
        let (poller, graph, _alerts) = poller();
        let replica = MockReplica::new();
        replica.extend_chain(100, 2);
        replica.set_initial_block_download(true);
        let rpc: Arc<dyn ReplicaRpc> = Arc::new(replica);
        let (tx, mut rx) = mpsc::channel(4);

        poller.poll_once(&spec(1, "alpha"), &rpc, &tx).await.unwrap();

        assert!(matches!(
            rx.try_recv().unwrap().status,
            ReportStatus::InitialBlockDownload
        ));
        assert!(graph.read().await.is_empty());
    }

    #[tokio::test]
    async fn trailing_work_past_grace_raises_a_lag_finding() {
        let (poller, _graph, alerts) = poller();
        let ahead = MockReplica::new();
        ahead.extend_chain(100, 3);
        // Same height but less cumulative work
        let behind = MockReplica::new();
        behind.add_block(1, 100, None);
        behind.add_block(2, 101, Some(1));
        behind.add_block_weighted(9, 102, Some(2), 102);
        let ahead: Arc<dyn ReplicaRpc> = Arc::new(ahead);
        let behind: Arc<dyn ReplicaRpc> = Arc::new(behind);
        let (tx, _rx) = mpsc::channel(32);
        let mut findings = alerts.subscribe();

        poller.poll_once(&spec(1, "alpha"), &ahead, &tx).await.unwrap();
        poller.poll_once(&spec(2, "beta"), &behind, &tx).await.unwrap();
        poller.poll_once(&spec(2, "beta"), &behind, &tx).await.unwrap();
        assert!(findings.try_recv().is_err());

        poller.poll_once(&spec(2, "beta"), &behind, &tx).await.unwrap();
        assert!(matches!(
            findings.try_recv().unwrap(),
            Finding::ReplicaLagging { replica, height: 102, best_height: 102 }
                if replica == ReplicaId(2)
        ));
    }

    #[tokio::test]
    async fn catching_up_clears_the_lag_state() {
        let (poller, _graph, alerts) = poller();
        let ahead = Arc::new(MockReplica::new());
        ahead.extend_chain(100, 3);
        let behind = Arc::new(MockReplica::new());
        behind.extend_chain(100, 2);
        let ahead_rpc: Arc<dyn ReplicaRpc> = ahead.clone();
        let behind_rpc: Arc<dyn ReplicaRpc> = behind.clone();
        let (tx, _rx) = mpsc::channel(32);
        let mut findings = alerts.subscribe();

        poller.poll_once(&spec(1, "alpha"), &ahead_rpc, &tx).await.unwrap();
        for _ in 0..3 {
            poller.poll_once(&spec(2, "beta"), &behind_rpc, &tx).await.unwrap();
        }
        assert!(matches!(
            findings.try_recv().unwrap(),
            Finding::ReplicaLagging { .. }
        ));

        // Catch up past the leader, then fall behind again
        behind.add_block_weighted(3, 102, Some(2), 104);
        poller.poll_once(&spec(2, "beta"), &behind_rpc, &tx).await.unwrap();
        assert!(findings.try_recv().is_err());

        ahead.add_block_weighted(4, 103, Some(3), 110);
        poller.poll_once(&spec(1, "alpha"), &ahead_rpc, &tx).await.unwrap();
        for _ in 0..3 {
            poller.poll_once(&spec(2, "beta"), &behind_rpc, &tx).await.unwrap();
        }
        assert!(matches!(
            findings.try_recv().unwrap(),
            Finding::ReplicaLagging { .. }
        ));
    }
}
