//! 'main' for the Forkscout monitor process: polls the replica fleet,
//! reconciles chaintips, analyzes stale races and audits coin supply on a
//! mirror replica.

use anyhow::Result;
use clap::Parser;
use config::{Config, Environment, File};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use forkscout_common::alerts::AlertSink;
use forkscout_common::messages::{ReportStatus, TipReport};
use forkscout_common::{ClientKind, ReplicaId, ReplicaRpc, ReplicaSpec};
use forkscout_graph::BlockGraph;
use forkscout_module_chaintip_reconciler::{ChaintipReconciler, ReconcilerConfig};
use forkscout_module_mirror_rollback::{InflationAuditor, MirrorConfig, MirrorRollbackController};
use forkscout_module_replica_poller::{PollerConfig, ReplicaPoller};
use forkscout_module_replica_rpc::{RpcClient, RpcSettings};
use forkscout_module_stale_analyzer::{StaleCandidateAnalyzer, StaleConfig};

#[derive(Parser)]
#[command(name = "forkscout-monitor", about = "Consensus monitor for a replica fleet")]
struct Args {
    /// Configuration file name, without extension
    #[arg(long, default_value = "monitor")]
    config: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ReplicaSettings {
    id: u32,
    name: String,
    client: ClientKind,
    version: u64,
    #[serde(default)]
    mirror: bool,
    #[serde(flatten)]
    rpc: RpcSettings,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MonitorSettings {
    /// Height below which history is never retained in the graph.
    #[serde(default)]
    min_retained_height: u64,
    #[serde(default = "default_reconcile_interval_ms")]
    reconcile_interval_ms: u64,
    #[serde(default = "default_audit_interval_secs")]
    audit_interval_secs: u64,
    replicas: Vec<ReplicaSettings>,
}

fn default_reconcile_interval_ms() -> u64 {
    10_000
}

fn default_audit_interval_secs() -> u64 {
    300
}

/// Extract one module's configuration table as a standalone Config so the
/// module can layer it over its own defaults.
fn scoped(config: &Config, key: &str) -> Result<Config> {
    let table = config.get_table(key).unwrap_or_default();
    let mut builder = Config::builder();
    for (name, value) in table {
        builder = builder.set_override(name, value)?;
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Standard logging using RUST_LOG for log levels
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());
    Registry::default().with(fmt_layer).init();

    info!("Forkscout monitor process");

    let config = Config::builder()
        .add_source(File::with_name(&args.config))
        .add_source(Environment::with_prefix("FORKSCOUT"))
        .build()?;
    let settings: MonitorSettings = config.clone().try_deserialize()?;

    let graph = Arc::new(RwLock::new(BlockGraph::new(settings.min_retained_height)));
    let alerts = Arc::new(AlertSink::new());

    let mut fleet: Vec<(ReplicaSpec, Arc<dyn ReplicaRpc>)> = Vec::new();
    let mut mirror: Option<(ReplicaSpec, Arc<dyn ReplicaRpc>)> = None;
    for replica in &settings.replicas {
        let spec = ReplicaSpec {
            id: ReplicaId(replica.id),
            name: replica.name.clone(),
            client: replica.client,
            version: replica.version,
            mirror: replica.mirror,
        };
        let rpc: Arc<dyn ReplicaRpc> = Arc::new(RpcClient::new(replica.rpc.clone())?);
        info!(replica = %spec.id, name = %spec.name, mirror = spec.mirror, "configured replica");
        if spec.mirror {
            mirror = Some((spec, rpc));
        } else {
            fleet.push((spec, rpc));
        }
    }

    let poller = Arc::new(ReplicaPoller::new(
        PollerConfig::try_load(&scoped(&config, "poller")?)?,
        Arc::clone(&graph),
        Arc::clone(&alerts),
    ));
    let (report_tx, report_rx) = mpsc::channel(64);
    let mut tasks = poller.spawn(fleet, report_tx);

    let reconciler =
        ChaintipReconciler::new(ReconcilerConfig::try_load(&scoped(&config, "reconciler")?)?);
    let analyzer =
        StaleCandidateAnalyzer::new(StaleConfig::try_load(&scoped(&config, "stale")?)?);
    tasks.push(tokio::spawn(reconcile_loop(
        reconciler,
        analyzer,
        Arc::clone(&graph),
        Arc::clone(&alerts),
        report_rx,
        Duration::from_millis(settings.reconcile_interval_ms),
    )));

    match mirror {
        Some((spec, rpc)) => {
            let controller = MirrorRollbackController::new(
                MirrorConfig::try_load(&scoped(&config, "mirror")?)?,
                Arc::clone(&graph),
                rpc,
                spec.id,
            );
            tasks.push(tokio::spawn(audit_loop(
                InflationAuditor::new(controller),
                Arc::clone(&alerts),
                Duration::from_secs(settings.audit_interval_secs),
            )));
        }
        None => info!("no mirror replica configured, supply audits disabled"),
    }

    signal::ctrl_c().await?;
    info!("shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

/// Collect the freshest report per replica and run a reconciliation pass on
/// an interval. Stale analysis piggybacks on the same pass cadence.
async fn reconcile_loop(
    mut reconciler: ChaintipReconciler,
    mut analyzer: StaleCandidateAnalyzer,
    graph: Arc<RwLock<BlockGraph>>,
    alerts: Arc<AlertSink>,
    mut reports: mpsc::Receiver<TipReport>,
    interval: Duration,
) {
    let mut latest: HashMap<ReplicaId, TipReport> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            report = reports.recv() => match report {
                Some(report) => {
                    latest.insert(report.replica.id, report);
                }
                None => break,
            },
            _ = ticker.tick() => {
                let snapshot: Vec<TipReport> = latest.values().cloned().collect();
                if snapshot.is_empty() {
                    continue;
                }
                {
                    let mut graph = graph.write().await;
                    if let Err(e) = reconciler.reconcile(&mut graph, &snapshot, &alerts).await {
                        error!(error = %e, "reconciliation pass failed");
                        continue;
                    }
                    analyzer.scan(&graph, &alerts);
                }
                // Transaction bodies can come from any replica that answered
                let fetch_rpc = snapshot
                    .iter()
                    .find(|r| matches!(r.status, ReportStatus::Tips(_)))
                    .map(|r| Arc::clone(&r.rpc));
                if let Some(rpc) = fetch_rpc {
                    let mut graph = graph.write().await;
                    analyzer.fetch_transactions(&mut graph, rpc.as_ref()).await;
                    analyzer.process(&graph);
                }
            }
        }
    }
}

async fn audit_loop(mut auditor: InflationAuditor, alerts: Arc<AlertSink>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match auditor.check(&alerts).await {
            Ok(outcome) => debug!(?outcome, "supply audit pass"),
            Err(e) => error!(error = %e, "supply audit failed"),
        }
    }
}
