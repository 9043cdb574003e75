//! Messages passed from the per-replica pollers to the reconciliation loop.

use crate::rpc::ReplicaRpc;
use crate::types::{ReplicaSpec, TipInfo};
use std::sync::Arc;

/// Outcome of one poll of one replica.
#[derive(Clone)]
pub enum ReportStatus {
    /// The replica answered; these are its advertised chain tips.
    Tips(Vec<TipInfo>),
    /// The replica could not be reached.
    Unreachable,
    /// The replica is still syncing; its tips are not meaningful.
    InitialBlockDownload,
}

/// Everything a reconciliation pass needs to know about one replica,
/// including the RPC handle for ancestor fetches during the pass.
#[derive(Clone)]
pub struct TipReport {
    pub replica: ReplicaSpec,
    pub rpc: Arc<dyn ReplicaRpc>,
    pub status: ReportStatus,
}
