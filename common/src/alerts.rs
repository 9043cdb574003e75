//! Consensus-divergence findings and their de-duplicated fan-out.

use crate::byte_array::BlockHash;
use crate::types::ReplicaId;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

/// A finding raised for downstream alerting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// Some replicas accepted a block others rejected.
    InvalidBlock {
        block: BlockHash,
        height: u64,
        valid_by: Vec<ReplicaId>,
        invalid_by: Vec<ReplicaId>,
    },
    /// Supply grew past the subsidy ceiling at this block.
    Inflation {
        replica: ReplicaId,
        block: BlockHash,
        height: u64,
        max_issuance: u64,
        observed: u64,
    },
    /// More than one block contends for the same height near the tip.
    StaleCandidate { height: u64, branch_count: usize },
    /// A replica's tip work stayed below the fleet's best past the grace
    /// window.
    ReplicaLagging {
        replica: ReplicaId,
        height: u64,
        best_height: u64,
    },
    ReplicaUnreachable { replica: ReplicaId },
}

/// Identity under which repeat findings are suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FindingKey {
    InvalidBlock(BlockHash),
    Inflation(BlockHash),
    Stale(u64),
    Lagging(ReplicaId),
    Unreachable(ReplicaId),
}

impl Finding {
    fn key(&self) -> FindingKey {
        match self {
            Finding::InvalidBlock { block, .. } => FindingKey::InvalidBlock(*block),
            Finding::Inflation { block, .. } => FindingKey::Inflation(*block),
            Finding::StaleCandidate { height, .. } => FindingKey::Stale(*height),
            Finding::ReplicaLagging { replica, .. } => FindingKey::Lagging(*replica),
            Finding::ReplicaUnreachable { replica } => FindingKey::Unreachable(*replica),
        }
    }
}

/// Fan-out point for findings. Each distinct finding is delivered once for
/// the life of the process; recoverable conditions (lag, unreachability)
/// can be cleared so a relapse alerts again.
pub struct AlertSink {
    seen: Mutex<HashSet<FindingKey>>,
    tx: broadcast::Sender<Finding>,
}

impl AlertSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            seen: Mutex::new(HashSet::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Finding> {
        self.tx.subscribe()
    }

    /// Raise a finding. Returns false if it was already raised.
    pub fn raise(&self, finding: Finding) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !seen.insert(finding.key()) {
            return false;
        }
        warn!(?finding, "consensus divergence finding");
        // No subscribers is fine; findings are also logged above
        let _ = self.tx.send(finding);
        true
    }

    /// Forget a recovered replica condition so it can fire again.
    pub fn clear_lagging(&self, replica: ReplicaId) {
        self.clear(FindingKey::Lagging(replica));
    }

    pub fn clear_unreachable(&self, replica: ReplicaId) {
        self.clear(FindingKey::Unreachable(replica));
    }

    fn clear(&self, key: FindingKey) {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.remove(&key);
    }
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> BlockHash {
        BlockHash::from([n; 32])
    }

    #[test]
    fn duplicate_findings_are_suppressed() {
        let sink = AlertSink::new();
        let finding = Finding::InvalidBlock {
            block: hash(1),
            height: 100,
            valid_by: vec![ReplicaId(1)],
            invalid_by: vec![ReplicaId(2)],
        };
        assert!(sink.raise(finding.clone()));
        assert!(!sink.raise(finding));
    }

    #[test]
    fn cleared_conditions_fire_again() {
        let sink = AlertSink::new();
        let finding = Finding::ReplicaUnreachable {
            replica: ReplicaId(3),
        };
        assert!(sink.raise(finding.clone()));
        assert!(!sink.raise(finding.clone()));
        sink.clear_unreachable(ReplicaId(3));
        assert!(sink.raise(finding));
    }

    #[tokio::test]
    async fn subscribers_receive_new_findings() {
        let sink = AlertSink::new();
        let mut rx = sink.subscribe();
        sink.raise(Finding::StaleCandidate {
            height: 500,
            branch_count: 2,
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(
            received,
            Finding::StaleCandidate {
                height: 500,
                branch_count: 2
            }
        );
    }
}
