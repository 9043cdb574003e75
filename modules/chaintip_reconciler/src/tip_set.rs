//! Chaintip records and the parent/child linking rules.

use forkscout_common::{BlockHash, ReplicaId, ReplicaSpec, TipStatus};
use forkscout_graph::BlockGraph;
use std::cmp::Reverse;

/// One replica's stake in a chain tip. A replica has at most one active
/// record; fork and invalid records are rebuilt every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaintipRecord {
    pub id: u64,
    pub replica: ReplicaId,
    pub block: BlockHash,
    pub height: u64,
    pub status: TipStatus,
    /// Active record of another replica whose chain contains this tip.
    /// Interpreted as: that replica would agree with us, until its
    /// advertised tips say otherwise.
    pub parent_tip: Option<u64>,
}

/// All chaintip records across the fleet.
#[derive(Debug, Default)]
pub struct TipSet {
    records: Vec<ChaintipRecord>,
    next_id: u64,
}

impl TipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ChaintipRecord] {
        &self.records
    }

    pub fn get(&self, id: u64) -> Option<&ChaintipRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn active_of(&self, replica: ReplicaId) -> Option<&ChaintipRecord> {
        self.records
            .iter()
            .find(|r| r.replica == replica && r.status == TipStatus::Active)
    }

    /// Drop a replica's fork and invalid records; with `drop_all`, its
    /// active record too (replica unreachable or syncing).
    pub fn purge(&mut self, replica: ReplicaId, drop_all: bool) {
        self.records.retain(|r| {
            r.replica != replica || (!drop_all && r.status == TipStatus::Active)
        });
    }

    /// Drop records of replicas no longer in the fleet.
    pub fn retain_replicas(&mut self, fleet: &[ReplicaId]) {
        let removed: Vec<u64> = self
            .records
            .iter()
            .filter(|r| !fleet.contains(&r.replica))
            .map(|r| r.id)
            .collect();
        self.records.retain(|r| fleet.contains(&r.replica));
        for id in removed {
            self.unlink_children_of(id);
        }
    }

    /// Update (or create) the replica's single active record. When the tip
    /// block changed, the record loses its parent link and any records
    /// pointing at it are unlinked too.
    pub fn set_active(&mut self, replica: ReplicaId, block: BlockHash, height: u64) -> u64 {
        if let Some(pos) = self
            .records
            .iter()
            .position(|r| r.replica == replica && r.status == TipStatus::Active)
        {
            let id = self.records[pos].id;
            if self.records[pos].block != block {
                self.records[pos].block = block;
                self.records[pos].height = height;
                self.records[pos].parent_tip = None;
                self.unlink_children_of(id);
            }
            return id;
        }
        self.insert(replica, block, height, TipStatus::Active)
    }

    /// Record a fork or invalid tip for a replica. Idempotent per pass.
    pub fn add_tip(
        &mut self,
        replica: ReplicaId,
        block: BlockHash,
        height: u64,
        status: TipStatus,
    ) -> u64 {
        if let Some(existing) = self
            .records
            .iter()
            .find(|r| r.replica == replica && r.block == block && r.status == status)
        {
            return existing.id;
        }
        self.insert(replica, block, height, status)
    }

    fn insert(&mut self, replica: ReplicaId, block: BlockHash, height: u64, status: TipStatus) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push(ChaintipRecord {
            id,
            replica,
            block,
            height,
            status,
            parent_tip: None,
        });
        id
    }

    pub fn has_invalid_record(&self, replica: ReplicaId, block: &BlockHash) -> bool {
        self.records
            .iter()
            .any(|r| r.replica == replica && r.status == TipStatus::Invalid && r.block == *block)
    }

    fn unlink_children_of(&mut self, id: u64) {
        for record in &mut self.records {
            if record.parent_tip == Some(id) {
                record.parent_tip = None;
            }
        }
    }

    fn set_parent(&mut self, id: u64, parent: Option<u64>) {
        if let Some(record) = self.records.iter_mut().find(|r| r.id == id) {
            record.parent_tip = parent;
        }
    }

    /// Active records other than `id`, filtered by `pred` on height, in
    /// nearest-to-`near`-first order with fleet rank as tiebreak. Nearest
    /// first keeps chains of agreeing replicas transitive instead of
    /// everyone linking straight to the highest tip.
    fn active_candidates(
        &self,
        id: u64,
        near: u64,
        fleet: &[ReplicaSpec],
        pred: impl Fn(u64) -> bool,
    ) -> Vec<u64> {
        let mut candidates: Vec<&ChaintipRecord> = self
            .records
            .iter()
            .filter(|r| r.id != id && r.status == TipStatus::Active && pred(r.height))
            .collect();
        candidates.sort_by_key(|r| (near.abs_diff(r.height), fleet_rank(fleet, r.replica)));
        candidates.iter().map(|r| r.id).collect()
    }

    /// Find an active record at greater height whose chain contains our
    /// tip, and adopt it as parent. A candidate is abandoned as soon as
    /// its chain crosses a block this replica considers invalid.
    pub fn match_parent(&mut self, id: u64, graph: &BlockGraph, fleet: &[ReplicaSpec]) {
        let Some(record) = self.get(id).cloned() else {
            return;
        };
        if record.parent_tip.is_some() {
            return;
        }
        for candidate_id in
            self.active_candidates(id, record.height, fleet, |height| height > record.height)
        {
            let Some(candidate) = self.get(candidate_id).cloned() else {
                continue;
            };
            let mut cursor = Some(candidate.block);
            while let Some(hash) = cursor {
                let Some(block) = graph.get(&hash) else {
                    break;
                };
                if block.height < record.height {
                    break;
                }
                if block.marked_invalid_by.contains(&record.replica)
                    || self.has_invalid_record(record.replica, &hash)
                {
                    break;
                }
                if hash == record.block {
                    self.set_parent(id, Some(candidate_id));
                    return;
                }
                cursor = block.parent;
            }
        }
    }

    /// The downward counterpart: adopt lower parentless active records
    /// whose tip lies on our chain.
    pub fn match_children(&mut self, id: u64, graph: &BlockGraph, fleet: &[ReplicaSpec]) {
        let Some(record) = self.get(id).cloned() else {
            return;
        };
        let candidates: Vec<u64> = self
            .active_candidates(id, record.height, fleet, |height| height < record.height)
            .into_iter()
            .filter(|cid| self.get(*cid).is_some_and(|c| c.parent_tip.is_none()))
            .collect();
        for candidate_id in candidates {
            let Some(candidate) = self.get(candidate_id).cloned() else {
                continue;
            };
            let mut cursor = Some(record.block);
            while let Some(hash) = cursor {
                let Some(block) = graph.get(&hash) else {
                    break;
                };
                if block.height < candidate.height {
                    break;
                }
                if self.has_invalid_record(record.replica, &hash) {
                    break;
                }
                if hash == candidate.block {
                    self.set_parent(candidate_id, Some(id));
                    return;
                }
                cursor = block.parent;
            }
        }
    }

    /// Sever the parent link when an invalid-marked tip of this replica
    /// turns out to descend from our block: the parent replica's chain
    /// passes through territory we reject.
    pub fn check_parent(&mut self, id: u64, graph: &BlockGraph) {
        let Some(record) = self.get(id).cloned() else {
            return;
        };
        if record.parent_tip.is_none() {
            return;
        }
        let invalid_above: Vec<BlockHash> = self
            .records
            .iter()
            .filter(|r| {
                r.replica == record.replica
                    && r.status == TipStatus::Invalid
                    && r.height > record.height
            })
            .map(|r| r.block)
            .collect();
        for tip in invalid_above {
            let mut cursor = Some(tip);
            while let Some(hash) = cursor {
                let Some(block) = graph.get(&hash) else {
                    break;
                };
                if block.height < record.height {
                    break;
                }
                if hash == record.block {
                    self.set_parent(id, None);
                    return;
                }
                cursor = block.parent;
            }
        }
    }
}

/// Deterministic replica ordering: client kind, then name, then newest
/// version first. Unknown replicas sort last.
fn fleet_rank(
    fleet: &[ReplicaSpec],
    replica: ReplicaId,
) -> (u8, String, Reverse<u64>) {
    fleet
        .iter()
        .find(|spec| spec.id == replica)
        .map(|spec| (spec.client as u8, spec.name.clone(), Reverse(spec.version)))
        .unwrap_or((u8::MAX, String::new(), Reverse(0)))
}
