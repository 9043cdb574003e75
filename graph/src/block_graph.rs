//! Block DAG built from replica reports.
//!
//! Keyed by hash with parent/child links both ways, a by-height index for
//! bounded forward walks, and a retained-history floor below which nothing
//! is stored or walked.

use std::collections::{BTreeMap, HashMap, VecDeque};

use forkscout_common::params;
use forkscout_common::{BlockData, BlockHash, HeaderData, ReplicaId, TxData};
use tracing::debug;

use crate::block::Block;
use crate::errors::GraphError;

/// The top-level structure holding all observed blocks.
///
/// Operations are single-threaded; the owning process handles concurrency
/// by wrapping the graph in a reader-writer lock.
pub struct BlockGraph {
    /// All blocks keyed by hash.
    blocks: HashMap<BlockHash, Block>,
    /// Hashes per height, for bounded forward walks.
    by_height: BTreeMap<u64, Vec<BlockHash>>,
    /// Walks never go below this height.
    min_retained_height: u64,
}

impl BlockGraph {
    pub fn new(min_retained_height: u64) -> Self {
        Self {
            blocks: HashMap::new(),
            by_height: BTreeMap::new(),
            min_retained_height,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn min_retained_height(&self) -> u64 {
        self.min_retained_height
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Hashes recorded at the given height, in insertion order.
    pub fn blocks_at_height(&self, height: u64) -> &[BlockHash] {
        self.by_height.get(&height).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Highest recorded height, if any.
    pub fn best_height(&self) -> Option<u64> {
        self.by_height.keys().next_back().copied()
    }

    /// Iterate over all blocks, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    // ── Inserting and merging ──────────────────────────────────────

    /// Idempotent create-or-update from a full block body.
    ///
    /// Re-reporting an existing hash merges missing fields and never
    /// duplicates. A height that conflicts with the recorded one is a
    /// fatal consistency error.
    pub fn upsert_block(
        &mut self,
        data: &BlockData,
        seen_by: Option<ReplicaId>,
    ) -> Result<BlockHash, GraphError> {
        if let Some(existing) = self.blocks.get_mut(&data.hash) {
            if existing.height != data.height {
                return Err(GraphError::HeightMismatch {
                    hash: data.hash,
                    recorded: existing.height,
                    reported: data.height,
                });
            }
            Self::merge_body(existing, data);
            if existing.parent.is_none() && data.previous_block_hash.is_some() {
                existing.parent = data.previous_block_hash;
                self.link_parent(data.hash)?;
            }
            return Ok(data.hash);
        }
        self.insert_new(Block::from_data(data, seen_by))
    }

    /// Record a block from header data alone, marked headers-only.
    /// A later body upsert clears the flag and fills the missing fields.
    pub fn insert_headers_only(
        &mut self,
        header: &HeaderData,
        seen_by: Option<ReplicaId>,
    ) -> Result<BlockHash, GraphError> {
        if let Some(existing) = self.blocks.get(&header.hash) {
            if existing.height != header.height {
                return Err(GraphError::HeightMismatch {
                    hash: header.hash,
                    recorded: existing.height,
                    reported: header.height,
                });
            }
            return Ok(header.hash);
        }
        self.insert_new(Block::from_header(header, seen_by))
    }

    fn insert_new(&mut self, block: Block) -> Result<BlockHash, GraphError> {
        let hash = block.hash;
        debug!(%hash, height = block.height, headers_only = block.headers_only, "new block");
        self.by_height.entry(block.height).or_default().push(hash);
        self.blocks.insert(hash, block);
        self.link_parent(hash)?;
        self.adopt_pending_children(hash);
        Ok(hash)
    }

    /// Wire the child link on this block's parent, if the parent is known.
    fn link_parent(&mut self, hash: BlockHash) -> Result<(), GraphError> {
        let Some(block) = self.blocks.get(&hash) else {
            return Ok(());
        };
        let (height, Some(parent_hash)) = (block.height, block.parent) else {
            return Ok(());
        };
        let Some(parent) = self.blocks.get_mut(&parent_hash) else {
            // Parent not observed yet; the link completes when it arrives
            return Ok(());
        };
        if parent.height + 1 != height {
            return Err(GraphError::ParentHeightMismatch {
                hash,
                parent: parent_hash,
                parent_height: parent.height,
                expected: height.saturating_sub(1),
            });
        }
        if !parent.children.contains(&hash) {
            parent.children.push(hash);
        }
        Ok(())
    }

    /// Back-fill child links from blocks that arrived before this one.
    fn adopt_pending_children(&mut self, hash: BlockHash) {
        let Some(height) = self.blocks.get(&hash).map(|b| b.height) else {
            return;
        };
        let pending: Vec<BlockHash> = self
            .blocks_at_height(height + 1)
            .iter()
            .copied()
            .filter(|child| self.blocks.get(child).and_then(|b| b.parent) == Some(hash))
            .collect();
        if let Some(block) = self.blocks.get_mut(&hash) {
            for child in pending {
                if !block.children.contains(&child) {
                    block.children.push(child);
                }
            }
        }
    }

    fn merge_body(existing: &mut Block, data: &BlockData) {
        existing.headers_only = false;
        if existing.work.is_none() {
            existing.work = data.chain_work.clone();
        }
        existing.timestamp = existing.timestamp.or(Some(data.time));
        existing.median_time = existing.median_time.or(data.median_time);
        existing.version = existing.version.or(Some(data.version));
        existing.tx_count = existing.tx_count.or(Some(data.tx_count));
        existing.size = existing.size.or(Some(data.size));
        if let Some(txs) = &data.transactions {
            if existing.transactions.is_none() {
                existing.pool = existing.pool.take().or_else(|| {
                    txs.first()
                        .and_then(|cb| cb.coinbase_tag.as_deref())
                        .and_then(params::pool_from_coinbase_tag)
                        .map(str::to_string)
                });
                existing.transactions = Some(txs.clone());
            }
        }
    }

    // ── Marking ────────────────────────────────────────────────────

    pub fn mark_valid(&mut self, hash: &BlockHash, replica: ReplicaId) -> Result<(), GraphError> {
        let block = self
            .blocks
            .get_mut(hash)
            .ok_or(GraphError::UnknownBlock { hash: *hash })?;
        block.marked_valid_by.insert(replica);
        Ok(())
    }

    pub fn mark_invalid(&mut self, hash: &BlockHash, replica: ReplicaId) -> Result<(), GraphError> {
        let block = self
            .blocks
            .get_mut(hash)
            .ok_or(GraphError::UnknownBlock { hash: *hash })?;
        block.marked_invalid_by.insert(replica);
        Ok(())
    }

    pub fn mark_pruned(&mut self, hash: &BlockHash) -> Result<(), GraphError> {
        let block = self
            .blocks
            .get_mut(hash)
            .ok_or(GraphError::UnknownBlock { hash: *hash })?;
        block.pruned = true;
        Ok(())
    }

    pub(crate) fn set_connected(&mut self, hash: &BlockHash) {
        if let Some(block) = self.blocks.get_mut(hash) {
            block.connected = true;
        }
    }

    /// Attach verbose transaction data to a known block.
    pub fn attach_transactions(
        &mut self,
        hash: &BlockHash,
        transactions: Vec<TxData>,
    ) -> Result<(), GraphError> {
        let block = self
            .blocks
            .get_mut(hash)
            .ok_or(GraphError::UnknownBlock { hash: *hash })?;
        if block.pool.is_none() {
            block.pool = transactions
                .first()
                .and_then(|cb| cb.coinbase_tag.as_deref())
                .and_then(params::pool_from_coinbase_tag)
                .map(str::to_string);
        }
        block.headers_only = false;
        block.transactions = Some(transactions);
        Ok(())
    }

    // ── Walks ──────────────────────────────────────────────────────

    /// Blocks reachable from `hash` by child links, bounded by the height
    /// window `(h, h + max_depth]`. The block itself is never included.
    pub fn descendants(
        &self,
        hash: &BlockHash,
        max_depth: u64,
    ) -> Result<Vec<BlockHash>, GraphError> {
        let start = self
            .blocks
            .get(hash)
            .ok_or(GraphError::UnknownBlock { hash: *hash })?;
        let limit = start.height + max_depth;
        let mut found = Vec::new();
        let mut queue: VecDeque<BlockHash> = start.children.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            let Some(block) = self.blocks.get(&next) else {
                continue;
            };
            if block.height > limit {
                continue;
            }
            found.push(next);
            queue.extend(block.children.iter().copied());
        }
        Ok(found)
    }

    /// True if `block` is on the chain ending at `tip` (inclusive).
    pub fn chain_contains(&self, block: &BlockHash, tip: &BlockHash) -> bool {
        let mut current = Some(*tip);
        while let Some(h) = current {
            if h == *block {
                return true;
            }
            current = self.blocks.get(&h).and_then(|b| b.parent);
        }
        false
    }

    /// The first block below `a` whose descendant set contains `b`: the
    /// common ancestor of two diverged branches.
    pub fn branch_point(&self, a: &BlockHash, b: &BlockHash) -> Result<BlockHash, GraphError> {
        if a == b {
            return Err(GraphError::SameBlock);
        }
        let block_a = self.blocks.get(a).ok_or(GraphError::UnknownBlock { hash: *a })?;
        let block_b = self.blocks.get(b).ok_or(GraphError::UnknownBlock { hash: *b })?;
        if self.chain_contains(a, b) || self.chain_contains(b, a) {
            return Err(GraphError::SameBranch);
        }

        let mut ha = *a;
        let mut hb = *b;
        let mut na = block_a.height;
        let mut nb = block_b.height;

        // Walk the higher block down to the same height, then both in
        // lockstep until they meet
        while na > nb {
            ha = self.parent_or_exhausted(&ha)?;
            na -= 1;
        }
        while nb > na {
            hb = self.parent_or_exhausted(&hb)?;
            nb -= 1;
        }
        while ha != hb {
            if na <= self.min_retained_height {
                return Err(GraphError::NoCommonAncestor);
            }
            ha = self.parent_or_exhausted(&ha)?;
            hb = self.parent_or_exhausted(&hb)?;
            na -= 1;
        }
        Ok(ha)
    }

    fn parent_or_exhausted(&self, hash: &BlockHash) -> Result<BlockHash, GraphError> {
        self.blocks
            .get(hash)
            .and_then(|b| b.parent)
            .filter(|p| self.blocks.contains_key(p))
            .ok_or(GraphError::NoCommonAncestor)
    }

    /// The ancestor of `tip` sitting directly above `ancestor`: the first
    /// block of `tip`'s branch past the branch point.
    pub fn first_block_after(
        &self,
        ancestor: &BlockHash,
        tip: &BlockHash,
    ) -> Result<BlockHash, GraphError> {
        if ancestor == tip {
            return Err(GraphError::SameBlock);
        }
        let mut current = *tip;
        loop {
            let block = self
                .blocks
                .get(&current)
                .ok_or(GraphError::UnknownBlock { hash: current })?;
            match block.parent {
                Some(parent) if parent == *ancestor => return Ok(current),
                Some(parent) => current = parent,
                None => return Err(GraphError::NoCommonAncestor),
            }
        }
    }

    // ── Retention ──────────────────────────────────────────────────

    /// Raise the retained-history floor and drop everything below it.
    /// Surviving blocks keep their (now dangling) parent hashes.
    pub fn prune_below(&mut self, height: u64) {
        if height <= self.min_retained_height {
            return;
        }
        self.min_retained_height = height;
        let dropped: Vec<u64> =
            self.by_height.range(..height).map(|(h, _)| *h).collect();
        for h in dropped {
            if let Some(hashes) = self.by_height.remove(&h) {
                for hash in hashes {
                    self.blocks.remove(&hash);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkscout_common::{ChainWork, TxOutput};

    /// Helper: create a BlockHash from a u8 value (for test convenience).
    fn hash(n: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        BlockHash::from(bytes)
    }

    fn txid(n: u8) -> forkscout_common::TxId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        forkscout_common::TxId::from(bytes)
    }

    fn data(n: u8, height: u64, parent: Option<u8>) -> BlockData {
        BlockData {
            hash: hash(n),
            height,
            previous_block_hash: parent.map(hash),
            chain_work: Some(ChainWork::from(height + 1)),
            time: 1_600_000_000 + height,
            median_time: Some(1_600_000_000 + height),
            version: 0x2000_0000,
            tx_count: 1,
            size: 250,
            transactions: None,
        }
    }

    fn header(n: u8, height: u64, parent: Option<u8>) -> HeaderData {
        HeaderData {
            hash: hash(n),
            height,
            previous_block_hash: parent.map(hash),
            chain_work: Some(ChainWork::from(height + 1)),
            time: 1_600_000_000 + height,
            median_time: None,
            version: 0x2000_0000,
        }
    }

    /// Helper: graph with a straight chain 1..=n starting at height 100.
    fn chain(n: u8) -> BlockGraph {
        let mut graph = BlockGraph::new(0);
        graph.upsert_block(&data(1, 100, None), None).unwrap();
        for i in 2..=n {
            graph.upsert_block(&data(i, 100 + i as u64 - 1, Some(i - 1)), None).unwrap();
        }
        graph
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut graph = BlockGraph::new(0);
        graph.upsert_block(&data(1, 100, None), Some(ReplicaId(1))).unwrap();
        graph.upsert_block(&data(1, 100, None), Some(ReplicaId(2))).unwrap();
        assert_eq!(graph.len(), 1);
        // First reporter wins
        assert_eq!(graph.get(&hash(1)).unwrap().first_seen_by, Some(ReplicaId(1)));
    }

    #[test]
    fn conflicting_height_is_fatal() {
        let mut graph = BlockGraph::new(0);
        graph.upsert_block(&data(1, 100, None), None).unwrap();
        let err = graph.upsert_block(&data(1, 101, None), None).unwrap_err();
        assert!(matches!(err, GraphError::HeightMismatch { recorded: 100, reported: 101, .. }));
    }

    #[test]
    fn parent_must_sit_one_below() {
        let mut graph = BlockGraph::new(0);
        graph.upsert_block(&data(1, 100, None), None).unwrap();
        let mut bad = data(2, 102, Some(1));
        bad.height = 102;
        let err = graph.upsert_block(&bad, None).unwrap_err();
        assert!(matches!(err, GraphError::ParentHeightMismatch { .. }));
    }

    #[test]
    fn body_upsert_fills_headers_only_block() {
        let mut graph = BlockGraph::new(0);
        graph.insert_headers_only(&header(1, 100, None), None).unwrap();
        assert!(graph.get(&hash(1)).unwrap().headers_only);

        let mut body = data(1, 100, None);
        body.transactions = Some(vec![TxData {
            txid: txid(9),
            inputs: vec![],
            outputs: vec![TxOutput { value: 50, script_pubkey: vec![0x51] }],
            coinbase_tag: Some(b"/F2Pool/".to_vec()),
        }]);
        graph.upsert_block(&body, None).unwrap();

        let block = graph.get(&hash(1)).unwrap();
        assert!(!block.headers_only);
        assert!(block.has_transactions());
        assert_eq!(block.pool.as_deref(), Some("F2Pool"));
    }

    #[test]
    fn child_arriving_first_is_linked_when_parent_appears() {
        let mut graph = BlockGraph::new(0);
        graph.upsert_block(&data(2, 101, Some(1)), None).unwrap();
        graph.upsert_block(&data(1, 100, None), None).unwrap();
        assert_eq!(graph.get(&hash(1)).unwrap().children, vec![hash(2)]);
    }

    #[test]
    fn descendants_exclude_self_and_respect_bound() {
        let graph = chain(5);
        let within = graph.descendants(&hash(1), 2).unwrap();
        assert_eq!(within, vec![hash(2), hash(3)]);
        assert!(!graph.descendants(&hash(1), 100).unwrap().contains(&hash(1)));
        assert!(graph.descendants(&hash(5), 100).unwrap().is_empty());
    }

    #[test]
    fn descendants_cover_sibling_branches() {
        let mut graph = chain(3);
        // Fork at height 101: block 4 is a sibling of block 3
        graph.upsert_block(&data(4, 102, Some(2)), None).unwrap();
        let all = graph.descendants(&hash(1), 10).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.contains(&hash(3)));
        assert!(all.contains(&hash(4)));
    }

    #[test]
    fn branch_point_of_siblings_is_symmetric() {
        let mut graph = chain(3);
        graph.upsert_block(&data(4, 102, Some(2)), None).unwrap();
        graph.upsert_block(&data(5, 103, Some(4)), None).unwrap();
        assert_eq!(graph.branch_point(&hash(3), &hash(5)).unwrap(), hash(2));
        assert_eq!(graph.branch_point(&hash(5), &hash(3)).unwrap(), hash(2));
    }

    #[test]
    fn branch_point_rejects_same_block_and_same_branch() {
        let graph = chain(3);
        assert!(matches!(
            graph.branch_point(&hash(2), &hash(2)),
            Err(GraphError::SameBlock)
        ));
        assert!(matches!(
            graph.branch_point(&hash(1), &hash(3)),
            Err(GraphError::SameBranch)
        ));
        assert!(matches!(
            graph.branch_point(&hash(3), &hash(1)),
            Err(GraphError::SameBranch)
        ));
    }

    #[test]
    fn branch_point_fails_outside_retained_history() {
        let mut graph = BlockGraph::new(0);
        // Two disconnected chains; parents below are unknown
        graph.upsert_block(&data(1, 100, None), None).unwrap();
        graph.upsert_block(&data(2, 101, Some(1)), None).unwrap();
        graph.upsert_block(&data(3, 100, None), None).unwrap();
        graph.upsert_block(&data(4, 101, Some(3)), None).unwrap();
        assert!(matches!(
            graph.branch_point(&hash(2), &hash(4)),
            Err(GraphError::NoCommonAncestor)
        ));
    }

    #[test]
    fn first_block_after_returns_branch_start() {
        let mut graph = chain(4);
        graph.upsert_block(&data(5, 102, Some(2)), None).unwrap();
        // Active branch 1-2-3-4, target branch forked at 2
        assert_eq!(graph.first_block_after(&hash(2), &hash(4)).unwrap(), hash(3));
        assert_eq!(graph.first_block_after(&hash(2), &hash(5)).unwrap(), hash(5));
    }

    #[test]
    fn marks_accumulate_per_replica() {
        let mut graph = chain(2);
        graph.mark_valid(&hash(2), ReplicaId(1)).unwrap();
        graph.mark_valid(&hash(2), ReplicaId(1)).unwrap();
        graph.mark_invalid(&hash(2), ReplicaId(2)).unwrap();
        let block = graph.get(&hash(2)).unwrap();
        assert_eq!(block.marked_valid_by.len(), 1);
        assert_eq!(block.marked_invalid_by.len(), 1);
    }

    #[test]
    fn prune_below_drops_old_heights() {
        let mut graph = chain(5);
        graph.prune_below(102);
        assert_eq!(graph.len(), 3);
        assert!(!graph.contains(&hash(1)));
        assert!(graph.contains(&hash(3)));
        assert_eq!(graph.min_retained_height(), 102);
    }

    #[test]
    fn best_height_tracks_insertions() {
        let graph = chain(4);
        assert_eq!(graph.best_height(), Some(103));
        assert_eq!(graph.blocks_at_height(103), &[hash(4)]);
    }
}
