//! Test helpers shared across the Forkscout modules.
//!
//! The centerpiece is [`MockReplica`], an in-memory `ReplicaRpc` whose
//! `invalidateblock`/`reconsiderblock` recompute the active tip the way a
//! real node would, so rollback logic can be exercised end to end.

use async_trait::async_trait;
use forkscout_common::{
    params, BlockData, BlockHash, BlockVerbosity, BlockchainStatus, ChainWork, HeaderData,
    PeerSummary, ReplicaRpc, RpcError, TipInfo, TipStatus, TxData, TxOutSetTotals,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A BlockHash whose first byte is `n`; shorthand for test chains.
pub fn hash(n: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    BlockHash::from(bytes)
}

/// A TxId whose first byte is `n`.
pub fn txid(n: u8) -> forkscout_common::TxId {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    forkscout_common::TxId::from(bytes)
}

#[derive(Clone)]
struct MockBlock {
    hash: BlockHash,
    height: u64,
    parent: Option<BlockHash>,
    work: u64,
    time: u64,
    version: u32,
    transactions: Option<Vec<TxData>>,
    pruned: bool,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<BlockHash, MockBlock>,
    invalidated: Vec<BlockHash>,
    supply: HashMap<BlockHash, u64>,
    peers: Vec<u64>,
    network_active: bool,
    reachable: bool,
    tips_failing: bool,
    initial_block_download: bool,
}

/// Scriptable in-memory replica.
pub struct MockReplica {
    inner: Mutex<Inner>,
}

impl Default for MockReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReplica {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: vec![1, 2],
                network_active: true,
                reachable: true,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ── Scripting ──────────────────────────────────────────────────

    /// Add a block `hash(n)` with work `height + 1`.
    pub fn add_block(&self, n: u8, height: u64, parent: Option<u8>) {
        self.add_block_weighted(n, height, parent, height + 1);
    }

    /// Add a block with explicit cumulative work (ties in a fork race).
    pub fn add_block_weighted(&self, n: u8, height: u64, parent: Option<u8>, work: u64) {
        let mut inner = self.lock();
        inner.blocks.insert(
            hash(n),
            MockBlock {
                hash: hash(n),
                height,
                parent: parent.map(hash),
                work,
                time: 1_600_000_000 + height,
                version: 0x2000_0000,
                transactions: None,
                pruned: false,
            },
        );
    }

    /// Straight chain `hash(1)..=hash(count)` from `start_height` upward.
    pub fn extend_chain(&self, start_height: u64, count: u8) {
        for i in 1..=count {
            let parent = (i > 1).then(|| i - 1);
            self.add_block(i, start_height + (i - 1) as u64, parent);
        }
    }

    pub fn set_transactions(&self, block: &BlockHash, txs: Vec<TxData>) {
        if let Some(b) = self.lock().blocks.get_mut(block) {
            b.transactions = Some(txs);
        }
    }

    /// Fix the `gettxoutsetinfo` total reported while `block` is the tip.
    pub fn set_supply(&self, block: &BlockHash, total_amount: u64) {
        self.lock().supply.insert(*block, total_amount);
    }

    pub fn prune_block(&self, block: &BlockHash) {
        if let Some(b) = self.lock().blocks.get_mut(block) {
            b.pruned = true;
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Fail only `get_chain_tips`, leaving the other calls healthy.
    pub fn set_tips_failing(&self, failing: bool) {
        self.lock().tips_failing = failing;
    }

    pub fn set_initial_block_download(&self, ibd: bool) {
        self.lock().initial_block_download = ibd;
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn network_active(&self) -> bool {
        self.lock().network_active
    }

    pub fn peers(&self) -> Vec<u64> {
        self.lock().peers.clone()
    }

    pub fn invalidated(&self) -> Vec<BlockHash> {
        self.lock().invalidated.clone()
    }

    /// Summary `BlockData` for the current active tip.
    pub fn tip_data(&self) -> BlockData {
        let inner = self.lock();
        let tip = inner.active_tip().expect("mock chain is empty");
        inner.block_data(tip, false)
    }

    pub fn active_tip_hash(&self) -> BlockHash {
        let inner = self.lock();
        inner.active_tip().expect("mock chain is empty").hash
    }
}

impl Inner {
    fn tainted(&self, block: &MockBlock) -> bool {
        let invalidated: HashSet<&BlockHash> = self.invalidated.iter().collect();
        let mut current = Some(block.hash);
        while let Some(h) = current {
            if invalidated.contains(&h) {
                return true;
            }
            current = self.blocks.get(&h).and_then(|b| b.parent);
        }
        false
    }

    fn active_tip(&self) -> Option<&MockBlock> {
        self.blocks
            .values()
            .filter(|b| !self.tainted(b))
            .max_by_key(|b| (b.work, b.height, b.hash))
    }

    fn leaves(&self) -> Vec<&MockBlock> {
        let parents: HashSet<BlockHash> =
            self.blocks.values().filter_map(|b| b.parent).collect();
        self.blocks.values().filter(|b| !parents.contains(&b.hash)).collect()
    }

    fn block_data(&self, block: &MockBlock, with_txs: bool) -> BlockData {
        BlockData {
            hash: block.hash,
            height: block.height,
            previous_block_hash: block.parent,
            chain_work: Some(ChainWork::from(block.work)),
            time: block.time,
            median_time: Some(block.time),
            version: block.version,
            tx_count: block.transactions.as_ref().map(|t| t.len() as u64).unwrap_or(1),
            size: 250,
            transactions: if with_txs {
                Some(block.transactions.clone().unwrap_or_default())
            } else {
                None
            },
        }
    }

    fn header_data(&self, block: &MockBlock) -> HeaderData {
        HeaderData {
            hash: block.hash,
            height: block.height,
            previous_block_hash: block.parent,
            chain_work: Some(ChainWork::from(block.work)),
            time: block.time,
            median_time: Some(block.time),
            version: block.version,
        }
    }

    fn check_reachable(&self) -> Result<(), RpcError> {
        if self.reachable {
            Ok(())
        } else {
            Err(RpcError::Unreachable("mock replica offline".into()))
        }
    }
}

#[async_trait]
impl ReplicaRpc for MockReplica {
    async fn get_blockchain_info(&self) -> Result<BlockchainStatus, RpcError> {
        let inner = self.lock();
        inner.check_reachable()?;
        let tip = inner.active_tip().ok_or(RpcError::Initializing)?;
        Ok(BlockchainStatus {
            best_block_hash: tip.hash,
            blocks: tip.height,
            chain_work: ChainWork::from(tip.work),
            initial_block_download: inner.initial_block_download,
        })
    }

    async fn get_chain_tips(&self) -> Result<Vec<TipInfo>, RpcError> {
        let inner = self.lock();
        inner.check_reachable()?;
        if inner.tips_failing {
            return Err(RpcError::Unreachable("mock chaintips failure".into()));
        }
        let active = inner.active_tip().ok_or(RpcError::Initializing)?.hash;
        let mut tips = Vec::new();
        for leaf in inner.leaves() {
            let status = if leaf.hash == active {
                TipStatus::Active
            } else if inner.tainted(leaf) {
                TipStatus::Invalid
            } else {
                TipStatus::ValidFork
            };
            tips.push(TipInfo {
                hash: leaf.hash,
                height: leaf.height,
                status,
            });
        }
        // The active block may be an interior node once its children are
        // all invalidated
        if !tips.iter().any(|t| t.hash == active) {
            let block = &inner.blocks[&active];
            tips.push(TipInfo {
                hash: active,
                height: block.height,
                status: TipStatus::Active,
            });
        }
        Ok(tips)
    }

    async fn get_block(
        &self,
        hash: &BlockHash,
        verbosity: BlockVerbosity,
    ) -> Result<BlockData, RpcError> {
        let inner = self.lock();
        inner.check_reachable()?;
        let block = inner.blocks.get(hash).ok_or(RpcError::BlockNotFound)?;
        if block.pruned {
            return Err(RpcError::BlockPruned);
        }
        Ok(inner.block_data(block, verbosity == BlockVerbosity::WithTransactions))
    }

    async fn get_block_header(&self, hash: &BlockHash) -> Result<HeaderData, RpcError> {
        let inner = self.lock();
        inner.check_reachable()?;
        let block = inner.blocks.get(hash).ok_or(RpcError::BlockNotFound)?;
        Ok(inner.header_data(block))
    }

    async fn get_tx_out_set_info(&self) -> Result<TxOutSetTotals, RpcError> {
        let inner = self.lock();
        inner.check_reachable()?;
        let tip = inner.active_tip().ok_or(RpcError::Initializing)?;
        let total_amount = inner
            .supply
            .get(&tip.hash)
            .copied()
            .unwrap_or_else(|| tip.height * params::max_issuance(tip.height));
        Ok(TxOutSetTotals {
            height: tip.height,
            best_block: tip.hash,
            tx_outs: tip.height,
            total_amount,
        })
    }

    async fn invalidate_block(&self, hash: &BlockHash) -> Result<(), RpcError> {
        let mut inner = self.lock();
        inner.check_reachable()?;
        if !inner.blocks.contains_key(hash) {
            return Err(RpcError::BlockNotFound);
        }
        if !inner.invalidated.contains(hash) {
            inner.invalidated.push(*hash);
        }
        Ok(())
    }

    async fn reconsider_block(&self, hash: &BlockHash) -> Result<(), RpcError> {
        let mut inner = self.lock();
        inner.check_reachable()?;
        inner.invalidated.retain(|h| h != hash);
        Ok(())
    }

    async fn set_network_active(&self, active: bool) -> Result<(), RpcError> {
        let mut inner = self.lock();
        inner.check_reachable()?;
        inner.network_active = active;
        Ok(())
    }

    async fn get_peer_info(&self) -> Result<Vec<PeerSummary>, RpcError> {
        let inner = self.lock();
        inner.check_reachable()?;
        Ok(inner.peers.iter().map(|&id| PeerSummary { id }).collect())
    }

    async fn disconnect_peer(&self, peer_id: u64) -> Result<(), RpcError> {
        let mut inner = self.lock();
        inner.check_reachable()?;
        if !inner.peers.contains(&peer_id) {
            return Err(RpcError::PeerNotConnected);
        }
        inner.peers.retain(|&id| id != peer_id);
        Ok(())
    }
}
