//! Block representation within the shared graph.

use forkscout_common::params;
use forkscout_common::{BlockData, BlockHash, ChainWork, HeaderData, ReplicaId, TxData};
use std::collections::BTreeSet;

/// One observed block. Most fields are optional because a block may be
/// known from a header alone until some replica serves the body.
#[derive(Debug, Clone)]
pub struct Block {
    /// 32-byte block hash (identity key).
    pub hash: BlockHash,
    /// Block height. Immutable once recorded.
    pub height: u64,
    /// Parent block hash; may reference a block not (yet) in the graph.
    pub parent: Option<BlockHash>,
    /// Child block hashes present in the graph.
    pub children: Vec<BlockHash>,
    /// Cumulative proof-of-work at this block.
    pub work: Option<ChainWork>,
    /// Header timestamp.
    pub timestamp: Option<u64>,
    /// Median time past.
    pub median_time: Option<u64>,
    /// Raw version field.
    pub version: Option<u32>,
    pub tx_count: Option<u64>,
    pub size: Option<u64>,
    /// Miner attribution decoded from the coinbase tag.
    pub pool: Option<String>,
    /// True once the parent walk from here is known to reach the
    /// retained-history floor.
    pub connected: bool,
    /// Only the header has been observed.
    pub headers_only: bool,
    /// Some replica reported the body as pruned.
    pub pruned: bool,
    /// Replica that first reported this block.
    pub first_seen_by: Option<ReplicaId>,
    /// Replicas that advertised this block on a valid chain.
    pub marked_valid_by: BTreeSet<ReplicaId>,
    /// Replicas that advertised this block on an invalid chain.
    pub marked_invalid_by: BTreeSet<ReplicaId>,
    /// Per-transaction summaries; present once a verbose body was fetched.
    pub transactions: Option<Vec<TxData>>,
}

impl Block {
    pub(crate) fn from_data(data: &BlockData, seen_by: Option<ReplicaId>) -> Self {
        let pool = data
            .transactions
            .as_ref()
            .and_then(|txs| txs.first())
            .and_then(|coinbase| coinbase.coinbase_tag.as_deref())
            .and_then(params::pool_from_coinbase_tag)
            .map(str::to_string);
        Self {
            hash: data.hash,
            height: data.height,
            parent: data.previous_block_hash,
            children: Vec::new(),
            work: data.chain_work.clone(),
            timestamp: Some(data.time),
            median_time: data.median_time,
            version: Some(data.version),
            tx_count: Some(data.tx_count),
            size: Some(data.size),
            pool,
            connected: false,
            headers_only: false,
            pruned: false,
            first_seen_by: seen_by,
            marked_valid_by: BTreeSet::new(),
            marked_invalid_by: BTreeSet::new(),
            transactions: data.transactions.clone(),
        }
    }

    pub(crate) fn from_header(header: &HeaderData, seen_by: Option<ReplicaId>) -> Self {
        Self {
            hash: header.hash,
            height: header.height,
            parent: header.previous_block_hash,
            children: Vec::new(),
            work: header.chain_work.clone(),
            timestamp: Some(header.time),
            median_time: header.median_time,
            version: Some(header.version),
            tx_count: None,
            size: None,
            pool: None,
            connected: false,
            headers_only: true,
            pruned: false,
            first_seen_by: seen_by,
            marked_valid_by: BTreeSet::new(),
            marked_invalid_by: BTreeSet::new(),
            transactions: None,
        }
    }

    /// Signal bits set in the version field, if the version is known.
    pub fn signal_bits(&self) -> Option<Vec<u8>> {
        self.version.map(params::signal_bits)
    }

    /// True when conflict analysis can read this block's transactions.
    pub fn has_transactions(&self) -> bool {
        !self.headers_only && self.transactions.is_some()
    }
}
