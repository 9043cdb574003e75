//! Data shapes exchanged with replicas and shared across modules

use crate::byte_array::{BlockHash, TxId};
use crate::work::ChainWork;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use std::fmt;

/// Identifies one replica in the audited fleet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReplicaId(pub u32);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

/// Client implementation kind. Ordering matters: when several replicas could
/// serve as a chaintip's parent, candidates are tried by kind, then name,
/// then newest version first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ClientKind {
    Core,
    Knots,
    Btcd,
    Libbitcoin,
    Other,
}

/// Static description of a fleet member, from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSpec {
    pub id: ReplicaId,
    pub name: String,
    pub client: ClientKind,
    pub version: u64,
    /// Mirror replicas are reserved for rollback audits and never polled as
    /// part of the ordinary fleet.
    #[serde(default)]
    pub mirror: bool,
}

/// Chain tip status as advertised by `getchaintips`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TipStatus {
    Active,
    ValidFork,
    ValidHeaders,
    HeadersOnly,
    Invalid,
}

impl fmt::Display for TipStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TipStatus::Active => "active",
            TipStatus::ValidFork => "valid-fork",
            TipStatus::ValidHeaders => "valid-headers",
            TipStatus::HeadersOnly => "headers-only",
            TipStatus::Invalid => "invalid",
        };
        write!(f, "{name}")
    }
}

/// One entry of a replica's advertised chain tip set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipInfo {
    pub hash: BlockHash,
    pub height: u64,
    pub status: TipStatus,
}

/// Subset of `getblockchaininfo` the engine reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainStatus {
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: BlockHash,
    pub blocks: u64,
    #[serde(rename = "chainwork")]
    pub chain_work: ChainWork,
    #[serde(rename = "initialblockdownload", default)]
    pub initial_block_download: bool,
}

/// Header fields, from `getblockheader` or verbosity-1 `getblock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderData {
    pub hash: BlockHash,
    pub height: u64,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: Option<BlockHash>,
    #[serde(rename = "chainwork")]
    pub chain_work: Option<ChainWork>,
    pub time: u64,
    #[serde(rename = "mediantime")]
    pub median_time: Option<u64>,
    pub version: u32,
}

/// Block fields the engine reads from `getblock`. Transactions are present
/// only when fetched with [`crate::BlockVerbosity::WithTransactions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub hash: BlockHash,
    pub height: u64,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: Option<BlockHash>,
    #[serde(rename = "chainwork")]
    pub chain_work: Option<ChainWork>,
    pub time: u64,
    #[serde(rename = "mediantime")]
    pub median_time: Option<u64>,
    pub version: u32,
    #[serde(rename = "nTx")]
    pub tx_count: u64,
    pub size: u64,
    #[serde(rename = "tx")]
    pub transactions: Option<Vec<TxData>>,
}

/// A spent transaction output reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.txid, self.vout)
    }
}

/// A created transaction output. Values are integer base units throughout;
/// the engine never handles floating-point amounts.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    #[serde_as(as = "Hex")]
    pub script_pubkey: Vec<u8>,
}

/// Transaction summary kept per block for conflict analysis.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    pub txid: TxId,
    /// Spent outpoints. Empty for the coinbase.
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
    /// Coinbase scriptSig bytes, used for miner attribution.
    #[serde_as(as = "Option<Hex>")]
    pub coinbase_tag: Option<Vec<u8>>,
}

impl TxData {
    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// UTXO set totals from `gettxoutsetinfo`, in base units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutSetTotals {
    pub height: u64,
    #[serde(rename = "bestblock")]
    pub best_block: BlockHash,
    #[serde(rename = "txouts")]
    pub tx_outs: u64,
    pub total_amount: u64,
}

/// Subset of `getpeerinfo` needed to drop a mirror's connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: u64,
}
