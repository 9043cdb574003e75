//! The RPC seam between the engine and replica clients.
//!
//! Transport is deliberately out of scope; modules depend only on this
//! trait, and tests drive them with the in-memory replica from
//! `forkscout_test_utils`.

use crate::byte_array::BlockHash;
use crate::types::{
    BlockData, BlockchainStatus, HeaderData, PeerSummary, TipInfo, TxOutSetTotals,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("replica unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("block not found")]
    BlockNotFound,
    #[error("block pruned")]
    BlockPruned,
    #[error("method not supported by this replica")]
    MethodNotSupported,
    #[error("peer not connected")]
    PeerNotConnected,
    #[error("replica still initializing")]
    Initializing,
    #[error("rpc error: {0}")]
    Other(String),
}

impl RpcError {
    /// Errors that indicate the replica itself is down rather than the
    /// request being bad.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout)
    }
}

/// How much of a block to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockVerbosity {
    /// Header-level fields only.
    Summary,
    /// Include per-transaction inputs and outputs.
    WithTransactions,
}

/// The calls the engine issues against a replica.
#[async_trait]
pub trait ReplicaRpc: Send + Sync {
    async fn get_blockchain_info(&self) -> Result<BlockchainStatus, RpcError>;
    async fn get_chain_tips(&self) -> Result<Vec<TipInfo>, RpcError>;
    async fn get_block(
        &self,
        hash: &BlockHash,
        verbosity: BlockVerbosity,
    ) -> Result<BlockData, RpcError>;
    async fn get_block_header(&self, hash: &BlockHash) -> Result<HeaderData, RpcError>;
    async fn get_tx_out_set_info(&self) -> Result<TxOutSetTotals, RpcError>;
    async fn invalidate_block(&self, hash: &BlockHash) -> Result<(), RpcError>;
    async fn reconsider_block(&self, hash: &BlockHash) -> Result<(), RpcError>;
    async fn set_network_active(&self, active: bool) -> Result<(), RpcError>;
    async fn get_peer_info(&self) -> Result<Vec<PeerSummary>, RpcError>;
    async fn disconnect_peer(&self, peer_id: u64) -> Result<(), RpcError>;
}
