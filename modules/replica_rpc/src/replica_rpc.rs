//! JSON-RPC client for replica nodes.
//!
//! Implements [`ReplicaRpc`] over HTTP with basic auth, classifying replica
//! error responses into the engine's error taxonomy.

mod wire;

use anyhow::Result;
use async_trait::async_trait;
use forkscout_common::{
    BlockData, BlockHash, BlockVerbosity, BlockchainStatus, HeaderData, PeerSummary, ReplicaRpc,
    RpcError, TipInfo, TxOutSetTotals,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RpcSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

pub struct RpcClient {
    http: reqwest::Client,
    settings: RpcSettings,
}

impl RpcClient {
    pub fn new(settings: RpcSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self { http, settings })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let envelope = self.call_raw(method, params).await?;
        match envelope.result {
            Some(result) => {
                serde_json::from_value(result).map_err(|e| RpcError::Other(format!("{method}: {e}")))
            }
            None => Err(RpcError::Other(format!("{method}: empty result"))),
        }
    }

    /// For methods whose result is null or uninteresting.
    async fn call_unit(&self, method: &str, params: Value) -> Result<(), RpcError> {
        self.call_raw(method, params).await.map(|_| ())
    }

    async fn call_raw(&self, method: &str, params: Value) -> Result<Envelope, RpcError> {
        trace!(method, "replica rpc call");
        let request = json!({
            "jsonrpc": "1.0",
            "id": "forkscout",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.settings.url)
            .basic_auth(&self.settings.user, Some(&self.settings.password))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: Envelope = response.json().await.map_err(transport_error)?;
        if let Some(error) = &envelope.error {
            return Err(classify(method, error));
        }
        Ok(envelope)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    result: Option<Value>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: i64,
    message: String,
}

fn transport_error(e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout
    } else if e.is_connect() {
        RpcError::Unreachable(e.to_string())
    } else {
        RpcError::Other(e.to_string())
    }
}

fn classify(method: &str, error: &WireError) -> RpcError {
    match error.code {
        -28 => RpcError::Initializing,
        -32601 => RpcError::MethodNotSupported,
        _ if error.message.contains("pruned data") => RpcError::BlockPruned,
        _ if error.message.contains("Block not found") => RpcError::BlockNotFound,
        _ if error.message.contains("Node not found in connected nodes") => {
            RpcError::PeerNotConnected
        }
        _ => RpcError::Other(format!("{method}: {} (code {})", error.message, error.code)),
    }
}

#[async_trait]
impl ReplicaRpc for RpcClient {
    async fn get_blockchain_info(&self) -> Result<BlockchainStatus, RpcError> {
        self.call("getblockchaininfo", json!([])).await
    }

    async fn get_chain_tips(&self) -> Result<Vec<TipInfo>, RpcError> {
        self.call("getchaintips", json!([])).await
    }

    async fn get_block(
        &self,
        hash: &BlockHash,
        verbosity: BlockVerbosity,
    ) -> Result<BlockData, RpcError> {
        match verbosity {
            BlockVerbosity::Summary => {
                let raw: wire::RawBlockSummary = self.call("getblock", json!([hash, 1])).await?;
                Ok(raw.into_block_data(None))
            }
            BlockVerbosity::WithTransactions => {
                let raw: wire::RawBlockFull = self.call("getblock", json!([hash, 2])).await?;
                raw.into_block_data()
            }
        }
    }

    async fn get_block_header(&self, hash: &BlockHash) -> Result<HeaderData, RpcError> {
        self.call("getblockheader", json!([hash, true])).await
    }

    async fn get_tx_out_set_info(&self) -> Result<TxOutSetTotals, RpcError> {
        let raw: wire::RawTxOutSet = self.call("gettxoutsetinfo", json!([])).await?;
        Ok(raw.into_totals())
    }

    async fn invalidate_block(&self, hash: &BlockHash) -> Result<(), RpcError> {
        self.call_unit("invalidateblock", json!([hash])).await
    }

    async fn reconsider_block(&self, hash: &BlockHash) -> Result<(), RpcError> {
        self.call_unit("reconsiderblock", json!([hash])).await
    }

    async fn set_network_active(&self, active: bool) -> Result<(), RpcError> {
        self.call_unit("setnetworkactive", json!([active])).await
    }

    async fn get_peer_info(&self) -> Result<Vec<PeerSummary>, RpcError> {
        self.call("getpeerinfo", json!([])).await
    }

    async fn disconnect_peer(&self, peer_id: u64) -> Result<(), RpcError> {
        self.call_unit("disconnectnode", json!(["", peer_id])).await
    }
}
