//! Wire structures for replica JSON-RPC responses, and their conversion
//! into engine types. Replicas report amounts as fractional coin values;
//! they are converted to integer base units here and nowhere else.

use forkscout_common::params::COIN;
use forkscout_common::{
    BlockData, BlockHash, ChainWork, OutPoint, RpcError, TxData, TxId, TxOutSetTotals, TxOutput,
};
use serde::Deserialize;

pub(crate) fn coins_to_base_units(value: f64) -> u64 {
    (value * COIN as f64).round() as u64
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawBlockSummary {
    pub hash: BlockHash,
    pub height: u64,
    pub previousblockhash: Option<BlockHash>,
    pub chainwork: Option<ChainWork>,
    pub time: u64,
    pub mediantime: Option<u64>,
    pub version: u32,
    #[serde(rename = "nTx")]
    pub n_tx: u64,
    pub size: u64,
}

impl RawBlockSummary {
    pub(crate) fn into_block_data(self, transactions: Option<Vec<TxData>>) -> BlockData {
        BlockData {
            hash: self.hash,
            height: self.height,
            previous_block_hash: self.previousblockhash,
            chain_work: self.chainwork,
            time: self.time,
            median_time: self.mediantime,
            version: self.version,
            tx_count: self.n_tx,
            size: self.size,
            transactions,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawBlockFull {
    #[serde(flatten)]
    pub summary: RawBlockSummary,
    pub tx: Vec<RawTx>,
}

impl RawBlockFull {
    pub(crate) fn into_block_data(self) -> Result<BlockData, RpcError> {
        let transactions = self
            .tx
            .into_iter()
            .map(RawTx::into_tx_data)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.summary.into_block_data(Some(transactions)))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawTx {
    pub txid: TxId,
    pub vin: Vec<RawVin>,
    pub vout: Vec<RawVout>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawVin {
    pub txid: Option<TxId>,
    pub vout: Option<u32>,
    pub coinbase: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawVout {
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: RawScript,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawScript {
    pub hex: String,
}

impl RawTx {
    pub(crate) fn into_tx_data(self) -> Result<TxData, RpcError> {
        let mut inputs = Vec::new();
        let mut coinbase_tag = None;
        for vin in self.vin {
            if let Some(coinbase) = vin.coinbase {
                coinbase_tag = Some(decode_hex(&coinbase)?);
            } else if let (Some(txid), Some(vout)) = (vin.txid, vin.vout) {
                inputs.push(OutPoint { txid, vout });
            }
        }
        let outputs = self
            .vout
            .into_iter()
            .map(|out| {
                Ok(TxOutput {
                    value: coins_to_base_units(out.value),
                    script_pubkey: decode_hex(&out.script_pub_key.hex)?,
                })
            })
            .collect::<Result<Vec<_>, RpcError>>()?;
        Ok(TxData {
            txid: self.txid,
            inputs,
            outputs,
            coinbase_tag,
        })
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, RpcError> {
    hex::decode(s).map_err(|e| RpcError::Other(format!("invalid hex in response: {e}")))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawTxOutSet {
    pub height: u64,
    pub bestblock: BlockHash,
    pub txouts: u64,
    pub total_amount: f64,
}

impl RawTxOutSet {
    pub(crate) fn into_totals(self) -> TxOutSetTotals {
        TxOutSetTotals {
            height: self.height,
            best_block: self.bestblock,
            tx_outs: self.txouts,
            total_amount: coins_to_base_units(self.total_amount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_fractional_coins_exactly() {
        assert_eq!(coins_to_base_units(0.1), 10_000_000);
        assert_eq!(coins_to_base_units(0.00010001), 10_001);
        assert_eq!(coins_to_base_units(50.0), 5_000_000_000);
        assert_eq!(coins_to_base_units(20_999_999.9769), 2_099_999_997_690_000);
    }

    #[test]
    fn verbose_block_converts_to_engine_types() {
        let raw: RawBlockFull = serde_json::from_value(json!({
            "hash": "00000000000000000000000000000000000000000000000000000000000000aa",
            "height": 700_000,
            "previousblockhash":
                "00000000000000000000000000000000000000000000000000000000000000bb",
            "chainwork":
                "00000000000000000000000000000000000000002070113a6d46d5af1c0b2d4e",
            "time": 1_700_000_000u64,
            "mediantime": 1_699_999_000u64,
            "version": 0x2000_0000u32,
            "nTx": 2,
            "size": 1_523,
            "tx": [
                {
                    "txid":
                        "11000000000000000000000000000000000000000000000000000000000000aa",
                    "vin": [{ "coinbase": "03abcdef" }],
                    "vout": [
                        { "value": 6.25, "scriptPubKey": { "hex": "76a914ff88ac" } }
                    ]
                },
                {
                    "txid":
                        "22000000000000000000000000000000000000000000000000000000000000aa",
                    "vin": [{
                        "txid":
                            "33000000000000000000000000000000000000000000000000000000000000aa",
                        "vout": 1
                    }],
                    "vout": [
                        { "value": 0.0005, "scriptPubKey": { "hex": "0014aabb" } }
                    ]
                }
            ]
        }))
        .unwrap();

        let block = raw.into_block_data().unwrap();
        assert_eq!(block.height, 700_000);
        assert_eq!(block.tx_count, 2);
        let txs = block.transactions.unwrap();
        assert_eq!(txs[0].coinbase_tag, Some(vec![0x03, 0xab, 0xcd, 0xef]));
        assert!(txs[0].inputs.is_empty());
        assert_eq!(txs[0].outputs[0].value, 625_000_000);
        assert_eq!(txs[1].inputs.len(), 1);
        assert_eq!(txs[1].inputs[0].vout, 1);
        assert_eq!(txs[1].outputs[0].value, 50_000);
        assert_eq!(txs[1].outputs[0].script_pubkey, vec![0x00, 0x14, 0xaa, 0xbb]);
    }

    #[test]
    fn utxo_set_totals_convert_to_base_units() {
        let raw: RawTxOutSet = serde_json::from_value(json!({
            "height": 700_000,
            "bestblock":
                "00000000000000000000000000000000000000000000000000000000000000aa",
            "txouts": 80_000_000,
            "total_amount": 18_700_001.5
        }))
        .unwrap();
        let totals = raw.into_totals();
        assert_eq!(totals.total_amount, 1_870_000_150_000_000);
        assert_eq!(totals.tx_outs, 80_000_000);
    }
}
