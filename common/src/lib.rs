//! Shared types and helpers for the Forkscout modules

pub mod alerts;
pub mod byte_array;
pub mod messages;
pub mod params;
pub mod rpc;
pub mod types;
pub mod work;

pub use byte_array::{BlockHash, TxId};
pub use rpc::{BlockVerbosity, ReplicaRpc, RpcError};
pub use types::*;
pub use work::ChainWork;
