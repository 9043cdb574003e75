//! The shared block DAG all Forkscout modules read and mutate.
//!
//! No module owns a private copy: the process wires one graph behind an
//! `Arc<tokio::sync::RwLock<_>>` and a reconciliation pass holds the writer
//! side for the whole pass.

mod block;
mod block_graph;
mod errors;
mod resolve;

pub use block::Block;
pub use block_graph::BlockGraph;
pub use errors::GraphError;
pub use resolve::{resolve_ancestors, stage_ancestors, MarkAs, StagedAncestors};
