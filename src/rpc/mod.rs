//! Upstream node access.

pub mod client;

pub use client::JsonRpcClient;

use crate::error::RpcError;
use async_trait::async_trait;

/// The subset of the node's RPC interface the mempool monitor needs.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Ids of every transaction currently in the node's mempool.
    async fn get_raw_mempool(&self) -> Result<Vec<String>, RpcError>;

    /// Serialized bytes of a transaction.
    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, RpcError>;
}
