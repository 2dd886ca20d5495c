//! Structured chain records produced by the block reader.
//!
//! Hashes are carried as lowercase hex in display order, which is also the
//! form embedded in every index key.

use crate::network_type::NetworkType;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub block_hash: String,
    pub previous_block_hash: String,
    pub height: u64,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub version: i32,
    pub merkle_root: String,
    pub byte_size: u64,
    pub file_name: String,
    /// Offset of the first byte of the serialized block within `file_name`.
    pub file_position: u64,
    pub network: NetworkType,
    pub transactions: Vec<Transaction>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub tx_hash: String,
    pub file_position: u64,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionInput {
    /// Hash of the transaction whose output is consumed.
    pub tx_hash: String,
    pub txo_index: u32,
    pub coinbase: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionOutput {
    /// Owning transaction.
    pub tx_hash: String,
    pub index: u32,
    pub value: u64,
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EsignatureTransaction {
    pub from_address: String,
    pub to_address: String,
    pub tx_id: String,
    pub height: u64,
    pub time: u64,
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityTransaction {
    pub from_address: String,
    pub to_address: String,
    pub tx_id: String,
    pub height: u64,
    pub time: u64,
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
