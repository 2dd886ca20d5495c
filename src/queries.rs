//! Read-only lookups over the index, as served to API clients.
//!
//! Confirmed data is always read from the store before pending data is read
//! from the mempool monitor. A transaction confirming between the two reads
//! is then missed by both rather than reported by both.

use crate::error::{IndexerError, StorageError};
use crate::mempool::MempoolMonitor;
use crate::reader::BlockReader;
use crate::schema::{self, AssertionRecord, FilePosition, SpendRecord, TxoRecord};
use crate::solver::ScriptSolver;
use crate::storage::KeyValueStore;
use crate::types::{EsignatureTransaction, IdentityTransaction, TransactionOutput};
use serde::Serialize;
use std::sync::Arc;

/// Number of headers returned with a transaction proof.
const PROOF_DEPTH: u64 = 10;

/// Hash of the indexed block containing `txid`, if that block is still on
/// the indexed chain.
pub fn confirmed_block(
    store: &dyn KeyValueStore,
    txid: &str,
) -> Result<Option<String>, StorageError> {
    let Some(block_hash) = store.get(&schema::tx_block_key(txid))? else {
        return Ok(None);
    };
    Ok(store
        .get(&schema::block_hash_key(&block_hash))?
        .map(|_| block_hash))
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AddressTxo {
    pub txhash: String,
    pub vout: u32,
    pub block: u64,
    pub value: u64,
    pub spender: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OutpointSpend {
    pub txid: String,
    pub vout: u32,
    pub spender: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSummary {
    pub block_hash: String,
    pub previous_block_hash: String,
    pub merkle_root: String,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionProof {
    pub tx_hash: String,
    pub block_hash: String,
    pub block_height: u64,
    /// Headers from the containing block downwards.
    pub chain: Vec<HeaderSummary>,
}

pub struct IndexQuery {
    store: Arc<dyn KeyValueStore>,
    solver: Arc<dyn ScriptSolver>,
    mempool: Option<Arc<MempoolMonitor>>,
}

impl IndexQuery {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        solver: Arc<dyn ScriptSolver>,
        mempool: Option<Arc<MempoolMonitor>>,
    ) -> Self {
        Self {
            store,
            solver,
            mempool,
        }
    }

    pub fn highest_block(&self) -> Result<Option<u64>, IndexerError> {
        match self.store.get(schema::HIGHEST_BLOCK_KEY)? {
            Some(value) => Ok(Some(parse_height(schema::HIGHEST_BLOCK_KEY, &value)?)),
            None => Ok(None),
        }
    }

    pub fn block_hash_at(&self, height: u64) -> Result<Option<String>, IndexerError> {
        Ok(self.store.get(&schema::block_height_key(height))?)
    }

    pub fn has_indexed_block(&self, block_hash: &str, height: u64) -> Result<bool, IndexerError> {
        Ok(self.block_hash_at(height)?.is_some_and(|hash| hash == block_hash))
    }

    /// Sum of the address's confirmed outputs that carry no spend marker.
    pub fn address_balance(&self, address: &str) -> Result<u64, IndexerError> {
        let mut balance = 0u64;
        let mut count = 0usize;
        for (key, value) in self.txo_records(address)? {
            let txo = TxoRecord::parse(&key, &value)?;
            count += 1;
            if self.store.get(&schema::spent_key(&txo.tx_hash, txo.vout))?.is_none() {
                balance += txo.value;
            }
        }
        tracing::debug!("Analyzed {} TXOs of {}, balance {}", count, address, balance);
        Ok(balance)
    }

    /// Confirmed outputs of `address` created at or after `since_block`, with
    /// their confirmed spender.
    pub fn address_txos(
        &self,
        address: &str,
        since_block: u64,
    ) -> Result<Vec<AddressTxo>, IndexerError> {
        let mut txos = Vec::new();
        for (key, value) in self.txo_records(address)? {
            let txo = TxoRecord::parse(&key, &value)?;
            if txo.height < since_block {
                continue;
            }
            let spender = self.confirmed_spender(&txo.tx_hash, txo.vout)?;
            txos.push(AddressTxo {
                txhash: txo.tx_hash,
                vout: txo.vout,
                block: txo.height,
                value: txo.value,
                spender,
            });
        }
        Ok(txos)
    }

    /// Spender of `txid:vout`: the confirmed one if any, otherwise a pending
    /// one.
    pub fn outpoint_spend(&self, txid: &str, vout: u32) -> Result<Option<String>, IndexerError> {
        if let Some(spender) = self.confirmed_spender(txid, vout)? {
            return Ok(Some(spender));
        }
        Ok(self
            .mempool
            .as_ref()
            .and_then(|mempool| mempool.outpoint_spend(txid, vout)))
    }

    /// The spent subset of `outpoints`, in input order.
    pub fn outpoint_spends(
        &self,
        outpoints: &[(String, u32)],
    ) -> Result<Vec<OutpointSpend>, IndexerError> {
        let mut spends = Vec::new();
        for (txid, vout) in outpoints {
            if let Some(spender) = self.outpoint_spend(txid, *vout)? {
                spends.push(OutpointSpend {
                    txid: txid.clone(),
                    vout: *vout,
                    spender,
                });
            }
        }
        Ok(spends)
    }

    /// Location of `txid` in the indexed chain plus the headers of up to ten
    /// blocks from its block downwards, never below height 1.
    pub fn transaction_proof(
        &self,
        txid: &str,
        reader: &BlockReader,
    ) -> Result<Option<TransactionProof>, IndexerError> {
        let Some(block_hash) = self.store.get(&schema::tx_block_key(txid))? else {
            return Ok(None);
        };
        let hash_key = schema::block_hash_key(&block_hash);
        let Some(height) = self.store.get(&hash_key)? else {
            return Ok(None);
        };
        let block_height = parse_height(&hash_key, &height)?;

        let lowest = block_height.saturating_sub(PROOF_DEPTH - 1).max(1);
        let mut chain = Vec::new();
        for height in (lowest..=block_height).rev() {
            let key = schema::block_file_position_key(height);
            let value = self
                .store
                .get(&key)?
                .ok_or_else(|| IndexerError::MalformedRecord {
                    key: key.clone(),
                    reason: "block in proof range is not indexed".to_string(),
                })?;
            let position = FilePosition::parse(&key, &value)?;
            let header = reader.read_block(
                &position.file_name,
                position.offset,
                height,
                position.network,
                true,
            )?;
            chain.push(HeaderSummary {
                block_hash: header.block_hash,
                previous_block_hash: header.previous_block_hash,
                merkle_root: header.merkle_root,
                version: header.version,
                time: header.time,
                bits: header.bits,
                nonce: header.nonce,
                height,
            });
        }

        Ok(Some(TransactionProof {
            tx_hash: txid.to_string(),
            block_hash,
            block_height,
            chain,
        }))
    }

    /// E-sign assertions made by `address`, confirmed first.
    pub fn esign_from(&self, address: &str) -> Result<Vec<EsignatureTransaction>, IndexerError> {
        let mut found: Vec<EsignatureTransaction> = self
            .assertion_records(&schema::esign_out_prefix(address))?
            .into_iter()
            .map(|(record, script)| EsignatureTransaction {
                from_address: address.to_string(),
                to_address: record.counterparty,
                tx_id: record.tx_id,
                height: record.height,
                time: record.time,
                script,
            })
            .collect();
        if let Some(mempool) = &self.mempool {
            found.extend(mempool.get_esign_transactions_from(address));
        }
        Ok(found)
    }

    /// E-sign assertions made about `address`, confirmed first.
    pub fn esign_to(&self, address: &str) -> Result<Vec<EsignatureTransaction>, IndexerError> {
        let mut found: Vec<EsignatureTransaction> = self
            .assertion_records(&schema::esign_in_prefix(address))?
            .into_iter()
            .map(|(record, script)| EsignatureTransaction {
                from_address: record.counterparty,
                to_address: address.to_string(),
                tx_id: record.tx_id,
                height: record.height,
                time: record.time,
                script,
            })
            .collect();
        if let Some(mempool) = &self.mempool {
            found.extend(mempool.get_esign_transactions_to(address));
        }
        Ok(found)
    }

    /// Identity assertions about `address`, confirmed first.
    pub fn identities(&self, address: &str) -> Result<Vec<IdentityTransaction>, IndexerError> {
        let mut found: Vec<IdentityTransaction> = self
            .assertion_records(&schema::identity_prefix(address))?
            .into_iter()
            .map(|(record, script)| IdentityTransaction {
                from_address: record.counterparty,
                to_address: address.to_string(),
                tx_id: record.tx_id,
                height: record.height,
                time: record.time,
                script,
            })
            .collect();
        if let Some(mempool) = &self.mempool {
            found.extend(mempool.get_identity_transactions(address));
        }
        Ok(found)
    }

    /// Unconfirmed outputs paying `address`. Empty without a mempool monitor.
    pub fn pending_txos(&self, address: &str) -> Vec<TransactionOutput> {
        self.mempool
            .as_ref()
            .map(|mempool| mempool.get_txos(address))
            .unwrap_or_default()
    }

    fn txo_records(&self, address: &str) -> Result<Vec<(String, String)>, StorageError> {
        let (start, limit) = schema::sequence_range(&schema::address_txo_prefix(address));
        self.store.scan(&start, &limit)
    }

    fn confirmed_spender(&self, txid: &str, vout: u32) -> Result<Option<String>, IndexerError> {
        let key = schema::spent_key(txid, vout);
        match self.store.get(&key)? {
            Some(value) => Ok(Some(SpendRecord::parse(&key, &value)?.spending_tx_hash)),
            None => Ok(None),
        }
    }

    fn assertion_records(
        &self,
        prefix: &str,
    ) -> Result<Vec<(AssertionRecord, Vec<u8>)>, IndexerError> {
        let (start, limit) = schema::sequence_range(prefix);
        self.store
            .scan(&start, &limit)?
            .into_iter()
            .map(|(key, value)| {
                let record =
                    AssertionRecord::parse(&key, &value, |a| self.solver.is_valid_address(a))?;
                let script = hex::decode(&record.script_hex).map_err(|e| {
                    IndexerError::MalformedRecord {
                        key: key.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok((record, script))
            })
            .collect()
    }
}

fn parse_height(key: &str, value: &str) -> Result<u64, IndexerError> {
    value.parse().map_err(|_| IndexerError::MalformedRecord {
        key: key.to_string(),
        reason: format!("not a height: {:?}", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_type::NetworkType;
    use crate::solver::StandardSolver;
    use crate::storage::MemoryStore;

    fn hash(n: u64) -> String {
        format!("{:064x}", n)
    }

    fn query(store: Arc<MemoryStore>) -> IndexQuery {
        IndexQuery::new(
            store,
            Arc::new(StandardSolver::new(NetworkType::Mainnet)),
            None,
        )
    }

    #[test]
    fn test_balance_skips_spent_outputs() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("Vaddr-txo-00000001", &schema::txo_value(&hash(1), 0, 10, 5000))
            .unwrap();
        store
            .put("Vaddr-txo-00000002", &schema::txo_value(&hash(2), 1, 12, 300))
            .unwrap();
        store
            .put(
                &schema::spent_key(&hash(1), 0),
                &schema::spent_value(&hash(100), &hash(3)),
            )
            .unwrap();

        let query = query(store);
        assert_eq!(query.address_balance("Vaddr").unwrap(), 300);
        assert_eq!(query.address_balance("Vnobody").unwrap(), 0);

        let txos = query.address_txos("Vaddr", 0).unwrap();
        assert_eq!(txos.len(), 2);
        assert_eq!(txos[0].spender, Some(hash(3)));
        assert_eq!(txos[1].spender, None);
        assert_eq!(query.address_txos("Vaddr", 11).unwrap().len(), 1);
    }

    #[test]
    fn test_outpoint_spends_returns_only_spent() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(
                &schema::spent_key(&hash(1), 4),
                &schema::spent_value(&hash(100), &hash(3)),
            )
            .unwrap();
        let query = query(store);

        let spends = query
            .outpoint_spends(&[(hash(1), 4), (hash(1), 5)])
            .unwrap();
        assert_eq!(
            spends,
            vec![OutpointSpend {
                txid: hash(1),
                vout: 4,
                spender: hash(3),
            }]
        );
        assert_eq!(query.outpoint_spend(&hash(1), 5).unwrap(), None);
    }

    #[test]
    fn test_confirmed_block_requires_block_on_chain() {
        let store = Arc::new(MemoryStore::new());
        store.put(&schema::tx_block_key(&hash(1)), &hash(100)).unwrap();
        assert_eq!(confirmed_block(store.as_ref(), &hash(1)).unwrap(), None);

        store
            .put(&schema::block_hash_key(&hash(100)), "00000007")
            .unwrap();
        assert_eq!(
            confirmed_block(store.as_ref(), &hash(1)).unwrap(),
            Some(hash(100))
        );
        assert_eq!(confirmed_block(store.as_ref(), &hash(2)).unwrap(), None);
    }

    #[test]
    fn test_highest_block_and_malformed_value() {
        let store = Arc::new(MemoryStore::new());
        let query = query(store.clone());
        assert_eq!(query.highest_block().unwrap(), None);

        store.put(schema::HIGHEST_BLOCK_KEY, "00000042").unwrap();
        assert_eq!(query.highest_block().unwrap(), Some(42));

        store.put(schema::HIGHEST_BLOCK_KEY, "tip").unwrap();
        assert!(matches!(
            query.highest_block(),
            Err(IndexerError::MalformedRecord { .. })
        ));
    }
}
