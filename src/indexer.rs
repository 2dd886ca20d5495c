//! Block indexing.
//!
//! Every record a block produces is written in a single atomic batch. Records
//! that must disappear if the block is later replaced at its height are
//! paired with a block-scoped pointer (`{blockHash}-txo-`, `-txospent-`,
//! `-assert-`), since the store has no way to find them by value.

use crate::assertions::{AssertionScanner, StoreTxoLookup, TxoAddressLookup};
use crate::error::{IndexerError, StorageError};
use crate::mempool::MempoolMonitor;
use crate::schema::{self, SpendRecord};
use crate::sequence::SequenceCache;
use crate::solver::ScriptSolver;
use crate::storage::{KeyValueStore, WriteBatch};
use crate::types::Block;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The block was already the indexed block at its height.
    AlreadyIndexed,
    Indexed,
    /// A different block was indexed at this height and has been replaced.
    Replaced { previous: String },
}

/// A batch in which every record is written together with a cleanup pointer.
struct IndexedCollection<'a> {
    sequences: &'a SequenceCache,
    batch: WriteBatch,
}

impl<'a> IndexedCollection<'a> {
    fn new(sequences: &'a SequenceCache, batch: WriteBatch) -> Self {
        Self { sequences, batch }
    }

    /// Put `value` under the next `{prefix}-{seq}` key. Returns the record key
    /// and its cleanup pointer key.
    fn insert_sequenced(
        &mut self,
        prefix: &str,
        value: String,
        cleanup_prefix: &str,
    ) -> Result<(String, String), StorageError> {
        let key = schema::sequenced_key(prefix, self.sequences.next(prefix)?);
        self.insert_keyed(key, value, cleanup_prefix)
    }

    fn insert_keyed(
        &mut self,
        key: String,
        value: String,
        cleanup_prefix: &str,
    ) -> Result<(String, String), StorageError> {
        let pointer =
            schema::sequenced_key(cleanup_prefix, self.sequences.next(cleanup_prefix)?);
        self.batch.put(key.clone(), value);
        self.batch.put(pointer.clone(), key.clone());
        Ok((key, pointer))
    }

    fn put(&mut self, key: String, value: String) {
        self.batch.put(key, value);
    }

    fn into_batch(self) -> WriteBatch {
        self.batch
    }
}

pub struct ChainIndexer {
    store: Arc<dyn KeyValueStore>,
    sequences: SequenceCache,
    solver: Arc<dyn ScriptSolver>,
    scanner: AssertionScanner,
    mempool: Option<Arc<MempoolMonitor>>,
    write_lock: Mutex<()>,
}

impl ChainIndexer {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        solver: Arc<dyn ScriptSolver>,
        mempool: Option<Arc<MempoolMonitor>>,
    ) -> Self {
        Self {
            sequences: SequenceCache::new(store.clone()),
            scanner: AssertionScanner::new(solver.clone()),
            store,
            solver,
            mempool,
            write_lock: Mutex::new(()),
        }
    }

    /// True when `block_hash` is the block recorded at `height`.
    pub fn has_indexed_block(&self, block_hash: &str, height: u64) -> Result<bool, IndexerError> {
        Ok(self
            .store
            .get(&schema::block_height_key(height))?
            .is_some_and(|indexed| indexed == block_hash))
    }

    /// Index `block`, replacing whatever block was previously indexed at the
    /// same height.
    pub fn index_block(&self, block: &Block) -> Result<IndexOutcome, IndexerError> {
        let _writer = self.write_lock.lock();
        let hash = block.block_hash.as_str();
        let height = block.height;

        let mut batch = WriteBatch::new();
        let previous = match self.store.get(&schema::block_height_key(height))? {
            Some(indexed) if indexed == hash => return Ok(IndexOutcome::AlreadyIndexed),
            Some(indexed) => {
                tracing::warn!(
                    "⚠️  Replacing block {} at height {} with {}",
                    indexed,
                    height,
                    hash
                );
                let cleared = self.add_cleanup(&mut batch, &indexed)?;
                batch.delete(schema::block_hash_key(&indexed));
                tracing::debug!("Clearing {} records of block {}", cleared, indexed);
                Some(indexed)
            }
            None => None,
        };

        let mut records = IndexedCollection::new(&self.sequences, batch);

        let raise_tip = match self.store.get(schema::HIGHEST_BLOCK_KEY)? {
            Some(stored) => {
                let stored: u64 = stored.parse().map_err(|_| IndexerError::MalformedRecord {
                    key: schema::HIGHEST_BLOCK_KEY.to_string(),
                    reason: format!("not a height: {:?}", stored),
                })?;
                height > stored
            }
            None => true,
        };
        if raise_tip {
            records.put(
                schema::HIGHEST_BLOCK_KEY.to_string(),
                schema::height_field(height),
            );
        }

        records.put(schema::block_height_key(height), hash.to_string());
        records.put(
            schema::block_file_position_key(height),
            schema::block_file_position_value(
                &block.file_name,
                block.file_position,
                block.network,
            ),
        );
        records.put(schema::block_hash_key(hash), schema::height_field(height));
        records.put(schema::block_time_key(height), block.time.to_string());
        records.put(schema::block_size_key(height), block.byte_size.to_string());
        records.put(
            schema::block_tx_count_key(height),
            block.transactions.len().to_string(),
        );

        self.index_assertions(&mut records, block)?;

        let txo_cleanup = schema::block_txo_prefix(hash);
        let spent_cleanup = schema::block_txo_spent_prefix(hash);
        for (position, tx) in block.transactions.iter().enumerate() {
            records.put(schema::block_tx_key(hash, position), tx.tx_hash.clone());
            records.put(
                schema::tx_file_position_key(&tx.tx_hash),
                schema::tx_file_position_value(&block.file_name, tx.file_position),
            );
            records.put(schema::tx_block_key(&tx.tx_hash), hash.to_string());

            for output in &tx.outputs {
                for address in self.solver.addresses(&output.script) {
                    records.insert_sequenced(
                        &schema::address_txo_prefix(&address),
                        schema::txo_value(&tx.tx_hash, output.index, height, output.value),
                        &txo_cleanup,
                    )?;
                    records.put(schema::txo_address_key(&tx.tx_hash, output.index), address);
                }
            }

            for input in tx.inputs.iter().filter(|input| !input.coinbase) {
                records.insert_keyed(
                    schema::spent_key(&input.tx_hash, input.txo_index),
                    schema::spent_value(hash, &tx.tx_hash),
                    &spent_cleanup,
                )?;
            }
        }

        let batch = records.into_batch();
        let writes = batch.len();
        let txids: Vec<String> = block
            .transactions
            .iter()
            .map(|tx| tx.tx_hash.clone())
            .collect();
        match &self.mempool {
            Some(mempool) => mempool.confirm(&txids, || self.store.write(batch))?,
            None => self.store.write(batch)?,
        }

        tracing::info!(
            "📦 Indexed block {} at height {} ({} txs, {} writes)",
            hash,
            height,
            txids.len(),
            writes
        );
        Ok(match previous {
            Some(previous) => IndexOutcome::Replaced { previous },
            None => IndexOutcome::Indexed,
        })
    }

    /// Delete every output, spend marker and assertion record produced by
    /// `block_hash`, as one batch. The pointers themselves are left behind.
    pub fn clear_block_txos(&self, block_hash: &str) -> Result<usize, IndexerError> {
        let _writer = self.write_lock.lock();
        let mut batch = WriteBatch::new();
        let cleared = self.add_cleanup(&mut batch, block_hash)?;
        self.store.write(batch)?;
        Ok(cleared)
    }

    fn add_cleanup(&self, batch: &mut WriteBatch, block_hash: &str) -> Result<usize, IndexerError> {
        let mut cleared = 0;
        for prefix in [
            schema::block_txo_prefix(block_hash),
            schema::block_assertion_prefix(block_hash),
        ] {
            let (start, limit) = schema::sequence_range(&prefix);
            for (_, target) in self.store.scan(&start, &limit)? {
                batch.delete(target);
                cleared += 1;
            }
        }

        // A spend marker is rewritten by whichever block spends the outpoint
        // last, so it only goes when this block still owns it.
        let spent_prefix = schema::block_txo_spent_prefix(block_hash);
        let (start, limit) = schema::sequence_range(&spent_prefix);
        for (_, target) in self.store.scan(&start, &limit)? {
            let Some(value) = self.store.get(&target)? else {
                continue;
            };
            if SpendRecord::parse(&target, &value)?.block_hash == block_hash {
                batch.delete(target);
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    fn index_assertions(
        &self,
        records: &mut IndexedCollection<'_>,
        block: &Block,
    ) -> Result<(), IndexerError> {
        let store_lookup = StoreTxoLookup(self.store.as_ref());
        let mut lookups: Vec<&dyn TxoAddressLookup> = vec![&store_lookup];
        if let Some(mempool) = &self.mempool {
            lookups.push(mempool.as_ref());
        }
        let found = self.scanner.scan(
            &block.transactions,
            block.height,
            u64::from(block.time),
            &lookups,
        )?;

        let cleanup = schema::block_assertion_prefix(&block.block_hash);
        for esign in &found.esign {
            records.insert_sequenced(
                &schema::esign_out_prefix(&esign.from_address),
                schema::assertion_value(
                    &esign.to_address,
                    &esign.tx_id,
                    esign.height,
                    esign.time,
                    &esign.script,
                ),
                &cleanup,
            )?;
            records.insert_sequenced(
                &schema::esign_in_prefix(&esign.to_address),
                schema::assertion_value(
                    &esign.from_address,
                    &esign.tx_id,
                    esign.height,
                    esign.time,
                    &esign.script,
                ),
                &cleanup,
            )?;
        }
        for identity in &found.identity {
            records.insert_sequenced(
                &schema::identity_prefix(&identity.to_address),
                schema::assertion_value(
                    &identity.from_address,
                    &identity.tx_id,
                    identity.height,
                    identity.time,
                    &identity.script,
                ),
                &cleanup,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_type::NetworkType;
    use crate::solver::StandardSolver;
    use crate::storage::MemoryStore;
    use crate::types::{Transaction, TransactionInput, TransactionOutput};

    fn hash(n: u64) -> String {
        format!("{:064x}", n)
    }

    fn p2pkh(byte: u8) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[byte; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    fn block(id: u64, height: u64, transactions: Vec<Transaction>) -> Block {
        Block {
            block_hash: hash(id),
            previous_block_hash: hash(id - 1),
            height,
            time: 1_500_000_000 + height as u32,
            bits: 0x1e0f_fff0,
            nonce: 0,
            version: 1,
            merkle_root: hash(0),
            byte_size: 285,
            file_name: "blk00000.dat".to_string(),
            file_position: 8 + height * 300,
            network: NetworkType::Mainnet,
            transactions,
        }
    }

    fn payment(id: u64, spends: Option<(u64, u32)>, pays: u8, value: u64) -> Transaction {
        let input = match spends {
            Some((tx, vout)) => TransactionInput {
                tx_hash: hash(tx),
                txo_index: vout,
                coinbase: false,
            },
            None => TransactionInput {
                tx_hash: hash(0),
                txo_index: u32::MAX,
                coinbase: true,
            },
        };
        Transaction {
            tx_hash: hash(id),
            file_position: 0,
            inputs: vec![input],
            outputs: vec![TransactionOutput {
                tx_hash: hash(id),
                index: 0,
                value,
                script: p2pkh(pays),
            }],
        }
    }

    fn indexer() -> (ChainIndexer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let indexer = ChainIndexer::new(
            store.clone(),
            Arc::new(StandardSolver::new(NetworkType::Mainnet)),
            None,
        );
        (indexer, store)
    }

    #[test]
    fn test_header_records() {
        let (indexer, store) = indexer();
        let b = block(1000, 5, vec![payment(1, None, 1, 50)]);
        assert_eq!(indexer.index_block(&b).unwrap(), IndexOutcome::Indexed);

        assert_eq!(store.get("block-00000005").unwrap(), Some(hash(1000)));
        assert_eq!(
            store.get(&schema::block_hash_key(&hash(1000))).unwrap(),
            Some("00000005".to_string())
        );
        assert_eq!(store.get("block-txcount-00000005").unwrap(), Some("1".to_string()));
        assert_eq!(store.get("block-size-00000005").unwrap(), Some("285".to_string()));
        assert_eq!(
            store.get("block-filePosition-00000005").unwrap(),
            Some("blk00000.dat0000000015080".to_string())
        );
        assert_eq!(store.get(schema::HIGHEST_BLOCK_KEY).unwrap(), Some("00000005".to_string()));
        assert_eq!(
            store.get(&schema::tx_block_key(&hash(1))).unwrap(),
            Some(hash(1000))
        );
        assert!(indexer.has_indexed_block(&hash(1000), 5).unwrap());
        assert!(!indexer.has_indexed_block(&hash(1000), 6).unwrap());
    }

    #[test]
    fn test_highest_block_never_moves_down() {
        let (indexer, store) = indexer();
        indexer.index_block(&block(1010, 10, vec![])).unwrap();
        indexer.index_block(&block(1004, 4, vec![])).unwrap();
        assert_eq!(store.get(schema::HIGHEST_BLOCK_KEY).unwrap(), Some("00000010".to_string()));
    }

    #[test]
    fn test_reindex_is_a_no_op() {
        let (indexer, store) = indexer();
        let b = block(1000, 3, vec![payment(1, None, 1, 50), payment(2, Some((9, 0)), 2, 20)]);
        indexer.index_block(&b).unwrap();
        let before = store.snapshot();

        assert_eq!(indexer.index_block(&b).unwrap(), IndexOutcome::AlreadyIndexed);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_replacement_removes_previous_records() {
        let (indexer, store) = indexer();
        let first = block(1000, 3, vec![payment(1, Some((9, 0)), 1, 50)]);
        let second = block(2000, 3, vec![payment(2, Some((8, 1)), 2, 70)]);

        indexer.index_block(&first).unwrap();
        assert!(store.get(&schema::spent_key(&hash(9), 0)).unwrap().is_some());

        assert_eq!(
            indexer.index_block(&second).unwrap(),
            IndexOutcome::Replaced { previous: hash(1000) }
        );
        assert!(store.get(&schema::spent_key(&hash(9), 0)).unwrap().is_none());
        assert!(store.get(&schema::block_hash_key(&hash(1000))).unwrap().is_none());
        assert_eq!(
            store.get(&schema::spent_key(&hash(8), 1)).unwrap(),
            Some(schema::spent_value(&hash(2000), &hash(2)))
        );
        assert!(indexer.has_indexed_block(&hash(2000), 3).unwrap());
        assert!(!indexer.has_indexed_block(&hash(1000), 3).unwrap());
    }

    #[test]
    fn test_spend_marker_shared_by_both_blocks_survives_replacement() {
        let (indexer, store) = indexer();
        let tx = payment(1, Some((9, 0)), 1, 50);
        indexer.index_block(&block(1000, 3, vec![tx.clone()])).unwrap();
        indexer.index_block(&block(2000, 3, vec![tx])).unwrap();

        assert_eq!(
            store.get(&schema::spent_key(&hash(9), 0)).unwrap(),
            Some(schema::spent_value(&hash(2000), &hash(1)))
        );
    }

    #[test]
    fn test_clear_block_txos_counts_deleted_records() {
        let (indexer, store) = indexer();
        let b = block(1000, 3, vec![payment(1, None, 1, 50), payment(2, Some((9, 0)), 2, 20)]);
        indexer.index_block(&b).unwrap();

        assert_eq!(indexer.clear_block_txos(&hash(1000)).unwrap(), 3);
        assert!(store.get(&schema::spent_key(&hash(9), 0)).unwrap().is_none());
        let (start, limit) = schema::sequence_range(&schema::block_txo_prefix(&hash(1000)));
        // Pointers are left in place.
        assert_eq!(store.count(&start, &limit).unwrap(), 2);
    }
}
