//! In-memory index of unconfirmed transactions.
//!
//! The monitor polls the node's mempool and keeps pending outputs per address
//! plus pending assertions. Transactions leave the index when the chain
//! indexer confirms them, or when they stop appearing in the node's mempool
//! for a configured number of consecutive polls.

use crate::assertions::{AssertionScanner, Assertions, StoreTxoLookup, TxoAddressLookup};
use crate::error::{IndexerError, StorageError};
use crate::network_type::NetworkType;
use crate::queries::confirmed_block;
use crate::reader::parse_transaction;
use crate::rpc::NodeRpc;
use crate::solver::ScriptSolver;
use crate::storage::KeyValueStore;
use crate::types::{EsignatureTransaction, IdentityTransaction, Transaction, TransactionOutput};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_EVICT_AFTER_MISSED_POLLS: u32 = 3;

#[derive(Default)]
struct MempoolState {
    transactions: HashMap<String, Transaction>,
    address_txos: HashMap<String, Vec<TransactionOutput>>,
    esign: Vec<EsignatureTransaction>,
    identity: Vec<IdentityTransaction>,
    /// Consecutive polls a tracked transaction was absent from.
    missed_polls: HashMap<String, u32>,
}

impl MempoolState {
    fn remove(&mut self, txid: &str) -> bool {
        let tracked = self.transactions.remove(txid).is_some();
        self.missed_polls.remove(txid);
        self.address_txos.retain(|_, outputs| {
            outputs.retain(|output| output.tx_hash != txid);
            !outputs.is_empty()
        });
        self.esign.retain(|esign| esign.tx_id != txid);
        self.identity.retain(|identity| identity.tx_id != txid);
        tracked
    }
}

/// Counts from one watch-loop iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub added: usize,
    pub evicted: usize,
}

pub struct MempoolMonitor {
    store: Arc<dyn KeyValueStore>,
    solver: Arc<dyn ScriptSolver>,
    scanner: AssertionScanner,
    network: NetworkType,
    evict_after_missed_polls: u32,
    state: RwLock<MempoolState>,
}

impl MempoolMonitor {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        solver: Arc<dyn ScriptSolver>,
        network: NetworkType,
        evict_after_missed_polls: u32,
    ) -> Self {
        Self {
            store,
            scanner: AssertionScanner::new(solver.clone()),
            solver,
            network,
            evict_after_missed_polls: evict_after_missed_polls.max(1),
            state: RwLock::new(MempoolState::default()),
        }
    }

    /// Run `commit` and retract `txids` from the pending index as one step:
    /// the state lock is held across both, so queries never see the
    /// transactions as pending after the commit landed. Nothing is retracted
    /// when `commit` fails.
    pub fn confirm<T, E, F>(&self, txids: &[String], commit: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut state = self.state.write();
        let committed = commit()?;
        for txid in txids {
            state.remove(txid);
        }
        Ok(committed)
    }

    /// Drop a transaction that has been indexed. Unknown ids are ignored.
    pub fn transaction_indexed(&self, txid: &str) {
        if self.state.write().remove(txid) {
            tracing::debug!("Pending transaction {} confirmed", txid);
        }
    }

    /// Id of the pending transaction spending `txid:vout`, if any.
    pub fn outpoint_spend(&self, txid: &str, vout: u32) -> Option<String> {
        self.state
            .read()
            .transactions
            .values()
            .find(|tx| {
                tx.inputs
                    .iter()
                    .any(|input| !input.coinbase && input.tx_hash == txid && input.txo_index == vout)
            })
            .map(|tx| tx.tx_hash.clone())
    }

    pub fn get_txos(&self, address: &str) -> Vec<TransactionOutput> {
        self.state
            .read()
            .address_txos
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_txo_address(&self, txid: &str, vout: u32) -> Option<String> {
        let state = self.state.read();
        let output = state.transactions.get(txid)?.outputs.get(vout as usize)?;
        self.solver.addresses(&output.script).into_iter().next()
    }

    pub fn get_esign_transactions_from(&self, address: &str) -> Vec<EsignatureTransaction> {
        self.state
            .read()
            .esign
            .iter()
            .filter(|esign| esign.from_address == address)
            .cloned()
            .collect()
    }

    pub fn get_esign_transactions_to(&self, address: &str) -> Vec<EsignatureTransaction> {
        self.state
            .read()
            .esign
            .iter()
            .filter(|esign| esign.to_address == address)
            .cloned()
            .collect()
    }

    pub fn get_identity_transactions(&self, address: &str) -> Vec<IdentityTransaction> {
        self.state
            .read()
            .identity
            .iter()
            .filter(|identity| identity.to_address == address)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().transactions.len()
    }

    /// One watch-loop iteration: reconcile against the node's current
    /// mempool, then fetch and index every transaction not yet tracked.
    ///
    /// An RPC failure aborts the iteration. A transaction that fails to
    /// parse is skipped and retried on the next poll.
    pub async fn poll_once(&self, rpc: &dyn NodeRpc) -> Result<PollStats, IndexerError> {
        let ids = rpc.get_raw_mempool().await?;
        let mut stats = PollStats {
            evicted: self.reconcile(&ids),
            ..PollStats::default()
        };

        let new_ids: Vec<String> = {
            let state = self.state.read();
            let untracked = ids
                .into_iter()
                .filter(|id| !state.transactions.contains_key(id))
                .collect();
            untracked
        };

        for txid in new_ids {
            // Transactions can leave the node's mempool between the two calls.
            let bytes = match rpc.get_raw_transaction(&txid).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!("Mempool transaction {} no longer available: {}", txid, e);
                    continue;
                }
            };
            let tx = match parse_transaction(&bytes) {
                Ok(tx) => tx,
                Err(e) => {
                    tracing::warn!("Skipping unparseable mempool transaction {}: {}", txid, e);
                    continue;
                }
            };
            let seen_at = chrono::Utc::now().timestamp().max(0) as u64;
            let assertions = self.scanner.scan(
                std::slice::from_ref(&tx),
                0,
                seen_at,
                &[&StoreTxoLookup(self.store.as_ref()), self],
            )?;
            if self.insert_pending(tx, assertions)? {
                stats.added += 1;
            }
        }
        Ok(stats)
    }

    /// Poll every `poll_interval` until `shutdown` is cancelled. Failed polls
    /// are logged and never end the loop.
    pub async fn run(
        self: Arc<Self>,
        rpc: Arc<dyn NodeRpc>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            "👀 Mempool monitor started on {} (polling every {}ms)",
            self.network,
            poll_interval.as_millis()
        );
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("🛑 Mempool monitor shutting down gracefully");
                    break;
                }
                _ = interval.tick() => {
                    match self.poll_once(rpc.as_ref()).await {
                        Ok(stats) if stats.added > 0 || stats.evicted > 0 => {
                            tracing::debug!(
                                "Mempool poll: {} new, {} evicted, {} pending",
                                stats.added,
                                stats.evicted,
                                self.pending_count()
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("⚠️  Mempool poll failed: {}", e),
                    }
                }
            }
        }
    }

    /// Advance the missed-poll counters and evict transactions that have
    /// been absent for too long.
    fn reconcile(&self, current: &[String]) -> usize {
        let present: HashSet<&str> = current.iter().map(String::as_str).collect();
        let mut state = self.state.write();

        let mut evict = Vec::new();
        let tracked: Vec<String> = state.transactions.keys().cloned().collect();
        for txid in tracked {
            if present.contains(txid.as_str()) {
                state.missed_polls.remove(&txid);
                continue;
            }
            let missed = state.missed_polls.entry(txid.clone()).or_insert(0);
            *missed += 1;
            if *missed >= self.evict_after_missed_polls {
                evict.push(txid);
            }
        }

        for txid in &evict {
            state.remove(txid);
            tracing::debug!("Evicted {} after it left the node's mempool", txid);
        }
        evict.len()
    }

    /// Add a parsed transaction unless it is already tracked or already
    /// confirmed on the indexed chain. The confirmation check runs under the
    /// state lock, which the indexer also holds while committing.
    fn insert_pending(&self, tx: Transaction, assertions: Assertions) -> Result<bool, StorageError> {
        let mut state = self.state.write();
        if state.transactions.contains_key(&tx.tx_hash) {
            return Ok(false);
        }
        if confirmed_block(self.store.as_ref(), &tx.tx_hash)?.is_some() {
            return Ok(false);
        }

        for output in &tx.outputs {
            for address in self.solver.addresses(&output.script) {
                state
                    .address_txos
                    .entry(address)
                    .or_default()
                    .push(output.clone());
            }
        }
        state.esign.extend(assertions.esign);
        state.identity.extend(assertions.identity);
        state.transactions.insert(tx.tx_hash.clone(), tx);
        Ok(true)
    }
}

impl TxoAddressLookup for MempoolMonitor {
    fn txo_address(&self, tx_hash: &str, vout: u32) -> Result<Option<String>, StorageError> {
        Ok(self.get_txo_address(tx_hash, vout))
    }
}
