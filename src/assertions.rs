//! E-sign and identity assertion discovery.
//!
//! An assertion is an ordinary transaction with an OP_RETURN output whose
//! first push begins with a marker. The asserting party is whoever owned the
//! outpoint spent by the first non-coinbase input; the subject is the first
//! other output that pays an address.

use crate::error::StorageError;
use crate::schema;
use crate::solver::ScriptSolver;
use crate::storage::KeyValueStore;
use crate::types::{EsignatureTransaction, IdentityTransaction, Transaction};
use bitcoin::script::Instruction;
use bitcoin::Script;
use std::collections::HashMap;
use std::sync::Arc;

pub const ESIGN_MARKER: &[u8] = b"esign";
pub const IDENTITY_MARKER: &[u8] = b"ident";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssertionKind {
    Esign,
    Identity,
}

/// Resolves the address that owns an output outside the transactions being
/// scanned.
pub trait TxoAddressLookup: Sync {
    fn txo_address(&self, tx_hash: &str, vout: u32) -> Result<Option<String>, StorageError>;
}

/// Output owners already persisted by the indexer.
pub struct StoreTxoLookup<'a>(pub &'a dyn KeyValueStore);

impl TxoAddressLookup for StoreTxoLookup<'_> {
    fn txo_address(&self, tx_hash: &str, vout: u32) -> Result<Option<String>, StorageError> {
        self.0.get(&schema::txo_address_key(tx_hash, vout))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assertions {
    pub esign: Vec<EsignatureTransaction>,
    pub identity: Vec<IdentityTransaction>,
}

impl Assertions {
    pub fn is_empty(&self) -> bool {
        self.esign.is_empty() && self.identity.is_empty()
    }
}

pub struct AssertionScanner {
    solver: Arc<dyn ScriptSolver>,
}

impl AssertionScanner {
    pub fn new(solver: Arc<dyn ScriptSolver>) -> Self {
        Self { solver }
    }

    /// Scan `transactions` (a block, or a single pending transaction) for
    /// assertions. Spent outpoints are resolved against the scanned
    /// transactions first, then against `lookups` in order.
    pub fn scan(
        &self,
        transactions: &[Transaction],
        height: u64,
        time: u64,
        lookups: &[&dyn TxoAddressLookup],
    ) -> Result<Assertions, StorageError> {
        let mut found = Assertions::default();
        let mut local_owners: Option<HashMap<(&str, u32), String>> = None;

        for tx in transactions {
            let Some((kind, marker_index)) = self.find_marker(tx) else {
                continue;
            };
            let owners = local_owners.get_or_insert_with(|| self.owners(transactions));

            let Some(from_address) = self.resolve_sender(tx, owners, lookups)? else {
                tracing::debug!("Assertion in {} has no resolvable sender, skipping", tx.tx_hash);
                continue;
            };
            let Some(to_address) = tx
                .outputs
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != marker_index)
                .find_map(|(_, output)| self.solver.addresses(&output.script).into_iter().next())
            else {
                tracing::debug!("Assertion in {} has no recipient, skipping", tx.tx_hash);
                continue;
            };

            let script = tx.outputs[marker_index].script.clone();
            match kind {
                AssertionKind::Esign => {
                    tracing::info!(
                        "✍️  E-sign assertion {} from {} to {}",
                        tx.tx_hash,
                        from_address,
                        to_address
                    );
                    found.esign.push(EsignatureTransaction {
                        from_address,
                        to_address,
                        tx_id: tx.tx_hash.clone(),
                        height,
                        time,
                        script,
                    });
                }
                AssertionKind::Identity => {
                    tracing::info!(
                        "🪪 Identity assertion {} from {} to {}",
                        tx.tx_hash,
                        from_address,
                        to_address
                    );
                    found.identity.push(IdentityTransaction {
                        from_address,
                        to_address,
                        tx_id: tx.tx_hash.clone(),
                        height,
                        time,
                        script,
                    });
                }
            }
        }
        Ok(found)
    }

    /// Index and kind of the first marker output of `tx`.
    fn find_marker(&self, tx: &Transaction) -> Option<(AssertionKind, usize)> {
        tx.outputs
            .iter()
            .enumerate()
            .find_map(|(index, output)| marker_kind(&output.script).map(|kind| (kind, index)))
    }

    fn owners<'t>(&self, transactions: &'t [Transaction]) -> HashMap<(&'t str, u32), String> {
        let mut owners = HashMap::new();
        for tx in transactions {
            for output in &tx.outputs {
                if let Some(address) = self.solver.addresses(&output.script).into_iter().next() {
                    owners.insert((tx.tx_hash.as_str(), output.index), address);
                }
            }
        }
        owners
    }

    fn resolve_sender<'t>(
        &self,
        tx: &'t Transaction,
        owners: &HashMap<(&'t str, u32), String>,
        lookups: &[&dyn TxoAddressLookup],
    ) -> Result<Option<String>, StorageError> {
        let Some(input) = tx.inputs.iter().find(|input| !input.coinbase) else {
            return Ok(None);
        };
        if let Some(address) = owners.get(&(input.tx_hash.as_str(), input.txo_index)) {
            return Ok(Some(address.clone()));
        }
        for lookup in lookups {
            if let Some(address) = lookup.txo_address(&input.tx_hash, input.txo_index)? {
                return Ok(Some(address));
            }
        }
        Ok(None)
    }
}

/// Kind of assertion an output script carries, if it is a marker output.
pub fn marker_kind(script: &[u8]) -> Option<AssertionKind> {
    let script = Script::from_bytes(script);
    if !script.is_op_return() {
        return None;
    }
    match script.instructions().nth(1) {
        Some(Ok(Instruction::PushBytes(push))) => {
            let data = push.as_bytes();
            if data.starts_with(ESIGN_MARKER) {
                Some(AssertionKind::Esign)
            } else if data.starts_with(IDENTITY_MARKER) {
                Some(AssertionKind::Identity)
            } else {
                None
            }
        }
        _ => None,
    }
}
