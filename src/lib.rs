//! Secondary indexes over Vertcoin block files: address outputs and
//! balances, spend markers, transaction locations and e-sign / identity
//! assertions, plus an in-memory index of unconfirmed transactions.

pub mod assertions;
pub mod block_scanner;
pub mod config;
pub mod error;
pub mod indexer;
pub mod mempool;
pub mod network_type;
pub mod queries;
pub mod reader;
pub mod rpc;
pub mod schema;
pub mod sequence;
pub mod shutdown;
pub mod solver;
pub mod storage;
pub mod types;

pub use error::{IndexerError, ReaderError, RpcError, StorageError};
pub use indexer::{ChainIndexer, IndexOutcome};
pub use mempool::MempoolMonitor;
pub use network_type::NetworkType;
pub use queries::IndexQuery;
pub use storage::{KeyValueStore, MemoryStore, SledStore, WriteBatch};
pub use types::{Block, Transaction, TransactionInput, TransactionOutput};
