use thiserror::Error;

/// Top-level error for the daemon binary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("Database operation failed: {0}")]
    DatabaseOp(#[from] sled::Error),

    #[error("Record under {key} is not valid UTF-8")]
    InvalidUtf8 { key: String },

    #[error("Sequence space exhausted for prefix {prefix}")]
    SequenceExhausted { prefix: String },
}

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: bitcoin::consensus::encode::Error,
    },

    #[error("Unexpected network magic {magic} in {file} at offset {offset}")]
    BadMagic {
        file: String,
        offset: u64,
        magic: String,
    },

    #[error("Truncated block frame in {file} at offset {offset}")]
    TruncatedFrame { file: String, offset: u64 },

    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("RPC call {0} returned no result")]
    EmptyResult(String),

    #[error("Unexpected response to {method}: {reason}")]
    InvalidResponse { method: String, reason: String },
}

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Block file error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Upstream node error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Malformed record under {key}: {reason}")]
    MalformedRecord { key: String, reason: String },
}
