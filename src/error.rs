use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database is not open")]
    NotOpen,

    #[error("collection has been disposed: {0}")]
    Disposed(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("checksum mismatch on page {page_id}")]
    ChecksumMismatch { page_id: u64 },

    #[error("invalid page size {0}: must be a power of two in 4096..=65536")]
    InvalidPageSize(usize),

    #[error("buffer pool exhausted: all {capacity} pages are pinned")]
    BufferExhausted { capacity: usize },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("concurrency conflict on {id}: expected version {expected}, actual {actual}")]
    ConcurrencyConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("transaction {txn_id} conflict: read set is stale")]
    TransactionConflict { txn_id: u64 },

    #[error("transaction not found: {0}")]
    TransactionNotFound(u64),

    #[error("entity too large: {size} bytes exceeds limit of {limit}")]
    EntityTooLarge { size: usize, limit: usize },

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("type mismatch: collection {collection} is registered as {registered}, requested {requested}")]
    TypeMismatch {
        collection: String,
        registered: String,
        requested: String,
    },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("WAL corruption: {0}")]
    WalCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("page {0} is pinned")]
    PinnedPage(u64),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl DbError {
    /// True when the caller can reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::ConcurrencyConflict { .. } | DbError::TransactionConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}
