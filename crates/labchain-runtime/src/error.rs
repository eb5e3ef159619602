use labchain_chain::ChainError;
use labchain_crypto::CryptoError;
use labchain_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Build descriptor not found in {0}")]
    MissingBuildDescriptor(String),

    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Export error: {0}")]
    Export(#[from] csv::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Scheduler closed")]
    SchedulerClosed,

    #[error("Scheduler handler not set")]
    HandlerNotSet,

    #[error("Operation cancelled")]
    Cancelled,
}
