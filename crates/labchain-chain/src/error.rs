use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("Receipt not found: {0}")]
    ReceiptNotFound(String),

    #[error("Block not found: {0}")]
    BlockNotFound(u64),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("Insufficient funds for {0}")]
    InsufficientFunds(String),
}

pub type Result<T> = std::result::Result<T, ChainError>;
