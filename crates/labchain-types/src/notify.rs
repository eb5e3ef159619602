use crate::BlockchainTransaction;
use serde::{Deserialize, Serialize};

/// Result codes delivered to transaction listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BizCode {
    Success,
    ReceiptQueryFail,
    BlockQueryFail,
    StorageWriteFail,
    StorageReadFail,
}

impl BizCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Terminal message for one transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub code: BizCode,
    /// Present for successful results that produced or updated a row.
    pub data: Option<BlockchainTransaction>,
}

impl Notification {
    pub fn success(data: Option<BlockchainTransaction>) -> Self {
        Self {
            code: BizCode::Success,
            data,
        }
    }

    pub fn error(code: BizCode) -> Self {
        Self { code, data: None }
    }
}
