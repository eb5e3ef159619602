use crate::{Cid, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committee member's vote on an algorithm bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: RecordId,
    pub algo_cid: Cid,
    pub voter: String,
    pub approved: bool,
    pub voted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Record that a scientist's algorithm consumed a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataUsage {
    pub id: RecordId,
    pub scientist_wallet: String,
    pub algo_cid: Cid,
    pub dataset: String,
    /// Unix seconds, as passed to the on-chain usage record.
    pub used_at: i64,
    pub created_at: DateTime<Utc>,
}
