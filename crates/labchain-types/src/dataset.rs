use crate::{Cid, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dataset names carrying this prefix refer to author-uploaded static datasets.
pub const STATIC_DATASET_PREFIX: &str = "__static__";

pub fn is_static_dataset(name: &str) -> bool {
    name.starts_with(STATIC_DATASET_PREFIX)
}

/// Encrypted, author-uploaded dataset held in the content-addressed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticDataset {
    pub id: RecordId,
    pub name: String,
    pub ui_name: String,
    pub description: String,
    /// Hex digest of the plaintext file.
    pub file_hash: String,
    pub cid: Cid,
    pub author: String,
    pub author_wallet: String,
    pub created_at: DateTime<Utc>,
}

impl StaticDataset {
    /// Cache version key, `static_<id>_<first 8 chars of hash>`.
    pub fn version_key(&self) -> String {
        let prefix: String = self.file_hash.chars().take(8).collect();
        format!("static_{}_{}", self.id, prefix)
    }
}

/// Dataset assembled from live test-result rows and exported periodically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicDataset {
    pub id: RecordId,
    pub name: String,
    pub ui_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub id: RecordId,
    pub dataset: String,
    pub user_wallet: String,
    pub file_hash: String,
    pub created_at: DateTime<Utc>,
}

/// One row of a dynamic dataset export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: RecordId,
    pub test_report_id: RecordId,
    pub category: String,
    pub name: String,
    pub definition: String,
    pub result: String,
    pub reference_range: String,
    pub explanation: String,
    pub status: String,
    pub suggestions: Option<String>,
}
