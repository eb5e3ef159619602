use crate::error::{Result, TypesError};
use crate::{RecordId, TxHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Submitted but not yet observed on chain.
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "FAILED" => Ok(Self::Failed),
            other => Err(TypesError::UnknownStatus(other.to_string())),
        }
    }
}

/// Kind of row a blockchain transaction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Execution,
    Vote,
    Committee,
    TestReport,
    StaticDataset,
    #[serde(rename = "DATAUSAGE")]
    DataUsage,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "EXECUTION",
            Self::Vote => "VOTE",
            Self::Committee => "COMMITTEE",
            Self::TestReport => "TEST_REPORT",
            Self::StaticDataset => "STATIC_DATASET",
            Self::DataUsage => "DATAUSAGE",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXECUTION" => Ok(Self::Execution),
            "VOTE" => Ok(Self::Vote),
            "COMMITTEE" => Ok(Self::Committee),
            "TEST_REPORT" => Ok(Self::TestReport),
            "STATIC_DATASET" => Ok(Self::StaticDataset),
            "DATAUSAGE" => Ok(Self::DataUsage),
            other => Err(TypesError::UnknownEntityType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainTransaction {
    pub id: RecordId,
    pub tx_hash: TxHash,
    pub entity_id: RecordId,
    pub entity_type: EntityType,
    pub status: TxStatus,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EntityType::DataUsage).unwrap(),
            "\"DATAUSAGE\""
        );
        assert_eq!(
            serde_json::to_string(&EntityType::StaticDataset).unwrap(),
            "\"STATIC_DATASET\""
        );
        assert_eq!("TEST_REPORT".parse::<EntityType>().unwrap(), EntityType::TestReport);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TxStatus::Pending.is_terminal());
        assert!(TxStatus::Confirmed.is_terminal());
        assert!(TxStatus::Failed.is_terminal());
    }
}
