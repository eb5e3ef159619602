use crate::error::{Result, TypesError};
use crate::{Cid, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Committee review outcome for a submitted execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Reviewing,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reviewing => "REVIEWING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Reviewing)
    }

    /// REVIEWING moves to APPROVED or REJECTED, nothing else.
    pub fn can_transition_to(&self, next: ReviewStatus) -> bool {
        matches!(
            (self, next),
            (Self::Reviewing, Self::Approved) | (Self::Reviewing, Self::Rejected)
        )
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REVIEWING" => Ok(Self::Reviewing),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(TypesError::UnknownStatus(other.to_string())),
        }
    }
}

/// Execution lifecycle: QUEUED -> RUNNING -> COMPLETED | FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// RUNNING -> RUNNING is allowed so that a recovered execution can
    /// re-enter the pipeline from the top after a crash.
    pub fn can_transition_to(&self, next: ExecStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn check_transition(&self, next: ExecStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TypesError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(TypesError::UnknownStatus(other.to_string())),
        }
    }
}

/// An uploaded algorithm bundle. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Algorithm {
    pub id: RecordId,
    pub name: String,
    pub link: String,
    pub cid: Cid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmExecution {
    pub id: RecordId,
    pub algorithm_id: RecordId,
    pub used_dataset: String,
    pub scientist_wallet: String,
    pub review_status: ReviewStatus,
    pub vote_start_time: Option<DateTime<Utc>>,
    pub vote_end_time: Option<DateTime<Utc>>,
    pub status: ExecStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: String,
    pub error_msg: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlgorithmExecution {
    /// A freshly submitted execution: QUEUED and under review.
    pub fn new(
        id: RecordId,
        algorithm_id: RecordId,
        used_dataset: impl Into<String>,
        scientist_wallet: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            algorithm_id,
            used_dataset: used_dataset.into(),
            scientist_wallet: scientist_wallet.into(),
            review_status: ReviewStatus::Reviewing,
            vote_start_time: None,
            vote_end_time: None,
            status: ExecStatus::Queued,
            start_time: None,
            end_time: None,
            result: String::new(),
            error_msg: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Execution joined with its algorithm, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionWithAlgorithm {
    #[serde(flatten)]
    pub execution: AlgorithmExecution,
    pub algo_name: String,
    pub algo_link: String,
    pub cid: Cid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_status_never_skips_running() {
        assert!(ExecStatus::Queued.can_transition_to(ExecStatus::Running));
        assert!(!ExecStatus::Queued.can_transition_to(ExecStatus::Completed));
        assert!(!ExecStatus::Queued.can_transition_to(ExecStatus::Failed));
        assert!(ExecStatus::Running.can_transition_to(ExecStatus::Completed));
        assert!(ExecStatus::Running.can_transition_to(ExecStatus::Failed));
        assert!(!ExecStatus::Completed.can_transition_to(ExecStatus::Running));
        assert!(!ExecStatus::Failed.can_transition_to(ExecStatus::Queued));
    }

    #[test]
    fn test_review_status_transitions() {
        assert!(ReviewStatus::Reviewing.can_transition_to(ReviewStatus::Approved));
        assert!(ReviewStatus::Reviewing.can_transition_to(ReviewStatus::Rejected));
        assert!(!ReviewStatus::Approved.can_transition_to(ReviewStatus::Rejected));
        assert!(!ReviewStatus::Rejected.can_transition_to(ReviewStatus::Reviewing));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            ExecStatus::Queued,
            ExecStatus::Running,
            ExecStatus::Completed,
            ExecStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ExecStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<ExecStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&ReviewStatus::Approved).unwrap(),
            "\"APPROVED\""
        );
    }

    #[test]
    fn test_new_execution_defaults() {
        let exe = AlgorithmExecution::new(7, 3, "blood", "0xabc");
        assert_eq!(exe.status, ExecStatus::Queued);
        assert_eq!(exe.review_status, ReviewStatus::Reviewing);
        assert!(exe.vote_end_time.is_none());
        assert!(exe.result.is_empty());
    }
}
