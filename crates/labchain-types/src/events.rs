use crate::{Cid, RecordId, TxHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The on-chain event streams the synchronizer watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    DataRegistered,
    AlgorithmSubmitted,
    VoteCast,
    CommitteeMemberUpdated,
    AlgorithmResolved,
    DataUsed,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::DataRegistered,
        EventKind::AlgorithmSubmitted,
        EventKind::VoteCast,
        EventKind::CommitteeMemberUpdated,
        EventKind::AlgorithmResolved,
        EventKind::DataUsed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataRegistered => "DataRegistered",
            Self::AlgorithmSubmitted => "AlgorithmSubmitted",
            Self::VoteCast => "VoteCast",
            Self::CommitteeMemberUpdated => "CommitteeMemberUpdated",
            Self::AlgorithmResolved => "AlgorithmResolved",
            Self::DataUsed => "DataUsed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded contract event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChainEvent {
    DataRegistered {
        contributor: String,
        cid: Cid,
        dataset: String,
    },
    AlgorithmSubmitted {
        execution_id: RecordId,
        cid: Cid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    VoteCast {
        execution_id: RecordId,
        cid: Cid,
        voter: String,
        approved: bool,
        vote_time: DateTime<Utc>,
    },
    CommitteeMemberUpdated {
        member: String,
        approved: bool,
    },
    AlgorithmResolved {
        execution_id: RecordId,
        cid: Cid,
        approved: bool,
    },
    DataUsed {
        scientist: String,
        cid: Cid,
        dataset: String,
        used_at: i64,
    },
}

impl ChainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DataRegistered { .. } => EventKind::DataRegistered,
            Self::AlgorithmSubmitted { .. } => EventKind::AlgorithmSubmitted,
            Self::VoteCast { .. } => EventKind::VoteCast,
            Self::CommitteeMemberUpdated { .. } => EventKind::CommitteeMemberUpdated,
            Self::AlgorithmResolved { .. } => EventKind::AlgorithmResolved,
            Self::DataUsed { .. } => EventKind::DataUsed,
        }
    }
}

/// An event together with the transaction and block that emitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub event: ChainEvent,
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}
