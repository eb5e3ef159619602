use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labchain_types::{EventEnvelope, EventKind, RecordId, TxHash};
use std::time::Duration;
use tokio::sync::mpsc;

/// Handle of a transaction accepted by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTx {
    pub hash: TxHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub status: ReceiptStatus,
    pub block_number: u64,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: DateTime<Utc>,
}

/// State-changing contract calls.
#[async_trait]
pub trait ChainCaller: Send + Sync {
    async fn submit_algorithm(&self, execution_id: RecordId, cid: &str) -> Result<SubmittedTx>;

    async fn resolve(&self, execution_id: RecordId, cid: &str) -> Result<SubmittedTx>;

    async fn set_committee_member(&self, member: &str, approved: bool) -> Result<SubmittedTx>;

    async fn set_voting_duration(&self, duration: Duration) -> Result<SubmittedTx>;

    async fn register_data(
        &self,
        contributor: &str,
        cid: &str,
        dataset: &str,
    ) -> Result<SubmittedTx>;

    async fn record_usage(
        &self,
        scientist: &str,
        cid: &str,
        dataset: &str,
        used_at: i64,
    ) -> Result<SubmittedTx>;

    /// Top the wallet up if its balance is below the funding threshold.
    async fn ensure_wallet_funded(&self, address: &str) -> Result<()>;
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Receipt>;

    async fn block_by_number(&self, number: u64) -> Result<BlockHeader>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, kind: EventKind) -> Result<Subscription>;
}

/// Live feed of one event kind.
///
/// An `Err` item or the end of the stream means the subscription is gone
/// and has to be re-established.
pub struct Subscription {
    kind: EventKind,
    rx: mpsc::UnboundedReceiver<Result<EventEnvelope>>,
}

impl Subscription {
    pub fn new(kind: EventKind, rx: mpsc::UnboundedReceiver<Result<EventEnvelope>>) -> Self {
        Self { kind, rx }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub async fn next(&mut self) -> Option<Result<EventEnvelope>> {
        self.rx.recv().await
    }
}
