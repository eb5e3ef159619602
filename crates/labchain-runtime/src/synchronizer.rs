//! Turns contract events into local state.
//!
//! One supervised watch loop runs per [`EventKind`]. Each event is confirmed
//! against its receipt and block, persisted, reported to whoever waits on its
//! transaction hash, and for submissions and resolutions turned into
//! scheduler work.

use crate::error::Result;
use crate::metrics::RuntimeMetrics;
use crate::notifier::NotifierHub;
use crate::recent::RecentMap;
use crate::scheduler::TaskScheduler;
use chrono::{DateTime, Utc};
use labchain_chain::{ChainReader, EventSource};
use labchain_storage::{StorageBackend, StorageTransaction};
use labchain_types::{
    BizCode, BlockchainTransaction, ChainEvent, EntityType, EventEnvelope, EventKind, RecordId,
    ReviewStatus, TxStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Transaction hashes each watch loop remembers for redelivery checks.
const SEEN_CAPACITY: usize = 4096;
const SEEN_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Resolve reviews whose window closed while the node was down.
    pub resolve_elapsed_on_recovery: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            resolve_elapsed_on_recovery: true,
        }
    }
}

/// Delay before resubscribing after `attempt` consecutive failures.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.checked_mul(1u32 << attempt.min(10))
        .unwrap_or(max)
        .min(max)
}

/// Receipt outcome of the transaction that emitted an event.
#[derive(Debug, Clone, Copy)]
struct Confirmation {
    status: TxStatus,
    block_number: u64,
    block_time: DateTime<Utc>,
}

impl Confirmation {
    fn confirmed(&self) -> bool {
        self.status == TxStatus::Confirmed
    }
}

pub struct ChainEventSynchronizer {
    config: SyncConfig,
    reader: Arc<dyn ChainReader>,
    events: Arc<dyn EventSource>,
    storage: Arc<dyn StorageBackend>,
    notifier: Arc<NotifierHub>,
    scheduler: Arc<TaskScheduler>,
    metrics: Arc<RuntimeMetrics>,
}

impl ChainEventSynchronizer {
    pub fn new(
        config: SyncConfig,
        reader: Arc<dyn ChainReader>,
        events: Arc<dyn EventSource>,
        storage: Arc<dyn StorageBackend>,
        notifier: Arc<NotifierHub>,
        scheduler: Arc<TaskScheduler>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            config,
            reader,
            events,
            storage,
            notifier,
            scheduler,
            metrics,
        }
    }

    /// Re-schedule resolution of every confirmed execution still under review.
    ///
    /// A row that cannot be recovered is logged and skipped; the count covers
    /// only the resolves actually scheduled.
    pub async fn recover_resolve_tasks(&self) -> Result<usize> {
        let now = Utc::now();
        let mut scheduled = 0;
        for execution in self.storage.list_reviewing_executions().await? {
            let Some(end) = execution.vote_end_time else {
                debug!(execution_id = execution.id, "No vote window recorded yet");
                continue;
            };
            if end <= now && !self.config.resolve_elapsed_on_recovery {
                warn!(execution_id = execution.id, vote_end = %end, "Vote window elapsed during downtime, not resolving");
                continue;
            }

            let algorithm = match self.storage.get_algorithm(execution.algorithm_id).await {
                Ok(algorithm) => algorithm,
                Err(e) => {
                    error!(execution_id = execution.id, algorithm_id = execution.algorithm_id, error = %e, "Cannot recover resolve task");
                    continue;
                }
            };
            if let Err(e) = self
                .scheduler
                .schedule_resolve(execution.id, &algorithm.cid, end)
                .await
            {
                error!(execution_id = execution.id, error = %e, "Failed to re-schedule resolve");
                continue;
            }
            info!(
                execution_id = execution.id,
                vote_end = %end,
                elapsed = end <= now,
                "♻️ Recovered resolve task"
            );
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// Spawn one supervised watch loop per event kind.
    pub fn spawn_watchers(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        EventKind::ALL
            .iter()
            .map(|kind| {
                let sync = self.clone();
                let token = token.clone();
                let kind = *kind;
                tokio::spawn(async move { sync.watch(kind, token).await })
            })
            .collect()
    }

    /// Watch one event stream until cancelled, resubscribing with backoff
    /// whenever the subscription is lost.
    pub async fn watch(&self, kind: EventKind, token: CancellationToken) {
        let mut attempt = 0u32;
        let mut seen = RecentMap::new(SEEN_CAPACITY, SEEN_TTL);

        loop {
            match self.events.subscribe(kind).await {
                Ok(mut subscription) => {
                    info!(event = %kind, "👂 Watching chain events");
                    loop {
                        let item = tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                debug!(event = %kind, "Watch loop stopped");
                                return;
                            }
                            item = subscription.next() => item,
                        };
                        match item {
                            Some(Ok(envelope)) => {
                                attempt = 0;
                                if !seen.insert(&envelope.tx_hash, ()) {
                                    debug!(event = %kind, tx_hash = %envelope.tx_hash, "Ignoring redelivered event");
                                    continue;
                                }
                                self.process(envelope).await;
                            }
                            Some(Err(e)) => {
                                warn!(event = %kind, error = %e, "🔌 Subscription lost");
                                break;
                            }
                            None => {
                                warn!(event = %kind, "🔌 Subscription closed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => error!(event = %kind, error = %e, "Failed to subscribe"),
            }

            let delay = backoff_delay(self.config.backoff_base, self.config.backoff_max, attempt);
            attempt = attempt.saturating_add(1);
            self.metrics
                .subscription_restarts
                .with_label_values(&[kind.as_str()])
                .inc();
            info!(event = %kind, attempt, delay_ms = delay.as_millis() as u64, "Resubscribing");

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Handle one event and notify the listener of its transaction.
    pub async fn process(&self, envelope: EventEnvelope) {
        let kind = envelope.kind();
        self.metrics
            .chain_events
            .with_label_values(&[kind.as_str()])
            .inc();

        let result = match self.confirm(&envelope).await {
            Ok(confirmation) => self.apply(&envelope, confirmation).await,
            Err(code) => Err(code),
        };

        match result {
            Ok(data) => self.notifier.push_tx_result(&envelope.tx_hash, data).await,
            Err(code) => {
                self.metrics
                    .chain_event_errors
                    .with_label_values(&[kind.as_str()])
                    .inc();
                self.notifier.push_error(&envelope.tx_hash, code).await;
            }
        }
    }

    async fn confirm(&self, envelope: &EventEnvelope) -> std::result::Result<Confirmation, BizCode> {
        let receipt = self
            .reader
            .transaction_receipt(&envelope.tx_hash)
            .await
            .map_err(|e| {
                error!(tx_hash = %envelope.tx_hash, error = %e, "Receipt query failed");
                BizCode::ReceiptQueryFail
            })?;
        let block = self
            .reader
            .block_by_number(receipt.block_number)
            .await
            .map_err(|e| {
                error!(tx_hash = %envelope.tx_hash, block = receipt.block_number, error = %e, "Block query failed");
                BizCode::BlockQueryFail
            })?;

        let status = if receipt.succeeded() {
            TxStatus::Confirmed
        } else {
            TxStatus::Failed
        };
        Ok(Confirmation {
            status,
            block_number: block.number,
            block_time: block.timestamp,
        })
    }

    async fn apply(
        &self,
        envelope: &EventEnvelope,
        confirmation: Confirmation,
    ) -> std::result::Result<Option<BlockchainTransaction>, BizCode> {
        let tx_hash = envelope.tx_hash.as_str();
        match &envelope.event {
            ChainEvent::AlgorithmSubmitted {
                execution_id,
                cid,
                start_time,
                end_time,
            } => {
                let row = self
                    .settle(tx_hash, confirmation, BizCode::StorageWriteFail)
                    .await?;
                if confirmation.confirmed() {
                    self.open_review(*execution_id, cid, *start_time, *end_time)
                        .await?;
                }
                Ok(Some(row))
            }
            ChainEvent::VoteCast {
                cid,
                voter,
                approved,
                vote_time,
                ..
            } => {
                let mut tx = self.storage.begin().await.map_err(|e| {
                    error!(tx_hash, error = %e, "Failed to open transaction");
                    BizCode::StorageWriteFail
                })?;
                let staged = stage_vote(tx.as_mut(), tx_hash, cid, voter, *approved, *vote_time, confirmation).await;
                let committed = match staged {
                    Ok(row) => tx.commit().await.map(|_| row),
                    Err(e) => {
                        if let Err(rb) = tx.rollback().await {
                            warn!(tx_hash, error = %rb, "Rollback failed");
                        }
                        Err(e)
                    }
                };
                committed.map(Some).map_err(|e| {
                    error!(tx_hash, error = %e, "Failed to record vote");
                    BizCode::StorageWriteFail
                })
            }
            ChainEvent::AlgorithmResolved {
                execution_id,
                approved,
                ..
            } => {
                if confirmation.confirmed() {
                    self.close_review(*execution_id, *approved).await?;
                }
                Ok(None)
            }
            ChainEvent::CommitteeMemberUpdated { .. } | ChainEvent::DataUsed { .. } => self
                .settle(tx_hash, confirmation, BizCode::StorageReadFail)
                .await
                .map(Some),
            ChainEvent::DataRegistered { .. } => self
                .settle(tx_hash, confirmation, BizCode::StorageWriteFail)
                .await
                .map(Some),
        }
    }

    async fn settle(
        &self,
        tx_hash: &str,
        confirmation: Confirmation,
        code: BizCode,
    ) -> std::result::Result<BlockchainTransaction, BizCode> {
        let row = self
            .storage
            .update_transaction_status(
                tx_hash,
                confirmation.status,
                Some(confirmation.block_number),
                Some(confirmation.block_time),
            )
            .await
            .map_err(|e| {
                error!(tx_hash, error = %e, "Failed to update transaction status");
                code
            })?;
        info!(
            tx_hash,
            entity = %row.entity_type,
            status = %row.status,
            block = confirmation.block_number,
            "⛓️ Transaction settled"
        );
        Ok(row)
    }

    async fn open_review(
        &self,
        execution_id: RecordId,
        cid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> std::result::Result<(), BizCode> {
        self.storage
            .update_vote_window(execution_id, start, end)
            .await
            .map_err(|e| {
                error!(execution_id, error = %e, "Failed to store vote window");
                BizCode::StorageWriteFail
            })?;
        if let Err(e) = self.scheduler.schedule_resolve(execution_id, cid, end).await {
            error!(execution_id, error = %e, "Failed to schedule resolve");
        }
        Ok(())
    }

    async fn close_review(
        &self,
        execution_id: RecordId,
        approved: bool,
    ) -> std::result::Result<(), BizCode> {
        let status = if approved {
            ReviewStatus::Approved
        } else {
            ReviewStatus::Rejected
        };
        self.storage
            .update_review_status(execution_id, status)
            .await
            .map_err(|e| {
                error!(execution_id, error = %e, "Failed to store review outcome");
                BizCode::StorageWriteFail
            })?;
        info!(execution_id, review = %status, "⚖️ Review resolved");

        if approved {
            if let Err(e) = self.scheduler.schedule_run(execution_id).await {
                error!(execution_id, error = %e, "Failed to schedule run");
            }
        }
        Ok(())
    }
}

/// Vote row and its transaction row, linked.
async fn stage_vote(
    tx: &mut dyn StorageTransaction,
    tx_hash: &str,
    cid: &str,
    voter: &str,
    approved: bool,
    vote_time: DateTime<Utc>,
    confirmation: Confirmation,
) -> labchain_storage::Result<BlockchainTransaction> {
    let vote = tx.create_vote(cid, voter, approved, vote_time).await?;
    tx.create_transaction_with_status(
        tx_hash,
        vote.id,
        EntityType::Vote,
        confirmation.status,
        Some(confirmation.block_number),
        Some(confirmation.block_time),
    )
    .await
}
