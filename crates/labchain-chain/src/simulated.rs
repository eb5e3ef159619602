//! In-process chain used by the local node and the test suites.
//!
//! Every call mines one block holding one transaction, records a receipt and
//! emits the matching contract event to current subscribers once
//! `event_delay` has passed, the way a watcher sees a block only after the
//! submitting call has returned. Failure hooks let callers exercise receipt
//! errors, reverted transactions and lost subscriptions.

use crate::error::{ChainError, Result};
use crate::traits::{
    BlockHeader, ChainCaller, ChainReader, EventSource, Receipt, ReceiptStatus, SubmittedTx,
    Subscription,
};
use async_trait::async_trait;
use chrono::Utc;
use labchain_types::{ChainEvent, EventEnvelope, EventKind, RecordId, TxHash};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub voting_duration: Duration,
    /// Lag between mining a transaction and publishing its event.
    pub event_delay: Duration,
    pub funding_threshold: u128,
    pub top_up_amount: u128,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            voting_duration: Duration::from_secs(3600),
            event_delay: Duration::from_millis(20),
            funding_threshold: 1_000_000_000_000_000,
            top_up_amount: 10_000_000_000_000_000,
        }
    }
}

/// Contract calls as observed by the simulated chain, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCall {
    SubmitAlgorithm { execution_id: RecordId, cid: String },
    Resolve { execution_id: RecordId, cid: String, approved: bool },
    CastVote { execution_id: RecordId, voter: String, approved: bool },
    SetCommitteeMember { member: String, approved: bool },
    SetVotingDuration { secs: u64 },
    RegisterData { contributor: String, cid: String, dataset: String },
    RecordUsage { scientist: String, cid: String, dataset: String, used_at: i64 },
    FundWallet { address: String, amount: u128 },
}

struct Submission {
    cid: String,
}

#[derive(Default)]
struct ChainState {
    height: u64,
    nonce: u64,
    blocks: HashMap<u64, BlockHeader>,
    receipts: HashMap<TxHash, Receipt>,
    subscribers: HashMap<EventKind, Vec<mpsc::UnboundedSender<Result<EventEnvelope>>>>,
    submissions: HashMap<RecordId, Submission>,
    votes: HashMap<RecordId, HashMap<String, bool>>,
    committee: HashSet<String>,
    balances: HashMap<String, u128>,
    calls: Vec<ChainCall>,
    voting_duration: Duration,
    event_delay: Duration,
    fail_receipts: bool,
    fail_blocks: bool,
    revert_next: bool,
    fail_record_usage: bool,
}

impl ChainState {
    /// Mine a block with a single transaction and publish its event.
    fn mine(&mut self, call: ChainCall, event: Option<ChainEvent>) -> SubmittedTx {
        self.nonce += 1;
        self.height += 1;
        let mut seed = self.nonce.to_le_bytes().to_vec();
        seed.extend_from_slice(format!("{:?}", call).as_bytes());
        let hash = format!("0x{}", hex::encode(blake3::hash(&seed).as_bytes()));

        let status = if std::mem::take(&mut self.revert_next) {
            ReceiptStatus::Failed
        } else {
            ReceiptStatus::Success
        };

        self.blocks.insert(
            self.height,
            BlockHeader {
                number: self.height,
                timestamp: Utc::now(),
            },
        );
        self.receipts.insert(
            hash.clone(),
            Receipt {
                tx_hash: hash.clone(),
                status,
                block_number: self.height,
            },
        );
        debug!(tx_hash = %hash, block = self.height, call = ?call, "⛓️ Mined transaction");
        self.calls.push(call);

        if let Some(event) = event {
            let envelope = EventEnvelope {
                tx_hash: hash.clone(),
                block_number: self.height,
                event,
            };
            if let Some(subs) = self.subscribers.get_mut(&envelope.kind()) {
                subs.retain(|tx| !tx.is_closed());
                for tx in subs.iter() {
                    publish(tx.clone(), envelope.clone(), self.event_delay);
                }
            }
        }

        SubmittedTx { hash }
    }
}

fn publish(
    tx: mpsc::UnboundedSender<Result<EventEnvelope>>,
    envelope: EventEnvelope,
    delay: Duration,
) {
    if delay.is_zero() {
        let _ = tx.send(Ok(envelope));
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(Ok(envelope));
    });
}

/// A single-node chain with instant finality.
#[derive(Clone)]
pub struct SimulatedChain {
    config: SimulatedConfig,
    state: Arc<Mutex<ChainState>>,
}

impl SimulatedChain {
    pub fn new(config: SimulatedConfig) -> Self {
        let state = ChainState {
            voting_duration: config.voting_duration,
            event_delay: config.event_delay,
            ..Default::default()
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Committee vote on a submitted algorithm.
    pub async fn cast_vote(
        &self,
        execution_id: RecordId,
        voter: &str,
        approved: bool,
    ) -> Result<SubmittedTx> {
        let mut state = self.state.lock().await;
        let cid = state
            .submissions
            .get(&execution_id)
            .map(|s| s.cid.clone())
            .ok_or_else(|| ChainError::Reverted(format!("no submission {}", execution_id)))?;
        state
            .votes
            .entry(execution_id)
            .or_default()
            .insert(voter.to_string(), approved);

        let event = ChainEvent::VoteCast {
            execution_id,
            cid,
            voter: voter.to_string(),
            approved,
            vote_time: Utc::now(),
        };
        let call = ChainCall::CastVote {
            execution_id,
            voter: voter.to_string(),
            approved,
        };
        Ok(state.mine(call, Some(event)))
    }

    pub async fn calls(&self) -> Vec<ChainCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn balance(&self, address: &str) -> u128 {
        self.state
            .lock()
            .await
            .balances
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub async fn is_committee_member(&self, member: &str) -> bool {
        self.state.lock().await.committee.contains(member)
    }

    pub async fn height(&self) -> u64 {
        self.state.lock().await.height
    }

    /// Make receipt lookups fail with an RPC error.
    pub async fn fail_receipt_queries(&self, fail: bool) {
        self.state.lock().await.fail_receipts = fail;
    }

    /// Make block lookups fail with an RPC error.
    pub async fn fail_block_queries(&self, fail: bool) {
        self.state.lock().await.fail_blocks = fail;
    }

    /// Give the next mined transaction a failed receipt.
    pub async fn revert_next(&self) {
        self.state.lock().await.revert_next = true;
    }

    pub async fn fail_record_usage(&self, fail: bool) {
        self.state.lock().await.fail_record_usage = fail;
    }

    /// Terminate every live subscription for `kind` with an error.
    pub async fn drop_subscriptions(&self, kind: EventKind) {
        let mut state = self.state.lock().await;
        if let Some(subs) = state.subscribers.remove(&kind) {
            warn!(kind = %kind, count = subs.len(), "🔌 Dropping subscriptions");
            for tx in subs {
                let _ = tx.send(Err(ChainError::SubscriptionLost(kind.to_string())));
            }
        }
    }

    pub async fn subscriber_count(&self, kind: EventKind) -> usize {
        self.state
            .lock()
            .await
            .subscribers
            .get(&kind)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

#[async_trait]
impl ChainCaller for SimulatedChain {
    async fn submit_algorithm(&self, execution_id: RecordId, cid: &str) -> Result<SubmittedTx> {
        let mut state = self.state.lock().await;
        if state.submissions.contains_key(&execution_id) {
            return Err(ChainError::Reverted(format!(
                "execution {} already submitted",
                execution_id
            )));
        }
        state.submissions.insert(
            execution_id,
            Submission {
                cid: cid.to_string(),
            },
        );

        let start_time = Utc::now();
        let window = chrono::Duration::from_std(state.voting_duration)
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        let event = ChainEvent::AlgorithmSubmitted {
            execution_id,
            cid: cid.to_string(),
            start_time,
            end_time: start_time + window,
        };
        let call = ChainCall::SubmitAlgorithm {
            execution_id,
            cid: cid.to_string(),
        };
        Ok(state.mine(call, Some(event)))
    }

    async fn resolve(&self, execution_id: RecordId, cid: &str) -> Result<SubmittedTx> {
        let mut state = self.state.lock().await;
        if !state.submissions.contains_key(&execution_id) {
            return Err(ChainError::Reverted(format!("no submission {}", execution_id)));
        }
        let (approvals, rejections) = state
            .votes
            .get(&execution_id)
            .map(|votes| {
                let yes = votes.values().filter(|v| **v).count();
                (yes, votes.len() - yes)
            })
            .unwrap_or((0, 0));
        let approved = approvals > rejections;

        info!(execution_id, approvals, rejections, approved, "🗳️ Resolving review");
        let event = ChainEvent::AlgorithmResolved {
            execution_id,
            cid: cid.to_string(),
            approved,
        };
        let call = ChainCall::Resolve {
            execution_id,
            cid: cid.to_string(),
            approved,
        };
        Ok(state.mine(call, Some(event)))
    }

    async fn set_committee_member(&self, member: &str, approved: bool) -> Result<SubmittedTx> {
        let mut state = self.state.lock().await;
        if approved {
            state.committee.insert(member.to_string());
        } else {
            state.committee.remove(member);
        }
        let event = ChainEvent::CommitteeMemberUpdated {
            member: member.to_string(),
            approved,
        };
        let call = ChainCall::SetCommitteeMember {
            member: member.to_string(),
            approved,
        };
        Ok(state.mine(call, Some(event)))
    }

    async fn set_voting_duration(&self, duration: Duration) -> Result<SubmittedTx> {
        let mut state = self.state.lock().await;
        state.voting_duration = duration;
        let call = ChainCall::SetVotingDuration {
            secs: duration.as_secs(),
        };
        Ok(state.mine(call, None))
    }

    async fn register_data(
        &self,
        contributor: &str,
        cid: &str,
        dataset: &str,
    ) -> Result<SubmittedTx> {
        let mut state = self.state.lock().await;
        let event = ChainEvent::DataRegistered {
            contributor: contributor.to_string(),
            cid: cid.to_string(),
            dataset: dataset.to_string(),
        };
        let call = ChainCall::RegisterData {
            contributor: contributor.to_string(),
            cid: cid.to_string(),
            dataset: dataset.to_string(),
        };
        Ok(state.mine(call, Some(event)))
    }

    async fn record_usage(
        &self,
        scientist: &str,
        cid: &str,
        dataset: &str,
        used_at: i64,
    ) -> Result<SubmittedTx> {
        let mut state = self.state.lock().await;
        if state.fail_record_usage {
            return Err(ChainError::Rpc("record usage rejected".to_string()));
        }
        let event = ChainEvent::DataUsed {
            scientist: scientist.to_string(),
            cid: cid.to_string(),
            dataset: dataset.to_string(),
            used_at,
        };
        let call = ChainCall::RecordUsage {
            scientist: scientist.to_string(),
            cid: cid.to_string(),
            dataset: dataset.to_string(),
            used_at,
        };
        Ok(state.mine(call, Some(event)))
    }

    async fn ensure_wallet_funded(&self, address: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let balance = state.balances.get(address).copied().unwrap_or(0);
        if balance >= self.config.funding_threshold {
            return Ok(());
        }
        let amount = self.config.top_up_amount;
        state
            .balances
            .insert(address.to_string(), balance.saturating_add(amount));
        info!(address, amount = %amount, "💰 Funded wallet");
        state.mine(
            ChainCall::FundWallet {
                address: address.to_string(),
                amount,
            },
            None,
        );
        Ok(())
    }
}

#[async_trait]
impl ChainReader for SimulatedChain {
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Receipt> {
        let state = self.state.lock().await;
        if state.fail_receipts {
            return Err(ChainError::Rpc("receipt query failed".to_string()));
        }
        state
            .receipts
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| ChainError::ReceiptNotFound(tx_hash.to_string()))
    }

    async fn block_by_number(&self, number: u64) -> Result<BlockHeader> {
        let state = self.state.lock().await;
        if state.fail_blocks {
            return Err(ChainError::Rpc("block query failed".to_string()));
        }
        state
            .blocks
            .get(&number)
            .cloned()
            .ok_or(ChainError::BlockNotFound(number))
    }
}

#[async_trait]
impl EventSource for SimulatedChain {
    async fn subscribe(&self, kind: EventKind) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .subscribers
            .entry(kind)
            .or_default()
            .push(tx);
        debug!(kind = %kind, "📡 New subscription");
        Ok(Subscription::new(kind, rx))
    }
}
