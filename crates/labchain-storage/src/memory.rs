use crate::backend::{
    NewStaticDataset, NewTestResult, Result, StorageBackend, StorageError, StorageTransaction,
};
use crate::snapshot::{Snapshot, SnapshotFile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labchain_types::{
    Algorithm, AlgorithmExecution, BlockchainTransaction, DataUsage, DynamicDataset, EntityType,
    ExecStatus, ExecutionWithAlgorithm, RecordId, ReviewStatus, StaticDataset, TestReport,
    TestResult, TxStatus, Vote,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Every table the backend holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub algorithms: BTreeMap<RecordId, Algorithm>,
    pub executions: BTreeMap<RecordId, AlgorithmExecution>,
    /// Keyed by transaction hash.
    pub transactions: BTreeMap<String, BlockchainTransaction>,
    pub votes: BTreeMap<RecordId, Vote>,
    pub data_usage: BTreeMap<RecordId, DataUsage>,
    pub static_datasets: BTreeMap<RecordId, StaticDataset>,
    pub dynamic_datasets: BTreeMap<RecordId, DynamicDataset>,
    pub test_reports: BTreeMap<RecordId, TestReport>,
    pub test_results: BTreeMap<RecordId, TestResult>,
}

impl Tables {
    fn is_confirmed(&self, entity_type: EntityType, entity_id: RecordId) -> bool {
        self.transactions.values().any(|tx| {
            tx.entity_type == entity_type
                && tx.entity_id == entity_id
                && tx.status == TxStatus::Confirmed
        })
    }

    fn execution_mut(&mut self, id: RecordId) -> Result<&mut AlgorithmExecution> {
        self.executions
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("execution {}", id)))
    }
}

/// In-memory backend, optionally mirrored to a JSON snapshot on every write.
#[derive(Clone)]
pub struct MemoryBackend {
    tables: Arc<RwLock<Tables>>,
    next_id: Arc<AtomicU64>,
    snapshot: Option<Arc<SnapshotFile>>,
    fail_writes: Arc<AtomicBool>,
    fail_next: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            snapshot: None,
            fail_writes: Arc::new(AtomicBool::new(false)),
            fail_next: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open a backend persisted at `path`, restoring prior state if present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let file = SnapshotFile::new(path);
        let mut backend = Self::new();
        if let Some(snapshot) = file.load().await? {
            info!(
                executions = snapshot.tables.executions.len(),
                transactions = snapshot.tables.transactions.len(),
                "🗄️ Restored storage snapshot"
            );
            backend.next_id.store(snapshot.metadata.next_id, Ordering::SeqCst);
            *backend.tables.write().await = snapshot.tables;
        }
        backend.snapshot = Some(Arc::new(file));
        Ok(backend)
    }

    /// Make every subsequent write fail with a backend error.
    pub fn inject_write_failures(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make only the next `count` writes fail with a backend error.
    pub fn fail_next_writes(&self, count: u64) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn allocate_id(&self) -> RecordId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        let one_shot = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if one_shot || self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError("write rejected".to_string()));
        }
        Ok(())
    }

    /// Apply `change` under the write lock. With a snapshot file the change
    /// runs on a copy that replaces the live tables only once it is saved.
    async fn write<T>(&self, change: impl FnOnce(&mut Tables) -> Result<T> + Send) -> Result<T> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let Some(file) = &self.snapshot else {
            return change(&mut tables);
        };

        let mut next = tables.clone();
        let out = change(&mut next)?;
        let snapshot = Snapshot::new(next, self.next_id.load(Ordering::SeqCst));
        file.save(&snapshot).await?;
        *tables = snapshot.tables;
        Ok(out)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

enum Staged {
    Algorithm(Algorithm),
    Execution(AlgorithmExecution),
    Vote(Vote),
    DataUsage(DataUsage),
    Transaction(BlockchainTransaction),
}

struct MemoryTransaction {
    backend: MemoryBackend,
    staged: Vec<Staged>,
}

impl MemoryTransaction {
    fn staged_hashes(&self) -> impl Iterator<Item = &str> {
        self.staged.iter().filter_map(|s| match s {
            Staged::Transaction(tx) => Some(tx.tx_hash.as_str()),
            _ => None,
        })
    }

    fn has_staged_algorithm(&self, id: RecordId) -> bool {
        self.staged
            .iter()
            .any(|s| matches!(s, Staged::Algorithm(a) if a.id == id))
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn create_algorithm(&mut self, name: &str, link: &str, cid: &str) -> Result<Algorithm> {
        let algorithm = Algorithm {
            id: self.backend.allocate_id(),
            name: name.to_string(),
            link: link.to_string(),
            cid: cid.to_string(),
            created_at: Utc::now(),
        };
        self.staged.push(Staged::Algorithm(algorithm.clone()));
        Ok(algorithm)
    }

    async fn create_execution(
        &mut self,
        algorithm_id: RecordId,
        dataset: &str,
        scientist_wallet: &str,
    ) -> Result<AlgorithmExecution> {
        let known = self
            .backend
            .tables
            .read()
            .await
            .algorithms
            .contains_key(&algorithm_id);
        if !known && !self.has_staged_algorithm(algorithm_id) {
            return Err(StorageError::NotFound(format!("algorithm {}", algorithm_id)));
        }

        let execution = AlgorithmExecution::new(
            self.backend.allocate_id(),
            algorithm_id,
            dataset,
            scientist_wallet,
        );
        self.staged.push(Staged::Execution(execution.clone()));
        Ok(execution)
    }

    async fn create_vote(
        &mut self,
        algo_cid: &str,
        voter: &str,
        approved: bool,
        voted_at: DateTime<Utc>,
    ) -> Result<Vote> {
        let vote = Vote {
            id: self.backend.allocate_id(),
            algo_cid: algo_cid.to_string(),
            voter: voter.to_string(),
            approved,
            voted_at,
            created_at: Utc::now(),
        };
        self.staged.push(Staged::Vote(vote.clone()));
        Ok(vote)
    }

    async fn create_data_usage(
        &mut self,
        scientist_wallet: &str,
        algo_cid: &str,
        dataset: &str,
        used_at: i64,
    ) -> Result<DataUsage> {
        let usage = DataUsage {
            id: self.backend.allocate_id(),
            scientist_wallet: scientist_wallet.to_string(),
            algo_cid: algo_cid.to_string(),
            dataset: dataset.to_string(),
            used_at,
            created_at: Utc::now(),
        };
        self.staged.push(Staged::DataUsage(usage.clone()));
        Ok(usage)
    }

    async fn create_transaction_with_status(
        &mut self,
        tx_hash: &str,
        entity_id: RecordId,
        entity_type: EntityType,
        status: TxStatus,
        block_number: Option<u64>,
        block_timestamp: Option<DateTime<Utc>>,
    ) -> Result<BlockchainTransaction> {
        let committed = self
            .backend
            .tables
            .read()
            .await
            .transactions
            .contains_key(tx_hash);
        if committed || self.staged_hashes().any(|h| h == tx_hash) {
            return Err(StorageError::AlreadyExists(format!("transaction {}", tx_hash)));
        }

        let now = Utc::now();
        let tx = BlockchainTransaction {
            id: self.backend.allocate_id(),
            tx_hash: tx_hash.to_string(),
            entity_id,
            entity_type,
            status,
            block_number,
            block_timestamp,
            created_at: now,
            updated_at: now,
        };
        self.staged.push(Staged::Transaction(tx.clone()));
        Ok(tx)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { backend, staged } = *self;
        let count = staged.len();
        backend
            .write(move |tables| {
                let mut hashes = HashSet::new();
                for item in &staged {
                    if let Staged::Transaction(tx) = item {
                        if tables.transactions.contains_key(&tx.tx_hash)
                            || !hashes.insert(tx.tx_hash.clone())
                        {
                            return Err(StorageError::AlreadyExists(format!(
                                "transaction {}",
                                tx.tx_hash
                            )));
                        }
                    }
                }

                for item in staged {
                    match item {
                        Staged::Algorithm(a) => {
                            tables.algorithms.insert(a.id, a);
                        }
                        Staged::Execution(e) => {
                            tables.executions.insert(e.id, e);
                        }
                        Staged::Vote(v) => {
                            tables.votes.insert(v.id, v);
                        }
                        Staged::DataUsage(u) => {
                            tables.data_usage.insert(u.id, u);
                        }
                        Staged::Transaction(tx) => {
                            tables.transactions.insert(tx.tx_hash.clone(), tx);
                        }
                    }
                }
                Ok(())
            })
            .await?;
        debug!(rows = count, "📝 Committed local transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(rows = self.staged.len(), "↩️ Rolled back local transaction");
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>> {
        Ok(Box::new(MemoryTransaction {
            backend: self.clone(),
            staged: Vec::new(),
        }))
    }

    async fn get_algorithm(&self, id: RecordId) -> Result<Algorithm> {
        self.tables
            .read()
            .await
            .algorithms
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("algorithm {}", id)))
    }

    async fn find_algorithm(&self, name: &str, cid: &str) -> Result<Option<Algorithm>> {
        let tables = self.tables.read().await;
        Ok(tables
            .algorithms
            .values()
            .find(|a| a.name == name && a.cid == cid)
            .cloned())
    }

    async fn get_execution(&self, id: RecordId) -> Result<AlgorithmExecution> {
        self.tables
            .read()
            .await
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("execution {}", id)))
    }

    async fn list_reviewing_executions(&self) -> Result<Vec<AlgorithmExecution>> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .values()
            .filter(|e| e.review_status == ReviewStatus::Reviewing)
            .filter(|e| tables.is_confirmed(EntityType::Execution, e.id))
            .cloned()
            .collect())
    }

    async fn list_pending_executions(&self) -> Result<Vec<AlgorithmExecution>> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .values()
            .filter(|e| match e.status {
                ExecStatus::Running => true,
                ExecStatus::Queued => e.review_status == ReviewStatus::Approved,
                _ => false,
            })
            .filter(|e| tables.is_confirmed(EntityType::Execution, e.id))
            .cloned()
            .collect())
    }

    async fn list_executions_with_algorithm(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<ExecutionWithAlgorithm>, u64)> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ExecutionWithAlgorithm> = tables
            .executions
            .values()
            .filter(|e| tables.is_confirmed(EntityType::Execution, e.id))
            .filter_map(|e| {
                tables.algorithms.get(&e.algorithm_id).map(|a| ExecutionWithAlgorithm {
                    execution: e.clone(),
                    algo_name: a.name.clone(),
                    algo_link: a.link.clone(),
                    cid: a.cid.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            b.execution
                .created_at
                .cmp(&a.execution.created_at)
                .then(b.execution.id.cmp(&a.execution.id))
        });

        let total = rows.len() as u64;
        let offset = page.saturating_sub(1) * page_size;
        let page_rows = rows.into_iter().skip(offset).take(page_size).collect();
        Ok((page_rows, total))
    }

    async fn update_review_status(&self, id: RecordId, status: ReviewStatus) -> Result<()> {
        let current = self.get_execution(id).await?.review_status;
        if current == status {
            return Ok(());
        }
        self.write(|tables| {
            let execution = tables.execution_mut(id)?;
            if !execution.review_status.can_transition_to(status) {
                return Err(StorageError::InvalidState(format!(
                    "review of execution {} is already {}",
                    id, execution.review_status
                )));
            }
            execution.review_status = status;
            execution.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn update_vote_window(
        &self,
        id: RecordId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|tables| {
            let execution = tables.execution_mut(id)?;
            execution.vote_start_time = Some(start);
            execution.vote_end_time = Some(end);
            execution.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn update_execution_status(
        &self,
        id: RecordId,
        status: ExecStatus,
    ) -> Result<AlgorithmExecution> {
        self.write(|tables| {
            let execution = tables.execution_mut(id)?;
            execution
                .status
                .check_transition(status)
                .map_err(|e| StorageError::InvalidState(format!("execution {}: {}", id, e)))?;

            let now = Utc::now();
            execution.status = status;
            execution.updated_at = now;
            if status == ExecStatus::Running {
                execution.start_time = Some(now);
            }
            if status.is_terminal() {
                execution.end_time = Some(now);
            }
            Ok(execution.clone())
        })
        .await
    }

    async fn update_execution_completed(
        &self,
        id: RecordId,
        result: &str,
        error_msg: Option<&str>,
    ) -> Result<AlgorithmExecution> {
        self.write(|tables| {
            let execution = tables.execution_mut(id)?;
            execution
                .status
                .check_transition(ExecStatus::Completed)
                .map_err(|e| StorageError::InvalidState(format!("execution {}: {}", id, e)))?;

            let now = Utc::now();
            execution.status = ExecStatus::Completed;
            execution.updated_at = now;
            execution.end_time = Some(now);
            execution.result = result.to_string();
            if let Some(msg) = error_msg.filter(|m| !m.is_empty()) {
                execution.error_msg = msg.to_string();
            }
            Ok(execution.clone())
        })
        .await
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<BlockchainTransaction> {
        self.tables
            .read()
            .await
            .transactions
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("transaction {}", tx_hash)))
    }

    async fn update_transaction_status(
        &self,
        tx_hash: &str,
        status: TxStatus,
        block_number: Option<u64>,
        block_timestamp: Option<DateTime<Utc>>,
    ) -> Result<BlockchainTransaction> {
        let stored = self.get_transaction(tx_hash).await?;
        if stored.status.is_terminal() {
            if stored.status != status {
                debug!(tx_hash, stored = %stored.status, requested = %status, "Ignoring status change of settled transaction");
            }
            return Ok(stored);
        }

        self.write(|tables| {
            let tx = tables
                .transactions
                .get_mut(tx_hash)
                .ok_or_else(|| StorageError::NotFound(format!("transaction {}", tx_hash)))?;
            if tx.status.is_terminal() {
                return Ok(tx.clone());
            }
            tx.status = status;
            if block_number.is_some() {
                tx.block_number = block_number;
            }
            if block_timestamp.is_some() {
                tx.block_timestamp = block_timestamp;
            }
            tx.updated_at = Utc::now();
            Ok(tx.clone())
        })
        .await
    }

    async fn create_static_dataset(&self, dataset: NewStaticDataset) -> Result<StaticDataset> {
        self.write(|tables| {
            if tables.static_datasets.values().any(|d| d.name == dataset.name) {
                return Err(StorageError::AlreadyExists(format!(
                    "static dataset {}",
                    dataset.name
                )));
            }
            let record = StaticDataset {
                id: self.allocate_id(),
                name: dataset.name,
                ui_name: dataset.ui_name,
                description: dataset.description,
                file_hash: dataset.file_hash,
                cid: dataset.cid,
                author: dataset.author,
                author_wallet: dataset.author_wallet,
                created_at: Utc::now(),
            };
            tables.static_datasets.insert(record.id, record.clone());
            Ok(record)
        })
        .await
    }

    async fn get_static_dataset_by_name(&self, name: &str) -> Result<StaticDataset> {
        let tables = self.tables.read().await;
        tables
            .static_datasets
            .values()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("static dataset {}", name)))
    }

    async fn create_dynamic_dataset(
        &self,
        name: &str,
        ui_name: &str,
        description: &str,
    ) -> Result<DynamicDataset> {
        self.write(|tables| {
            if tables.dynamic_datasets.values().any(|d| d.name == name) {
                return Err(StorageError::AlreadyExists(format!("dataset {}", name)));
            }
            let record = DynamicDataset {
                id: self.allocate_id(),
                name: name.to_string(),
                ui_name: ui_name.to_string(),
                description: description.to_string(),
                created_at: Utc::now(),
            };
            tables.dynamic_datasets.insert(record.id, record.clone());
            Ok(record)
        })
        .await
    }

    async fn list_dynamic_datasets(&self) -> Result<Vec<DynamicDataset>> {
        Ok(self
            .tables
            .read()
            .await
            .dynamic_datasets
            .values()
            .cloned()
            .collect())
    }

    async fn create_test_report(
        &self,
        dataset: &str,
        user_wallet: &str,
        file_hash: &str,
        results: Vec<NewTestResult>,
    ) -> Result<TestReport> {
        self.write(|tables| {
            let report = TestReport {
                id: self.allocate_id(),
                dataset: dataset.to_string(),
                user_wallet: user_wallet.to_string(),
                file_hash: file_hash.to_string(),
                created_at: Utc::now(),
            };
            for row in results {
                let result = TestResult {
                    id: self.allocate_id(),
                    test_report_id: report.id,
                    category: row.category,
                    name: row.name,
                    definition: row.definition,
                    result: row.result,
                    reference_range: row.reference_range,
                    explanation: row.explanation,
                    status: row.status,
                    suggestions: row.suggestions,
                };
                tables.test_results.insert(result.id, result);
            }
            tables.test_reports.insert(report.id, report.clone());
            Ok(report)
        })
        .await
    }

    async fn list_test_results(&self, dataset: &str) -> Result<Vec<TestResult>> {
        let tables = self.tables.read().await;
        let report_ids: HashSet<RecordId> = tables
            .test_reports
            .values()
            .filter(|r| r.dataset == dataset)
            .map(|r| r.id)
            .collect();
        Ok(tables
            .test_results
            .values()
            .filter(|r| report_ids.contains(&r.test_report_id))
            .cloned()
            .collect())
    }

    async fn list_votes(&self, algo_cid: &str) -> Result<Vec<Vote>> {
        Ok(self
            .tables
            .read()
            .await
            .votes
            .values()
            .filter(|v| v.algo_cid == algo_cid)
            .cloned()
            .collect())
    }

    async fn list_data_usage(&self) -> Result<Vec<DataUsage>> {
        Ok(self
            .tables
            .read()
            .await
            .data_usage
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seed_confirmed_execution(backend: &MemoryBackend) -> AlgorithmExecution {
        let mut tx = backend.begin().await.unwrap();
        let algo = tx.create_algorithm("cbc", "https://x", "Qm123").await.unwrap();
        let exe = tx.create_execution(algo.id, "blood", "0xabc").await.unwrap();
        tx.create_transaction_with_status(
            "0x01",
            exe.id,
            EntityType::Execution,
            TxStatus::Confirmed,
            Some(1),
            None,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        exe
    }

    #[tokio::test]
    async fn test_transaction_commit_applies_all_rows() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        let vote = tx
            .create_vote("Qm123", "0xmember", true, Utc::now())
            .await
            .unwrap();
        tx.create_transaction_with_status(
            "0xvote",
            vote.id,
            EntityType::Vote,
            TxStatus::Confirmed,
            Some(10),
            None,
        )
        .await
        .unwrap();

        assert!(backend.list_votes("Qm123").await.unwrap().is_empty());
        tx.commit().await.unwrap();

        assert_eq!(backend.list_votes("Qm123").await.unwrap().len(), 1);
        let stored = backend.get_transaction("0xvote").await.unwrap();
        assert_eq!(stored.entity_id, vote.id);
        assert_eq!(stored.status, TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_leave_no_rows() {
        let backend = MemoryBackend::new();

        let mut tx = backend.begin().await.unwrap();
        tx.create_data_usage("0xabc", "Qm1", "blood", 1).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = backend.begin().await.unwrap();
            tx.create_data_usage("0xabc", "Qm1", "blood", 2).await.unwrap();
        }

        assert!(backend.list_data_usage().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected_without_partial_state() {
        let backend = MemoryBackend::new();
        seed_confirmed_execution(&backend).await;

        let mut tx = backend.begin().await.unwrap();
        let vote = tx
            .create_vote("Qm123", "0xm", false, Utc::now())
            .await
            .unwrap();
        let err = tx
            .create_transaction("0x01", vote.id, EntityType::Vote)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        tx.rollback().await.unwrap();
        assert!(backend.list_votes("Qm123").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.create_data_usage("0xabc", "Qm1", "blood", 1).await.unwrap();
        backend.inject_write_failures(true);
        assert!(tx.commit().await.is_err());
        backend.inject_write_failures(false);
        assert!(backend.list_data_usage().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_transaction_status_is_idempotent() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.create_transaction("0xabc", 1, EntityType::DataUsage)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let first = backend
            .update_transaction_status("0xabc", TxStatus::Confirmed, Some(5), Some(Utc::now()))
            .await
            .unwrap();
        let second = backend
            .update_transaction_status("0xabc", TxStatus::Confirmed, Some(5), None)
            .await
            .unwrap();
        assert_eq!(first, second);

        let third = backend
            .update_transaction_status("0xabc", TxStatus::Failed, Some(6), None)
            .await
            .unwrap();
        assert_eq!(third.status, TxStatus::Confirmed);
        assert_eq!(third.block_number, Some(5));
    }

    #[tokio::test]
    async fn test_execution_state_machine_enforced() {
        let backend = MemoryBackend::new();
        let exe = seed_confirmed_execution(&backend).await;

        assert!(backend
            .update_execution_completed(exe.id, "42", None)
            .await
            .is_err());

        let running = backend
            .update_execution_status(exe.id, ExecStatus::Running)
            .await
            .unwrap();
        assert!(running.start_time.is_some());

        let done = backend
            .update_execution_completed(exe.id, "42", Some("warn"))
            .await
            .unwrap();
        assert_eq!(done.status, ExecStatus::Completed);
        assert_eq!(done.result, "42");
        assert_eq!(done.error_msg, "warn");
        assert!(done.end_time.is_some());

        assert!(backend
            .update_execution_status(exe.id, ExecStatus::Failed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_review_status_transitions() {
        let backend = MemoryBackend::new();
        let exe = seed_confirmed_execution(&backend).await;

        backend
            .update_review_status(exe.id, ReviewStatus::Approved)
            .await
            .unwrap();
        backend
            .update_review_status(exe.id, ReviewStatus::Approved)
            .await
            .unwrap();
        assert!(backend
            .update_review_status(exe.id, ReviewStatus::Rejected)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_listings_require_confirmed_transaction() {
        let backend = MemoryBackend::new();
        let confirmed = seed_confirmed_execution(&backend).await;

        let mut tx = backend.begin().await.unwrap();
        let algo = tx.create_algorithm("other", "l", "Qm9").await.unwrap();
        let pending = tx.create_execution(algo.id, "blood", "0xdef").await.unwrap();
        tx.create_transaction("0x02", pending.id, EntityType::Execution)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let reviewing = backend.list_reviewing_executions().await.unwrap();
        assert_eq!(reviewing.len(), 1);
        assert_eq!(reviewing[0].id, confirmed.id);

        // Still under review: not runnable yet.
        assert!(backend.list_pending_executions().await.unwrap().is_empty());
        backend
            .update_review_status(confirmed.id, ReviewStatus::Approved)
            .await
            .unwrap();
        let queued = backend.list_pending_executions().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, confirmed.id);

        let (page, total) = backend.list_executions_with_algorithm(1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].cid, "Qm123");
    }

    #[tokio::test]
    async fn test_test_results_grouped_by_dataset() {
        let backend = MemoryBackend::new();
        let row = |name: &str| NewTestResult {
            category: "blood".into(),
            name: name.into(),
            status: "normal".into(),
            ..Default::default()
        };
        backend
            .create_test_report("blood", "0x1", "h1", vec![row("hb"), row("rbc")])
            .await
            .unwrap();
        backend
            .create_test_report("urine", "0x1", "h2", vec![row("ph")])
            .await
            .unwrap();

        let blood = backend.list_test_results("blood").await.unwrap();
        assert_eq!(blood.len(), 2);
        assert_eq!(blood[0].name, "hb");
        assert_eq!(backend.list_test_results("urine").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let exe_id = {
            let backend = MemoryBackend::open(&path).await.unwrap();
            let exe = seed_confirmed_execution(&backend).await;
            backend
                .update_execution_status(exe.id, ExecStatus::Running)
                .await
                .unwrap();
            exe.id
        };

        let reopened = MemoryBackend::open(&path).await.unwrap();
        let exe = reopened.get_execution(exe_id).await.unwrap();
        assert_eq!(exe.status, ExecStatus::Running);
        assert_eq!(reopened.list_pending_executions().await.unwrap().len(), 1);

        let mut tx = reopened.begin().await.unwrap();
        let usage = tx.create_data_usage("0x", "Qm", "blood", 0).await.unwrap();
        assert!(usage.id > exe_id);
    }

    #[tokio::test]
    async fn test_unsaved_write_leaves_memory_untouched() {
        let dir = TempDir::new().unwrap();
        let backend = MemoryBackend::open(dir.path().join("state.json")).await.unwrap();
        let exe = seed_confirmed_execution(&backend).await;

        // The temp file cannot be created over a directory.
        std::fs::create_dir(dir.path().join("state.tmp")).unwrap();

        assert!(backend
            .update_execution_status(exe.id, ExecStatus::Running)
            .await
            .is_err());
        assert_eq!(
            backend.get_execution(exe.id).await.unwrap().status,
            ExecStatus::Queued
        );

        let mut tx = backend.begin().await.unwrap();
        tx.create_data_usage("0xabc", "Qm1", "blood", 1).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert!(backend.list_data_usage().await.unwrap().is_empty());

        std::fs::remove_dir(dir.path().join("state.tmp")).unwrap();
        backend
            .update_execution_status(exe.id, ExecStatus::Running)
            .await
            .unwrap();
        assert_eq!(
            backend.get_execution(exe.id).await.unwrap().status,
            ExecStatus::Running
        );
    }

    #[tokio::test]
    async fn test_fail_next_writes_is_one_shot() {
        let backend = MemoryBackend::new();
        let exe = seed_confirmed_execution(&backend).await;
        backend.fail_next_writes(1);
        assert!(backend
            .update_execution_status(exe.id, ExecStatus::Running)
            .await
            .is_err());
        backend
            .update_execution_status(exe.id, ExecStatus::Running)
            .await
            .unwrap();
    }
}
