use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labchain_types::{
    Algorithm, AlgorithmExecution, BlockchainTransaction, DataUsage, DynamicDataset, EntityType,
    ExecStatus, ExecutionWithAlgorithm, RecordId, ReviewStatus, StaticDataset, TestReport,
    TestResult, TxStatus, Vote,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Fields supplied when registering a static dataset.
#[derive(Debug, Clone)]
pub struct NewStaticDataset {
    pub name: String,
    pub ui_name: String,
    pub description: String,
    pub file_hash: String,
    pub cid: String,
    pub author: String,
    pub author_wallet: String,
}

/// One result row of a submitted test report.
#[derive(Debug, Clone, Default)]
pub struct NewTestResult {
    pub category: String,
    pub name: String,
    pub definition: String,
    pub result: String,
    pub reference_range: String,
    pub explanation: String,
    pub status: String,
    pub suggestions: Option<String>,
}

/// Multi-row write that either applies completely or not at all.
///
/// Ids are allocated as rows are staged so that later rows can link to
/// earlier ones. Dropping the transaction without committing discards it.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn create_algorithm(&mut self, name: &str, link: &str, cid: &str) -> Result<Algorithm>;

    async fn create_execution(
        &mut self,
        algorithm_id: RecordId,
        dataset: &str,
        scientist_wallet: &str,
    ) -> Result<AlgorithmExecution>;

    async fn create_vote(
        &mut self,
        algo_cid: &str,
        voter: &str,
        approved: bool,
        voted_at: DateTime<Utc>,
    ) -> Result<Vote>;

    async fn create_data_usage(
        &mut self,
        scientist_wallet: &str,
        algo_cid: &str,
        dataset: &str,
        used_at: i64,
    ) -> Result<DataUsage>;

    /// Stage a PENDING transaction row.
    async fn create_transaction(
        &mut self,
        tx_hash: &str,
        entity_id: RecordId,
        entity_type: EntityType,
    ) -> Result<BlockchainTransaction> {
        self.create_transaction_with_status(tx_hash, entity_id, entity_type, TxStatus::Pending, None, None)
            .await
    }

    async fn create_transaction_with_status(
        &mut self,
        tx_hash: &str,
        entity_id: RecordId,
        entity_type: EntityType,
        status: TxStatus,
        block_number: Option<u64>,
        block_timestamp: Option<DateTime<Utc>>,
    ) -> Result<BlockchainTransaction>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Typed persistence operations used by the orchestrator.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open a local transaction.
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>>;

    async fn get_algorithm(&self, id: RecordId) -> Result<Algorithm>;

    async fn find_algorithm(&self, name: &str, cid: &str) -> Result<Option<Algorithm>>;

    async fn get_execution(&self, id: RecordId) -> Result<AlgorithmExecution>;

    /// Executions confirmed on chain whose review is still open.
    async fn list_reviewing_executions(&self) -> Result<Vec<AlgorithmExecution>>;

    /// Executions confirmed on chain that are RUNNING, or QUEUED after approval.
    async fn list_pending_executions(&self) -> Result<Vec<AlgorithmExecution>>;

    /// Confirmed executions with their algorithm, newest first, plus the total count.
    async fn list_executions_with_algorithm(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<ExecutionWithAlgorithm>, u64)>;

    async fn update_review_status(&self, id: RecordId, status: ReviewStatus) -> Result<()>;

    async fn update_vote_window(
        &self,
        id: RecordId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()>;

    /// Move an execution to `status`, stamping start/end times.
    async fn update_execution_status(
        &self,
        id: RecordId,
        status: ExecStatus,
    ) -> Result<AlgorithmExecution>;

    /// Mark an execution COMPLETED with its output.
    async fn update_execution_completed(
        &self,
        id: RecordId,
        result: &str,
        error_msg: Option<&str>,
    ) -> Result<AlgorithmExecution>;

    async fn get_transaction(&self, tx_hash: &str) -> Result<BlockchainTransaction>;

    /// Record the on-chain outcome of a transaction.
    ///
    /// Repeating a call is harmless: once a row is terminal its status is
    /// kept and the stored row is returned unchanged.
    async fn update_transaction_status(
        &self,
        tx_hash: &str,
        status: TxStatus,
        block_number: Option<u64>,
        block_timestamp: Option<DateTime<Utc>>,
    ) -> Result<BlockchainTransaction>;

    async fn create_static_dataset(&self, dataset: NewStaticDataset) -> Result<StaticDataset>;

    async fn get_static_dataset_by_name(&self, name: &str) -> Result<StaticDataset>;

    async fn create_dynamic_dataset(
        &self,
        name: &str,
        ui_name: &str,
        description: &str,
    ) -> Result<DynamicDataset>;

    async fn list_dynamic_datasets(&self) -> Result<Vec<DynamicDataset>>;

    async fn create_test_report(
        &self,
        dataset: &str,
        user_wallet: &str,
        file_hash: &str,
        results: Vec<NewTestResult>,
    ) -> Result<TestReport>;

    /// Every result row of every report filed under `dataset`, ordered by id.
    async fn list_test_results(&self, dataset: &str) -> Result<Vec<TestResult>>;

    async fn list_votes(&self, algo_cid: &str) -> Result<Vec<Vote>>;

    async fn list_data_usage(&self) -> Result<Vec<DataUsage>>;
}
