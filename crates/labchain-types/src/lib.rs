pub mod dataset;
pub mod error;
pub mod events;
pub mod execution;
pub mod notify;
pub mod records;
pub mod transaction;

pub use dataset::{
    is_static_dataset, DynamicDataset, StaticDataset, TestReport, TestResult,
    STATIC_DATASET_PREFIX,
};
pub use error::{Result, TypesError};
pub use events::{ChainEvent, EventEnvelope, EventKind};
pub use execution::{
    Algorithm, AlgorithmExecution, ExecStatus, ExecutionWithAlgorithm, ReviewStatus,
};
pub use notify::{BizCode, Notification};
pub use records::{DataUsage, Vote};
pub use transaction::{BlockchainTransaction, EntityType, TxStatus};

/// Identifier of a persisted row. Allocated by the storage backend.
pub type RecordId = u64;

/// Hex-encoded transaction hash (`0x`-prefixed).
pub type TxHash = String;

/// Content identifier returned by the content-addressed store.
pub type Cid = String;
