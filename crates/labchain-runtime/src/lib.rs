//! Orchestration core of the labchain node.
//!
//! - [`synchronizer`]: chain events to local state and scheduler work
//! - [`scheduler`]: bounded RUN / RESOLVE queue with a run permit pool
//! - [`orchestrator`]: the run pipeline and the timed resolve call
//! - [`dataset`]: reference-counted dataset versions on disk
//! - [`container`]: image build and sandboxed runs
//! - [`archive`]: algorithm bundle extraction

pub mod archive;
pub mod container;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
mod recent;
pub mod scheduler;
pub mod submission;
pub mod synchronizer;

pub use archive::{extract_bundle, pack_directory, ExtractedBundle};
pub use container::{
    ContainerConfig, ContainerOutput, ContainerRunner, DockerCliRunner, Mount, BUILD_DESCRIPTOR,
};
pub use dataset::{DatasetConfig, DatasetVersionCache, CURRENT_LINK, EXPORT_HEADER};
pub use error::{Result, RuntimeError};
pub use metrics::RuntimeMetrics;
pub use notifier::NotifierHub;
pub use orchestrator::{ExecutionOrchestrator, OrchestratorConfig, DATASET_ENV};
pub use scheduler::{SchedulerConfig, SchedulerHandler, SchedulerTask, TaskScheduler};
pub use submission::Submitter;
pub use synchronizer::{backoff_delay, ChainEventSynchronizer, SyncConfig};
