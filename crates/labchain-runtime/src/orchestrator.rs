use crate::archive::extract_bundle;
use crate::container::{ContainerOutput, ContainerRunner, Mount, BUILD_DESCRIPTOR};
use crate::dataset::DatasetVersionCache;
use crate::error::{Result, RuntimeError};
use crate::metrics::RuntimeMetrics;
use crate::scheduler::{SchedulerHandler, TaskScheduler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labchain_chain::ChainCaller;
use labchain_storage::{ContentStore, StorageBackend, StorageTransaction};
use labchain_types::{
    Algorithm, AlgorithmExecution, Cid, EntityType, ExecStatus, RecordId, TxHash,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variable that tells the algorithm where its dataset is mounted.
pub const DATASET_ENV: &str = "DATASET_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Images are tagged `<image_prefix>-algorithm-<algorithm id>`.
    pub image_prefix: String,
    /// Container path the dataset directory is mounted at.
    pub dataset_mount: String,
    /// Extra wait after a vote window closes before resolving.
    pub resolve_grace_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            image_prefix: "labchain".to_string(),
            dataset_mount: "/data".to_string(),
            resolve_grace_secs: 60,
        }
    }
}

/// A finished container run and what it ran against.
struct RunOutcome {
    execution: AlgorithmExecution,
    algorithm: Algorithm,
    output: ContainerOutput,
}

/// Drives one execution from QUEUED to COMPLETED or FAILED, and issues the
/// resolve call when a review window closes.
pub struct ExecutionOrchestrator {
    config: OrchestratorConfig,
    storage: Arc<dyn StorageBackend>,
    store: Arc<dyn ContentStore>,
    chain: Arc<dyn ChainCaller>,
    datasets: Arc<DatasetVersionCache>,
    runner: Arc<dyn ContainerRunner>,
    metrics: Arc<RuntimeMetrics>,
}

impl ExecutionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        storage: Arc<dyn StorageBackend>,
        store: Arc<dyn ContentStore>,
        chain: Arc<dyn ChainCaller>,
        datasets: Arc<DatasetVersionCache>,
        runner: Arc<dyn ContainerRunner>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            config,
            storage,
            store,
            chain,
            datasets,
            runner,
            metrics,
        }
    }

    pub fn image_name(&self, algorithm_id: RecordId) -> String {
        format!("{}-algorithm-{}", self.config.image_prefix, algorithm_id)
    }

    /// Re-enqueue every confirmed execution that is still QUEUED or RUNNING.
    pub async fn recover_pending(&self, scheduler: &TaskScheduler) -> Result<usize> {
        let pending = self.storage.list_pending_executions().await?;
        for execution in &pending {
            info!(
                execution_id = execution.id,
                status = %execution.status,
                "♻️ Recovering execution"
            );
            scheduler.schedule_run(execution.id).await?;
        }
        Ok(pending.len())
    }

    /// Run the pipeline and hand its outcome to exactly one finalizer.
    pub async fn run_execution(&self, execution_id: RecordId) {
        let started = Instant::now();
        info!(execution_id, "🚀 Starting execution");

        match self.execute(execution_id).await {
            Ok(outcome) => {
                if let Err(e) = self.on_completed(outcome).await {
                    error!(execution_id, error = %e, "Failed to finalize completed execution");
                }
            }
            Err(e) => self.on_error(execution_id, &e).await,
        }

        self.metrics
            .run_duration
            .observe(started.elapsed().as_secs_f64());
    }

    async fn execute(&self, execution_id: RecordId) -> Result<RunOutcome> {
        let execution = self
            .storage
            .update_execution_status(execution_id, ExecStatus::Running)
            .await?;
        let algorithm = self.storage.get_algorithm(execution.algorithm_id).await?;

        let archive = self.store.download(&algorithm.cid).await?;
        let bundle = extract_bundle(&algorithm.cid, archive).await?;
        if !bundle.root().join(BUILD_DESCRIPTOR).is_file() {
            return Err(RuntimeError::MissingBuildDescriptor(
                bundle.root().display().to_string(),
            ));
        }

        let image = self.image_name(algorithm.id);
        self.runner.build_image(bundle.root(), &image).await?;

        let (path, version) = self
            .datasets
            .acquire_current(&execution.used_dataset)
            .await?;
        let output = self.run_against(&image, &path).await;
        self.datasets
            .release(&execution.used_dataset, &version)
            .await;
        let output = output?;

        debug!(
            execution_id,
            version = %version,
            success = output.success,
            "Container finished"
        );
        Ok(RunOutcome {
            execution,
            algorithm,
            output,
        })
    }

    async fn run_against(&self, image: &str, dataset_dir: &Path) -> Result<ContainerOutput> {
        if !tokio::fs::try_exists(dataset_dir).await? {
            return Err(RuntimeError::Dataset(format!(
                "dataset directory {} does not exist",
                dataset_dir.display()
            )));
        }
        let env = [(DATASET_ENV.to_string(), self.config.dataset_mount.clone())];
        let mounts = [Mount::read_only(dataset_dir, self.config.dataset_mount.as_str())];
        self.runner.run_container(image, &env, &mounts).await
    }

    async fn on_completed(&self, outcome: RunOutcome) -> Result<()> {
        let RunOutcome {
            execution,
            algorithm,
            output,
        } = outcome;
        let error_msg = (!output.success).then_some(output.stderr.as_str());
        if let Err(e) = self
            .storage
            .update_execution_completed(execution.id, &output.stdout, error_msg)
            .await
        {
            // A run whose result was not recorded must not stay RUNNING.
            let e = RuntimeError::from(e);
            self.on_error(execution.id, &e).await;
            return Err(e);
        }
        self.metrics.runs_completed.inc();
        info!(
            execution_id = execution.id,
            success = output.success,
            "✅ Execution completed"
        );

        let mut tx = self.storage.begin().await?;
        match self.stage_usage(tx.as_mut(), &execution, &algorithm).await {
            Ok(hash) => {
                tx.commit().await?;
                info!(execution_id = execution.id, tx_hash = %hash, "📝 Data usage recorded");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(execution_id = execution.id, error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn stage_usage(
        &self,
        tx: &mut dyn StorageTransaction,
        execution: &AlgorithmExecution,
        algorithm: &Algorithm,
    ) -> Result<TxHash> {
        let used_at = Utc::now().timestamp();
        let usage = tx
            .create_data_usage(
                &execution.scientist_wallet,
                &algorithm.cid,
                &execution.used_dataset,
                used_at,
            )
            .await?;
        let submitted = self
            .chain
            .record_usage(
                &execution.scientist_wallet,
                &algorithm.cid,
                &execution.used_dataset,
                used_at,
            )
            .await?;
        tx.create_transaction(&submitted.hash, usage.id, EntityType::DataUsage)
            .await?;
        Ok(submitted.hash)
    }

    async fn on_error(&self, execution_id: RecordId, cause: &RuntimeError) {
        error!(execution_id, error = %cause, "❌ Execution failed");
        self.metrics.runs_failed.inc();
        if let Err(e) = self
            .storage
            .update_execution_status(execution_id, ExecStatus::Failed)
            .await
        {
            error!(execution_id, error = %e, "Failed to mark execution FAILED");
        }
    }

    /// Wait for the review window to close, then resolve on chain.
    pub async fn resolve_when_due(
        &self,
        token: &CancellationToken,
        execution_id: RecordId,
        cid: &str,
        resolve_at: DateTime<Utc>,
    ) -> Result<Option<TxHash>> {
        let grace = chrono::Duration::seconds(self.config.resolve_grace_secs as i64);
        let delay = (resolve_at + grace - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(execution_id, delay_secs = delay.as_secs(), "⏳ Waiting to resolve");

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(execution_id, "Resolve abandoned on shutdown");
                return Ok(None);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let submitted = self.chain.resolve(execution_id, cid).await?;
        self.metrics.resolves_issued.inc();
        info!(execution_id, cid, tx_hash = %submitted.hash, "🗳️ Resolve submitted");
        Ok(Some(submitted.hash))
    }
}

#[async_trait]
impl SchedulerHandler for ExecutionOrchestrator {
    async fn on_run(&self, token: CancellationToken, execution_id: RecordId) {
        // Left as is so recovery picks it up on the next start.
        if token.is_cancelled() {
            debug!(execution_id, "Skipping run on shutdown");
            return;
        }
        self.run_execution(execution_id).await;
    }

    async fn on_resolve(
        &self,
        token: CancellationToken,
        execution_id: RecordId,
        cid: Cid,
        resolve_at: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .resolve_when_due(&token, execution_id, &cid, resolve_at)
            .await
        {
            error!(execution_id, cid = %cid, error = %e, "Resolve call failed");
        }
    }
}
