use crate::config::NodeConfig;
use crate::service::{ChainSyncService, MetricsService, RuntimeService, ServiceManager};
use anyhow::{Context, Result};
use labchain_chain::{SimulatedChain, SimulatedConfig};
use labchain_crypto::{KeyVault, LocalKeyDeriver};
use labchain_runtime::{
    ChainEventSynchronizer, ContainerRunner, DatasetVersionCache, DockerCliRunner,
    ExecutionOrchestrator, NotifierHub, OrchestratorConfig, RuntimeMetrics, Submitter, SyncConfig,
    TaskScheduler,
};
use labchain_storage::{FsContentStore, MemoryBackend};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The orchestrator node: every component wired to one chain, one store
/// and one root cancellation token.
pub struct LabchainNode {
    config: NodeConfig,
    chain: SimulatedChain,
    storage: Arc<MemoryBackend>,
    metrics: Arc<RuntimeMetrics>,
    notifier: Arc<NotifierHub>,
    datasets: Arc<DatasetVersionCache>,
    submitter: Submitter,
    services: ServiceManager,
}

impl LabchainNode {
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let runner = Arc::new(DockerCliRunner::new(config.container.clone()));
        Self::with_runner(config, runner).await
    }

    pub async fn with_runner(config: NodeConfig, runner: Arc<dyn ContainerRunner>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.node.data_dir)
            .await
            .with_context(|| format!("cannot create {}", config.node.data_dir.display()))?;

        let storage = Arc::new(MemoryBackend::open(config.state_file()).await?);
        let store = Arc::new(FsContentStore::open(config.blob_dir()).await?);
        let vault = Arc::new(load_vault(&config)?);
        let metrics = Arc::new(RuntimeMetrics::new()?);
        let notifier = Arc::new(NotifierHub::new());

        let chain = SimulatedChain::new(SimulatedConfig {
            voting_duration: Duration::from_secs(config.chain.voting_duration_secs),
            event_delay: Duration::from_millis(config.chain.event_delay_ms),
            funding_threshold: u128::from(config.chain.funding_threshold),
            top_up_amount: u128::from(config.chain.top_up_amount),
        });

        let scheduler = Arc::new(TaskScheduler::new(&config.scheduler, metrics.clone()));
        let datasets = Arc::new(DatasetVersionCache::new(
            config.dataset.clone(),
            storage.clone(),
            store.clone(),
            vault,
            metrics.clone(),
        ));
        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            OrchestratorConfig {
                image_prefix: config.node.image_prefix.clone(),
                resolve_grace_secs: config.scheduler.resolve_grace_secs,
                ..Default::default()
            },
            storage.clone(),
            store,
            Arc::new(chain.clone()),
            datasets.clone(),
            runner,
            metrics.clone(),
        ));
        let sync = Arc::new(ChainEventSynchronizer::new(
            SyncConfig {
                backoff_base: Duration::from_secs(config.chain.backoff_base_secs),
                backoff_max: Duration::from_secs(config.chain.backoff_max_secs),
                resolve_elapsed_on_recovery: config.scheduler.resolve_elapsed_on_recovery,
            },
            Arc::new(chain.clone()),
            Arc::new(chain.clone()),
            storage.clone(),
            notifier.clone(),
            scheduler.clone(),
            metrics.clone(),
        ));
        let submitter = Submitter::new(storage.clone(), Arc::new(chain.clone()));

        let mut services = ServiceManager::new(CancellationToken::new());
        services.register(Arc::new(RuntimeService::new(
            scheduler,
            orchestrator,
            datasets.clone(),
        )));
        services.register(Arc::new(ChainSyncService::new(sync)));
        if config.metrics.enabled {
            let addr: SocketAddr = format!("{}:{}", config.metrics.host, config.metrics.port)
                .parse()
                .context("invalid metrics address")?;
            services.register(Arc::new(MetricsService::new(metrics.clone(), addr)));
        }

        Ok(Self {
            config,
            chain,
            storage,
            metrics,
            notifier,
            datasets,
            submitter,
            services,
        })
    }

    /// Initialize and start every service.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            data_dir = %self.config.node.data_dir.display(),
            dataset_root = %self.config.dataset.storage_root.display(),
            max_concurrent_tasks = self.config.scheduler.max_concurrent_tasks,
            "🧬 Starting labchain node"
        );
        self.services.init_all().await?;
        if let Err(e) = self.services.start_all().await {
            self.services.stop_all().await;
            return Err(e);
        }
        Ok(())
    }

    /// Cancel every loop and wait for the services to wind down.
    pub async fn shutdown(&mut self) {
        info!("🛑 Shutting down");
        self.services.stop_all().await;
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &SimulatedChain {
        &self.chain
    }

    pub fn storage(&self) -> &Arc<MemoryBackend> {
        &self.storage
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    pub fn notifier(&self) -> &Arc<NotifierHub> {
        &self.notifier
    }

    pub fn datasets(&self) -> &Arc<DatasetVersionCache> {
        &self.datasets
    }

    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    pub fn token(&self) -> &CancellationToken {
        self.services.token()
    }
}

fn load_vault(config: &NodeConfig) -> Result<KeyVault> {
    let deriver = match &config.vault.master_secret_file {
        Some(path) => LocalKeyDeriver::from_file(path)
            .with_context(|| format!("cannot load vault secret from {}", path.display()))?,
        None => {
            warn!("🔐 No vault secret configured, using an ephemeral one");
            LocalKeyDeriver::generate()
        }
    };
    Ok(KeyVault::new(Arc::new(deriver)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use labchain_runtime::{ContainerOutput, Mount, CURRENT_LINK};
    use labchain_storage::{ContentStore, StorageBackend};
    use labchain_types::{ExecStatus, ReviewStatus};
    use std::path::Path;
    use tempfile::TempDir;

    struct EchoRunner;

    #[async_trait]
    impl ContainerRunner for EchoRunner {
        async fn build_image(&self, _source_dir: &Path, _image: &str) -> labchain_runtime::Result<()> {
            Ok(())
        }

        async fn run_container(
            &self,
            _image: &str,
            _env: &[(String, String)],
            _mounts: &[Mount],
        ) -> labchain_runtime::Result<ContainerOutput> {
            Ok(ContainerOutput {
                stdout: "done".to_string(),
                stderr: String::new(),
                success: true,
            })
        }
    }

    fn test_config(dir: &Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.set_data_dir(dir.to_path_buf());
        config.metrics.enabled = false;
        config.scheduler.resolve_grace_secs = 0;
        config.chain.voting_duration_secs = 1;
        config
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_publishes_initial_export() {
        let dir = TempDir::new().unwrap();
        let mut node = LabchainNode::with_runner(test_config(dir.path()), Arc::new(EchoRunner))
            .await
            .unwrap();
        node.start().await.unwrap();

        let datasets = node.datasets().clone();
        wait_for(|| {
            let datasets = datasets.clone();
            async move { datasets.current_version().await.is_some() }
        })
        .await;
        assert!(dir.path().join("datasets").join(CURRENT_LINK).exists());

        node.shutdown().await;
        assert!(node.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_submitted_algorithm_runs_after_approval() {
        let dir = TempDir::new().unwrap();
        let mut node = LabchainNode::with_runner(test_config(dir.path()), Arc::new(EchoRunner))
            .await
            .unwrap();
        node.storage()
            .create_dynamic_dataset("blood", "Blood tests", "")
            .await
            .unwrap();
        node.start().await.unwrap();
        let datasets = node.datasets().clone();
        wait_for(|| {
            let datasets = datasets.clone();
            async move { datasets.current_version().await.is_some() }
        })
        .await;

        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let bundle = labchain_runtime::pack_directory(src.path(), "algo").unwrap();
        let store = FsContentStore::open(node.config().blob_dir()).await.unwrap();
        let cid = store.upload(&bundle).await.unwrap();

        let (execution, _) = node
            .submitter()
            .submit_algorithm("cbc", "", &cid, "blood", "0xscientist")
            .await
            .unwrap();
        node.chain()
            .cast_vote(execution.id, "0xreviewer", true)
            .await
            .unwrap();

        let storage = node.storage().clone();
        wait_for(|| {
            let storage = storage.clone();
            async move {
                storage.get_execution(execution.id).await.unwrap().status == ExecStatus::Completed
            }
        })
        .await;
        let done = node.storage().get_execution(execution.id).await.unwrap();
        assert_eq!(done.review_status, ReviewStatus::Approved);
        assert_eq!(done.result, "done");

        node.shutdown().await;
    }
}
