#![allow(dead_code)]

use async_trait::async_trait;
use labchain_chain::{SimulatedChain, SimulatedConfig};
use labchain_crypto::{KeyVault, LocalKeyDeriver};
use labchain_runtime::{
    pack_directory, ChainEventSynchronizer, ContainerOutput, ContainerRunner, DatasetConfig,
    DatasetVersionCache, ExecutionOrchestrator, Mount, NotifierHub, OrchestratorConfig,
    Result, RuntimeMetrics, SchedulerConfig, Submitter, SyncConfig, TaskScheduler,
};
use labchain_storage::{ContentStore, MemoryBackend, MemoryContentStore, NewTestResult, StorageBackend};
use labchain_types::{AlgorithmExecution, EntityType, EventKind, RecordId, TxStatus};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub image: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    /// Files visible in the mounted dataset directory during the run.
    pub dataset_files: Vec<String>,
}

/// Container runner test double with a fixed output.
pub struct ScriptedRunner {
    pub builds: Mutex<Vec<(PathBuf, String)>>,
    pub runs: Mutex<Vec<RecordedRun>>,
    output: ContainerOutput,
}

impl ScriptedRunner {
    pub fn new(stdout: &str, success: bool) -> Self {
        Self {
            builds: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            output: ContainerOutput {
                stdout: stdout.to_string(),
                stderr: if success { String::new() } else { "boom".to_string() },
                success,
            },
        }
    }
}

#[async_trait]
impl ContainerRunner for ScriptedRunner {
    async fn build_image(&self, source_dir: &Path, image: &str) -> Result<()> {
        self.builds
            .lock()
            .await
            .push((source_dir.to_path_buf(), image.to_string()));
        Ok(())
    }

    async fn run_container(
        &self,
        image: &str,
        env: &[(String, String)],
        mounts: &[Mount],
    ) -> Result<ContainerOutput> {
        let mut dataset_files = Vec::new();
        if let Some(mount) = mounts.first() {
            for entry in std::fs::read_dir(&mount.source)? {
                dataset_files.push(entry?.file_name().to_string_lossy().into_owned());
            }
        }
        dataset_files.sort();
        self.runs.lock().await.push(RecordedRun {
            image: image.to_string(),
            env: env.to_vec(),
            mounts: mounts.to_vec(),
            dataset_files,
        });
        Ok(self.output.clone())
    }
}

pub struct HarnessOptions {
    pub voting_duration: Duration,
    pub resolve_grace_secs: u64,
    pub resolve_elapsed_on_recovery: bool,
    pub stdout: &'static str,
    pub success: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            voting_duration: Duration::from_secs(3600),
            resolve_grace_secs: 0,
            resolve_elapsed_on_recovery: true,
            stdout: "42",
            success: true,
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub chain: SimulatedChain,
    pub storage: Arc<MemoryBackend>,
    pub store: Arc<MemoryContentStore>,
    pub metrics: Arc<RuntimeMetrics>,
    pub notifier: Arc<NotifierHub>,
    pub scheduler: Arc<TaskScheduler>,
    pub datasets: Arc<DatasetVersionCache>,
    pub orchestrator: Arc<ExecutionOrchestrator>,
    pub sync: Arc<ChainEventSynchronizer>,
    pub submitter: Submitter,
    pub runner: Arc<ScriptedRunner>,
    pub token: CancellationToken,
}

impl Harness {
    pub async fn new(options: HarnessOptions) -> Self {
        let dir = TempDir::new().unwrap();
        Self::build(dir, MemoryBackend::new(), MemoryContentStore::new(), options).await
    }

    pub async fn build(
        dir: TempDir,
        storage: MemoryBackend,
        store: MemoryContentStore,
        options: HarnessOptions,
    ) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let chain = SimulatedChain::new(SimulatedConfig {
            voting_duration: options.voting_duration,
            ..Default::default()
        });
        let storage = Arc::new(storage);
        let store = Arc::new(store);
        let metrics = Arc::new(RuntimeMetrics::new().unwrap());
        let notifier = Arc::new(NotifierHub::new());
        let scheduler = Arc::new(TaskScheduler::new(&SchedulerConfig::default(), metrics.clone()));
        let runner = Arc::new(ScriptedRunner::new(options.stdout, options.success));

        let datasets = Arc::new(DatasetVersionCache::new(
            DatasetConfig {
                storage_root: dir.path().join("datasets"),
                ..Default::default()
            },
            storage.clone(),
            store.clone(),
            Arc::new(KeyVault::new(Arc::new(LocalKeyDeriver::generate()))),
            metrics.clone(),
        ));
        datasets.init().await.unwrap();

        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            OrchestratorConfig {
                resolve_grace_secs: options.resolve_grace_secs,
                ..Default::default()
            },
            storage.clone(),
            store.clone(),
            Arc::new(chain.clone()),
            datasets.clone(),
            runner.clone(),
            metrics.clone(),
        ));
        let sync = Arc::new(ChainEventSynchronizer::new(
            SyncConfig {
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(50),
                resolve_elapsed_on_recovery: options.resolve_elapsed_on_recovery,
            },
            Arc::new(chain.clone()),
            Arc::new(chain.clone()),
            storage.clone(),
            notifier.clone(),
            scheduler.clone(),
            metrics.clone(),
        ));
        let submitter = Submitter::new(storage.clone(), Arc::new(chain.clone()));

        scheduler.set_handler(orchestrator.clone()).await;

        Self {
            dir,
            chain,
            storage,
            store,
            metrics,
            notifier,
            scheduler,
            datasets,
            orchestrator,
            sync,
            submitter,
            runner,
            token: CancellationToken::new(),
        }
    }

    /// Start the dispatch loop only.
    pub fn start_scheduler(&self) {
        let scheduler = self.scheduler.clone();
        let token = self.token.clone();
        tokio::spawn(async move { scheduler.run(token).await });
    }

    /// Start the dispatch loop and every watch loop, and wait for the
    /// subscriptions to be live.
    pub async fn start(&self) {
        self.start_scheduler();
        self.sync.spawn_watchers(&self.token);
        for kind in EventKind::ALL {
            let chain = self.chain.clone();
            eventually(|| {
                let chain = chain.clone();
                async move { chain.subscriber_count(kind).await == 1 }
            })
            .await;
        }
    }

    pub async fn seed_blood_dataset(&self) {
        self.storage
            .create_dynamic_dataset("blood", "Blood tests", "")
            .await
            .unwrap();
        self.storage
            .create_test_report(
                "blood",
                "0xpatient",
                "h1",
                vec![NewTestResult {
                    category: "cbc".into(),
                    name: "hemoglobin".into(),
                    result: "13.5".into(),
                    status: "normal".into(),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();
        self.datasets.export().await.unwrap();
    }

    /// Upload a bundle whose archive holds the given top-level directories.
    pub async fn upload_bundle(&self, roots: &[&str], with_descriptor: bool) -> String {
        let src = TempDir::new().unwrap();
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for root in roots {
            let dir = src.path().join(root);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("main.py"), "print(42)\n").unwrap();
            if with_descriptor {
                std::fs::write(dir.join("Dockerfile"), "FROM python:3-slim\n").unwrap();
            }
            builder.append_dir_all(root, &dir).unwrap();
        }
        let bytes = builder.into_inner().unwrap().finish().unwrap();
        self.store.upload(&bytes).await.unwrap()
    }

    pub async fn upload_valid_bundle(&self) -> String {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("Dockerfile"), "FROM python:3-slim\n").unwrap();
        std::fs::write(src.path().join("main.py"), "print(42)\n").unwrap();
        let bytes = pack_directory(src.path(), "algo").unwrap();
        self.store.upload(&bytes).await.unwrap()
    }

    /// An execution whose submission is already confirmed on chain.
    pub async fn seed_confirmed_execution(&self, cid: &str, dataset: &str) -> AlgorithmExecution {
        let mut tx = self.storage.begin().await.unwrap();
        let algo = tx.create_algorithm("cbc", "https://example.org", cid).await.unwrap();
        let execution = tx.create_execution(algo.id, dataset, "0xscientist").await.unwrap();
        tx.create_transaction_with_status(
            &format!("0xseed{}", execution.id),
            execution.id,
            EntityType::Execution,
            TxStatus::Confirmed,
            Some(1),
            None,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        execution
    }

    pub async fn execution(&self, id: RecordId) -> AlgorithmExecution {
        self.storage.get_execution(id).await.unwrap()
    }

    pub fn scheduled(&self, kind: &str) -> u64 {
        self.metrics.tasks_scheduled.with_label_values(&[kind]).get()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
