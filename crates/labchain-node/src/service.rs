//! Service lifecycle for the node.
//!
//! Every long-running part of the node is a [`Service`]. The
//! [`ServiceManager`] initializes them in registration order, starts them
//! in the same order, and stops them in reverse once the shared
//! cancellation token fires.

use anyhow::{Context, Result};
use async_trait::async_trait;
use labchain_runtime::{
    ChainEventSynchronizer, DatasetVersionCache, ExecutionOrchestrator, RuntimeMetrics,
    TaskScheduler,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a stopping service waits for its tasks before aborting them.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn init(&self) -> Result<()>;

    /// Spawn the service's tasks. They must exit once `token` is cancelled.
    async fn start(&self, token: CancellationToken) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

pub struct ServiceManager {
    services: Vec<Arc<dyn Service>>,
    started: usize,
    token: CancellationToken,
}

impl ServiceManager {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            services: Vec::new(),
            started: 0,
            token,
        }
    }

    pub fn register(&mut self, service: Arc<dyn Service>) {
        debug!(service = service.name(), "Service registered");
        self.services.push(service);
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn init_all(&self) -> Result<()> {
        for service in &self.services {
            service
                .init()
                .await
                .with_context(|| format!("{} failed to initialize", service.name()))?;
            info!(service = service.name(), "✨ Service initialized");
        }
        Ok(())
    }

    pub async fn start_all(&mut self) -> Result<()> {
        for service in &self.services {
            service
                .start(self.token.clone())
                .await
                .with_context(|| format!("{} failed to start", service.name()))?;
            self.started += 1;
            info!(service = service.name(), "🚀 Service started");
        }
        Ok(())
    }

    /// Cancel the shared token, then stop started services in reverse order.
    pub async fn stop_all(&mut self) {
        self.token.cancel();
        for service in self.services[..self.started].iter().rev() {
            match service.stop().await {
                Ok(()) => info!(service = service.name(), "🛑 Service stopped"),
                Err(e) => warn!(service = service.name(), error = %e, "Service stopped with error"),
            }
        }
        self.started = 0;
    }
}

/// Handles spawned by a service, awaited on stop.
#[derive(Default)]
struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    async fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    async fn extend(&self, handles: Vec<JoinHandle<()>>) {
        self.handles.lock().await.extend(handles);
    }

    async fn join(&self, service: &'static str) {
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!(service, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

/// Scheduler dispatch, pending-run recovery and the dataset lifecycle.
pub struct RuntimeService {
    scheduler: Arc<TaskScheduler>,
    orchestrator: Arc<ExecutionOrchestrator>,
    datasets: Arc<DatasetVersionCache>,
    tasks: TaskSet,
}

impl RuntimeService {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        orchestrator: Arc<ExecutionOrchestrator>,
        datasets: Arc<DatasetVersionCache>,
    ) -> Self {
        Self {
            scheduler,
            orchestrator,
            datasets,
            tasks: TaskSet::default(),
        }
    }
}

#[async_trait]
impl Service for RuntimeService {
    fn name(&self) -> &'static str {
        "runtime"
    }

    async fn init(&self) -> Result<()> {
        self.scheduler.set_handler(self.orchestrator.clone()).await;
        self.datasets.init().await?;
        Ok(())
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        // Dispatch must be live before recovery fills the bounded queue.
        let scheduler = self.scheduler.clone();
        let dispatch_token = token.clone();
        self.tasks
            .push(tokio::spawn(async move {
                if let Err(e) = scheduler.run(dispatch_token).await {
                    error!(error = %e, "❌ Scheduler dispatch loop failed");
                }
            }))
            .await;

        let recovered = self.orchestrator.recover_pending(&self.scheduler).await?;
        if recovered > 0 {
            info!(count = recovered, "♻️ Pending executions re-queued");
        }

        let datasets = self.datasets.clone();
        self.tasks
            .push(tokio::spawn(datasets.run_lifecycle(token)))
            .await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.tasks.join(self.name()).await;
        Ok(())
    }
}

/// Resolve recovery and the supervised chain watch loops.
pub struct ChainSyncService {
    sync: Arc<ChainEventSynchronizer>,
    tasks: TaskSet,
}

impl ChainSyncService {
    pub fn new(sync: Arc<ChainEventSynchronizer>) -> Self {
        Self {
            sync,
            tasks: TaskSet::default(),
        }
    }
}

#[async_trait]
impl Service for ChainSyncService {
    fn name(&self) -> &'static str {
        "chain-sync"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        let recovered = self.sync.recover_resolve_tasks().await?;
        if recovered > 0 {
            info!(count = recovered, "♻️ Resolve tasks re-scheduled");
        }
        self.tasks.extend(self.sync.spawn_watchers(&token)).await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.tasks.join(self.name()).await;
        Ok(())
    }
}

/// HTTP endpoint for `/health` and `/metrics`.
pub struct MetricsService {
    metrics: Arc<RuntimeMetrics>,
    addr: SocketAddr,
    tasks: TaskSet,
}

impl MetricsService {
    pub fn new(metrics: Arc<RuntimeMetrics>, addr: SocketAddr) -> Self {
        Self {
            metrics,
            addr,
            tasks: TaskSet::default(),
        }
    }
}

#[async_trait]
impl Service for MetricsService {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("cannot bind metrics endpoint on {}", self.addr))?;
        let metrics = self.metrics.clone();
        self.tasks
            .push(tokio::spawn(async move {
                if let Err(e) = crate::metrics_server::serve(listener, metrics, token).await {
                    error!(error = %e, "❌ Metrics endpoint failed");
                }
            }))
            .await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.tasks.join(self.name()).await;
        Ok(())
    }
}
