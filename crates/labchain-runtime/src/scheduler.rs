//! Bounded task queue with a single dispatch loop.
//!
//! The dispatch loop never waits: every task is handed to its own spawned
//! future at once. RUN futures then take a permit from a fixed-size pool and
//! hold it for their whole pipeline, which caps concurrent container builds
//! and runs. RESOLVE tasks are timed waits and do not take a permit.

use crate::error::{Result, RuntimeError};
use crate::metrics::RuntimeMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labchain_types::{Cid, RecordId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub max_concurrent_tasks: usize,
    /// Extra wait after a vote window closes before resolving.
    pub resolve_grace_secs: u64,
    /// Resolve reviews whose window closed while the node was down.
    pub resolve_elapsed_on_recovery: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            max_concurrent_tasks: 4,
            resolve_grace_secs: 60,
            resolve_elapsed_on_recovery: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerTask {
    Run {
        execution_id: RecordId,
    },
    Resolve {
        execution_id: RecordId,
        cid: Cid,
        resolve_at: DateTime<Utc>,
    },
}

impl SchedulerTask {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Resolve { .. } => "resolve",
        }
    }

    pub fn execution_id(&self) -> RecordId {
        match self {
            Self::Run { execution_id } | Self::Resolve { execution_id, .. } => *execution_id,
        }
    }
}

/// Receives dispatched tasks.
#[async_trait]
pub trait SchedulerHandler: Send + Sync {
    async fn on_run(&self, token: CancellationToken, execution_id: RecordId);

    async fn on_resolve(
        &self,
        token: CancellationToken,
        execution_id: RecordId,
        cid: Cid,
        resolve_at: DateTime<Utc>,
    );
}

pub struct TaskScheduler {
    tx: mpsc::Sender<SchedulerTask>,
    rx: Mutex<Option<mpsc::Receiver<SchedulerTask>>>,
    handler: RwLock<Option<Arc<dyn SchedulerHandler>>>,
    permits: Arc<Semaphore>,
    metrics: Arc<RuntimeMetrics>,
}

impl TaskScheduler {
    pub fn new(config: &SchedulerConfig, metrics: Arc<RuntimeMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handler: RwLock::new(None),
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            metrics,
        }
    }

    /// Install the task handler. Must happen before [`TaskScheduler::run`].
    pub async fn set_handler(&self, handler: Arc<dyn SchedulerHandler>) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn schedule_run(&self, execution_id: RecordId) -> Result<()> {
        self.enqueue(SchedulerTask::Run { execution_id }).await?;
        info!(execution_id, "📋 Run scheduled");
        Ok(())
    }

    pub async fn schedule_resolve(
        &self,
        execution_id: RecordId,
        cid: &str,
        resolve_at: DateTime<Utc>,
    ) -> Result<()> {
        self.enqueue(SchedulerTask::Resolve {
            execution_id,
            cid: cid.to_string(),
            resolve_at,
        })
        .await?;
        info!(execution_id, cid, resolve_at = %resolve_at, "📋 Resolve scheduled");
        Ok(())
    }

    async fn enqueue(&self, task: SchedulerTask) -> Result<()> {
        let kind = task.kind();
        self.tx
            .send(task)
            .await
            .map_err(|_| RuntimeError::SchedulerClosed)?;
        self.metrics.tasks_scheduled.with_label_values(&[kind]).inc();
        Ok(())
    }

    /// Permits currently free in the run pool.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Dispatch loop. Returns once `token` is cancelled; the queue is closed
    /// on the way out so later schedule calls fail.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or(RuntimeError::SchedulerClosed)?;
        let handler = self
            .handler
            .read()
            .await
            .clone()
            .ok_or(RuntimeError::HandlerNotSet)?;

        info!("🚦 Task scheduler started");
        loop {
            let task = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            debug!(kind = task.kind(), execution_id = task.execution_id(), "Dispatching task");

            match task {
                SchedulerTask::Run { execution_id } => {
                    let handler = handler.clone();
                    let token = token.child_token();
                    let permits = self.permits.clone();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        let _permit = tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                debug!(execution_id, "Run dropped while waiting for a permit");
                                return;
                            }
                            permit = permits.acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => return,
                            },
                        };
                        metrics.tasks_in_flight.inc();
                        handler.on_run(token, execution_id).await;
                        metrics.tasks_in_flight.dec();
                    });
                }
                SchedulerTask::Resolve {
                    execution_id,
                    cid,
                    resolve_at,
                } => {
                    let handler = handler.clone();
                    let token = token.child_token();
                    tokio::spawn(async move {
                        handler.on_resolve(token, execution_id, cid, resolve_at).await;
                    });
                }
            }
        }

        rx.close();
        while let Ok(task) = rx.try_recv() {
            warn!(kind = task.kind(), execution_id = task.execution_id(), "Dropping queued task at shutdown");
        }
        info!("🛑 Task scheduler stopped");
        Ok(())
    }
}
