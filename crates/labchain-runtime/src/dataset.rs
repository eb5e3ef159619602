//! Versioned, reference-counted dataset directories.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/current -> 20250101_120000        published dynamic version
//! <root>/20250101_120000/<dataset>.csv     dynamic export
//! <root>/static_<id>_<hash8>/<name>.csv    decrypted static dataset
//! ```
//!
//! A version directory is only deleted by [`DatasetVersionCache::cleanup`],
//! and only when its count is zero and it is not the published version.

use crate::error::{Result, RuntimeError};
use crate::metrics::RuntimeMetrics;
use chrono::Utc;
use labchain_crypto::{KeyContext, KeyVault};
use labchain_storage::{ContentStore, StorageBackend};
use labchain_types::{is_static_dataset, StaticDataset, TestResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CURRENT_LINK: &str = "current";
pub const DATASET_SUFFIX: &str = ".csv";

const TMP_LINK_PREFIX: &str = ".tmp_current_";

pub const EXPORT_HEADER: [&str; 10] = [
    "id",
    "test_report_id",
    "category",
    "name",
    "definition",
    "result",
    "reference_range",
    "explanation",
    "status",
    "suggestions",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub storage_root: PathBuf,
    pub export_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data/datasets"),
            export_interval_secs: 15 * 60,
            cleanup_interval_secs: 60 * 60,
        }
    }
}

/// Reference counts per version.
#[derive(Debug, Default)]
pub(crate) struct VersionTable {
    refs: HashMap<String, u64>,
}

impl VersionTable {
    pub(crate) fn acquire(&mut self, version: &str) -> u64 {
        let count = self.refs.entry(version.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrement; never below zero. Unknown versions are reported as `None`.
    pub(crate) fn release(&mut self, version: &str) -> Option<u64> {
        self.refs.get_mut(version).map(|count| {
            *count = count.saturating_sub(1);
            *count
        })
    }

    /// Track `version` at zero if it is not tracked yet.
    pub(crate) fn register(&mut self, version: &str) {
        self.refs.entry(version.to_string()).or_insert(0);
    }

    /// Every unreferenced version except `current`.
    pub(crate) fn reclaimable(&self, current: Option<&str>) -> Vec<String> {
        self.refs
            .iter()
            .filter(|(version, count)| **count == 0 && Some(version.as_str()) != current)
            .map(|(version, _)| version.clone())
            .collect()
    }

    /// Stop tracking `version`. Only unreferenced versions can be forgotten.
    pub(crate) fn forget(&mut self, version: &str) -> bool {
        if self.refs.get(version) == Some(&0) {
            self.refs.remove(version);
            true
        } else {
            false
        }
    }

    pub(crate) fn get(&self, version: &str) -> Option<u64> {
        self.refs.get(version).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.refs.len()
    }
}

pub struct DatasetVersionCache {
    config: DatasetConfig,
    storage: Arc<dyn StorageBackend>,
    store: Arc<dyn ContentStore>,
    vault: Arc<KeyVault>,
    metrics: Arc<RuntimeMetrics>,
    table: Mutex<VersionTable>,
    fetches: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl DatasetVersionCache {
    pub fn new(
        config: DatasetConfig,
        storage: Arc<dyn StorageBackend>,
        store: Arc<dyn ContentStore>,
        vault: Arc<KeyVault>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            config,
            storage,
            store,
            vault,
            metrics,
            table: Mutex::new(VersionTable::default()),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.storage_root
    }

    /// Create the storage root and track version directories already on disk.
    pub async fn init(&self) -> Result<()> {
        let root = self.root();
        tokio::fs::create_dir_all(root).await?;

        let mut table = self.table.lock().await;
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;
            if name.starts_with(TMP_LINK_PREFIX) {
                debug!(link = %name, "Removing stale pointer");
                tokio::fs::remove_file(entry.path()).await?;
            } else if file_type.is_dir() && !name.starts_with('.') {
                table.register(&name);
            }
        }
        self.metrics.dataset_versions.set(table.len() as i64);
        info!(root = %root.display(), versions = table.len(), "🗂️ Dataset cache ready");
        Ok(())
    }

    /// Pin the version a new run should read and return its directory.
    pub async fn acquire_current(&self, dataset: &str) -> Result<(PathBuf, String)> {
        if is_static_dataset(dataset) {
            return self.acquire_static(dataset).await;
        }

        let mut table = self.table.lock().await;
        let version = self.published_version().await.ok_or_else(|| {
            RuntimeError::Dataset(format!("no published version for dataset {}", dataset))
        })?;
        let count = table.acquire(&version);
        self.metrics.dataset_versions.set(table.len() as i64);
        debug!(dataset, version = %version, refs = count, "📌 Acquired dataset version");
        Ok((self.root().join(&version), version))
    }

    pub async fn release(&self, dataset: &str, version: &str) {
        let mut table = self.table.lock().await;
        match table.release(version) {
            Some(count) => debug!(dataset, version, refs = count, "Released dataset version"),
            None => warn!(dataset, version, "Release of untracked dataset version"),
        }
    }

    async fn acquire_static(&self, dataset: &str) -> Result<(PathBuf, String)> {
        let record = self.storage.get_static_dataset_by_name(dataset).await?;
        let version = record.version_key();
        let dir = self.root().join(&version);
        let file = dir.join(format!("{}{}", record.name, DATASET_SUFFIX));

        // A sweep can land between the fetch and the pin; one refetch covers it.
        for _ in 0..2 {
            let cell = self
                .fetches
                .lock()
                .await
                .entry(version.clone())
                .or_default()
                .clone();
            cell.get_or_try_init(|| self.fetch_static(&record, &dir, &file))
                .await?;

            let mut table = self.table.lock().await;
            if tokio::fs::try_exists(&file).await? {
                let count = table.acquire(&version);
                self.metrics.dataset_versions.set(table.len() as i64);
                debug!(dataset, version = %version, refs = count, "📌 Acquired static dataset");
                return Ok((dir, version));
            }
            self.fetches.lock().await.remove(&version);
        }
        Err(RuntimeError::Dataset(format!(
            "static dataset {} vanished while being acquired",
            dataset
        )))
    }

    async fn fetch_static(&self, record: &StaticDataset, dir: &Path, file: &Path) -> Result<()> {
        if tokio::fs::try_exists(file).await? {
            debug!(path = %file.display(), "Static dataset already cached");
            return Ok(());
        }

        info!(dataset = %record.name, cid = %record.cid, "⬇️ Fetching static dataset");
        let key = self
            .vault
            .derive_symmetric_key(&KeyContext::static_dataset(record.author.clone()))
            .await?;
        let plaintext = self.store.download_decrypted(&record.cid, &key).await?;

        tokio::fs::create_dir_all(dir).await?;
        let partial = file.with_extension("partial");
        tokio::fs::write(&partial, &plaintext).await?;
        tokio::fs::rename(&partial, file).await?;
        info!(path = %file.display(), bytes = plaintext.len(), "✅ Static dataset cached");
        Ok(())
    }

    /// Write a fresh dynamic snapshot and publish it as `current`.
    pub async fn export(&self) -> Result<String> {
        let root = self.root().to_path_buf();
        let base = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut version = base.clone();
        let mut suffix = 1;
        while tokio::fs::try_exists(root.join(&version)).await? {
            version = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        let dir = root.join(&version);
        tokio::fs::create_dir_all(&dir).await?;

        let datasets = self.storage.list_dynamic_datasets().await?;
        let mut rows_total = 0;
        for dataset in &datasets {
            let rows = self.storage.list_test_results(&dataset.name).await?;
            rows_total += rows.len();
            let csv = render_csv(&rows)?;
            let path = dir.join(format!("{}{}", dataset.name, DATASET_SUFFIX));
            tokio::fs::write(&path, csv).await?;
        }

        let mut table = self.table.lock().await;
        table.register(&version);
        self.publish(&version).await?;
        self.metrics.dataset_versions.set(table.len() as i64);
        info!(
            version = %version,
            datasets = datasets.len(),
            rows = rows_total,
            "📤 Dataset export published"
        );
        Ok(version)
    }

    /// Repoint `current` at `version` through a temporary link and rename.
    async fn publish(&self, version: &str) -> Result<()> {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let tmp = self.root().join(format!("{}{}", TMP_LINK_PREFIX, nanos));
        tokio::fs::symlink(version, &tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.root().join(CURRENT_LINK)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn published_version(&self) -> Option<String> {
        let target = tokio::fs::read_link(self.root().join(CURRENT_LINK))
            .await
            .ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    pub async fn current_version(&self) -> Option<String> {
        let _table = self.table.lock().await;
        self.published_version().await
    }

    /// Delete unreferenced versions other than the published one.
    ///
    /// A version stays tracked until its directory is gone, so one that
    /// fails to delete is retried on the next sweep.
    pub async fn cleanup(&self) -> Result<Vec<String>> {
        let mut table = self.table.lock().await;
        let current = self.published_version().await;

        let mut removed = Vec::new();
        for version in table.reclaimable(current.as_deref()) {
            let dir = self.root().join(&version);
            if let Err(e) = remove_version_dir(&dir).await {
                warn!(version = %version, error = %e, "Failed to remove dataset version, will retry");
                continue;
            }
            info!(version = %version, "🧹 Removed unused dataset version");
            table.forget(&version);
            removed.push(version);
        }
        if !removed.is_empty() {
            let mut fetches = self.fetches.lock().await;
            for version in &removed {
                fetches.remove(version);
            }
        }
        self.metrics.dataset_versions.set(table.len() as i64);
        Ok(removed)
    }

    /// Current reference count of `version`, if tracked.
    pub async fn refcount(&self, version: &str) -> Option<u64> {
        self.table.lock().await.get(version)
    }

    /// Initial export, then periodic export and cleanup until cancelled.
    pub async fn run_lifecycle(self: Arc<Self>, token: CancellationToken) {
        if let Err(e) = self.export().await {
            error!(error = %e, "Initial dataset export failed");
        }

        let export_every = Duration::from_secs(self.config.export_interval_secs.max(1));
        let cleanup_every = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        let start = tokio::time::Instant::now();
        let mut export_tick = tokio::time::interval_at(start + export_every, export_every);
        let mut cleanup_tick = tokio::time::interval_at(start + cleanup_every, cleanup_every);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Stopping dataset lifecycle");
                    return;
                }
                _ = export_tick.tick() => {
                    if let Err(e) = self.export().await {
                        error!(error = %e, "Dataset export failed");
                    }
                }
                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!(error = %e, "Dataset cleanup failed");
                    }
                }
            }
        }
    }
}

async fn remove_version_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn render_csv(rows: &[TestResult]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(EXPORT_HEADER)?;
    for row in rows {
        writer.write_record([
            row.id.to_string().as_str(),
            row.test_report_id.to_string().as_str(),
            row.category.as_str(),
            row.name.as_str(),
            row.definition.as_str(),
            row.result.as_str(),
            row.reference_range.as_str(),
            row.explanation.as_str(),
            row.status.as_str(),
            row.suggestions.as_deref().unwrap_or_default(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| RuntimeError::Dataset(format!("failed to flush export: {}", e)))
}
