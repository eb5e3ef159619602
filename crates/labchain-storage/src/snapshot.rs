use crate::backend::{Result, StorageError};
use crate::memory::Tables;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Next record id to allocate after restore.
    pub next_id: u64,
    pub execution_count: usize,
    pub transaction_count: usize,
    /// Hex blake3 digest of the serialized tables.
    pub hash: String,
}

/// Full copy of the backend tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub tables: Tables,
}

impl Snapshot {
    pub fn new(tables: Tables, next_id: u64) -> Self {
        let hash = Self::calculate_hash(&tables);
        let metadata = SnapshotMetadata {
            version: SNAPSHOT_VERSION,
            created_at: chrono::Utc::now(),
            next_id,
            execution_count: tables.executions.len(),
            transaction_count: tables.transactions.len(),
            hash,
        };
        Self { metadata, tables }
    }

    fn calculate_hash(tables: &Tables) -> String {
        // Serializing plain maps of owned data cannot fail.
        let bytes = serde_json::to_vec(tables).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    pub fn verify(&self) -> bool {
        Self::calculate_hash(&self.tables) == self.metadata.hash
    }
}

/// A snapshot location on disk. Writes go to a sibling temp file first.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<Snapshot>> {
        if !fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let data = fs::read(&self.path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&data)?;

        if snapshot.metadata.version != SNAPSHOT_VERSION {
            return Err(StorageError::SerializationError(format!(
                "unsupported snapshot version {}",
                snapshot.metadata.version
            )));
        }
        if !snapshot.verify() {
            return Err(StorageError::BackendError(
                "Snapshot verification failed".into(),
            ));
        }
        Ok(Some(snapshot))
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
