//! Content-addressed blob storage.
//!
//! Blobs are stored under their CID and verified against it on retrieval,
//! so corruption in the underlying store surfaces as an error instead of
//! bad bytes.

use crate::backend::{Result, StorageError};
use async_trait::async_trait;
use labchain_crypto::PayloadCipher;
use labchain_types::Cid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;
use tracing::debug;

/// Readable byte stream handed across the store boundary.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

const CID_DIGEST_BYTES: usize = 22;

/// `Qm` followed by the hex of the first 22 bytes of the blake3 digest.
pub fn compute_cid(data: &[u8]) -> Cid {
    let digest = blake3::hash(data);
    format!("Qm{}", hex::encode(&digest.as_bytes()[..CID_DIGEST_BYTES]))
}

fn crypto_err(e: labchain_crypto::CryptoError) -> StorageError {
    StorageError::BackendError(e.to_string())
}

async fn read_all(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await?;
    Ok(data)
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store raw bytes. Implementations only need this and [`ContentStore::get`].
    async fn put(&self, cid: &Cid, data: Vec<u8>) -> Result<()>;

    async fn get(&self, cid: &str) -> Result<Option<Vec<u8>>>;

    async fn upload(&self, data: &[u8]) -> Result<Cid> {
        let cid = compute_cid(data);
        self.put(&cid, data.to_vec()).await?;
        debug!(cid = %cid, bytes = data.len(), "📦 Stored blob");
        Ok(cid)
    }

    async fn upload_stream(&self, stream: ByteStream) -> Result<Cid> {
        let data = read_all(stream).await?;
        self.upload(&data).await
    }

    async fn upload_encrypted(&self, data: &[u8], key: &[u8]) -> Result<Cid> {
        let sealed = PayloadCipher::new().encrypt(data, key).map_err(crypto_err)?;
        self.upload(&sealed).await
    }

    async fn upload_encrypted_stream(&self, stream: ByteStream, key: &[u8]) -> Result<Cid> {
        let data = read_all(stream).await?;
        self.upload_encrypted(&data, key).await
    }

    async fn download(&self, cid: &str) -> Result<Vec<u8>> {
        let data = self
            .get(cid)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("blob {}", cid)))?;
        if compute_cid(&data) != cid {
            return Err(StorageError::BackendError(format!(
                "blob {} failed content verification",
                cid
            )));
        }
        Ok(data)
    }

    async fn download_stream(&self, cid: &str) -> Result<ByteStream> {
        let data = self.download(cid).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn download_decrypted(&self, cid: &str, key: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.download(cid).await?;
        PayloadCipher::new().decrypt(&sealed, key).map_err(crypto_err)
    }

    async fn download_decrypted_stream(&self, cid: &str, key: &[u8]) -> Result<ByteStream> {
        let data = self.download_decrypted(cid, key).await?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }
}

#[derive(Clone, Default)]
pub struct MemoryContentStore {
    blobs: Arc<RwLock<HashMap<Cid, Vec<u8>>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Overwrite a stored blob in place. Used to exercise verification.
    pub async fn corrupt(&self, cid: &str, data: Vec<u8>) {
        self.blobs.write().await.insert(cid.to_string(), data);
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, cid: &Cid, data: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(cid.clone(), data);
        Ok(())
    }

    async fn get(&self, cid: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(cid).cloned())
    }
}

/// Blobs stored as files named by CID under a root directory.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, cid: &str) -> Result<PathBuf> {
        if cid.is_empty() || !cid.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StorageError::InvalidState(format!("malformed cid {:?}", cid)));
        }
        Ok(self.root.join(cid))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, cid: &Cid, data: Vec<u8>) -> Result<()> {
        let path = self.blob_path(cid)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, cid: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(cid)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
