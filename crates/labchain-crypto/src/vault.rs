use crate::error::{CryptoError, Result};
use crate::key_context::KeyContext;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const SYMMETRIC_KEY_CONTEXT: &str = "labchain vault 2024-06 symmetric key";

/// Source of raw key material for a context.
///
/// Production deployments back this with an enclave key service; the
/// local implementation derives from a master secret on disk.
#[async_trait]
pub trait KeyDeriver: Send + Sync {
    async fn derive_raw(&self, ctx: &KeyContext) -> Result<Vec<u8>>;
}

/// Derives raw material as `blake3_keyed(master, path | purpose)`.
pub struct LocalKeyDeriver {
    master: [u8; 32],
}

impl LocalKeyDeriver {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    pub fn generate() -> Self {
        let mut master = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut master);
        Self { master }
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| CryptoError::DerivationFailed(format!("invalid master secret: {}", e)))?;
        let master: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeySize {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self { master })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CryptoError::DerivationFailed(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_hex(&content)
    }

    pub fn master_hex(&self) -> String {
        hex::encode(self.master)
    }
}

#[async_trait]
impl KeyDeriver for LocalKeyDeriver {
    async fn derive_raw(&self, ctx: &KeyContext) -> Result<Vec<u8>> {
        let mut hasher = blake3::Hasher::new_keyed(&self.master);
        hasher.update(ctx.path().as_bytes());
        hasher.update(b"|");
        hasher.update(ctx.purpose().as_bytes());
        Ok(hasher.finalize().as_bytes().to_vec())
    }
}

/// A signing identity used for on-chain calls.
#[derive(Clone)]
pub struct ChainAccount {
    signing_key: SigningKey,
    address: String,
}

impl ChainAccount {
    fn from_raw(raw: &[u8]) -> Self {
        let seed: [u8; 32] = match raw.try_into() {
            Ok(seed) => seed,
            Err(_) => *blake3::hash(raw).as_bytes(),
        };
        let signing_key = SigningKey::from_bytes(&seed);
        let digest = blake3::hash(signing_key.verifying_key().as_bytes());
        let address = format!("0x{}", hex::encode(&digest.as_bytes()[12..]));
        Self {
            signing_key,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for ChainAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainAccount")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Process-scoped key cache in front of a [`KeyDeriver`].
pub struct KeyVault {
    deriver: Arc<dyn KeyDeriver>,
    symmetric_cache: RwLock<HashMap<String, [u8; 32]>>,
    account_cache: RwLock<HashMap<String, ChainAccount>>,
}

impl KeyVault {
    pub fn new(deriver: Arc<dyn KeyDeriver>) -> Self {
        Self {
            deriver,
            symmetric_cache: RwLock::new(HashMap::new()),
            account_cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn derive_symmetric_key(&self, ctx: &KeyContext) -> Result<[u8; 32]> {
        let cache_key = ctx.cache_key();
        if let Some(key) = self.symmetric_cache.read().await.get(&cache_key) {
            return Ok(*key);
        }

        let raw = self.deriver.derive_raw(ctx).await?;
        let mut material = Vec::with_capacity(raw.len() + 128);
        material.extend_from_slice(&ctx.salt());
        material.extend_from_slice(&ctx.info());
        material.extend_from_slice(&raw);
        let key = blake3::derive_key(SYMMETRIC_KEY_CONTEXT, &material);

        debug!(cache_key = %cache_key, "🔐 Derived symmetric key");
        self.symmetric_cache.write().await.insert(cache_key, key);
        Ok(key)
    }

    pub async fn derive_account(&self, ctx: &KeyContext) -> Result<ChainAccount> {
        let cache_key = ctx.cache_key();
        if let Some(account) = self.account_cache.read().await.get(&cache_key) {
            return Ok(account.clone());
        }

        let raw = self.deriver.derive_raw(ctx).await?;
        let account = ChainAccount::from_raw(&raw);

        debug!(cache_key = %cache_key, address = %account.address(), "🔐 Derived chain account");
        self.account_cache
            .write()
            .await
            .insert(cache_key, account.clone());
        Ok(account)
    }
}
