//! Cryptographic helpers for the labchain orchestrator.
//!
//! - [`cipher`]: AES-256-GCM sealing of dataset payloads (nonce-prefixed)
//! - [`key_context`]: the (kind, name, purpose) triple every derived key is bound to
//! - [`vault`]: cached symmetric-key and account derivation on top of a [`KeyDeriver`]

pub mod cipher;
pub mod error;
pub mod key_context;
pub mod vault;

pub use cipher::{PayloadCipher, KEY_SIZE, NONCE_SIZE};
pub use error::{CryptoError, Result};
pub use key_context::{KeyContext, KeyKind, PURPOSE_STATIC_DATASET};
pub use vault::{ChainAccount, KeyDeriver, KeyVault, LocalKeyDeriver};
