pub mod backend;
pub mod cas;
pub mod memory;
pub mod snapshot;

pub use backend::{
    NewStaticDataset, NewTestResult, Result, StorageBackend, StorageError, StorageTransaction,
};
pub use cas::{compute_cid, ByteStream, ContentStore, FsContentStore, MemoryContentStore};
pub use memory::MemoryBackend;
pub use snapshot::{Snapshot, SnapshotFile};
