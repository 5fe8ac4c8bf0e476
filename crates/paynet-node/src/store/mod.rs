//! Transactional key-value storage contract and backends.
//!
//! Every multi-key mutation in the node runs inside [`KvStore::transaction`]:
//! reads observe the state as of transaction start, writes buffer into one
//! atomic batch that is applied durably on success and discarded entirely on
//! error. Transactions are serialized globally, which is what makes the
//! read-modify-write cycles of the repository safe without row locks.

mod memory;
mod repo;
mod sled_store;
mod task;

pub use memory::MemoryStore;
pub use repo::{PaymentsDb, SCHEMA_VERSION};
pub use sled_store::SledStore;
pub use task::{Task, TASK_LEASE_NANOS};

use thiserror::Error;

use crate::error::NodeError;

/// Storage errors. `NotFound` is a sentinel distinct from IO failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("io: {0}")]
    Io(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),
}

/// Uniform access surface: the live store outside a transaction, the
/// buffered batch view inside one. Repository operations take an executor so
/// they compose into a caller's transaction without nesting.
pub trait KvExecutor {
    /// Read a value; [`StoreError::NotFound`] when the key is absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;

    fn has(&self, key: &[u8]) -> Result<bool, StoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Visit `(key, value)` pairs under `prefix` in byte order (reverse order
    /// when `forward` is false). The visitor returns `false` to stop early.
    fn scan_prefix(
        &self,
        prefix: &[u8],
        forward: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError>;
}

/// A durable ordered byte-key store with serialized transactions.
pub trait KvStore: Send + Sync + 'static {
    /// Autocommit executor: every write is applied and made durable
    /// immediately.
    fn executor(&self) -> Box<dyn KvExecutor + '_>;

    /// Run `f` against a consistent snapshot, applying its writes atomically
    /// and durably if it returns `Ok`. Reads inside the transaction see the
    /// pre-transaction state.
    fn transaction<T>(
        &self,
        f: impl FnOnce(&dyn KvExecutor) -> Result<T, NodeError>,
    ) -> Result<T, NodeError>
    where
        Self: Sized;
}

/// Collect key/value pairs under a prefix. Convenience for small scans.
pub(crate) fn collect_prefix(
    exec: &dyn KvExecutor,
    prefix: &[u8],
    forward: bool,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
    let mut out = Vec::new();
    exec.scan_prefix(prefix, forward, &mut |key, value| {
        out.push((key.to_vec(), value.to_vec()));
        Ok(true)
    })?;
    Ok(out)
}
