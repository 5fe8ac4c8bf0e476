//! Sled-backed store: the production persistence backend.
//!
//! Transactions follow the same recipe the contract demands: a global lock
//! serializes them, reads go to the tree (no concurrent writer can exist),
//! writes buffer into a [`sled::Batch`] applied atomically and flushed to
//! disk before the transaction returns.

use std::cell::RefCell;
use std::path::Path;
use std::sync::Mutex;

use crate::error::NodeError;
use crate::store::{KvExecutor, KvStore, StoreError};

pub struct SledStore {
    db: sled::Db,
    tx_lock: Mutex<()>,
}

impl SledStore {
    /// Open or create a database at `path`. The boolean reports whether the
    /// database did not exist before.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, bool), StoreError> {
        let is_new = !path.as_ref().exists();
        let db = sled::open(path).map_err(io_err)?;
        Ok((
            Self {
                db,
                tx_lock: Mutex::new(()),
            },
            is_new,
        ))
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(io_err)?;
        Ok(())
    }
}

fn io_err(err: sled::Error) -> StoreError {
    StoreError::Io(err.to_string())
}

fn tree_get(db: &sled::Db, key: &[u8]) -> Result<Vec<u8>, StoreError> {
    match db.get(key).map_err(io_err)? {
        Some(value) => Ok(value.to_vec()),
        None => Err(StoreError::NotFound),
    }
}

fn tree_scan(
    db: &sled::Db,
    prefix: &[u8],
    forward: bool,
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool, StoreError>,
) -> Result<(), StoreError> {
    let iter = db.scan_prefix(prefix);
    if forward {
        for item in iter {
            let (key, value) = item.map_err(io_err)?;
            if !visit(&key, &value)? {
                break;
            }
        }
    } else {
        for item in iter.rev() {
            let (key, value) = item.map_err(io_err)?;
            if !visit(&key, &value)? {
                break;
            }
        }
    }
    Ok(())
}

struct Autocommit<'a> {
    store: &'a SledStore,
}

impl KvExecutor for Autocommit<'_> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        tree_get(&self.store.db, key)
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.store.db.contains_key(key).map_err(io_err)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.store.db.insert(key, value).map_err(io_err)?;
        self.store.flush()
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.store.db.remove(key).map_err(io_err)?;
        self.store.flush()
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        forward: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError> {
        tree_scan(&self.store.db, prefix, forward, visit)
    }
}

struct TxExecutor<'a> {
    store: &'a SledStore,
    batch: RefCell<sled::Batch>,
}

impl KvExecutor for TxExecutor<'_> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        // The transaction lock keeps writers out, so the tree is the
        // pre-transaction snapshot; buffered writes stay invisible.
        tree_get(&self.store.db, key)
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.store.db.contains_key(key).map_err(io_err)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.batch.borrow_mut().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.batch.borrow_mut().remove(key);
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        forward: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError> {
        tree_scan(&self.store.db, prefix, forward, visit)
    }
}

impl KvStore for SledStore {
    fn executor(&self) -> Box<dyn KvExecutor + '_> {
        Box::new(Autocommit { store: self })
    }

    fn transaction<T>(
        &self,
        f: impl FnOnce(&dyn KvExecutor) -> Result<T, NodeError>,
    ) -> Result<T, NodeError> {
        let _serialized = self.tx_lock.lock().expect("tx lock");
        let exec = TxExecutor {
            store: self,
            batch: RefCell::new(sled::Batch::default()),
        };
        let result = f(&exec)?;
        self.db.apply_batch(exec.batch.into_inner()).map_err(io_err)?;
        self.flush()?;
        Ok(result)
    }
}
