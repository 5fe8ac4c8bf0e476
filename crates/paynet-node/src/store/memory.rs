//! In-memory store backend for tests and ephemeral nodes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, RwLock};

use crate::error::NodeError;
use crate::store::{KvExecutor, KvStore, StoreError};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// BTreeMap-backed [`KvStore`]. Durability is a no-op; everything else
/// follows the contract, including pre-state reads inside transactions.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<Map>,
    tx_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

fn prefix_range(map: &Map, prefix: &[u8], forward: bool) -> Vec<(Vec<u8>, Vec<u8>)> {
    let range = map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded));
    let mut out: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for (key, value) in range {
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key.clone(), value.clone()));
    }
    if !forward {
        out.reverse();
    }
    out
}

struct Autocommit<'a> {
    store: &'a MemoryStore,
}

impl KvExecutor for Autocommit<'_> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.store
            .map
            .read()
            .expect("store lock")
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.store.map.read().expect("store lock").contains_key(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.store
            .map
            .write()
            .expect("store lock")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.store.map.write().expect("store lock").remove(key);
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        forward: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError> {
        let entries = prefix_range(&self.store.map.read().expect("store lock"), prefix, forward);
        for (key, value) in entries {
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

struct TxExecutor<'a> {
    store: &'a MemoryStore,
    batch: RefCell<Vec<Op>>,
}

impl KvExecutor for TxExecutor<'_> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        // Reads see the pre-transaction state; buffered writes are invisible.
        self.store
            .map
            .read()
            .expect("store lock")
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.store.map.read().expect("store lock").contains_key(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.batch
            .borrow_mut()
            .push(Op::Put(key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.batch.borrow_mut().push(Op::Delete(key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        forward: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError> {
        let entries = prefix_range(&self.store.map.read().expect("store lock"), prefix, forward);
        for (key, value) in entries {
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
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
            batch: RefCell::new(Vec::new()),
        };
        let result = f(&exec)?;

        let mut map = self.map.write().expect("store lock");
        for op in exec.batch.into_inner() {
            match op {
                Op::Put(key, value) => {
                    map.insert(key, value);
                }
                Op::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        Ok(result)
    }
}
