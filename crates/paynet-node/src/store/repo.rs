//! Channel repository: persisted records atop the KV contract.
//!
//! Key namespaces, ordered so prefix iteration yields natural order:
//!
//! | prefix | contents |
//! |---|---|
//! | `ch:<address>` | channel blob (JSON, sides as base64 bags-of-cells) |
//! | `vc:<pubkey>` | virtual-channel meta |
//! | `hist:<channel>:<unix-nanos BE>` | history entry |
//! | `tv:<task-id>` | task body |
//! | `ti:<pool>:<ready-at BE>:<queue>` | task order index → `tv:` key |
//! | `bo:` | last scanned ledger offset |
//! | `mv:` | schema version |

use std::sync::Arc;

use crate::clock;
use crate::error::NodeError;
use crate::store::{collect_prefix, KvExecutor, KvStore, StoreError};
use crate::types::{Channel, ChannelHistoryItem, ChannelStatus, VirtualChannelMeta};

/// Current schema version; one entry per migration ever shipped.
pub const SCHEMA_VERSION: u32 = 1;

const CHANNEL_PREFIX: &[u8] = b"ch:";
const VIRTUAL_PREFIX: &[u8] = b"vc:";
const HISTORY_PREFIX: &[u8] = b"hist:";
const BLOCK_OFFSET_KEY: &[u8] = b"bo:";
const SCHEMA_KEY: &[u8] = b"mv:";

/// Repository over a [`KvStore`]. Operations take a [`KvExecutor`] so a
/// caller can compose several of them into one transaction.
pub struct PaymentsDb<S: KvStore> {
    store: Arc<S>,
}

impl<S: KvStore> PaymentsDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run `f` in one store transaction.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&dyn KvExecutor) -> Result<T, NodeError>,
    ) -> Result<T, NodeError> {
        self.store.transaction(f)
    }

    fn channel_key(address: &str) -> Vec<u8> {
        [CHANNEL_PREFIX, address.as_bytes()].concat()
    }

    fn virtual_key(key: &[u8; 32]) -> Vec<u8> {
        [VIRTUAL_PREFIX, key.as_slice()].concat()
    }

    fn history_key(address: &str, at_nanos: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(HISTORY_PREFIX.len() + address.len() + 9);
        key.extend_from_slice(HISTORY_PREFIX);
        key.extend_from_slice(address.as_bytes());
        key.push(b':');
        key.extend_from_slice(&(at_nanos as u64).to_be_bytes());
        key
    }

    pub fn get_channel(&self, exec: &dyn KvExecutor, address: &str) -> Result<Channel, NodeError> {
        let raw = match exec.get(&Self::channel_key(address)) {
            Ok(raw) => raw,
            Err(StoreError::NotFound) => return Err(NodeError::NotFound),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Persist a channel, requiring the on-disk version to be unchanged
    /// since this copy was loaded. Bumps `db_version` on success.
    pub fn put_channel(&self, exec: &dyn KvExecutor, channel: &mut Channel) -> Result<(), NodeError> {
        match self.get_channel(exec, &channel.address) {
            Ok(existing) => {
                if existing.db_version != channel.db_version {
                    return Err(NodeError::ChannelBusy);
                }
            }
            Err(NodeError::NotFound) => {}
            Err(err) => return Err(err),
        }
        channel.db_version += 1;
        let raw = serde_json::to_vec(channel)?;
        exec.put(&Self::channel_key(&channel.address), &raw)?;
        Ok(())
    }

    /// Drop a channel record. Only legal once the contract reached its
    /// final settled state.
    pub fn delete_channel(&self, exec: &dyn KvExecutor, address: &str) -> Result<(), NodeError> {
        exec.delete(&Self::channel_key(address))?;
        Ok(())
    }

    /// All channels, optionally filtered by status.
    pub fn list_channels(
        &self,
        exec: &dyn KvExecutor,
        status: Option<ChannelStatus>,
    ) -> Result<Vec<Channel>, NodeError> {
        let mut channels = Vec::new();
        for (_, raw) in collect_prefix(exec, CHANNEL_PREFIX, true)? {
            let channel: Channel = serde_json::from_slice(&raw)?;
            if status.map_or(true, |wanted| channel.status == wanted) {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    pub fn get_virtual_meta(
        &self,
        exec: &dyn KvExecutor,
        key: &[u8; 32],
    ) -> Result<VirtualChannelMeta, NodeError> {
        let raw = match exec.get(&Self::virtual_key(key)) {
            Ok(raw) => raw,
            Err(StoreError::NotFound) => return Err(NodeError::NotFound),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn put_virtual_meta(
        &self,
        exec: &dyn KvExecutor,
        meta: &VirtualChannelMeta,
    ) -> Result<(), NodeError> {
        let raw = serde_json::to_vec(meta)?;
        exec.put(&Self::virtual_key(&meta.key), &raw)?;
        Ok(())
    }

    /// Load, mutate and store a virtual-channel meta, creating it with
    /// `create` when absent.
    pub fn create_or_update_virtual_meta(
        &self,
        exec: &dyn KvExecutor,
        key: &[u8; 32],
        create: impl FnOnce() -> VirtualChannelMeta,
        update: impl FnOnce(&mut VirtualChannelMeta) -> Result<(), NodeError>,
    ) -> Result<VirtualChannelMeta, NodeError> {
        let mut meta = match self.get_virtual_meta(exec, key) {
            Ok(meta) => meta,
            Err(NodeError::NotFound) => create(),
            Err(err) => return Err(err),
        };
        update(&mut meta)?;
        self.put_virtual_meta(exec, &meta)?;
        Ok(meta)
    }

    pub fn add_history(
        &self,
        exec: &dyn KvExecutor,
        address: &str,
        item: &ChannelHistoryItem,
    ) -> Result<(), NodeError> {
        let raw = serde_json::to_vec(item)?;
        exec.put(&Self::history_key(address, item.at), &raw)?;
        Ok(())
    }

    /// History entries for a channel, newest first.
    pub fn list_history(
        &self,
        exec: &dyn KvExecutor,
        address: &str,
        limit: usize,
    ) -> Result<Vec<ChannelHistoryItem>, NodeError> {
        let mut prefix = Vec::with_capacity(HISTORY_PREFIX.len() + address.len() + 1);
        prefix.extend_from_slice(HISTORY_PREFIX);
        prefix.extend_from_slice(address.as_bytes());
        prefix.push(b':');

        let mut items = Vec::new();
        let mut scan_err = None;
        exec.scan_prefix(&prefix, false, &mut |_, raw| {
            match serde_json::from_slice(raw) {
                Ok(item) => items.push(item),
                Err(err) => {
                    scan_err = Some(err);
                    return Ok(false);
                }
            }
            Ok(items.len() < limit)
        })?;
        match scan_err {
            Some(err) => Err(err.into()),
            None => Ok(items),
        }
    }

    pub fn set_block_offset(&self, exec: &dyn KvExecutor, seqno: u64) -> Result<(), NodeError> {
        exec.put(BLOCK_OFFSET_KEY, &seqno.to_be_bytes())?;
        Ok(())
    }

    pub fn get_block_offset(&self, exec: &dyn KvExecutor) -> Result<Option<u64>, NodeError> {
        match exec.get(BLOCK_OFFSET_KEY) {
            Ok(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupted("block offset width".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            Err(StoreError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Apply pending schema migrations inside one transaction. The registry
    /// is append-only; entry `i` migrates version `i` to `i + 1`.
    pub fn migrate(&self) -> Result<(), NodeError> {
        let migrations: [fn(&dyn KvExecutor) -> Result<(), NodeError>; SCHEMA_VERSION as usize] =
            [|_| Ok(())];

        self.transaction(|exec| {
            let current = match exec.get(SCHEMA_KEY) {
                Ok(raw) => {
                    let bytes: [u8; 4] = raw
                        .as_slice()
                        .try_into()
                        .map_err(|_| StoreError::Corrupted("schema version width".into()))?;
                    u32::from_be_bytes(bytes)
                }
                Err(StoreError::NotFound) => 0,
                Err(err) => return Err(err.into()),
            };
            if current > SCHEMA_VERSION {
                return Err(NodeError::ProtocolViolation(format!(
                    "database schema {current} is newer than supported {SCHEMA_VERSION}"
                )));
            }
            for migration in migrations.iter().skip(current as usize) {
                migration(exec)?;
            }
            exec.put(SCHEMA_KEY, &SCHEMA_VERSION.to_be_bytes())?;
            Ok(())
        })
    }
}

/// Build a fresh history item stamped now.
pub fn history_now(event: crate::types::ChannelHistoryEvent) -> ChannelHistoryItem {
    ChannelHistoryItem {
        at: clock::now_unix_nanos(),
        event,
    }
}
