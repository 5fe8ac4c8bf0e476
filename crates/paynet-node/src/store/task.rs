//! Durable task queue persistence.
//!
//! A task lives under `tv:<id>`; an order index entry under
//! `ti:<pool>:<ready-at BE>:<queue>` points back at it. Acquiring walks the
//! index in ready-time order and takes the first runnable task per queue —
//! if a queue's head is locked or not yet ready, the whole queue is skipped,
//! which is what serializes execution within a queue while pools run queues
//! in parallel.

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::NodeError;
use crate::store::{KvExecutor, KvStore, PaymentsDb, StoreError};

/// Lease duration set on acquire: 5 minutes, in nanoseconds.
pub const TASK_LEASE_NANOS: i64 = 5 * 60 * 1_000_000_000;

/// A durable unit of work. All timestamps are unix nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Handler selector.
    pub kind: String,
    /// Serialization domain; one queue never runs two tasks at once.
    pub queue: String,
    /// Serialized handler payload.
    pub data: Vec<u8>,

    pub execute_after: i64,
    pub execute_till: Option<i64>,
    pub locked_till: Option<i64>,
    pub re_execute_after: Option<i64>,
    pub completed_at: Option<i64>,

    pub last_error: String,
    pub attempts: u32,
    pub created_at: i64,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.execute_till.is_some_and(|till| till < now)
    }
}

fn value_key(id: &str) -> Vec<u8> {
    [b"tv:", id.as_bytes()].concat()
}

fn index_prefix(pool: &str) -> Vec<u8> {
    [b"ti:", pool.as_bytes(), b":"].concat()
}

fn index_key(pool: &str, task: &Task) -> Vec<u8> {
    let mut key = index_prefix(pool);
    key.extend_from_slice(&(task.execute_after as u64).to_be_bytes());
    key.extend_from_slice(task.queue.as_bytes());
    key
}

impl<S: KvStore> PaymentsDb<S> {
    /// Create a task. Reinserting an existing id is a no-op success — that is
    /// what makes at-least-once schedulers safe to re-run.
    #[allow(clippy::too_many_arguments)]
    pub fn create_task(
        &self,
        exec: &dyn KvExecutor,
        pool: &str,
        kind: &str,
        queue: &str,
        id: &str,
        data: &impl Serialize,
        execute_after: Option<i64>,
        execute_till: Option<i64>,
    ) -> Result<(), NodeError> {
        let key = value_key(id);
        if exec.has(&key)? {
            return Ok(());
        }

        let now = clock::now_unix_nanos();
        let task = Task {
            id: id.to_string(),
            kind: kind.to_string(),
            queue: queue.to_string(),
            data: serde_json::to_vec(data)?,
            execute_after: execute_after.unwrap_or(now),
            execute_till,
            locked_till: None,
            re_execute_after: None,
            completed_at: None,
            last_error: String::new(),
            attempts: 0,
            created_at: now,
        };

        exec.put(&key, &serde_json::to_vec(&task)?)?;
        exec.put(&index_key(pool, &task), &key)?;
        tracing::debug!(pool, kind, queue, id, "task created");
        Ok(())
    }

    /// Take the earliest runnable task out of the pool and lease it.
    ///
    /// Within each queue only the head is considered; a locked or
    /// not-yet-retryable head blocks the rest of its queue. Tasks past their
    /// `execute_till` are dropped from the index on the way.
    pub fn acquire_task(&self, pool: &str) -> Result<Option<Task>, NodeError> {
        self.transaction(|exec| {
            let prefix = index_prefix(pool);
            let now = clock::now_unix_nanos();

            // Collect ready index entries; the index is ordered by ready
            // time, so stop at the first future entry.
            let mut ready: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            exec.scan_prefix(&prefix, true, &mut |key, value| {
                let at_bytes: [u8; 8] = match key[prefix.len()..].get(..8) {
                    Some(bytes) => bytes.try_into().expect("slice of 8"),
                    None => return Err(StoreError::Corrupted("short task index key".into())),
                };
                if u64::from_be_bytes(at_bytes) as i64 > now {
                    return Ok(false);
                }
                ready.push((key.to_vec(), value.to_vec()));
                Ok(true)
            })?;

            let mut skip_queues: Vec<String> = Vec::new();
            for (idx_key, data_key) in ready {
                let raw = match exec.get(&data_key) {
                    Ok(raw) => raw,
                    // Dangling index entry; drop it and move on.
                    Err(StoreError::NotFound) => {
                        exec.delete(&idx_key)?;
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                let mut task: Task = serde_json::from_slice(&raw)?;

                if skip_queues.contains(&task.queue) {
                    continue;
                }
                // Completed tasks leave the index on completion; tolerate
                // leftovers.
                if task.is_completed() {
                    continue;
                }
                if task.locked_till.is_some_and(|till| till > now) {
                    // In progress elsewhere: hold back the whole queue to
                    // keep its order.
                    skip_queues.push(task.queue.clone());
                    continue;
                }
                if task.re_execute_after.is_some_and(|at| at > now) {
                    skip_queues.push(task.queue.clone());
                    continue;
                }
                if task.is_expired(now) {
                    exec.delete(&idx_key)?;
                    tracing::debug!(id = %task.id, "expired task dropped from index");
                    continue;
                }

                task.locked_till = Some(now + TASK_LEASE_NANOS);
                exec.put(&data_key, &serde_json::to_vec(&task)?)?;
                return Ok(Some(task));
            }
            Ok(None)
        })
    }

    /// Mark a task done and drop it from the order index. The body stays for
    /// observability. Idempotent.
    pub fn complete_task(&self, pool: &str, task: &mut Task) -> Result<(), NodeError> {
        if task.is_completed() {
            return Ok(());
        }
        task.completed_at = Some(clock::now_unix_nanos());
        task.locked_till = None;

        let key = value_key(&task.id);
        let idx_key = index_key(pool, task);
        self.transaction(|exec| {
            if !exec.has(&key)? {
                return Err(NodeError::NotFound);
            }
            exec.put(&key, &serde_json::to_vec(task)?)?;
            exec.delete(&idx_key)?;
            Ok(())
        })
    }

    /// Release a leased task for another attempt at `retry_at`.
    pub fn retry_task(&self, task: &mut Task, reason: &str, retry_at: i64) -> Result<(), NodeError> {
        if task.is_completed() || task.locked_till.is_none() {
            return Ok(());
        }
        task.locked_till = None;
        task.last_error = reason.to_string();
        task.re_execute_after = Some(retry_at);
        task.attempts += 1;

        let key = value_key(&task.id);
        self.transaction(|exec| {
            if !exec.has(&key)? {
                return Err(NodeError::NotFound);
            }
            exec.put(&key, &serde_json::to_vec(task)?)?;
            Ok(())
        })
    }

    /// Fetch a task body by id, completed or not.
    pub fn get_task(&self, id: &str) -> Result<Task, NodeError> {
        let exec = self.store().executor();
        match exec.get(&value_key(id)) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(StoreError::NotFound) => Err(NodeError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Uncompleted tasks currently runnable or pending in a pool.
    pub fn list_active_tasks(&self, pool: &str) -> Result<Vec<Task>, NodeError> {
        let exec = self.store().executor();
        let prefix = index_prefix(pool);
        let mut index_values: Vec<Vec<u8>> = Vec::new();
        exec.scan_prefix(&prefix, true, &mut |_, value| {
            index_values.push(value.to_vec());
            Ok(true)
        })?;

        let mut tasks = Vec::new();
        for data_key in index_values {
            match exec.get(&data_key) {
                Ok(raw) => {
                    let task: Task = serde_json::from_slice(&raw)?;
                    if !task.is_completed() {
                        tasks.push(task);
                    }
                }
                Err(StoreError::NotFound) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(tasks)
    }

    /// All task bodies whose id starts with `prefix`, newest first. Debug
    /// surface.
    pub fn dump_tasks(&self, prefix: &str) -> Result<Vec<Task>, NodeError> {
        let exec = self.store().executor();
        let key_prefix = [b"tv:", prefix.as_bytes()].concat();
        let mut tasks: Vec<Task> = Vec::new();
        let mut scan_err = None;
        exec.scan_prefix(&key_prefix, true, &mut |_, raw| {
            match serde_json::from_slice(raw) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    scan_err = Some(err);
                    return Ok(false);
                }
            }
            Ok(true)
        })?;
        if let Some(err) = scan_err {
            return Err(err.into());
        }
        tasks.sort_by_key(|task| std::cmp::Reverse(task.created_at));
        Ok(tasks)
    }
}
