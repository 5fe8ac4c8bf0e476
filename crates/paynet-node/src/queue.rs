//! Worker pools over the durable task queue.
//!
//! Workers loop `acquire → run → complete | retry`. The acquire algorithm in
//! the store guarantees a queue never runs on two workers at once, so a pool
//! scales across queues, not within one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::store::{KvStore, PaymentsDb, Task};

/// Handles one task kind family. Handlers MUST be idempotent: the lease can
/// expire mid-run and the task will execute again.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), NodeError>;
}

const IDLE_POLL: Duration = Duration::from_millis(500);
const BACKOFF_BASE_SECS: i64 = 3;
const BACKOFF_CAP_SECS: i64 = 300;

/// Retry delay in nanoseconds: exponential in the attempt count, capped.
pub fn retry_backoff_nanos(attempts: u32) -> i64 {
    let exp = attempts.min(7);
    (BACKOFF_BASE_SECS << exp).min(BACKOFF_CAP_SECS) * 1_000_000_000
}

/// A named pool of workers draining one task pool.
pub struct TaskPool<S: KvStore> {
    db: Arc<PaymentsDb<S>>,
    pool: String,
    workers: usize,
}

/// Running pool; dropping the handle does not stop the workers, use
/// [`TaskPoolHandle::shutdown`].
pub struct TaskPoolHandle {
    stop: watch::Sender<bool>,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

impl TaskPoolHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for join in self.joins {
            let _ = join.await;
        }
    }
}

impl<S: KvStore> TaskPool<S> {
    pub fn new(db: Arc<PaymentsDb<S>>, pool: impl Into<String>, workers: usize) -> Self {
        Self {
            db,
            pool: pool.into(),
            workers: workers.max(1),
        }
    }

    /// Spawn the workers onto the current runtime.
    pub fn spawn(self, handler: Arc<dyn TaskHandler>) -> TaskPoolHandle {
        let (stop, stopped) = watch::channel(false);
        let mut joins = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let db = self.db.clone();
            let pool = self.pool.clone();
            let handler = handler.clone();
            let mut stopped = stopped.clone();
            joins.push(tokio::spawn(async move {
                debug!(pool = %pool, worker, "task worker started");
                loop {
                    if *stopped.borrow() {
                        break;
                    }
                    match process_one(&db, &pool, handler.as_ref()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::select! {
                                _ = stopped.changed() => {}
                                _ = tokio::time::sleep(IDLE_POLL) => {}
                            }
                        }
                        Err(err) => {
                            warn!(pool = %pool, error = %err, "task loop error");
                            tokio::time::sleep(IDLE_POLL).await;
                        }
                    }
                }
                debug!(pool = %pool, worker, "task worker stopped");
            }));
        }
        TaskPoolHandle { stop, joins }
    }
}

/// Acquire and run a single task. Returns whether a task was found. Public
/// so embedders and tests can drive the queue without spawning workers.
pub async fn process_one<S: KvStore>(
    db: &PaymentsDb<S>,
    pool: &str,
    handler: &dyn TaskHandler,
) -> Result<bool, NodeError> {
    let Some(mut task) = db.acquire_task(pool)? else {
        return Ok(false);
    };

    match handler.handle(&task).await {
        Ok(()) => {
            // A completed task with an error recorded means terminal
            // failure; wipe any leftover from earlier retries.
            task.last_error.clear();
            db.complete_task(pool, &mut task)?;
        }
        Err(err) if err.is_idempotent_success() => {
            debug!(id = %task.id, outcome = %err, "task effect already in place");
            task.last_error.clear();
            db.complete_task(pool, &mut task)?;
        }
        Err(err) if err.is_retryable() => {
            let retry_at = crate::clock::now_unix_nanos() + retry_backoff_nanos(task.attempts);
            warn!(id = %task.id, error = %err, attempts = task.attempts, "task retry scheduled");
            db.retry_task(&mut task, &err.to_string(), retry_at)?;
        }
        Err(err) => {
            // Protocol-level failure: record and stop retrying; the peer may
            // re-propose with corrected inputs.
            warn!(id = %task.id, error = %err, "task failed permanently");
            task.last_error = err.to_string();
            db.complete_task(pool, &mut task)?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        ran: AtomicUsize,
        fail_with: Option<fn() -> NodeError>,
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _task: &Task) -> Result<(), NodeError> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn db() -> Arc<PaymentsDb<MemoryStore>> {
        Arc::new(PaymentsDb::new(Arc::new(MemoryStore::new())))
    }

    fn enqueue(db: &PaymentsDb<MemoryStore>, id: &str) {
        let exec = db.store().executor();
        db.create_task(
            exec.as_ref(),
            "p",
            "test",
            "q",
            id,
            &serde_json::json!({}),
            Some(crate::clock::now_unix_nanos() - 1),
            None,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn successful_task_completes() {
        let db = db();
        enqueue(&db, "t1");
        let handler = Counting {
            ran: AtomicUsize::new(0),
            fail_with: None,
        };
        assert!(process_one(&db, "p", &handler).await.unwrap());
        assert_eq!(handler.ran.load(Ordering::SeqCst), 1);
        assert!(db.list_active_tasks("p").unwrap().is_empty());
        assert!(!process_one(&db, "p", &handler).await.unwrap());
    }

    #[tokio::test]
    async fn idempotent_errors_complete_the_task() {
        let db = db();
        enqueue(&db, "t1");
        let handler = Counting {
            ran: AtomicUsize::new(0),
            fail_with: Some(|| NodeError::AlreadyExists),
        };
        process_one(&db, "p", &handler).await.unwrap();
        assert!(db.list_active_tasks("p").unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_errors_schedule_retry() {
        let db = db();
        enqueue(&db, "t1");
        let handler = Counting {
            ran: AtomicUsize::new(0),
            fail_with: Some(|| NodeError::Transient("io".into())),
        };
        process_one(&db, "p", &handler).await.unwrap();

        let pending = db.list_active_tasks("p").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].re_execute_after.is_some());
    }

    #[tokio::test]
    async fn success_after_retry_clears_the_error() {
        let db = db();
        enqueue(&db, "t1");

        // First attempt failed transiently and is due for retry.
        let mut task = db.acquire_task("p").unwrap().unwrap();
        db.retry_task(&mut task, "peer unreachable", crate::clock::now_unix_nanos() - 1)
            .unwrap();

        let handler = Counting {
            ran: AtomicUsize::new(0),
            fail_with: None,
        };
        assert!(process_one(&db, "p", &handler).await.unwrap());

        // Completed without an error on record: the retry trace is gone, so
        // a non-empty error on a completed task always means terminal
        // failure.
        let stored = db.get_task("t1").unwrap();
        assert!(stored.is_completed());
        assert!(stored.last_error.is_empty());
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn protocol_errors_fail_without_retry() {
        let db = db();
        enqueue(&db, "t1");
        let handler = Counting {
            ran: AtomicUsize::new(0),
            fail_with: Some(|| NodeError::InvalidProof),
        };
        process_one(&db, "p", &handler).await.unwrap();

        assert!(db.list_active_tasks("p").unwrap().is_empty());
        let stored = &db.dump_tasks("t1").unwrap()[0];
        assert!(stored.is_completed());
        assert!(stored.last_error.contains("proof"));
    }

    #[tokio::test]
    async fn pool_drains_tasks_in_background() {
        let db = db();
        for i in 0..5 {
            enqueue(&db, &format!("t{i}"));
        }
        let handler = Arc::new(Counting {
            ran: AtomicUsize::new(0),
            fail_with: None,
        });
        let pool = TaskPool::new(db.clone(), "p", 2).spawn(handler.clone());

        for _ in 0..50 {
            if db.list_active_tasks("p").unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.shutdown().await;
        assert_eq!(handler.ran.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff_nanos(0), 3_000_000_000);
        assert_eq!(retry_backoff_nanos(1), 6_000_000_000);
        assert!(retry_backoff_nanos(20) <= 300_000_000_000);
    }
}
