//! Ordered persistence queue.
//!
//! Architecture:
//! ```text
//!  submit(job) ──┐
//!  submit(job) ──┼──► mpsc ──► Consumer (single task) ──► dyn Storage
//!  enqueue(job) ─┘              │  backlog: VecDeque       │
//!                               │  1 write in flight       ▼
//!                               └──◄── oneshot Outcome ◄── result
//! ```
//!
//! Jobs are executed strictly in admission order by exactly one consumer.
//! A transient failure is retried after a backoff pause; by default the
//! failing job keeps its place at the head so nothing submitted after it
//! reaches storage first. Permanent failures and exhausted retries are
//! delivered to the waiter as [`PersistError`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::shape::{ShapeFields, ShapePatch};
use crate::storage::{ChatRecord, ShapeRecord, Storage, StorageError};

/// One pending durable write. Never mutated once created.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Chat {
        room_id: String,
        user_id: String,
        message: String,
    },
    ShapeCreate {
        room_id: String,
        user_id: String,
        fields: ShapeFields,
    },
    ShapeUpdate {
        room_id: String,
        user_id: String,
        patch: ShapePatch,
    },
}

/// Job discriminant, for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Chat,
    ShapeCreate,
    ShapeUpdate,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::ShapeCreate => write!(f, "shape:create"),
            Self::ShapeUpdate => write!(f, "shape:update"),
        }
    }
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Chat { .. } => JobKind::Chat,
            Self::ShapeCreate { .. } => JobKind::ShapeCreate,
            Self::ShapeUpdate { .. } => JobKind::ShapeUpdate,
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            Self::Chat { room_id, .. }
            | Self::ShapeCreate { room_id, .. }
            | Self::ShapeUpdate { room_id, .. } => room_id,
        }
    }

    /// Run the storage operation this job stands for.
    async fn execute(&self, storage: &dyn Storage) -> Result<Outcome, StorageError> {
        match self {
            Self::Chat {
                room_id,
                user_id,
                message,
            } => storage
                .create_chat(room_id, user_id, message)
                .await
                .map(Outcome::Chat),
            Self::ShapeCreate {
                room_id,
                user_id,
                fields,
            } => storage
                .create_shape(room_id, user_id, fields)
                .await
                .map(Outcome::Shape),
            Self::ShapeUpdate { room_id, patch, .. } => storage
                .update_shape(room_id, patch)
                .await
                .map(Outcome::Shape),
        }
    }
}

/// Result of a successfully persisted job.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Chat(ChatRecord),
    Shape(ShapeRecord),
}

impl Outcome {
    pub fn into_shape(self) -> Option<ShapeRecord> {
        match self {
            Self::Shape(record) => Some(record),
            Self::Chat(_) => None,
        }
    }
}

/// Terminal persistence failures, delivered to the job's waiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistError {
    /// Permanent storage error; retrying cannot help
    #[error("{0}")]
    Storage(StorageError),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StorageError },
    #[error("persistence queue is closed")]
    QueueClosed,
}

/// Where a job goes after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlacement {
    /// Retry the same job before anything behind it (strict FIFO).
    InPlace,
    /// Requeue behind everything admitted so far.
    Tail,
}

/// Retry policy for transient storage failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total executions per job, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub placement: RetryPlacement,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            placement: RetryPlacement::InPlace,
        }
    }
}

impl RetryPolicy {
    /// Policy for tests: short pauses.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            placement: RetryPlacement::InPlace,
        }
    }

    /// Pause after the `failures`-th failed attempt (1-based), doubling each time.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Queue health snapshot.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    /// Jobs admitted but not yet finished
    pub depth: u64,
}

#[derive(Default)]
struct AtomicQueueStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

type Waiter = oneshot::Sender<Result<Outcome, PersistError>>;

/// A job travelling through the queue with its bookkeeping.
struct Pending {
    job: Job,
    failures: u32,
    waiter: Waiter,
}

/// Handle used to submit jobs. Clones share the same consumer.
///
/// The consumer exits once the queue is closed (or every handle is dropped)
/// and the backlog is empty.
#[derive(Clone)]
pub struct PersistenceQueue {
    /// `None` once closed; shared so closing one handle closes them all
    tx: Arc<RwLock<Option<mpsc::UnboundedSender<Pending>>>>,
    stats: Arc<AtomicQueueStats>,
}

impl PersistenceQueue {
    /// Spawn the consumer task and return the submission handle.
    pub fn start(storage: Arc<dyn Storage>, policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicQueueStats::default());
        let consumer = Consumer {
            rx,
            storage,
            policy,
            backlog: VecDeque::new(),
            stats: stats.clone(),
        };
        let task = tokio::spawn(consumer.run());
        let tx = Arc::new(RwLock::new(Some(tx)));
        (Self { tx, stats }, task)
    }

    /// Submit a job and wait for its outcome.
    pub async fn submit(&self, job: Job) -> Result<Outcome, PersistError> {
        let rx = self.enqueue(job)?;
        rx.await.unwrap_or(Err(PersistError::QueueClosed))
    }

    /// Admit a job without waiting. Dropping the receiver makes it
    /// fire-and-forget; the job is still executed.
    pub fn enqueue(
        &self,
        job: Job,
    ) -> Result<oneshot::Receiver<Result<Outcome, PersistError>>, PersistError> {
        let (waiter, rx) = oneshot::channel();
        let pending = Pending {
            job,
            failures: 0,
            waiter,
        };
        let tx = self.tx.read().unwrap_or_else(PoisonError::into_inner);
        tx.as_ref()
            .ok_or(PersistError::QueueClosed)?
            .send(pending)
            .map_err(|_| PersistError::QueueClosed)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    /// Stop admitting jobs. Jobs admitted before this call still run; the
    /// consumer exits after the last of them. Later `enqueue` calls fail
    /// with [`PersistError::QueueClosed`].
    pub fn close(&self) {
        let mut tx = self.tx.write().unwrap_or_else(PoisonError::into_inner);
        if tx.take().is_some() {
            log::debug!("Persistence queue closed to new jobs");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn stats(&self) -> QueueStats {
        let submitted = self.stats.submitted.load(Ordering::Relaxed);
        let completed = self.stats.completed.load(Ordering::Relaxed);
        let failed = self.stats.failed.load(Ordering::Relaxed);
        QueueStats {
            submitted,
            completed,
            retried: self.stats.retried.load(Ordering::Relaxed),
            failed,
            depth: submitted.saturating_sub(completed + failed),
        }
    }

    /// Wait until every admitted job has finished, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stats().depth == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// The single consumer. Owns the backlog; nothing else touches it.
struct Consumer {
    rx: mpsc::UnboundedReceiver<Pending>,
    storage: Arc<dyn Storage>,
    policy: RetryPolicy,
    backlog: VecDeque<Pending>,
    stats: Arc<AtomicQueueStats>,
}

impl Consumer {
    async fn run(mut self) {
        loop {
            if self.backlog.is_empty() {
                match self.rx.recv().await {
                    Some(pending) => self.backlog.push_back(pending),
                    None => break,
                }
            }
            self.admit();

            let Some(mut pending) = self.backlog.pop_front() else {
                continue;
            };

            match pending.job.execute(self.storage.as_ref()).await {
                Ok(outcome) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    log::trace!(
                        "Persisted {} for room {}",
                        pending.job.kind(),
                        pending.job.room_id()
                    );
                    let _ = pending.waiter.send(Ok(outcome));
                }
                Err(err) if !err.is_transient() => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "Permanent failure persisting {} for room {}: {err}",
                        pending.job.kind(),
                        pending.job.room_id()
                    );
                    let _ = pending.waiter.send(Err(PersistError::Storage(err)));
                }
                Err(err) => {
                    pending.failures += 1;
                    if pending.failures >= self.policy.max_attempts {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        log::error!(
                            "Giving up on {} for room {} after {} attempts: {err}",
                            pending.job.kind(),
                            pending.job.room_id(),
                            pending.failures
                        );
                        let _ = pending.waiter.send(Err(PersistError::RetriesExhausted {
                            attempts: pending.failures,
                            last: err,
                        }));
                        continue;
                    }

                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = self.policy.backoff_for(pending.failures);
                    log::warn!(
                        "Write of {} for room {} failed (attempt {}), retrying in {delay:?}: {err}",
                        pending.job.kind(),
                        pending.job.room_id(),
                        pending.failures
                    );
                    match self.policy.placement {
                        RetryPlacement::InPlace => self.backlog.push_front(pending),
                        RetryPlacement::Tail => {
                            self.admit();
                            self.backlog.push_back(pending);
                        }
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
        log::debug!("Persistence queue consumer stopped");
    }

    /// Move everything already submitted into the backlog, preserving order.
    fn admit(&mut self) {
        while let Ok(pending) = self.rx.try_recv() {
            self.backlog.push_back(pending);
        }
    }
}
