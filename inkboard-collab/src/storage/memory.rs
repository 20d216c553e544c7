//! In-memory storage backend.
//!
//! Used when no storage path is configured and throughout the tests. Keeps
//! an ordered log of applied writes and supports injecting failures and
//! latency so retry and ordering behaviour can be observed.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{unix_now, ChatRecord, ShapeRecord, Storage, StorageError};
use crate::shape::{ShapeFields, ShapeId, ShapePatch};

/// One successfully applied write, in application order.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteLogEntry {
    Chat { id: u64, room_id: String, message: String },
    ShapeCreate { id: ShapeId, room_id: String },
    ShapeUpdate { id: ShapeId, room_id: String },
}

#[derive(Default)]
struct State {
    next_chat_id: u64,
    next_shape_id: ShapeId,
    chats: Vec<ChatRecord>,
    shapes: BTreeMap<ShapeId, ShapeRecord>,
    log: Vec<WriteLogEntry>,
    faults: VecDeque<StorageError>,
    attempts: u64,
}

/// Volatile [`Storage`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency` before applying it.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Make the next `times` operations fail with `error`.
    pub async fn fail_next(&self, error: StorageError, times: usize) {
        let mut state = self.state.lock().await;
        state.faults.extend(std::iter::repeat(error).take(times));
    }

    /// Applied writes in the order storage observed them.
    pub async fn write_log(&self) -> Vec<WriteLogEntry> {
        self.state.lock().await.log.clone()
    }

    /// Chats of a room in insertion order.
    pub async fn chats(&self, room_id: &str) -> Vec<ChatRecord> {
        self.state
            .lock()
            .await
            .chats
            .iter()
            .filter(|c| c.room_id == room_id)
            .cloned()
            .collect()
    }

    pub async fn shape(&self, id: ShapeId) -> Option<ShapeRecord> {
        self.state.lock().await.shapes.get(&id).cloned()
    }

    /// Shapes of a room ordered by id.
    pub async fn shapes(&self, room_id: &str) -> Vec<ShapeRecord> {
        self.state
            .lock()
            .await
            .shapes
            .values()
            .filter(|s| s.room_id == room_id)
            .cloned()
            .collect()
    }

    /// Operations attempted, including failed ones.
    pub async fn attempts(&self) -> u64 {
        self.state.lock().await.attempts
    }

    /// Highest number of operations observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Common prologue: concurrency tracking, latency, fault injection.
    async fn begin(&self) -> Result<InFlight<'_>, StorageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        state.attempts += 1;
        match state.faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(guard),
        }
    }
}

/// Decrements the in-flight counter when an operation ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_chat(
        &self,
        room_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<ChatRecord, StorageError> {
        let _op = self.begin().await?;
        let mut state = self.state.lock().await;

        state.next_chat_id += 1;
        let record = ChatRecord {
            id: state.next_chat_id,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            created_at: unix_now(),
        };
        state.chats.push(record.clone());
        state.log.push(WriteLogEntry::Chat {
            id: record.id,
            room_id: record.room_id.clone(),
            message: record.message.clone(),
        });
        Ok(record)
    }

    async fn create_shape(
        &self,
        room_id: &str,
        user_id: &str,
        fields: &ShapeFields,
    ) -> Result<ShapeRecord, StorageError> {
        let _op = self.begin().await?;
        let mut state = self.state.lock().await;

        state.next_shape_id += 1;
        let record = ShapeRecord {
            id: state.next_shape_id,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            fields: fields.clone(),
        };
        state.shapes.insert(record.id, record.clone());
        state.log.push(WriteLogEntry::ShapeCreate {
            id: record.id,
            room_id: record.room_id.clone(),
        });
        Ok(record)
    }

    async fn update_shape(
        &self,
        room_id: &str,
        patch: &ShapePatch,
    ) -> Result<ShapeRecord, StorageError> {
        let _op = self.begin().await?;
        let mut state = self.state.lock().await;

        let record = match state.shapes.get_mut(&patch.id) {
            Some(record) if record.room_id == room_id => {
                record.fields.apply(patch);
                record.clone()
            }
            _ => {
                return Err(StorageError::NotFound {
                    room_id: room_id.to_string(),
                    shape_id: patch.id,
                })
            }
        };
        state.log.push(WriteLogEntry::ShapeUpdate {
            id: record.id,
            room_id: record.room_id.clone(),
        });
        Ok(record)
    }
}
