//! Durable storage collaborator.
//!
//! The collaboration core only needs three writes. Everything behind them
//! (schema, queries, room lifecycle) belongs to the storage backend.
//!
//! ```text
//! ┌──────────────────┐  Job   ┌────────────────┐  create/update  ┌─────────────┐
//! │ Dispatcher       │ ─────► │ PersistQueue   │ ──────────────► │ dyn Storage │
//! └──────────────────┘        │ (1 consumer)   │                 ├─────────────┤
//!                             └────────────────┘                 │ MemoryStore │
//!                                                                │ RocksStore  │
//!                                                                └─────────────┘
//! ```

pub mod memory;
#[cfg(feature = "rocks")]
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shape::{ShapeFields, ShapeId, ShapePatch};

pub use memory::{MemoryStore, WriteLogEntry};
#[cfg(feature = "rocks")]
pub use rocks::{RocksStore, StoreConfig};

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: u64,
    pub room_id: String,
    pub user_id: String,
    pub message: String,
    /// Seconds since epoch
    pub created_at: u64,
}

/// A persisted shape with its canonical field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub id: ShapeId,
    pub room_id: String,
    pub user_id: String,
    pub fields: ShapeFields,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// Backend temporarily unreachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    /// Addressed record does not exist
    #[error("Shape {shape_id} not found in room {room_id}")]
    NotFound { room_id: String, shape_id: ShapeId },
    /// Write rejected by a storage constraint
    #[error("Constraint violation: {0}")]
    Constraint(String),
    /// Backend I/O error
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the identical write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_))
    }
}

/// The durable writes the collaboration core performs.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_chat(
        &self,
        room_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<ChatRecord, StorageError>;

    /// Persist a new shape. The returned record carries the assigned id.
    async fn create_shape(
        &self,
        room_id: &str,
        user_id: &str,
        fields: &ShapeFields,
    ) -> Result<ShapeRecord, StorageError>;

    /// Apply a partial update to a shape of the given room.
    async fn update_shape(
        &self,
        room_id: &str,
        patch: &ShapePatch,
    ) -> Result<ShapeRecord, StorageError>;
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(StorageError::Database("io".into()).is_transient());
        assert!(!StorageError::Constraint("dup".into()).is_transient());
        assert!(!StorageError::Serialization("bad".into()).is_transient());
        assert!(!StorageError::NotFound {
            room_id: "r1".into(),
            shape_id: 4
        }
        .is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::NotFound {
            room_id: "r1".into(),
            shape_id: 4,
        };
        assert!(err.to_string().contains("not found"));
        assert!(StorageError::Database("x".into()).to_string().contains("Database error"));
    }
}
