//! # inkboard-collab: Real-time collaboration backbone for Inkboard
//!
//! Authenticated WebSocket clients join rooms, exchange chat messages and
//! shape edits, and every mutation is written to storage in the order it
//! was accepted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ws://…?token=JWT   ┌──────────────────┐
//! │ Client      │ ◄──────────────────► │ handle_connection│
//! │ (per user)  │     JSON frames      │ (per connection) │
//! └─────────────┘                      └────────┬─────────┘
//!                                               │
//!                                       ┌───────┴───────┐
//!                                       │ Dispatcher    │
//!                                       └───┬───────┬───┘
//!                                           │       │
//!                               ┌───────────┴─┐   ┌─┴───────────────┐
//!                               │RoomDirectory│   │PersistenceQueue │
//!                               │ (fan-out)   │   │ (1 consumer)    │
//!                               └─────────────┘   └────────┬────────┘
//!                                                          │
//!                                                   ┌──────┴──────┐
//!                                                   │ dyn Storage │
//!                                                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: Handshake token verification
//! - [`registry`]: Live connections indexed by user
//! - [`rooms`]: Room membership and broadcast
//! - [`protocol`]: JSON wire events
//! - [`queue`]: Ordered persistence with retry
//! - [`dispatch`]: Event routing
//! - [`handler`]: Connection lifecycle
//! - [`server`]: Listener, configuration and service wiring
//! - [`storage`]: Storage trait, in-memory and RocksDB backends

pub mod auth;
pub mod dispatch;
pub mod handler;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod shape;
pub mod storage;

// Re-exports for convenience
pub use auth::{Claims, Identity, TokenVerifier};
pub use dispatch::Dispatcher;
pub use handler::{handle_connection, HandlerError, CLOSE_MISSING_TOKEN, CLOSE_UNAUTHORIZED};
pub use protocol::{ClientEvent, ProtocolError, ServerEvent, ShapeView};
pub use queue::{
    Job, JobKind, Outcome, PersistError, PersistenceQueue, QueueStats, RetryPlacement,
    RetryPolicy,
};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Frame};
pub use rooms::{RoomDirectory, RoomStats};
pub use server::{CollabServer, ConfigError, ServerConfig, ServerError, ServerStats, Services};
pub use shape::{Point, ShapeDraft, ShapeFields, ShapeId, ShapePatch};
pub use storage::{ChatRecord, MemoryStore, ShapeRecord, Storage, StorageError};
#[cfg(feature = "rocks")]
pub use storage::{RocksStore, StoreConfig};
