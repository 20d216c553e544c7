//! Live connections and the process-wide user → connection index.
//!
//! A [`ConnectionHandle`] is the transport handle everything else holds:
//! frames pushed into it are written to the socket by the connection's own
//! task. Once that task ends the handle reports closed and sends fail.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::ServerEvent;

/// Unique id of one websocket session.
pub type ConnectionId = Uuid;

/// Pre-encoded outbound text frame, shared across all recipients.
pub type Frame = Arc<str>;

/// Cheaply clonable handle to an authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Arc<Identity>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer drains.
    pub fn new(identity: Identity) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: Uuid::new_v4(),
            identity: Arc::new(identity),
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Whether the writer side is still alive.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a pre-encoded frame. Returns `false` if the connection is gone.
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Encode and queue a single event for this connection only.
    pub fn send(&self, event: &ServerEvent) -> bool {
        match event.encode() {
            Ok(text) => self.send_frame(Arc::from(text)),
            Err(e) => {
                log::error!("Failed to encode frame for connection {}: {e}", self.id);
                false
            }
        }
    }
}

/// Index of active connections by user id.
///
/// Multiple concurrent sessions per user are allowed.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: RwLock<HashMap<String, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its identity.
    pub async fn add(&self, conn: ConnectionHandle) {
        let mut users = self.users.write().await;
        users
            .entry(conn.user_id().to_string())
            .or_default()
            .insert(conn.id(), conn);
    }

    /// Remove one session. Other sessions of the same user are untouched.
    pub async fn remove(&self, user_id: &str, conn_id: ConnectionId) -> bool {
        let mut users = self.users.write().await;
        let Some(sessions) = users.get_mut(user_id) else {
            return false;
        };
        let removed = sessions.remove(&conn_id).is_some();
        if sessions.is_empty() {
            users.remove(user_id);
        }
        removed
    }

    /// Remove every session of a user. Returns how many were removed.
    pub async fn remove_user(&self, user_id: &str) -> usize {
        self.users
            .write()
            .await
            .remove(user_id)
            .map_or(0, |sessions| sessions.len())
    }

    /// All live sessions of a user.
    pub async fn connections_for(&self, user_id: &str) -> Vec<ConnectionHandle> {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.users.read().await.contains_key(user_id)
    }

    /// Number of distinct connected users.
    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Number of sessions across all users.
    pub async fn connection_count(&self) -> usize {
        self.users.read().await.values().map(HashMap::len).sum()
    }
}
