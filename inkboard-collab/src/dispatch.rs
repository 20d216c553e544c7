//! Event dispatcher: routes decoded client events to room and queue actions.
//!
//! | Event          | Room action | Broadcast                       | Durability            |
//! |----------------|-------------|---------------------------------|-----------------------|
//! | `join-room`    | join        | `user_joined` to other members  | none                  |
//! | `leave-room`   | leave       | `user_left` to remaining        | none                  |
//! | `chat`         | none        | all members, before persisting  | fire-and-forget job   |
//! | `shape:create` | none        | all members, with storage id    | awaited job           |
//! | `shape:update` | none        | all members, with stored fields | awaited job           |
//!
//! Errors are only ever reported to the connection that caused them.

use std::sync::Arc;

use crate::protocol::{ClientEvent, ServerEvent};
use crate::queue::{Job, Outcome, PersistError, PersistenceQueue};
use crate::registry::ConnectionHandle;
use crate::rooms::RoomDirectory;
use crate::shape::{ShapeDraft, ShapePatch};
use crate::storage::ShapeRecord;

/// Shared per-process dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    rooms: Arc<RoomDirectory>,
    queue: PersistenceQueue,
}

impl Dispatcher {
    pub fn new(rooms: Arc<RoomDirectory>, queue: PersistenceQueue) -> Self {
        Self { rooms, queue }
    }

    pub fn rooms(&self) -> &Arc<RoomDirectory> {
        &self.rooms
    }

    pub fn queue(&self) -> &PersistenceQueue {
        &self.queue
    }

    /// Decode one text frame and handle it. Invalid frames are answered
    /// with an error frame to `conn` only.
    pub async fn dispatch_frame(&self, conn: &ConnectionHandle, frame: &str) {
        match ClientEvent::decode(frame) {
            Ok(event) => {
                log::debug!("Event from {} for room {}", conn.user_id(), event.room_id());
                self.dispatch(conn, event).await
            }
            Err(e) => {
                log::debug!("Rejected frame from {}: {e}", conn.user_id());
                conn.send(&ServerEvent::error(e.to_string()));
            }
        }
    }

    pub async fn dispatch(&self, conn: &ConnectionHandle, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom { room_id } => self.join_room(conn, &room_id).await,
            ClientEvent::LeaveRoom { room_id } => self.leave_room(conn, &room_id).await,
            ClientEvent::Chat { room_id, message } => self.chat(conn, room_id, message).await,
            ClientEvent::ShapeCreate { room_id, shape } => {
                self.shape_create(conn, room_id, shape).await
            }
            ClientEvent::ShapeUpdate { room_id, shape } => {
                self.shape_update(conn, room_id, shape).await
            }
        }
    }

    async fn join_room(&self, conn: &ConnectionHandle, room_id: &str) {
        if !self.rooms.join(room_id, conn).await {
            log::debug!("{} already in room {room_id}", conn.user_id());
            return;
        }
        log::info!("{} joined room {room_id}", conn.user_id());
        self.broadcast(
            room_id,
            &ServerEvent::user_joined(room_id, conn.identity()),
            Some(conn),
        )
        .await;
    }

    async fn leave_room(&self, conn: &ConnectionHandle, room_id: &str) {
        if !self.rooms.leave(room_id, conn.id()).await {
            return;
        }
        log::info!("{} left room {room_id}", conn.user_id());
        self.broadcast(room_id, &ServerEvent::user_left(room_id, conn.identity()), None)
            .await;
    }

    async fn chat(&self, conn: &ConnectionHandle, room_id: String, message: String) {
        // Broadcast first, sender included; chat carries no storage identity.
        self.broadcast(
            &room_id,
            &ServerEvent::chat(&room_id, conn.identity(), &message),
            None,
        )
        .await;

        let job = Job::Chat {
            room_id,
            user_id: conn.user_id().to_string(),
            message,
        };
        match self.queue.enqueue(job) {
            Ok(outcome) => {
                let conn = conn.clone();
                tokio::spawn(async move {
                    if let Ok(Err(e)) = outcome.await {
                        conn.send(&ServerEvent::error(format!("Failed to save chat message: {e}")));
                    }
                });
            }
            Err(e) => {
                conn.send(&ServerEvent::error(format!("Failed to save chat message: {e}")));
            }
        }
    }

    async fn shape_create(&self, conn: &ConnectionHandle, room_id: String, draft: ShapeDraft) {
        let job = Job::ShapeCreate {
            room_id: room_id.clone(),
            user_id: conn.user_id().to_string(),
            fields: draft.into_fields(),
        };
        if let Some(record) = self.persist_shape(conn, job, "create").await {
            log::debug!("Shape {} created in room {room_id}", record.id);
            let event = ServerEvent::shape_created(&room_id, conn.identity(), record);
            self.broadcast(&room_id, &event, None).await;
        }
    }

    async fn shape_update(&self, conn: &ConnectionHandle, room_id: String, patch: ShapePatch) {
        let job = Job::ShapeUpdate {
            room_id: room_id.clone(),
            user_id: conn.user_id().to_string(),
            patch,
        };
        if let Some(record) = self.persist_shape(conn, job, "update").await {
            let event = ServerEvent::shape_updated(&room_id, conn.identity(), record);
            self.broadcast(&room_id, &event, None).await;
        }
    }

    /// Submit a shape job and wait for the stored record. Failures are
    /// reported to `conn` and yield `None`.
    async fn persist_shape(
        &self,
        conn: &ConnectionHandle,
        job: Job,
        action: &str,
    ) -> Option<ShapeRecord> {
        let result = self.queue.submit(job).await;
        match result {
            Ok(Outcome::Shape(record)) => Some(record),
            Ok(Outcome::Chat(_)) => None,
            Err(e) => {
                if !matches!(e, PersistError::QueueClosed) {
                    log::warn!("Shape {action} from {} failed: {e}", conn.user_id());
                }
                conn.send(&ServerEvent::error(format!("Failed to {action} shape: {e}")));
                None
            }
        }
    }

    /// Remove `conn` from every room and tell the remaining members.
    ///
    /// Returns the rooms it was removed from.
    pub async fn disconnect(&self, conn: &ConnectionHandle) -> Vec<String> {
        let left = self.rooms.leave_all(conn.id()).await;
        for room_id in &left {
            self.broadcast(room_id, &ServerEvent::user_left(room_id, conn.identity()), None)
                .await;
        }
        left
    }

    async fn broadcast(
        &self,
        room_id: &str,
        event: &ServerEvent,
        exclude: Option<&ConnectionHandle>,
    ) {
        if let Err(e) = self
            .rooms
            .broadcast(room_id, event, exclude.map(ConnectionHandle::id))
            .await
        {
            log::error!("Failed to encode broadcast for room {room_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::queue::RetryPolicy;
    use crate::registry::Frame;
    use crate::storage::{MemoryStore, StorageError};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (Dispatcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (queue, _task) = PersistenceQueue::start(store.clone(), RetryPolicy::for_testing());
        (Dispatcher::new(Arc::new(RoomDirectory::new()), queue), store)
    }

    fn connect(user_id: &str, name: &str) -> (ConnectionHandle, UnboundedReceiver<Frame>) {
        ConnectionHandle::new(Identity {
            user_id: user_id.into(),
            display_name: name.into(),
        })
    }

    fn drain(rx: &mut UnboundedReceiver<Frame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    async fn join(d: &Dispatcher, conn: &ConnectionHandle, room: &str) {
        d.dispatch(conn, ClientEvent::JoinRoom { room_id: room.into() }).await;
    }

    #[tokio::test]
    async fn test_join_notifies_existing_members_only() {
        let (d, _) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, mut b_rx) = connect("b", "Bob");

        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;

        let a_frames = drain(&mut a_rx);
        assert_eq!(a_frames.len(), 1);
        assert_eq!(a_frames[0]["type"], "user_joined");
        assert_eq!(a_frames[0]["userId"], "b");
        assert_eq!(a_frames[0]["username"], "Bob");
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_repeat_join_is_silent() {
        let (d, _) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, _b_rx) = connect("b", "Bob");

        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;
        join(&d, &b, "r1").await;

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(d.rooms().members("r1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_leave_notifies_remaining_and_drops_empty_room() {
        let (d, _) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, mut b_rx) = connect("b", "Bob");
        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;
        drain(&mut a_rx);

        d.dispatch(&b, ClientEvent::LeaveRoom { room_id: "r1".into() }).await;
        let frames = drain(&mut a_rx);
        assert_eq!(frames[0]["type"], "user_left");
        assert_eq!(frames[0]["userId"], "b");
        assert!(drain(&mut b_rx).is_empty());

        d.dispatch(&a, ClientEvent::LeaveRoom { room_id: "r1".into() }).await;
        assert!(!d.rooms().contains_room("r1").await);
    }

    #[tokio::test]
    async fn test_leave_unjoined_room_is_noop() {
        let (d, _) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        d.dispatch(&a, ClientEvent::LeaveRoom { room_id: "nowhere".into() }).await;
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_chat_reaches_all_members_and_is_persisted() {
        let (d, store) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, mut b_rx) = connect("b", "Bob");
        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;
        drain(&mut a_rx);

        d.dispatch_frame(&a, r#"{"type":"chat","roomId":"r1","message":"hi"}"#).await;

        for frames in [drain(&mut a_rx), drain(&mut b_rx)] {
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "chat");
            assert_eq!(frames[0]["message"], "hi");
            assert_eq!(frames[0]["roomId"], "r1");
            assert_eq!(frames[0]["userId"], "a");
        }

        assert!(d.queue().wait_idle(Duration::from_secs(2)).await);
        let chats = store.chats("r1").await;
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].message, "hi");
        assert_eq!(chats[0].user_id, "a");
    }

    #[tokio::test]
    async fn test_chat_terminal_failure_reported_to_sender_only() {
        let (d, store) = setup();
        store.fail_next(StorageError::Constraint("room missing".into()), 1).await;
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, mut b_rx) = connect("b", "Bob");
        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;
        drain(&mut a_rx);

        d.dispatch_frame(&a, r#"{"type":"chat","roomId":"r1","message":"hi"}"#).await;
        assert!(d.queue().wait_idle(Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let a_frames = drain(&mut a_rx);
        assert_eq!(a_frames.len(), 2);
        assert_eq!(a_frames[1]["type"], "error");
        let b_frames = drain(&mut b_rx);
        assert_eq!(b_frames.len(), 1);
        assert_eq!(b_frames[0]["type"], "chat");
    }

    #[tokio::test]
    async fn test_shape_create_broadcasts_storage_id() {
        let (d, store) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, mut b_rx) = connect("b", "Bob");
        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;
        drain(&mut a_rx);

        d.dispatch_frame(
            &a,
            r#"{"type":"shape:create","roomId":"r1","shape":{"id":"tmp-1","type":"rect","width":5}}"#,
        )
        .await;

        let stored = store.shapes("r1").await;
        assert_eq!(stored.len(), 1);
        for frames in [drain(&mut a_rx), drain(&mut b_rx)] {
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "shape:create");
            assert_eq!(frames[0]["shape"]["id"], stored[0].id);
            assert_eq!(frames[0]["shape"]["width"], 5.0);
            assert_eq!(frames[0]["shape"]["strokeColor"], "black");
            assert_eq!(frames[0]["username"], "Alice");
        }
    }

    #[tokio::test]
    async fn test_concurrent_shape_creates_get_distinct_ids() {
        let (d, _) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, _b_rx) = connect("b", "Bob");
        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;
        drain(&mut a_rx);

        let draft = |kind: &str| ClientEvent::ShapeCreate {
            room_id: "r1".into(),
            shape: serde_json::from_value(serde_json::json!({ "id": "tmp", "type": kind })).unwrap(),
        };
        tokio::join!(d.dispatch(&a, draft("rect")), d.dispatch(&b, draft("circle")));

        let mut ids: Vec<u64> = drain(&mut a_rx)
            .iter()
            .map(|f| f["shape"]["id"].as_u64().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_shape_update_broadcasts_merged_record() {
        let (d, _) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        join(&d, &a, "r1").await;

        d.dispatch_frame(&a, r#"{"type":"shape:create","roomId":"r1","shape":{"type":"rect","fillColor":"red"}}"#)
            .await;
        d.dispatch_frame(&a, r#"{"type":"shape:update","roomId":"r1","shape":{"id":1,"width":40}}"#)
            .await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["type"], "shape:update");
        assert_eq!(frames[1]["shape"]["id"], 1);
        assert_eq!(frames[1]["shape"]["width"], 40.0);
        assert_eq!(frames[1]["shape"]["fillColor"], "red");
    }

    #[tokio::test]
    async fn test_shape_update_of_missing_shape_errors_sender_only() {
        let (d, _) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, mut b_rx) = connect("b", "Bob");
        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;
        drain(&mut a_rx);

        d.dispatch_frame(&a, r#"{"type":"shape:update","roomId":"r1","shape":{"id":99}}"#)
            .await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_shape_create_retried_then_broadcast_once() {
        let (d, store) = setup();
        store.fail_next(StorageError::Unavailable("blip".into()), 1).await;
        let (a, mut a_rx) = connect("a", "Alice");
        join(&d, &a, "r1").await;

        d.dispatch_frame(&a, r#"{"type":"shape:create","roomId":"r1","shape":{"type":"line"}}"#)
            .await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["shape"]["id"], 1);
        assert_eq!(store.attempts().await, 2);
    }

    #[tokio::test]
    async fn test_invalid_frames_answer_sender_only() {
        let (d, _) = setup();
        let (a, mut a_rx) = connect("a", "Alice");
        let (b, mut b_rx) = connect("b", "Bob");
        join(&d, &a, "r1").await;
        join(&d, &b, "r1").await;
        drain(&mut a_rx);

        d.dispatch_frame(&a, r#"{"type":"cursor","roomId":"r1"}"#).await;
        d.dispatch_frame(&a, "{{{").await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 2);
        assert!(frames[0]["message"].as_str().unwrap().starts_with("Unknown event type"));
        assert!(frames[1]["message"].as_str().unwrap().starts_with("Invalid message format"));
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(d.rooms().members("r1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms() {
        let (d, _) = setup();
        let (a, _a_rx) = connect("a", "Alice");
        let (b, mut b_rx) = connect("b", "Bob");
        join(&d, &a, "r1").await;
        join(&d, &a, "r2").await;
        join(&d, &b, "r1").await;

        let mut left = d.disconnect(&a).await;
        left.sort();
        assert_eq!(left, vec!["r1", "r2"]);
        assert!(!d.rooms().contains_room("r2").await);
        assert!(!d.rooms().is_member("r1", a.id()).await);

        let frames = drain(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "user_left");
        assert_eq!(frames[0]["roomId"], "r1");
    }
}
