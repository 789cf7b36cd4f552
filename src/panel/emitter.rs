use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::ids::{RoomId, UserId};
use crate::panel::protocol::ServerPanelMessage;

/// A frame destined for one panel socket's writer task.
#[derive(Debug)]
pub enum PanelFrame {
    Message(Box<ServerPanelMessage>),
    /// Instructs the writer task to close the socket with the given reason.
    Close { reason: &'static str },
}

/// Per-user JSON sink with per-room broadcast.
///
/// Process-wide and concurrency-safe. Sends are fire-and-forget: a user with
/// no open socket simply misses the message. Registering a second socket for
/// the same user closes the first with reason `replaced`.
#[derive(Default)]
pub struct PanelEmitter {
    sinks: RwLock<HashMap<UserId, mpsc::UnboundedSender<PanelFrame>>>,
    rooms: RwLock<HashMap<RoomId, HashSet<UserId>>>,
}

impl PanelEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a socket writer for `user`. Returns the receiving end the
    /// socket task drains.
    pub fn register(&self, user: UserId) -> mpsc::UnboundedReceiver<PanelFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(previous) = self.sinks.write().insert(user.clone(), tx) {
            let _ = previous.send(PanelFrame::Close { reason: "replaced" });
            debug!(%user, "panel socket replaced");
        }
        rx
    }

    /// Detach `user`'s socket, but only if `expected` is still the
    /// registered sender (a replacement socket must not be torn down by the
    /// old socket's cleanup).
    pub fn unregister(&self, user: &UserId, expected: &mpsc::UnboundedSender<PanelFrame>) {
        let mut sinks = self.sinks.write();
        if sinks
            .get(user)
            .is_some_and(|current| current.same_channel(expected))
        {
            sinks.remove(user);
        }
    }

    /// Look up the currently registered sender for a user.
    pub fn sender_of(&self, user: &UserId) -> Option<mpsc::UnboundedSender<PanelFrame>> {
        self.sinks.read().get(user).cloned()
    }

    pub fn subscribe(&self, room: &RoomId, user: &UserId) {
        self.rooms
            .write()
            .entry(room.clone())
            .or_default()
            .insert(user.clone());
    }

    pub fn unsubscribe(&self, room: &RoomId, user: &UserId) {
        let mut rooms = self.rooms.write();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(user);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Send to one user. No-op when the socket is absent or already closed.
    pub fn send(&self, user: &UserId, message: ServerPanelMessage) {
        if let Some(sink) = self.sinks.read().get(user) {
            let _ = sink.send(PanelFrame::Message(Box::new(message)));
        }
    }

    /// Send to every subscriber of a room.
    pub fn broadcast(&self, room: &RoomId, message: ServerPanelMessage) {
        let members: Vec<UserId> = self
            .rooms
            .read()
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        for user in members {
            self.send(&user, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn room(raw: &str) -> RoomId {
        RoomId::parse(raw).unwrap()
    }

    fn error_msg(text: &str) -> ServerPanelMessage {
        ServerPanelMessage::Error {
            message: text.to_string(),
        }
    }

    #[tokio::test]
    async fn send_reaches_registered_user() {
        let emitter = PanelEmitter::new();
        let mut rx = emitter.register(user("alice"));
        emitter.send(&user("alice"), error_msg("hi"));
        assert!(matches!(rx.recv().await, Some(PanelFrame::Message(_))));
    }

    #[test]
    fn send_to_absent_user_is_noop() {
        let emitter = PanelEmitter::new();
        emitter.send(&user("ghost"), error_msg("hi"));
    }

    #[tokio::test]
    async fn replacement_closes_prior_socket() {
        let emitter = PanelEmitter::new();
        let mut first = emitter.register(user("alice"));
        let _second = emitter.register(user("alice"));
        match first.recv().await {
            Some(PanelFrame::Close { reason }) => assert_eq!(reason, "replaced"),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_hits_only_room_subscribers() {
        let emitter = PanelEmitter::new();
        let mut alice = emitter.register(user("alice"));
        let mut bob = emitter.register(user("bob"));
        emitter.subscribe(&room("r1"), &user("alice"));

        emitter.broadcast(&room("r1"), error_msg("only alice"));
        assert!(matches!(alice.recv().await, Some(PanelFrame::Message(_))));
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_unregister_does_not_remove_replacement() {
        let emitter = PanelEmitter::new();
        let _first_rx = emitter.register(user("alice"));
        let first_tx = emitter.sender_of(&user("alice")).unwrap();
        let mut second_rx = emitter.register(user("alice"));

        // The first socket's cleanup runs after replacement.
        emitter.unregister(&user("alice"), &first_tx);

        emitter.send(&user("alice"), error_msg("still here"));
        assert!(matches!(second_rx.recv().await, Some(PanelFrame::Message(_))));
    }
}
