use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::domain::ids::UserId;

/// Frames queued per peer speaker before the relay starts shedding.
const SPEAKER_QUEUE_FRAMES: usize = 256;

/// Forwards raw PCM frames between the two peers of one room.
///
/// Each member registers a speaker sink (their outbound audio socket); a
/// frame arriving from one member is forwarded to every *other* member.
/// Forwarding is lossy: a slow peer socket sheds frames rather than
/// stalling the microphone path.
#[derive(Default)]
pub struct AudioRelay {
    speakers: RwLock<HashMap<UserId, mpsc::Sender<Bytes>>>,
}

impl AudioRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `user`'s speaker. Returns the receiver the audio socket task
    /// drains into outbound binary frames.
    pub fn attach(&self, user: UserId) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(SPEAKER_QUEUE_FRAMES);
        self.speakers.write().insert(user, tx);
        rx
    }

    pub fn detach(&self, user: &UserId) {
        self.speakers.write().remove(user);
    }

    /// Forward one frame from `from` to every other attached member.
    pub fn forward(&self, from: &UserId, frame: Bytes) {
        let peers: Vec<mpsc::Sender<Bytes>> = self
            .speakers
            .read()
            .iter()
            .filter(|(user, _)| *user != from)
            .map(|(_, tx)| tx.clone())
            .collect();
        for peer in peers {
            // try_send: shed on a full queue instead of blocking the mic.
            let _ = peer.try_send(frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn forwards_to_peer_not_self() {
        let relay = AudioRelay::new();
        let mut alice_rx = relay.attach(user("alice"));
        let mut bob_rx = relay.attach(user("bob"));

        relay.forward(&user("alice"), Bytes::from_static(b"pcm"));

        assert_eq!(bob_rx.recv().await.unwrap(), Bytes::from_static(b"pcm"));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn detached_peer_receives_nothing() {
        let relay = AudioRelay::new();
        let mut bob_rx = relay.attach(user("bob"));
        relay.detach(&user("bob"));
        relay.forward(&user("alice"), Bytes::from_static(b"pcm"));
        assert!(bob_rx.try_recv().is_err());
    }
}
