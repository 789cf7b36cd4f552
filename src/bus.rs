//! The paired message channel between a room's two agents.
//!
//! Delivery is in-order and at-most-once within the process; there are no
//! retries and no acks. Every message is deep-copied on send, so a sender
//! mutating its own copy afterwards can never affect the receiver. The bus
//! routes by user id and holds no component handles; the room supervisor
//! observes every message and drives the negotiation engine on it.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::ids::{NegotiationId, UserId};
use crate::domain::proposal::Proposal;

/// A message between the two agents of one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    AgentProposal {
        negotiation_id: NegotiationId,
        from_agent: UserId,
        proposal: Proposal,
    },
    AgentCounter {
        negotiation_id: NegotiationId,
        from_agent: UserId,
        proposal: Proposal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    AgentAccept {
        negotiation_id: NegotiationId,
        from_agent: UserId,
    },
    AgentReject {
        negotiation_id: NegotiationId,
        from_agent: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl AgentMessage {
    pub fn negotiation_id(&self) -> &NegotiationId {
        match self {
            Self::AgentProposal { negotiation_id, .. }
            | Self::AgentCounter { negotiation_id, .. }
            | Self::AgentAccept { negotiation_id, .. }
            | Self::AgentReject { negotiation_id, .. } => negotiation_id,
        }
    }

    pub fn from_agent(&self) -> &UserId {
        match self {
            Self::AgentProposal { from_agent, .. }
            | Self::AgentCounter { from_agent, .. }
            | Self::AgentAccept { from_agent, .. }
            | Self::AgentReject { from_agent, .. } => from_agent,
        }
    }
}

/// The room's message fabric. Registered agents get an inbox; a send from
/// one agent reaches every *other* registered inbox plus the observer.
pub struct InterAgentBus {
    inboxes: RwLock<HashMap<UserId, mpsc::UnboundedSender<AgentMessage>>>,
    observer: mpsc::UnboundedSender<AgentMessage>,
}

impl InterAgentBus {
    /// Build the bus; the returned receiver is the observer stream the room
    /// supervisor feeds into the negotiation engine.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentMessage>) {
        let (observer, observer_rx) = mpsc::unbounded_channel();
        (
            Self {
                inboxes: RwLock::new(HashMap::new()),
                observer,
            },
            observer_rx,
        )
    }

    /// Register one agent; returns its inbox.
    pub fn register(&self, user: UserId) -> mpsc::UnboundedReceiver<AgentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(user, tx);
        rx
    }

    pub fn unregister(&self, user: &UserId) {
        self.inboxes.write().remove(user);
    }

    /// Deep-copy and deliver to the peer and the observer. Routing is by
    /// the message's own `from_agent`. A dropped peer makes this a no-op;
    /// at-most-once delivery means the sender never learns nor retries.
    pub fn send(&self, message: &AgentMessage) {
        let from = message.from_agent().clone();
        let _ = self.observer.send(message.clone());
        for (user, inbox) in self.inboxes.read().iter() {
            if *user != from {
                let _ = inbox.send(message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, Currency};
    use crate::domain::proposal::{LineItem, LineItemKind};

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn proposal(total: i64) -> Proposal {
        Proposal {
            summary: "work".to_string(),
            line_items: vec![LineItem {
                description: "Labour".to_string(),
                amount: Amount(total),
                kind: LineItemKind::Immediate,
                condition: None,
                min_amount: None,
                max_amount: None,
                factors: Vec::new(),
            }],
            total_amount: Amount(total),
            currency: Currency::gbp(),
            conditions: Vec::new(),
            expires_at: 0,
            factor_summary: None,
            milestone_specs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn send_reaches_peer_and_observer_not_sender() {
        let (bus, mut observer) = InterAgentBus::new();
        let mut alice_inbox = bus.register(user("alice"));
        let mut bob_inbox = bus.register(user("bob"));

        bus.send(&AgentMessage::AgentAccept {
            negotiation_id: NegotiationId::generate(),
            from_agent: user("alice"),
        });

        assert_eq!(
            bob_inbox.recv().await.unwrap().from_agent().as_str(),
            "alice"
        );
        assert_eq!(
            observer.recv().await.unwrap().from_agent().as_str(),
            "alice"
        );
        assert!(alice_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn delivery_preserves_send_order() {
        let (bus, _observer) = InterAgentBus::new();
        bus.register(user("alice"));
        let mut bob_inbox = bus.register(user("bob"));
        let negotiation_id = NegotiationId::generate();

        for amount in [100, 200, 300] {
            bus.send(&AgentMessage::AgentCounter {
                negotiation_id: negotiation_id.clone(),
                from_agent: user("alice"),
                proposal: proposal(amount),
                reason: None,
            });
        }

        for expected in [100, 200, 300] {
            match bob_inbox.recv().await.unwrap() {
                AgentMessage::AgentCounter { proposal, .. } => {
                    assert_eq!(proposal.total_amount, Amount(expected));
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn sender_mutation_after_send_is_invisible_to_receiver() {
        let (bus, _observer) = InterAgentBus::new();
        bus.register(user("alice"));
        let mut bob_inbox = bus.register(user("bob"));

        let mut message = AgentMessage::AgentCounter {
            negotiation_id: NegotiationId::generate(),
            from_agent: user("alice"),
            proposal: proposal(500),
            reason: None,
        };
        bus.send(&message);

        // Mutate the sender's copy after the send.
        if let AgentMessage::AgentCounter { proposal, .. } = &mut message {
            proposal.total_amount = Amount(1);
            proposal.line_items[0].amount = Amount(1);
        }

        match bob_inbox.recv().await.unwrap() {
            AgentMessage::AgentCounter { proposal, .. } => {
                assert_eq!(proposal.total_amount, Amount(500));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_peer_is_skipped() {
        let (bus, mut observer) = InterAgentBus::new();
        bus.register(user("alice"));
        let mut bob_inbox = bus.register(user("bob"));
        bus.unregister(&user("bob"));

        bus.send(&AgentMessage::AgentAccept {
            negotiation_id: NegotiationId::generate(),
            from_agent: user("alice"),
        });
        assert!(bob_inbox.try_recv().is_err());
        assert!(observer.recv().await.is_some());
    }
}
