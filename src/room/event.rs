//! The room mailbox: every state transition in a room flows through one
//! `RoomEvent` queue consumed by the supervising task, which serializes all
//! mutation. Components hold a [`RoomHandle`] and never touch room state
//! directly.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::bus::AgentMessage;
use crate::domain::ids::{DocumentId, MilestoneId, RoomId, UserId};
use crate::domain::milestone::VerificationResult;
use crate::domain::money::Amount;
use crate::domain::negotiation::Negotiation;
use crate::domain::profile::UserProfile;
use crate::domain::proposal::Proposal;
use crate::error::{AccordResult, RoomError, SystemError};
use crate::negotiation::TimerFired;
use crate::panel::ClientPanelMessage;
use crate::stt::SttEvent;
use crate::trigger::{ClassifierOutcome, SemanticBatch};

/// Everything an audio socket task needs after attaching to a room.
pub struct AudioAttachment {
    /// PCM chunks for the speech recognizer (post-framing happens roomside).
    pub stt_tx: mpsc::Sender<Bytes>,
    /// Frames from the peer's microphone, for this user's speakers.
    pub speaker_rx: mpsc::Receiver<Bytes>,
    /// Raw inbound frames are forwarded here for the peer.
    pub relay: std::sync::Arc<crate::audio::AudioRelay>,
}

pub enum RoomEvent {
    // === Membership & panel dispatch ===
    Join {
        user: UserId,
        profile: UserProfile,
        reply: oneshot::Sender<AccordResult<()>>,
    },
    Leave {
        user: UserId,
    },
    Panel {
        user: UserId,
        message: ClientPanelMessage,
    },
    AttachAudio {
        user: UserId,
        reply: oneshot::Sender<AccordResult<AudioAttachment>>,
    },
    DetachAudio {
        user: UserId,
    },

    // === Transcription ===
    Stt {
        speaker: UserId,
        event: SttEvent,
    },

    // === Trigger detection ===
    SemanticTick,
    SemanticResult {
        batch: SemanticBatch,
        outcome: Option<ClassifierOutcome>,
    },

    // === Negotiation ===
    Bus(AgentMessage),
    NegotiationTimer(TimerFired),
    CreateNegotiation {
        initiator: UserId,
        proposal: Proposal,
        reply: oneshot::Sender<AccordResult<Negotiation>>,
    },

    // === Documents ===
    DocumentRendered {
        negotiation: Negotiation,
        content: AccordResult<String>,
    },

    // === Verification ===
    VerificationFinished {
        document_id: DocumentId,
        milestone_id: MilestoneId,
        result: VerificationResult,
        captured_amount: Option<Amount>,
    },

    // === Escrow placement after signing ===
    HoldPlaced {
        document_id: DocumentId,
        milestone_id: MilestoneId,
        outcome: AccordResult<crate::domain::escrow::EscrowHold>,
    },

    // === Party-driven escrow settlement ===
    EscrowSettled {
        document_id: DocumentId,
        milestone_id: MilestoneId,
        action: EscrowAction,
        outcome: AccordResult<crate::domain::escrow::EscrowHold>,
    },

    Shutdown,
}

/// Party-driven escrow settlements that come back through the mailbox.
#[derive(Debug, Clone, Copy)]
pub enum EscrowAction {
    /// The client approved the provider's proposed final amount.
    CapturedByApproval,
    /// The provider voluntarily waived the held funds.
    ReleasedByProvider,
}

/// Cloneable address of one room's supervising task.
#[derive(Clone)]
pub struct RoomHandle {
    pub room_id: RoomId,
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomHandle {
    pub fn new(room_id: RoomId, tx: mpsc::UnboundedSender<RoomEvent>) -> Self {
        Self { room_id, tx }
    }

    /// Fire-and-forget post. Dropped silently once the room is torn down.
    pub fn post(&self, event: RoomEvent) {
        let _ = self.tx.send(event);
    }

    /// Post, reporting whether the room is still alive. Periodic tasks use
    /// this to learn when to stop.
    pub fn try_post(&self, event: RoomEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Whether the supervising task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(&self, user: UserId, profile: UserProfile) -> AccordResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomEvent::Join {
                user,
                profile,
                reply,
            })
            .map_err(|_| RoomError::ShuttingDown)?;
        rx.await.map_err(|_| RoomError::ShuttingDown)?
    }

    pub async fn attach_audio(&self, user: UserId) -> AccordResult<AudioAttachment> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomEvent::AttachAudio { user, reply })
            .map_err(|_| RoomError::ShuttingDown)?;
        rx.await.map_err(|_| RoomError::ShuttingDown)?
    }

    /// Request/response used by the `analyze_and_propose` tool. First write
    /// wins: a second active negotiation is refused.
    pub async fn create_negotiation(
        &self,
        initiator: UserId,
        proposal: Proposal,
    ) -> AccordResult<Negotiation> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomEvent::CreateNegotiation {
                initiator,
                proposal,
                reply,
            })
            .map_err(|_| RoomError::ShuttingDown)?;
        rx.await
            .map_err(|_| SystemError::ChannelClosed("room reply dropped".to_string()))?
    }
}
