use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::ids::{NegotiationId, RoomId, UserId};
use crate::domain::proposal::Proposal;

/// Default bound on the number of rounds (including the opening proposal).
pub const MAX_ROUNDS: usize = 5;
/// Time either side has to answer the current proposal.
pub const ROUND_TIMEOUT_MS: u64 = 90_000;
/// Time the whole negotiation has from creation to a terminal state.
pub const TOTAL_TIMEOUT_MS: u64 = 300_000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NegotiationStatus {
    Proposed,
    Countering,
    Accepted,
    Rejected,
    Expired,
}

impl NegotiationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Expired)
    }
}

/// What one round did to the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RoundAction {
    Propose,
    Counter,
    Accept,
    Reject,
}

/// Why a negotiation expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExpiryReason {
    RoundLimit,
    RoundTimeout,
    TotalTimeout,
    PeerLeft,
}

/// One entry in a negotiation's history: propose, counter, accept or reject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub action: RoundAction,
    pub by: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<Proposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Epoch milliseconds.
    pub at: i64,
}

/// A bounded, twice-timed negotiation between the two room agents.
///
/// `rounds[0]` is always the initiator's `propose`; every later round is a
/// counter, accept or reject. Terminal statuses are sticky.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Negotiation {
    pub id: NegotiationId,
    pub room_id: RoomId,
    pub status: NegotiationStatus,
    pub initiator: UserId,
    pub responder: UserId,
    pub current_proposal: Proposal,
    pub rounds: Vec<Round>,
    pub max_rounds: usize,
    pub round_timeout_ms: u64,
    pub total_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_reason: Option<ExpiryReason>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

impl Negotiation {
    pub fn new(
        room_id: RoomId,
        initiator: UserId,
        responder: UserId,
        proposal: Proposal,
        now_ms: i64,
    ) -> Self {
        let opening = Round {
            action: RoundAction::Propose,
            by: initiator.clone(),
            proposal: Some(proposal.clone()),
            reason: None,
            at: now_ms,
        };
        Self {
            id: NegotiationId::generate(),
            room_id,
            status: NegotiationStatus::Proposed,
            initiator,
            responder,
            current_proposal: proposal,
            rounds: vec![opening],
            max_rounds: MAX_ROUNDS,
            round_timeout_ms: ROUND_TIMEOUT_MS,
            total_timeout_ms: TOTAL_TIMEOUT_MS,
            expiry_reason: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// The party whose turn it is to answer the current proposal.
    pub fn awaiting(&self) -> &UserId {
        match self.rounds.last() {
            Some(round) if round.by == self.initiator => &self.responder,
            _ => &self.initiator,
        }
    }
}
