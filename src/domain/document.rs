use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::ids::{DocumentId, NegotiationId, UserId};
use crate::domain::milestone::Milestone;
use crate::domain::proposal::Proposal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    PendingSignatures,
    FullySigned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub user_id: UserId,
    /// Epoch milliseconds.
    pub signed_at: i64,
}

/// A rendered agreement: frozen terms, parties, signatures, and the
/// milestones derived from escrow/conditional line items.
///
/// Status only ever advances; `FullySigned` holds exactly when every party
/// has signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    /// Rendered Markdown.
    pub content: String,
    pub negotiation_id: NegotiationId,
    pub parties: Vec<UserId>,
    /// The accepted proposal, frozen at generation time.
    pub terms: Proposal,
    pub signatures: Vec<Signature>,
    pub status: DocumentStatus,
    pub milestones: Vec<Milestone>,
    pub provider_id: UserId,
    pub client_id: UserId,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl Document {
    pub fn is_party(&self, user: &UserId) -> bool {
        self.parties.contains(user)
    }

    pub fn has_signed(&self, user: &UserId) -> bool {
        self.signatures.iter().any(|s| &s.user_id == user)
    }

    pub fn fully_signed(&self) -> bool {
        self.signatures.len() == self.parties.len()
    }
}
