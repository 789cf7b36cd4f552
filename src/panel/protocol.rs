//! The JSON protocol spoken on the panel WebSocket, both directions.
//!
//! Server → client messages carry a `panel` discriminator; client → server
//! messages carry a `type` discriminator. Unknown inbound messages are
//! rejected at parse time and answered with an `error` panel message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::document::Document;
use crate::domain::ids::{DocumentId, MilestoneId, RoomId, UserId};
use crate::domain::milestone::Milestone;
use crate::domain::money::Amount;
use crate::domain::negotiation::Negotiation;
use crate::domain::transcript::TranscriptEntry;
use crate::domain::trigger::TriggerEvent;

// ================================================================================================
// Server -> Client
// ================================================================================================

/// Everything the server pushes to one participant's UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "panel", rename_all = "snake_case")]
pub enum ServerPanelMessage {
    Transcript {
        entry: TranscriptEntry,
    },
    /// A message from the user's own agent.
    Agent {
        text: String,
    },
    Negotiation {
        event: String,
        negotiation: Negotiation,
    },
    Document {
        event: String,
        document: Document,
    },
    Milestone {
        event: String,
        milestone: Milestone,
    },
    /// Tool execution progress (payments being made, escrow being held).
    Execution {
        description: String,
    },
    PaymentReceipt {
        description: String,
        amount: Amount,
        currency: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payment_intent_id: Option<String>,
    },
    Verification {
        milestone_id: MilestoneId,
        step: String,
        message: String,
    },
    Status {
        room_id: RoomId,
        members: Vec<UserId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        trigger: Option<TriggerEvent>,
    },
    Error {
        message: String,
    },
}

// ================================================================================================
// Client -> Server
// ================================================================================================

/// Everything a participant's UI may ask of the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientPanelMessage {
    /// Must precede `join_room` to take effect for agent initialization.
    SetProfile {
        profile: Value,
    },
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    SetTriggerKeyword {
        keyword: String,
    },
    SignDocument {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
    },
    ConfirmMilestone {
        #[serde(rename = "milestoneId")]
        milestone_id: MilestoneId,
        #[serde(rename = "documentId")]
        document_id: DocumentId,
    },
    ProposeMilestoneAmount {
        #[serde(rename = "milestoneId")]
        milestone_id: MilestoneId,
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        amount: Amount,
    },
    ApproveMilestoneAmount {
        #[serde(rename = "milestoneId")]
        milestone_id: MilestoneId,
        #[serde(rename = "documentId")]
        document_id: DocumentId,
    },
    ReleaseEscrow {
        #[serde(rename = "milestoneId")]
        milestone_id: MilestoneId,
        #[serde(rename = "documentId")]
        document_id: DocumentId,
    },
    VerifyMilestone {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        #[serde(rename = "milestoneId")]
        milestone_id: MilestoneId,
        #[serde(default)]
        phone: Option<String>,
        #[serde(default, rename = "contactName")]
        contact_name: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_by_type_tag() {
        let msg: ClientPanelMessage =
            serde_json::from_str(r#"{"type":"join_room","roomId":"room-1"}"#).unwrap();
        assert!(matches!(msg, ClientPanelMessage::JoinRoom { room_id } if room_id == "room-1"));

        let msg: ClientPanelMessage = serde_json::from_str(
            r#"{"type":"verify_milestone","documentId":"doc_1","milestoneId":"mls_1","phone":"+441234"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientPanelMessage::VerifyMilestone { phone: Some(_), .. }));
    }

    #[test]
    fn unknown_client_message_is_a_parse_error() {
        assert!(serde_json::from_str::<ClientPanelMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn server_messages_carry_panel_discriminator() {
        let msg = ServerPanelMessage::Error {
            message: "nope".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["panel"], "error");
    }
}
