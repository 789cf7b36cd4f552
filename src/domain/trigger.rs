use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::ids::UserId;

/// Which detection path fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerKind {
    Keyword,
    Smart,
}

/// Which side of the deal the triggering speaker appears to be on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerRole {
    Proposer,
    Responder,
    #[default]
    Unclear,
}

/// The decision that the conversation contains a financial agreement
/// warranting agent activation. At most one is emitted per room lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub speaker_id: UserId,
    pub confidence: f64,
    pub matched_text: String,
    pub role: TriggerRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Deal terms the semantic classifier picked out of the conversation.
    /// Empty for keyword triggers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,
}
