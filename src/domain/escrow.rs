use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::ids::HoldId;
use crate::domain::money::{Amount, Currency};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    Captured,
    Released,
}

impl EscrowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Captured | Self::Released)
    }
}

/// A manual-capture pre-authorization at the worst-case amount. Funds move
/// only on capture; `Captured` and `Released` are one-way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowHold {
    pub hold_id: HoldId,
    /// Authorized maximum.
    pub amount: Amount,
    pub currency: Currency,
    pub status: EscrowStatus,
    pub payment_intent_id: String,
    pub recipient_account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_amount: Option<Amount>,
    /// Epoch milliseconds.
    pub created_at: i64,
}
