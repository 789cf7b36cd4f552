use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::money::{Amount, Currency};
use crate::error::{AccordResult, NegotiationError};

/// How a line item is settled once the agreement is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LineItemKind {
    /// Paid in full on signing.
    Immediate,
    /// Held at the worst-case amount; captured after milestone verification.
    Escrow,
    /// Like escrow, but the condition gates whether it is owed at all.
    Conditional,
}

/// Direction in which an observable factor moves the final price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FactorImpact {
    Increases,
    Decreases,
    Determines,
}

/// An observable condition that determines where in a price range the final
/// capture lands (e.g. "pipe corrosion found behind the panel").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFactor {
    pub name: String,
    pub description: String,
    pub impact: FactorImpact,
}

/// One priced deliverable inside a proposal.
///
/// `amount` is always the worst case. For ranged items `min_amount` and
/// `max_amount` bound the final capture; escrow holds authorize `max_amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub description: String,
    pub amount: Amount,
    #[serde(rename = "type")]
    pub kind: LineItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub factors: Vec<PriceFactor>,
}

impl LineItem {
    /// Worst-case amount an escrow hold must authorize for this item.
    pub fn hold_amount(&self) -> Amount {
        self.max_amount.unwrap_or(self.amount)
    }

    /// The capture range for ranged items; degenerate `[amount, amount]`
    /// otherwise.
    pub fn capture_range(&self) -> (Amount, Amount) {
        (
            self.min_amount.unwrap_or(self.amount),
            self.max_amount.unwrap_or(self.amount),
        )
    }

    pub fn needs_milestone(&self) -> bool {
        matches!(self.kind, LineItemKind::Escrow | LineItemKind::Conditional)
    }

    fn validate(&self, index: usize) -> AccordResult<()> {
        if self.description.trim().is_empty() {
            return Err(
                NegotiationError::InvalidProposal(format!("line item {index}: empty description"))
                    .into(),
            );
        }
        if !self.amount.is_positive() {
            return Err(NegotiationError::InvalidProposal(format!(
                "line item {index}: amount must be positive"
            ))
            .into());
        }
        if let (Some(min), Some(max)) = (self.min_amount, self.max_amount) {
            if !(min <= self.amount && self.amount <= max) {
                return Err(NegotiationError::InvalidProposal(format!(
                    "line item {index}: requires min <= amount <= max, got {} <= {} <= {}",
                    min, self.amount, max
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Completion criteria for one escrow/conditional line item, supplied by the
/// proposing agent at negotiation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneSpec {
    pub line_item_index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completion_criteria: Vec<String>,
}

/// A structured offer: ordered line items, total, conditions, expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub summary: String,
    pub line_items: Vec<LineItem>,
    pub total_amount: Amount,
    pub currency: Currency,
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Epoch milliseconds.
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub milestone_specs: Vec<MilestoneSpec>,
}

impl Proposal {
    /// Validate structural invariants. The stated total must equal the sum
    /// of the line item worst-case amounts.
    pub fn validate(&self) -> AccordResult<()> {
        if self.line_items.is_empty() {
            return Err(NegotiationError::InvalidProposal("no line items".to_string()).into());
        }
        for (index, item) in self.line_items.iter().enumerate() {
            item.validate(index)?;
        }
        let sum: Amount = self.line_items.iter().map(|li| li.amount).sum();
        if sum != self.total_amount {
            return Err(NegotiationError::InvalidProposal(format!(
                "totalAmount {} does not match line item sum {}",
                self.total_amount, sum
            ))
            .into());
        }
        for spec in &self.milestone_specs {
            if spec.line_item_index >= self.line_items.len() {
                return Err(NegotiationError::InvalidProposal(format!(
                    "milestone spec references line item {} of {}",
                    spec.line_item_index,
                    self.line_items.len()
                ))
                .into());
            }
        }
        Ok(())
    }
}
