use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::ids::{DocumentId, HoldId, MilestoneId};
use crate::domain::money::Amount;
use crate::domain::proposal::{LineItem, MilestoneSpec, PriceFactor};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MilestoneStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Disputed,
}

/// The verification driver's terminal decision on one milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerdictStatus {
    Passed,
    Failed,
    Disputed,
}

impl VerdictStatus {
    pub fn milestone_status(&self) -> MilestoneStatus {
        match self {
            Self::Passed => MilestoneStatus::Completed,
            Self::Failed => MilestoneStatus::Failed,
            Self::Disputed => MilestoneStatus::Disputed,
        }
    }
}

/// Evidence accumulated during a verification session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    FactorAssessment {
        condition: String,
        assessment: String,
        details: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        impact_on_price: Option<String>,
    },
    PhoneCall {
        questions: Vec<String>,
        outcome: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
    SelfAttestation {
        attestation: String,
        confidence: String,
    },
    PaymentHistory {
        search_terms: Vec<String>,
        days: u32,
        matches: usize,
        summary: String,
    },
}

/// The outcome of a verification session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub status: VerdictStatus,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<Evidence>,
}

/// A discrete, verifiable deliverable tied to one escrow/conditional line
/// item. Only the verification driver moves a milestone out of `Pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: MilestoneId,
    pub document_id: DocumentId,
    pub line_item_index: usize,
    pub description: String,
    /// Worst case; the escrow hold authorizes exactly this.
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
    pub verification_method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completion_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub factors: Vec<PriceFactor>,
    pub status: MilestoneStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_hold_id: Option<HoldId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_amount: Option<Amount>,
    /// Party confirmations collected via `confirm_milestone`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confirmations: Vec<crate::domain::ids::UserId>,
    /// Provider-proposed final amount awaiting client approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_amount: Option<Amount>,
}

impl Milestone {
    /// Derive a milestone from an escrow/conditional line item at document
    /// creation time. Completion criteria come from the proposal's milestone
    /// spec when present, otherwise a single fallback criterion equal to the
    /// line item condition.
    pub fn derive(
        document_id: DocumentId,
        line_item_index: usize,
        item: &LineItem,
        spec: Option<&MilestoneSpec>,
    ) -> Self {
        let completion_criteria = match spec {
            Some(spec) if !spec.completion_criteria.is_empty() => spec.completion_criteria.clone(),
            _ => item
                .condition
                .clone()
                .map(|c| vec![c])
                .unwrap_or_default(),
        };
        Self {
            id: MilestoneId::generate(),
            document_id,
            line_item_index,
            description: item.description.clone(),
            amount: item.hold_amount(),
            condition: item.condition.clone(),
            deliverables: spec.map(|s| s.deliverables.clone()).unwrap_or_default(),
            verification_method: spec
                .and_then(|s| s.verification_method.clone())
                .unwrap_or_else(|| "self_attestation".to_string()),
            completion_criteria,
            min_amount: item.min_amount,
            max_amount: item.max_amount,
            factors: item.factors.clone(),
            status: MilestoneStatus::Pending,
            escrow_hold_id: None,
            verification: None,
            captured_amount: None,
            confirmations: Vec::new(),
            proposed_amount: None,
        }
    }

    /// Range a recommended capture amount must fall in.
    pub fn capture_range(&self) -> (Amount, Amount) {
        (
            self.min_amount.unwrap_or(self.amount),
            self.max_amount.unwrap_or(self.amount),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::proposal::LineItemKind;

    fn escrow_item() -> LineItem {
        LineItem {
            description: "Parts".to_string(),
            amount: Amount(5_000),
            kind: LineItemKind::Escrow,
            condition: Some("parts installed and working".to_string()),
            min_amount: None,
            max_amount: None,
            factors: Vec::new(),
        }
    }

    #[test]
    fn derive_falls_back_to_condition_criterion() {
        let m = Milestone::derive(DocumentId::generate(), 1, &escrow_item(), None);
        assert_eq!(m.completion_criteria, vec!["parts installed and working"]);
        assert_eq!(m.amount, Amount(5_000));
        assert_eq!(m.status, MilestoneStatus::Pending);
    }

    #[test]
    fn derive_prefers_spec_criteria() {
        let spec = MilestoneSpec {
            line_item_index: 1,
            deliverables: vec!["receipt".to_string()],
            verification_method: Some("phone".to_string()),
            completion_criteria: vec!["client confirms".to_string()],
        };
        let m = Milestone::derive(DocumentId::generate(), 1, &escrow_item(), Some(&spec));
        assert_eq!(m.completion_criteria, vec!["client confirms"]);
        assert_eq!(m.verification_method, "phone");
        assert_eq!(m.deliverables, vec!["receipt"]);
    }

    #[test]
    fn capture_range_uses_worst_case_when_unranged() {
        let m = Milestone::derive(DocumentId::generate(), 0, &escrow_item(), None);
        assert_eq!(m.capture_range(), (Amount(5_000), Amount(5_000)));
    }
}
