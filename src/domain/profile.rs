use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::ids::UserId;
use crate::domain::money::{Amount, Currency};

/// Ceiling on the number of free-text context documents per profile.
pub const MAX_CONTEXT_DOCUMENTS: usize = 5;
/// Ceiling on the size of one context document, in bytes.
pub const MAX_CONTEXT_DOCUMENT_BYTES: usize = 5 * 1024;
/// Ceiling on the display name length, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 100;

/// When an agent should prefer escrow over an immediate transfer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EscrowPreference {
    Always,
    #[default]
    AboveThreshold,
    Never,
}

/// How hard the agent bargains on its owner's behalf.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NegotiationStyle {
    Aggressive,
    #[default]
    Balanced,
    Conservative,
}

/// Hard limits and defaults the agent honors without asking its owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Preferences {
    pub max_auto_approve_amount: Amount,
    pub preferred_currency: Currency,
    pub escrow_preference: EscrowPreference,
    pub escrow_threshold: Amount,
    pub negotiation_style: NegotiationStyle,
}

/// Hourly or per-job rate range a tradesperson advertises.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateRange {
    pub min: Amount,
    pub max: Amount,
}

/// Per-user agent configuration, copied into the room on join.
///
/// The profile is the sole input to the agent's system prompt; nothing else
/// about the user is known to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub payout_account_id: Option<String>,
    #[serde(default)]
    pub bank_token: Option<String>,
    #[serde(default)]
    pub trade: Option<String>,
    #[serde(default)]
    pub experience_years: Option<u32>,
    #[serde(default)]
    pub certifications: Vec<String>,
    #[serde(default)]
    pub rate_range: Option<RateRange>,
    #[serde(default)]
    pub service_area: Option<String>,
    #[serde(default)]
    pub context_documents: Vec<String>,
}

impl UserProfile {
    /// A minimal default profile for a user who never sent `set_profile`.
    pub fn default_for(user_id: UserId) -> Self {
        Self {
            display_name: user_id.as_str().to_string(),
            user_id,
            role: None,
            custom_instructions: None,
            preferences: Preferences::default(),
            payout_account_id: None,
            bank_token: None,
            trade: None,
            experience_years: None,
            certifications: Vec::new(),
            rate_range: None,
            service_area: None,
            context_documents: Vec::new(),
        }
    }

    /// Normalize the profile in place: trim and bound the display name,
    /// clamp negative numeric fields to zero, drop oversized context
    /// documents, and normalize an invalid rate range.
    ///
    /// Enum fields arrive already validated: serde substitutes nothing, and
    /// unknown variants are rejected at parse time, so the caller falls back
    /// to defaults per field via `#[serde(default)]`.
    pub fn validated(mut self) -> Self {
        self.display_name = self.display_name.trim().to_string();
        if self.display_name.is_empty() {
            self.display_name = self.user_id.as_str().to_string();
        }
        if self.display_name.chars().count() > MAX_DISPLAY_NAME_CHARS {
            self.display_name = self
                .display_name
                .chars()
                .take(MAX_DISPLAY_NAME_CHARS)
                .collect();
        }

        if self.preferences.max_auto_approve_amount.0 < 0 {
            self.preferences.max_auto_approve_amount = Amount(0);
        }
        if self.preferences.escrow_threshold.0 < 0 {
            self.preferences.escrow_threshold = Amount(0);
        }

        if let Some(range) = &mut self.rate_range {
            if range.min.0 < 0 {
                range.min = Amount(0);
            }
            if range.max < range.min {
                range.max = range.min;
            }
        }

        self.context_documents.truncate(MAX_CONTEXT_DOCUMENTS);
        self.context_documents
            .retain(|doc| doc.len() <= MAX_CONTEXT_DOCUMENT_BYTES);

        self
    }

    /// Role keywords decide which side proposes. "provider"-flavored roles
    /// propose; everything else evaluates.
    pub fn is_provider_role(&self) -> bool {
        let role = self
            .role
            .as_deref()
            .or(self.trade.as_deref())
            .unwrap_or_default()
            .to_ascii_lowercase();
        const PROVIDER_KEYWORDS: &[&str] = &[
            "provider",
            "tradesperson",
            "contractor",
            "plumber",
            "electrician",
            "builder",
            "seller",
            "freelancer",
        ];
        PROVIDER_KEYWORDS.iter().any(|kw| role.contains(kw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> UserProfile {
        let mut p = UserProfile::default_for(UserId::parse("u1").unwrap());
        p.display_name = name.to_string();
        p
    }

    #[test]
    fn display_name_is_trimmed_and_bounded() {
        let p = profile("  Alice  ").validated();
        assert_eq!(p.display_name, "Alice");

        let p = profile(&"x".repeat(150)).validated();
        assert_eq!(p.display_name.chars().count(), MAX_DISPLAY_NAME_CHARS);
    }

    #[test]
    fn empty_display_name_falls_back_to_user_id() {
        let p = profile("   ").validated();
        assert_eq!(p.display_name, "u1");
    }

    #[test]
    fn negative_amounts_clamp_to_zero() {
        let mut p = profile("Alice");
        p.preferences.max_auto_approve_amount = Amount(-5);
        p.preferences.escrow_threshold = Amount(-1);
        let p = p.validated();
        assert_eq!(p.preferences.max_auto_approve_amount, Amount(0));
        assert_eq!(p.preferences.escrow_threshold, Amount(0));
    }

    #[test]
    fn oversized_context_documents_are_dropped() {
        let mut p = profile("Alice");
        p.context_documents = vec!["ok".to_string(), "y".repeat(MAX_CONTEXT_DOCUMENT_BYTES + 1)];
        let p = p.validated();
        assert_eq!(p.context_documents, vec!["ok".to_string()]);
    }

    #[test]
    fn provider_role_detection() {
        let mut p = profile("Alice");
        p.role = Some("Master Plumber".to_string());
        assert!(p.is_provider_role());

        let mut p = profile("Bob");
        p.role = Some("homeowner".to_string());
        assert!(!p.is_provider_role());
    }
}
