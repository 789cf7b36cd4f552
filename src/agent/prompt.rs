//! System-prompt construction for the per-participant agents.

use crate::domain::profile::UserProfile;
use crate::domain::trigger::TriggerEvent;

/// Which side of the negotiation this agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// Opens with `analyze_and_propose` once triggered.
    Proposer,
    /// Waits for the proposal and answers with `evaluate_proposal`.
    Responder,
}

/// Derive the role from profile role keywords: providers propose, everyone
/// else evaluates.
pub fn derive_role(profile: &UserProfile) -> AgentRole {
    if profile.is_provider_role() {
        AgentRole::Proposer
    } else {
        AgentRole::Responder
    }
}

pub fn build_system_prompt(
    profile: &UserProfile,
    peer_name: &str,
    role: AgentRole,
) -> String {
    let mut prompt = format!(
        "You are the autonomous negotiation agent acting for {name}. You listen to a live \
         conversation between {name} and {peer_name}, and once a financial agreement is on the \
         table you negotiate structured terms on {name}'s behalf using the tools provided. All \
         amounts are integer minor units (pence).\n",
        name = profile.display_name,
        peer_name = peer_name,
    );

    match role {
        AgentRole::Proposer => prompt.push_str(
            "\nYour side provides the work. When handed the trigger context, analyze the \
             conversation and call analyze_and_propose with concrete line items. Use escrow line \
             items for amounts that depend on conditions discoverable only during the work; give \
             those a price range and named factors.\n",
        ),
        AgentRole::Responder => prompt.push_str(
            "\nYour side pays for the work. When a proposal or counter-offer arrives, evaluate \
             it against your principal's interests and call evaluate_proposal with accept, \
             counter, or reject. Counter with a full replacement proposal.\n",
        ),
    }

    let prefs = &profile.preferences;
    prompt.push_str(&format!(
        "\nPrincipal's standing instructions:\n\
         - negotiation style: {}\n\
         - preferred currency: {}\n\
         - auto-approve ceiling: {} (seek confirmation above this via send_message_to_user)\n\
         - escrow preference: {} (threshold {})\n",
        prefs.negotiation_style,
        prefs.preferred_currency,
        prefs.max_auto_approve_amount,
        prefs.escrow_preference,
        prefs.escrow_threshold,
    ));

    if let Some(trade) = &profile.trade {
        prompt.push_str(&format!("- trade: {trade}\n"));
    }
    if let Some(years) = profile.experience_years {
        prompt.push_str(&format!("- experience: {years} years\n"));
    }
    if !profile.certifications.is_empty() {
        prompt.push_str(&format!(
            "- certifications: {}\n",
            profile.certifications.join(", ")
        ));
    }
    if let Some(range) = &profile.rate_range {
        prompt.push_str(&format!("- rate range: {}-{}\n", range.min, range.max));
    }
    if let Some(area) = &profile.service_area {
        prompt.push_str(&format!("- service area: {area}\n"));
    }

    if let Some(instructions) = &profile.custom_instructions {
        prompt.push_str(&format!("\nCustom instructions:\n{instructions}\n"));
    }

    for (index, doc) in profile.context_documents.iter().enumerate() {
        prompt.push_str(&format!("\nContext document {}:\n{doc}\n", index + 1));
    }

    prompt.push_str(
        "\nTool failures come back as text; read them and adjust rather than repeating the same \
         call. Never invent payment details. Keep send_message_to_user updates short.",
    );
    prompt
}

/// The synthetic turn injected when the trigger fires, replacing whatever
/// batch was pending.
pub fn trigger_handoff(event: &TriggerEvent, conversation: &str, role: AgentRole) -> String {
    let mut message = format!(
        "AGREEMENT DETECTED ({}, confidence {:.2}, speaker {}, role {}).\n",
        event.kind, event.confidence, event.speaker_id, event.role
    );
    if let Some(summary) = &event.summary {
        message.push_str(&format!("Summary: {summary}\n"));
    }
    if !event.terms.is_empty() {
        message.push_str(&format!("Terms mentioned: {}\n", event.terms.join("; ")));
    }
    message.push_str(&format!(
        "Matched utterance: {}\n\nFull conversation so far:\n{}\n\n",
        event.matched_text, conversation
    ));
    match role {
        AgentRole::Proposer => message.push_str(
            "Analyze the conversation and open the negotiation with analyze_and_propose now.",
        ),
        AgentRole::Responder => message.push_str(
            "The counterparty's agent is drafting a proposal. Wait for it; you will be asked to \
             evaluate.",
        ),
    }
    message
}
