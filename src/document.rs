//! Document generation, the signing quorum, and milestone derivation.
//!
//! Generation is a prompt-composition plus one LLM call; the store itself is
//! synchronous and owned by the room supervisor, so the call is offloaded by
//! the caller and the rendered Markdown handed back in.

use std::collections::HashMap;

use tracing::info;

use crate::domain::document::{Document, DocumentStatus, Signature};
use crate::domain::ids::{DocumentId, MilestoneId, UserId};
use crate::domain::milestone::Milestone;
use crate::domain::negotiation::Negotiation;
use crate::domain::now_ms;
use crate::error::{AccordResult, DocumentError};
use crate::llm::{ChatMessage, ChatRequest, LlmProvider};

/// Tail of the spoken conversation included in the generation prompt.
pub const CONVERSATION_TAIL_CHARS: usize = 2_000;

/// One party as the document prompt sees it.
#[derive(Debug, Clone)]
pub struct Party {
    pub user_id: UserId,
    pub display_name: String,
}

/// What a successful signature did.
#[derive(Debug, Clone)]
pub enum SignOutcome {
    /// Signature recorded; more parties outstanding.
    Signed(Document),
    /// This signature completed the quorum.
    FullySigned(Document),
    /// The user had already signed; nothing changed.
    AlreadyRecorded(Document),
}

#[derive(Default)]
pub struct DocumentStore {
    documents: HashMap<DocumentId, Document>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    pub fn get_mut(&mut self, id: &DocumentId) -> Option<&mut Document> {
        self.documents.get_mut(id)
    }

    /// Build the document from an accepted negotiation and the rendered
    /// Markdown. Milestones are derived here, one per escrow/conditional
    /// line item, and the terms are frozen.
    pub fn create(
        &mut self,
        negotiation: &Negotiation,
        parties: &[Party],
        provider_id: UserId,
        client_id: UserId,
        content: String,
    ) -> &Document {
        let id = DocumentId::generate();
        let terms = negotiation.current_proposal.clone();

        let milestones: Vec<Milestone> = terms
            .line_items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.needs_milestone())
            .map(|(index, item)| {
                let spec = terms
                    .milestone_specs
                    .iter()
                    .find(|s| s.line_item_index == index);
                Milestone::derive(id.clone(), index, item, spec)
            })
            .collect();

        let document = Document {
            id: id.clone(),
            title: format!("Agreement: {}", terms.summary),
            content,
            negotiation_id: negotiation.id.clone(),
            parties: parties.iter().map(|p| p.user_id.clone()).collect(),
            terms,
            signatures: Vec::new(),
            status: DocumentStatus::PendingSignatures,
            milestones,
            provider_id,
            client_id,
            created_at: now_ms(),
        };

        info!(
            document = %document.id,
            negotiation = %document.negotiation_id,
            milestones = document.milestones.len(),
            "document created"
        );
        self.documents.entry(id).or_insert(document)
    }

    /// Record one signature. Duplicate signatures are silently idempotent;
    /// every other violation is a distinct error.
    pub fn sign(&mut self, id: &DocumentId, user: &UserId) -> AccordResult<SignOutcome> {
        let document = self
            .documents
            .get_mut(id)
            .ok_or_else(|| DocumentError::NotFound(id.to_string()))?;

        if !document.is_party(user) {
            return Err(DocumentError::NotAParty(user.to_string()).into());
        }
        if document.has_signed(user) {
            return Ok(SignOutcome::AlreadyRecorded(document.clone()));
        }
        if document.status == DocumentStatus::FullySigned {
            return Err(DocumentError::AlreadySigned(id.to_string()).into());
        }

        document.signatures.push(Signature {
            user_id: user.clone(),
            signed_at: now_ms(),
        });

        if document.fully_signed() {
            document.status = DocumentStatus::FullySigned;
            info!(document = %document.id, "document fully signed");
            Ok(SignOutcome::FullySigned(document.clone()))
        } else {
            Ok(SignOutcome::Signed(document.clone()))
        }
    }

    pub fn milestone(
        &self,
        document_id: &DocumentId,
        milestone_id: &MilestoneId,
    ) -> AccordResult<&Milestone> {
        let document = self
            .documents
            .get(document_id)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?;
        document
            .milestones
            .iter()
            .find(|m| &m.id == milestone_id)
            .ok_or_else(|| DocumentError::MilestoneNotFound(milestone_id.to_string()).into())
    }

    pub fn milestone_mut(
        &mut self,
        document_id: &DocumentId,
        milestone_id: &MilestoneId,
    ) -> AccordResult<&mut Milestone> {
        let document = self
            .documents
            .get_mut(document_id)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?;
        document
            .milestones
            .iter_mut()
            .find(|m| &m.id == milestone_id)
            .ok_or_else(|| DocumentError::MilestoneNotFound(milestone_id.to_string()).into())
    }
}

// ================================================================================================
// Generation
// ================================================================================================

/// Compose the generation prompt: parties, line items with factor detail for
/// ranged items, milestones, conditions, and the conversation tail.
pub fn compose_generation_prompt(
    negotiation: &Negotiation,
    parties: &[Party],
    conversation: &str,
) -> String {
    let terms = &negotiation.current_proposal;
    let mut prompt = String::new();

    prompt.push_str("Draft a plain-English service agreement in Markdown.\n\n## Parties\n");
    for party in parties {
        prompt.push_str(&format!("- {} ({})\n", party.display_name, party.user_id));
    }

    prompt.push_str(&format!(
        "\n## Agreed terms\nSummary: {}\nTotal: {} {}\n\n## Line items\n",
        terms.summary, terms.total_amount, terms.currency
    ));
    for (index, item) in terms.line_items.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. {} - {} {} ({})\n",
            index + 1,
            item.description,
            item.amount,
            terms.currency,
            item.kind
        ));
        if let (Some(min), Some(max)) = (item.min_amount, item.max_amount) {
            prompt.push_str(&format!(
                "   Final price range {min}–{max}, settled on verified conditions:\n"
            ));
            for factor in &item.factors {
                prompt.push_str(&format!(
                    "   - {} ({}): {}\n",
                    factor.name, factor.impact, factor.description
                ));
            }
        }
        if let Some(condition) = &item.condition {
            prompt.push_str(&format!("   Condition: {condition}\n"));
        }
    }

    if !terms.conditions.is_empty() {
        prompt.push_str("\n## Conditions\n");
        for condition in &terms.conditions {
            prompt.push_str(&format!("- {condition}\n"));
        }
    }

    if !terms.milestone_specs.is_empty() {
        prompt.push_str("\n## Milestones\n");
        for spec in &terms.milestone_specs {
            prompt.push_str(&format!(
                "- line item {}: criteria {}\n",
                spec.line_item_index + 1,
                spec.completion_criteria.join("; ")
            ));
        }
    }

    let mut tail_start = conversation
        .len()
        .saturating_sub(CONVERSATION_TAIL_CHARS);
    // Stay on a char boundary when the tail cut lands mid-codepoint.
    while tail_start < conversation.len() && !conversation.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let tail = &conversation[tail_start..];
    if !tail.is_empty() {
        prompt.push_str("\n## Conversation context (verbatim tail)\n");
        prompt.push_str(tail);
        prompt.push('\n');
    }

    prompt.push_str(
        "\nReturn only the agreement document as Markdown: title, parties, scope, payment \
         schedule (mark escrow items and their release conditions), and signature lines.",
    );
    prompt
}

/// Render the document body. Offloaded by the room supervisor.
pub async fn render_content(
    llm: &dyn LlmProvider,
    negotiation: &Negotiation,
    parties: &[Party],
    conversation: &str,
) -> AccordResult<String> {
    let prompt = compose_generation_prompt(negotiation, parties, conversation);
    let response = llm
        .complete(ChatRequest {
            system: "You draft concise, legally-styled service agreements. Markdown only."
                .to_string(),
            messages: vec![ChatMessage::user_text(prompt)],
            tools: Vec::new(),
            max_tokens: 4_096,
        })
        .await
        .map_err(|e| DocumentError::Generation(e.to_string()))?;

    let content = response.text();
    if content.trim().is_empty() {
        return Err(DocumentError::Generation("model returned empty document".to_string()).into());
    }
    Ok(content)
}
