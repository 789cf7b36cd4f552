//! Milestone verification: a bounded tool-using LLM session that gathers
//! evidence, renders a verdict, and drives the escrow consequences.
//!
//! The session has a 120 s hard deadline and a tool-loop depth bound of 15.
//! Exceeding either, or exiting without a verdict, yields `disputed` and
//! leaves held funds where they are.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::domain::ids::{DocumentId, UserId};
use crate::domain::milestone::{Evidence, Milestone, VerdictStatus, VerificationResult};
use crate::domain::money::Amount;
use crate::llm::{
    ChatMessage, ChatRequest, ContentBlock, LlmProvider, StopReason, ToolDefinition,
};
use crate::panel::{PanelEmitter, ServerPanelMessage};
use crate::payment::PaymentExecutor;
use crate::payment::bank::BankClient;
use crate::phone::{PhoneCallRequest, PhoneCallStatus, PhoneVerifier, run_call};

/// Hard wall-clock bound on one verification session.
pub const SESSION_DEADLINE: Duration = Duration::from_secs(120);
/// Bound on tool-call loops within the session.
pub const MAX_RECURSION_DEPTH: usize = 15;
const MAX_COMPLETION_TOKENS: u32 = 2_048;

/// What the room supervisor hands a verification session.
pub struct SessionParams {
    pub document_id: DocumentId,
    pub milestone: Milestone,
    pub requested_by: UserId,
    pub notify: Vec<UserId>,
    pub phone: Option<String>,
    pub contact_name: Option<String>,
    /// The requester's linked account, for payment-history evidence.
    pub bank_token: Option<String>,
}

/// The session's outcome: the (possibly rewritten) result plus the amount
/// actually captured, when a capture happened.
pub struct SessionOutcome {
    pub result: VerificationResult,
    pub captured_amount: Option<Amount>,
}

/// Run one verification session end to end, escrow consequences included.
pub async fn run_session(
    llm: Arc<dyn LlmProvider>,
    payments: Arc<PaymentExecutor>,
    phone: Arc<dyn PhoneVerifier>,
    bank: Arc<dyn BankClient>,
    panels: Arc<PanelEmitter>,
    params: SessionParams,
) -> SessionOutcome {
    let milestone_id = params.milestone.id.clone();
    info!(
        milestone = %milestone_id,
        document = %params.document_id,
        requested_by = %params.requested_by,
        "verification session starting"
    );

    let mut session = Session {
        phone_verifier: phone,
        bank,
        panels,
        params,
        evidence: Vec::new(),
        verdict: None,
    };

    let result = match tokio::time::timeout(SESSION_DEADLINE, session.drive(llm)).await {
        Ok(()) => match session.verdict.take() {
            Some(verdict) => VerificationResult {
                status: verdict.status,
                reasoning: verdict.reasoning,
                recommended_amount: verdict.recommended_amount,
                evidence: std::mem::take(&mut session.evidence),
            },
            None => session.disputed("Verification ended without a verdict"),
        },
        Err(_) => session.disputed("Verification timed out"),
    };

    apply_verdict(&payments, &session.params.milestone, result).await
}

/// Translate the verdict into escrow action.
async fn apply_verdict(
    payments: &PaymentExecutor,
    milestone: &Milestone,
    mut result: VerificationResult,
) -> SessionOutcome {
    let Some(hold_id) = &milestone.escrow_hold_id else {
        // Nothing held; the verdict stands on its own.
        return SessionOutcome {
            result,
            captured_amount: None,
        };
    };

    match result.status {
        VerdictStatus::Passed => {
            match payments
                .capture_escrow(hold_id, result.recommended_amount)
                .await
            {
                Ok(hold) => SessionOutcome {
                    captured_amount: hold.captured_amount,
                    result,
                },
                Err(err) => {
                    warn!(hold = %hold_id, %err, "capture failed; verdict rewritten to disputed");
                    result.status = VerdictStatus::Disputed;
                    result
                        .reasoning
                        .push_str(&format!(" [escrow capture failed: {err}]"));
                    SessionOutcome {
                        result,
                        captured_amount: None,
                    }
                }
            }
        }
        VerdictStatus::Failed => {
            if let Err(err) = payments.release_escrow(hold_id).await {
                warn!(hold = %hold_id, %err, "release failed after failed verdict");
                result
                    .reasoning
                    .push_str(&format!(" [escrow release failed: {err}]"));
            }
            SessionOutcome {
                result,
                captured_amount: None,
            }
        }
        VerdictStatus::Disputed => SessionOutcome {
            result,
            captured_amount: None,
        },
    }
}

// ================================================================================================
// The session loop
// ================================================================================================

struct Verdict {
    status: VerdictStatus,
    reasoning: String,
    recommended_amount: Option<Amount>,
}

struct Session {
    phone_verifier: Arc<dyn PhoneVerifier>,
    bank: Arc<dyn BankClient>,
    panels: Arc<PanelEmitter>,
    params: SessionParams,
    evidence: Vec<Evidence>,
    verdict: Option<Verdict>,
}

impl Session {
    fn disputed(&mut self, reasoning: &str) -> VerificationResult {
        VerificationResult {
            status: VerdictStatus::Disputed,
            reasoning: reasoning.to_string(),
            recommended_amount: None,
            evidence: std::mem::take(&mut self.evidence),
        }
    }

    async fn drive(&mut self, llm: Arc<dyn LlmProvider>) {
        let system = self.system_prompt();
        let mut conversation = vec![ChatMessage::user_text(
            "Verify this milestone now. Gather evidence with the tools, then submit_verdict.",
        )];
        let tool_defs = definitions();

        for _depth in 0..MAX_RECURSION_DEPTH {
            if self.verdict.is_some() {
                return;
            }

            let response = match llm
                .complete(ChatRequest {
                    system: system.clone(),
                    messages: conversation.clone(),
                    tools: tool_defs.clone(),
                    max_tokens: MAX_COMPLETION_TOKENS,
                })
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    warn!(%err, "verification LLM call failed");
                    return;
                }
            };

            conversation.push(ChatMessage::assistant(response.content.clone()));
            if response.stop_reason != StopReason::ToolUse {
                return;
            }

            let mut results = Vec::new();
            for (id, name, input) in response.tool_uses() {
                let text = self.dispatch(name, input).await;
                let is_error = text.starts_with("Error:");
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id.to_string(),
                    content: text,
                    is_error,
                });
            }
            if results.is_empty() {
                return;
            }
            conversation.push(ChatMessage::tool_results(results));
        }
        warn!(milestone = %self.params.milestone.id, "verification tool loop hit depth bound");
    }

    fn system_prompt(&self) -> String {
        let m = &self.params.milestone;
        let mut prompt = format!(
            "You verify completion of one contractual milestone and decide what fraction of the \
             held amount is owed. Be evidence-driven and impartial.\n\nMilestone: {}\n\
             Verification method: {}\nHeld amount: {}\n",
            m.description, m.verification_method, m.amount
        );
        if let Some(condition) = &m.condition {
            prompt.push_str(&format!("Condition: {condition}\n"));
        }
        if !m.deliverables.is_empty() {
            prompt.push_str(&format!("Deliverables: {}\n", m.deliverables.join("; ")));
        }
        if !m.completion_criteria.is_empty() {
            prompt.push_str(&format!(
                "Completion criteria: {}\n",
                m.completion_criteria.join("; ")
            ));
        }
        if let (Some(min), Some(max)) = (m.min_amount, m.max_amount) {
            prompt.push_str(&format!(
                "Price range: {min} to {max}. recommendedAmount must fall inside it.\n"
            ));
            for factor in &m.factors {
                prompt.push_str(&format!(
                    "Factor: {} ({}) - {}\n",
                    factor.name, factor.impact, factor.description
                ));
            }
        }
        prompt.push_str(
            "\nAssess each condition, use phone_verify or payment history when they can settle a \
             question, narrate progress with send_verification_update, and finish with \
             submit_verdict (passed, failed, or disputed).",
        );
        prompt
    }

    async fn dispatch(&mut self, name: &str, args: &Value) -> String {
        let result = match name {
            "assess_condition" => self.assess_condition(args),
            "phone_verify" => self.phone_verify(args).await,
            "record_self_attestation" => self.record_self_attestation(args),
            "check_payment_history" => self.check_payment_history(args).await,
            "send_verification_update" => self.send_update(args),
            "submit_verdict" => self.submit_verdict(args),
            other => Err(format!("unknown tool '{other}'")),
        };
        match result {
            Ok(text) => text,
            Err(text) => format!("Error: {text}"),
        }
    }

    fn assess_condition(&mut self, args: &Value) -> Result<String, String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            condition_name: String,
            assessment: Assessment,
            details: String,
            #[serde(default)]
            impact_on_price: Option<String>,
        }
        #[derive(Deserialize, Debug)]
        #[serde(rename_all = "snake_case")]
        enum Assessment {
            Met,
            PartiallyMet,
            NotMet,
            UnableToAssess,
        }
        let args: Args = parse(args)?;
        self.evidence.push(Evidence::FactorAssessment {
            condition: args.condition_name,
            assessment: format!("{:?}", args.assessment).to_lowercase(),
            details: args.details,
            impact_on_price: args.impact_on_price,
        });
        Ok("assessment recorded".to_string())
    }

    async fn phone_verify(&mut self, args: &Value) -> Result<String, String> {
        #[derive(Deserialize)]
        struct Args {
            questions: Vec<String>,
        }
        let args: Args = parse(args)?;

        let Some(phone) = self.params.phone.clone() else {
            // No number bound: a clearly-simulated result keeps the loop
            // honest without dialing anyone.
            self.evidence.push(Evidence::PhoneCall {
                questions: args.questions,
                outcome: "simulated: no phone number bound to this session".to_string(),
                transcript: None,
            });
            return Ok("No phone number bound; simulated result recorded.".to_string());
        };

        let request = PhoneCallRequest {
            phone,
            contact_name: self.params.contact_name.clone(),
            questions: args.questions.clone(),
        };
        match run_call(self.phone_verifier.as_ref(), &request).await {
            Ok(PhoneCallStatus::Done {
                summary,
                transcript,
            }) => {
                self.evidence.push(Evidence::PhoneCall {
                    questions: args.questions,
                    outcome: summary.clone(),
                    transcript,
                });
                Ok(format!("Call complete: {summary}"))
            }
            Ok(PhoneCallStatus::Failed { reason }) => {
                self.evidence.push(Evidence::PhoneCall {
                    questions: args.questions,
                    outcome: format!("failed: {reason}"),
                    transcript: None,
                });
                Ok(format!("Call failed: {reason}"))
            }
            Ok(PhoneCallStatus::InProgress) => Err("call provider returned a non-terminal status".to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    fn record_self_attestation(&mut self, args: &Value) -> Result<String, String> {
        #[derive(Deserialize)]
        struct Args {
            attestation: String,
            confidence: Confidence,
        }
        #[derive(Deserialize, Debug)]
        #[serde(rename_all = "snake_case")]
        enum Confidence {
            High,
            Medium,
            Low,
        }
        let args: Args = parse(args)?;
        self.evidence.push(Evidence::SelfAttestation {
            attestation: args.attestation,
            confidence: format!("{:?}", args.confidence).to_lowercase(),
        });
        Ok("attestation recorded".to_string())
    }

    async fn check_payment_history(&mut self, args: &Value) -> Result<String, String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            search_terms: Vec<String>,
            #[serde(default = "default_days")]
            days: u32,
        }
        fn default_days() -> u32 {
            30
        }
        let args: Args = parse(args)?;

        let token = self
            .params
            .bank_token
            .as_deref()
            .ok_or("requester has no linked bank account")?;
        let transactions = self
            .bank
            .search_transactions(token, &args.search_terms, args.days)
            .await
            .map_err(|e| e.to_string())?;

        let summary = if transactions.is_empty() {
            format!("no matching transactions in the last {} days", args.days)
        } else {
            transactions
                .iter()
                .map(|t| format!("{} ({})", t.description, t.amount))
                .collect::<Vec<_>>()
                .join("; ")
        };
        self.evidence.push(Evidence::PaymentHistory {
            search_terms: args.search_terms,
            days: args.days,
            matches: transactions.len(),
            summary: summary.clone(),
        });
        Ok(summary)
    }

    fn send_update(&mut self, args: &Value) -> Result<String, String> {
        #[derive(Deserialize)]
        struct Args {
            step: String,
            message: String,
        }
        let args: Args = parse(args)?;
        for user in &self.params.notify {
            self.panels.send(
                user,
                ServerPanelMessage::Verification {
                    milestone_id: self.params.milestone.id.clone(),
                    step: args.step.clone(),
                    message: args.message.clone(),
                },
            );
        }
        Ok("update sent".to_string())
    }

    fn submit_verdict(&mut self, args: &Value) -> Result<String, String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            status: VerdictStatus,
            reasoning: String,
            #[serde(default)]
            recommended_amount: Option<i64>,
        }
        let args: Args = parse(args)?;

        let recommended = args.recommended_amount.map(Amount);
        if let Some(amount) = recommended {
            let (min, max) = self.params.milestone.capture_range();
            if amount < min || amount > max {
                return Err(format!(
                    "recommendedAmount {amount} outside [{min}, {max}]; pick a value in range"
                ));
            }
        }

        self.verdict = Some(Verdict {
            status: args.status,
            reasoning: args.reasoning,
            recommended_amount: recommended,
        });
        Ok("verdict recorded".to_string())
    }
}

fn parse<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, String> {
    serde_json::from_value(args.clone()).map_err(|e| format!("invalid arguments: {e}"))
}

fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "assess_condition".to_string(),
            description: "Record an assessment of one completion condition or price factor."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["conditionName", "assessment", "details"],
                "properties": {
                    "conditionName": {"type": "string"},
                    "assessment": {"type": "string", "enum": ["met", "partially_met", "not_met", "unable_to_assess"]},
                    "details": {"type": "string"},
                    "impactOnPrice": {"type": "string"}
                }
            }),
        },
        ToolDefinition {
            name: "phone_verify".to_string(),
            description: "Place an AI-driven call to the bound contact and ask the given \
                          questions. Simulated when no number is bound."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["questions"],
                "properties": {"questions": {"type": "array", "items": {"type": "string"}}}
            }),
        },
        ToolDefinition {
            name: "record_self_attestation".to_string(),
            description: "Record the requester's own claim about completion.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["attestation", "confidence"],
                "properties": {
                    "attestation": {"type": "string"},
                    "confidence": {"type": "string", "enum": ["high", "medium", "low"]}
                }
            }),
        },
        ToolDefinition {
            name: "check_payment_history".to_string(),
            description: "Search the requester's bank transactions for matching activity."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["searchTerms"],
                "properties": {
                    "searchTerms": {"type": "array", "items": {"type": "string"}},
                    "days": {"type": "integer", "default": 30}
                }
            }),
        },
        ToolDefinition {
            name: "send_verification_update".to_string(),
            description: "Push a progress line to the participants' panels.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["step", "message"],
                "properties": {
                    "step": {"type": "string"},
                    "message": {"type": "string"}
                }
            }),
        },
        ToolDefinition {
            name: "submit_verdict".to_string(),
            description: "Terminal: record the verdict. recommendedAmount (minor units) must \
                          fall within the milestone's price range."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["status", "reasoning"],
                "properties": {
                    "status": {"type": "string", "enum": ["passed", "failed", "disputed"]},
                    "reasoning": {"type": "string"},
                    "recommendedAmount": {"type": "integer"}
                }
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::milestone::MilestoneStatus;
    use crate::domain::proposal::{LineItem, LineItemKind};

    fn milestone(min: Option<i64>, max: Option<i64>) -> Milestone {
        let item = LineItem {
            description: "Parts".to_string(),
            amount: Amount(max.unwrap_or(5_000)),
            kind: LineItemKind::Escrow,
            condition: Some("installed".to_string()),
            min_amount: min.map(Amount),
            max_amount: max.map(Amount),
            factors: Vec::new(),
        };
        Milestone::derive(DocumentId::generate(), 0, &item, None)
    }

    fn session(m: Milestone) -> Session {
        Session {
            phone_verifier: Arc::new(crate::phone::SimulatedPhone),
            bank: Arc::new(crate::payment::bank::UnconfiguredBank),
            panels: Arc::new(PanelEmitter::new()),
            params: SessionParams {
                document_id: DocumentId::generate(),
                milestone: m,
                requested_by: UserId::parse("alice").unwrap(),
                notify: vec![UserId::parse("alice").unwrap()],
                phone: None,
                contact_name: None,
                bank_token: None,
            },
            evidence: Vec::new(),
            verdict: None,
        }
    }

    #[tokio::test]
    async fn out_of_range_verdict_is_rejected_as_text() {
        let mut s = session(milestone(Some(30_000), Some(80_000)));
        let text = s
            .dispatch(
                "submit_verdict",
                &json!({"status": "passed", "reasoning": "done", "recommendedAmount": 100_000}),
            )
            .await;
        assert!(text.starts_with("Error:"));
        assert!(s.verdict.is_none());
    }

    #[tokio::test]
    async fn in_range_verdict_is_recorded() {
        let mut s = session(milestone(Some(30_000), Some(80_000)));
        let text = s
            .dispatch(
                "submit_verdict",
                &json!({"status": "passed", "reasoning": "done", "recommendedAmount": 45_000}),
            )
            .await;
        assert_eq!(text, "verdict recorded");
        let verdict = s.verdict.unwrap();
        assert_eq!(verdict.status, VerdictStatus::Passed);
        assert_eq!(verdict.recommended_amount, Some(Amount(45_000)));
    }

    #[tokio::test]
    async fn phone_verify_without_number_is_simulated() {
        let mut s = session(milestone(None, None));
        let text = s
            .dispatch("phone_verify", &json!({"questions": ["done?"]}))
            .await;
        assert!(text.contains("simulated") || text.contains("No phone number"));
        assert_eq!(s.evidence.len(), 1);
    }

    #[tokio::test]
    async fn assessment_and_attestation_record_evidence() {
        let mut s = session(milestone(None, None));
        s.dispatch(
            "assess_condition",
            &json!({"conditionName": "installed", "assessment": "met", "details": "photos shown"}),
        )
        .await;
        s.dispatch(
            "record_self_attestation",
            &json!({"attestation": "work finished yesterday", "confidence": "high"}),
        )
        .await;
        assert_eq!(s.evidence.len(), 2);
    }

    #[test]
    fn verdict_status_maps_to_milestone_status() {
        assert_eq!(
            VerdictStatus::Passed.milestone_status(),
            MilestoneStatus::Completed
        );
        assert_eq!(
            VerdictStatus::Failed.milestone_status(),
            MilestoneStatus::Failed
        );
        assert_eq!(
            VerdictStatus::Disputed.milestone_status(),
            MilestoneStatus::Disputed
        );
    }
}
