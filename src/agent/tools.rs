//! The agent-side tool registry: JSON Schema definitions plus the dispatch
//! that gives every tool the uniform `(args) -> text` shape. Failures inside
//! a tool never cross the LLM boundary as errors; the model sees text and
//! recovers.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::bus::{AgentMessage, InterAgentBus};
use crate::domain::ids::NegotiationId;
use crate::domain::money::{Amount, Currency};
use crate::domain::negotiation::TOTAL_TIMEOUT_MS;
use crate::domain::now_ms;
use crate::domain::profile::UserProfile;
use crate::domain::proposal::{LineItem, MilestoneSpec, Proposal};
use crate::llm::ToolDefinition;
use crate::panel::{PanelEmitter, ServerPanelMessage};
use crate::payment::bank::BankClient;
use crate::payment::{PaymentExecutor, PaymentRequest};
use crate::room::event::RoomHandle;

/// Everything a tool handler may touch. Cloned per agent at construction.
pub struct ToolContext {
    pub room: RoomHandle,
    pub bus: Arc<InterAgentBus>,
    pub payments: Arc<PaymentExecutor>,
    pub bank: Arc<dyn BankClient>,
    pub panels: Arc<PanelEmitter>,
    /// The agent's own principal.
    pub profile: UserProfile,
    /// The counterparty, source of the payout account for transfers.
    pub peer_profile: UserProfile,
}

// ================================================================================================
// Definitions
// ================================================================================================

pub fn definitions() -> Vec<ToolDefinition> {
    let line_item_schema = json!({
        "type": "object",
        "required": ["description", "amount", "type"],
        "properties": {
            "description": {"type": "string"},
            "amount": {"type": "integer", "description": "worst case, integer minor units"},
            "type": {"type": "string", "enum": ["immediate", "escrow", "conditional"]},
            "condition": {"type": "string"},
            "minAmount": {"type": "integer"},
            "maxAmount": {"type": "integer"},
            "factors": {"type": "array", "items": {
                "type": "object",
                "required": ["name", "description", "impact"],
                "properties": {
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "impact": {"type": "string", "enum": ["increases", "decreases", "determines"]}
                }
            }}
        }
    });

    vec![
        ToolDefinition {
            name: "analyze_and_propose".to_string(),
            description: "Open the negotiation with a structured proposal built from the \
                          conversation. First write wins; if a negotiation already exists you \
                          will be told so."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["summary", "lineItems", "currency"],
                "properties": {
                    "summary": {"type": "string"},
                    "lineItems": {"type": "array", "items": line_item_schema},
                    "currency": {"type": "string", "description": "3-letter code"},
                    "conditions": {"type": "array", "items": {"type": "string"}},
                    "factorSummary": {"type": "string"},
                    "milestones": {"type": "array", "items": {
                        "type": "object",
                        "required": ["lineItemIndex"],
                        "properties": {
                            "lineItemIndex": {"type": "integer"},
                            "deliverables": {"type": "array", "items": {"type": "string"}},
                            "verificationMethod": {"type": "string"},
                            "completionCriteria": {"type": "array", "items": {"type": "string"}}
                        }
                    }}
                }
            }),
        },
        ToolDefinition {
            name: "evaluate_proposal".to_string(),
            description: "Answer the current proposal: accept, counter (with a full replacement \
                          proposal), or reject."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["negotiationId", "decision"],
                "properties": {
                    "negotiationId": {"type": "string"},
                    "decision": {"type": "string", "enum": ["accept", "counter", "reject"]},
                    "reason": {"type": "string"},
                    "counterProposal": {
                        "type": "object",
                        "required": ["summary", "lineItems", "currency"],
                        "properties": {
                            "summary": {"type": "string"},
                            "lineItems": {"type": "array", "items": line_item_schema},
                            "currency": {"type": "string"},
                            "conditions": {"type": "array", "items": {"type": "string"}}
                        }
                    }
                }
            }),
        },
        ToolDefinition {
            name: "execute_payment".to_string(),
            description: "Transfer immediately to the counterparty's payout account.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["amount", "currency", "description"],
                "properties": {
                    "amount": {"type": "integer"},
                    "currency": {"type": "string"},
                    "description": {"type": "string"}
                }
            }),
        },
        ToolDefinition {
            name: "create_escrow_hold".to_string(),
            description: "Place a manual-capture hold at the worst-case amount.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["amount", "currency", "description"],
                "properties": {
                    "amount": {"type": "integer"},
                    "currency": {"type": "string"},
                    "description": {"type": "string"}
                }
            }),
        },
        ToolDefinition {
            name: "capture_escrow".to_string(),
            description: "Capture a held escrow, in part or in full.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["holdId"],
                "properties": {
                    "holdId": {"type": "string"},
                    "amount": {"type": "integer", "description": "omit to capture the full authorization"}
                }
            }),
        },
        ToolDefinition {
            name: "release_escrow".to_string(),
            description: "Cancel a held escrow, returning the authorization.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["holdId"],
                "properties": {"holdId": {"type": "string"}}
            }),
        },
        ToolDefinition {
            name: "check_balance".to_string(),
            description: "Look up the principal's linked bank balance.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "send_message_to_user".to_string(),
            description: "Show a short update on the principal's panel.".to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["text"],
                "properties": {"text": {"type": "string"}}
            }),
        },
    ]
}

// ================================================================================================
// Dispatch
// ================================================================================================

/// Run one tool call. Always returns text; `Err`-shaped outcomes are
/// rendered into the text so the model can read and recover.
pub async fn dispatch(ctx: &ToolContext, name: &str, args: &Value) -> String {
    debug!(tool = name, user = %ctx.profile.user_id, "tool dispatched");
    let result = match name {
        "analyze_and_propose" => analyze_and_propose(ctx, args).await,
        "evaluate_proposal" => evaluate_proposal(ctx, args).await,
        "execute_payment" => execute_payment(ctx, args).await,
        "create_escrow_hold" => create_escrow_hold(ctx, args).await,
        "capture_escrow" => capture_escrow(ctx, args).await,
        "release_escrow" => release_escrow(ctx, args).await,
        "check_balance" => check_balance(ctx).await,
        "send_message_to_user" => send_message_to_user(ctx, args),
        other => Err(format!("unknown tool '{other}'")),
    };
    match result {
        Ok(text) => text,
        Err(text) => format!("Error: {text}"),
    }
}

type ToolResult = Result<String, String>;

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, String> {
    serde_json::from_value(args.clone()).map_err(|e| format!("invalid arguments: {e}"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProposeArgs {
    summary: String,
    line_items: Vec<LineItem>,
    currency: String,
    #[serde(default)]
    conditions: Vec<String>,
    #[serde(default)]
    factor_summary: Option<String>,
    #[serde(default)]
    milestones: Vec<MilestoneSpec>,
}

fn build_proposal(args: ProposeArgs) -> Result<Proposal, String> {
    let currency = Currency::parse(&args.currency).map_err(|e| e.to_string())?;
    let total: Amount = args.line_items.iter().map(|li| li.amount).sum();
    let proposal = Proposal {
        summary: args.summary,
        line_items: args.line_items,
        total_amount: total,
        currency,
        conditions: args.conditions,
        expires_at: now_ms() + TOTAL_TIMEOUT_MS as i64,
        factor_summary: args.factor_summary,
        milestone_specs: args.milestones,
    };
    proposal.validate().map_err(|e| e.to_string())?;
    Ok(proposal)
}

async fn analyze_and_propose(ctx: &ToolContext, args: &Value) -> ToolResult {
    let proposal = build_proposal(parse_args::<ProposeArgs>(args)?)?;
    let negotiation = ctx
        .room
        .create_negotiation(ctx.profile.user_id.clone(), proposal.clone())
        .await
        .map_err(|e| e.to_string())?;

    ctx.bus.send(&AgentMessage::AgentProposal {
        negotiation_id: negotiation.id.clone(),
        from_agent: ctx.profile.user_id.clone(),
        proposal,
    });

    Ok(json!({
        "negotiationId": negotiation.id,
        "status": negotiation.status,
        "totalAmount": negotiation.current_proposal.total_amount,
        "currency": negotiation.current_proposal.currency,
    })
    .to_string())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateArgs {
    negotiation_id: String,
    decision: Decision,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    counter_proposal: Option<ProposeArgs>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Decision {
    Accept,
    Counter,
    Reject,
}

async fn evaluate_proposal(ctx: &ToolContext, args: &Value) -> ToolResult {
    let args: EvaluateArgs = parse_args(args)?;
    let negotiation_id = NegotiationId::from_raw(args.negotiation_id);
    let from_agent = ctx.profile.user_id.clone();

    let message = match args.decision {
        Decision::Accept => AgentMessage::AgentAccept {
            negotiation_id,
            from_agent,
        },
        Decision::Reject => AgentMessage::AgentReject {
            negotiation_id,
            from_agent,
            reason: args.reason,
        },
        Decision::Counter => {
            let counter = args
                .counter_proposal
                .ok_or("counter decision requires counterProposal")?;
            AgentMessage::AgentCounter {
                negotiation_id,
                from_agent,
                proposal: build_proposal(counter)?,
                reason: args.reason,
            }
        }
    };

    ctx.bus.send(&message);
    Ok("decision sent".to_string())
}

#[derive(Deserialize)]
struct MoneyArgs {
    amount: i64,
    currency: String,
    description: String,
}

fn payment_request(ctx: &ToolContext, args: MoneyArgs) -> Result<PaymentRequest, String> {
    let recipient = ctx
        .peer_profile
        .payout_account_id
        .clone()
        .ok_or("counterparty has no payout account linked")?;
    Ok(PaymentRequest {
        amount: Amount(args.amount),
        currency: Currency::parse(&args.currency).map_err(|e| e.to_string())?,
        recipient_account_id: recipient,
        description: args.description,
    })
}

async fn execute_payment(ctx: &ToolContext, args: &Value) -> ToolResult {
    let request = payment_request(ctx, parse_args(args)?)?;
    let description = request.description.clone();
    let amount = request.amount;
    let currency = request.currency.clone();

    let result = ctx.payments.execute_payment(request).await;
    if result.success {
        let receipt = ServerPanelMessage::PaymentReceipt {
            description,
            amount,
            currency: currency.to_string(),
            payment_intent_id: result.payment_intent_id.clone(),
        };
        ctx.panels.send(&ctx.profile.user_id, receipt.clone());
        ctx.panels.send(&ctx.peer_profile.user_id, receipt);
    }
    serde_json::to_string(&result).map_err(|e| e.to_string())
}

async fn create_escrow_hold(ctx: &ToolContext, args: &Value) -> ToolResult {
    let request = payment_request(ctx, parse_args(args)?)?;
    let hold = ctx
        .payments
        .create_escrow_hold(request)
        .await
        .map_err(|e| e.to_string())?;
    ctx.panels.send(
        &ctx.profile.user_id,
        ServerPanelMessage::Execution {
            description: format!(
                "Escrow hold {} placed for {} {}",
                hold.hold_id, hold.amount, hold.currency
            ),
        },
    );
    serde_json::to_string(&hold).map_err(|e| e.to_string())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureArgs {
    hold_id: String,
    #[serde(default)]
    amount: Option<i64>,
}

async fn capture_escrow(ctx: &ToolContext, args: &Value) -> ToolResult {
    let args: CaptureArgs = parse_args(args)?;
    let hold = ctx
        .payments
        .capture_escrow(
            &crate::domain::ids::HoldId::from_raw(args.hold_id),
            args.amount.map(Amount),
        )
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_string(&hold).map_err(|e| e.to_string())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseArgs {
    hold_id: String,
}

async fn release_escrow(ctx: &ToolContext, args: &Value) -> ToolResult {
    let args: ReleaseArgs = parse_args(args)?;
    let hold = ctx
        .payments
        .release_escrow(&crate::domain::ids::HoldId::from_raw(args.hold_id))
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_string(&hold).map_err(|e| e.to_string())
}

async fn check_balance(ctx: &ToolContext) -> ToolResult {
    let token = ctx
        .profile
        .bank_token
        .as_deref()
        .ok_or("no bank account linked")?;
    let balance = ctx
        .bank
        .balance(token)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_string(&balance).map_err(|e| e.to_string())
}

fn send_message_to_user(ctx: &ToolContext, args: &Value) -> ToolResult {
    #[derive(Deserialize)]
    struct TextArgs {
        text: String,
    }
    let args: TextArgs = parse_args(args)?;
    ctx.panels.send(
        &ctx.profile.user_id,
        ServerPanelMessage::Agent { text: args.text },
    );
    Ok("delivered".to_string())
}
