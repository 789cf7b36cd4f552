//! Shared doubles and helpers for the integration scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use accord::domain::ids::UserId;
use accord::domain::money::Amount;
use accord::domain::profile::UserProfile;
use accord::error::{AccordResult, PaymentError};
use accord::panel::{PanelFrame, ServerPanelMessage};
use accord::payment::provider::{IntentOutcome, IntentRequest, PaymentProvider};
use accord::{ChatRequest, ChatResponse, ContentBlock, LlmProvider, StopReason};

// ================================================================================================
// Scripted LLM
// ================================================================================================

type Router = dyn Fn(&ChatRequest) -> ChatResponse + Send + Sync;

/// An LLM whose answers are computed by a test-supplied router over the
/// request. One instance serves agents, the classifier, document generation
/// and verification; the router distinguishes them by prompt content.
pub struct ScriptedLlm {
    router: Box<Router>,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(router: impl Fn(&ChatRequest) -> ChatResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            router: Box::new(router),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, request: ChatRequest) -> AccordResult<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.router)(&request))
    }
}

/// Response helpers.
pub fn end_turn(text: &str) -> ChatResponse {
    ChatResponse {
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        stop_reason: StopReason::EndTurn,
    }
}

pub fn tool_use(name: &str, input: serde_json::Value) -> ChatResponse {
    ChatResponse {
        content: vec![ContentBlock::ToolUse {
            id: format!("call_{name}"),
            name: name.to_string(),
            input,
        }],
        stop_reason: StopReason::ToolUse,
    }
}

/// True when the latest message is a tool-result turn (the model already
/// acted and is being shown the outcome).
pub fn last_is_tool_result(request: &ChatRequest) -> bool {
    request
        .messages
        .last()
        .is_some_and(|m| {
            m.content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
        })
}

/// Text of the latest message, tool results included.
pub fn last_text(request: &ChatRequest) -> String {
    request
        .messages
        .last()
        .map(|m| {
            m.content
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::ToolResult { content, .. } => content.clone(),
                    ContentBlock::ToolUse { .. } => String::new(),
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Pull the embedded JSON payload out of an injected bus-message turn.
pub fn embedded_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    serde_json::from_str(&text[start..=end]).ok()
}

// ================================================================================================
// Payment provider double
// ================================================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    Confirmed { amount: i64 },
    ManualCapture { amount: i64 },
    Capture { intent: String, amount: Option<i64> },
    Cancel { intent: String },
}

/// In-memory payment provider that records every call and can be told to
/// fail captures.
#[derive(Default)]
pub struct FakePaymentProvider {
    pub calls: Mutex<Vec<ProviderCall>>,
    counter: AtomicUsize,
    pub fail_captures: std::sync::atomic::AtomicBool,
}

impl FakePaymentProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PaymentProvider for FakePaymentProvider {
    async fn create_confirmed_intent(&self, request: &IntentRequest) -> AccordResult<IntentOutcome> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(ProviderCall::Confirmed {
            amount: request.amount.into(),
        });
        Ok(IntentOutcome {
            payment_intent_id: format!("pi_{n}"),
            transfer_id: Some(format!("tr_{n}")),
        })
    }

    async fn create_manual_capture_intent(
        &self,
        request: &IntentRequest,
    ) -> AccordResult<IntentOutcome> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(ProviderCall::ManualCapture {
            amount: request.amount.into(),
        });
        Ok(IntentOutcome {
            payment_intent_id: format!("pi_{n}"),
            transfer_id: None,
        })
    }

    async fn capture_intent(
        &self,
        payment_intent_id: &str,
        amount: Option<Amount>,
    ) -> AccordResult<Amount> {
        if self.fail_captures.load(Ordering::SeqCst) {
            return Err(PaymentError::Declined("card issuer said no".to_string()).into());
        }
        self.calls.lock().push(ProviderCall::Capture {
            intent: payment_intent_id.to_string(),
            amount: amount.map(Into::into),
        });
        Ok(amount.unwrap_or(Amount(0)))
    }

    async fn cancel_intent(&self, payment_intent_id: &str) -> AccordResult<()> {
        self.calls.lock().push(ProviderCall::Cancel {
            intent: payment_intent_id.to_string(),
        });
        Ok(())
    }
}

// ================================================================================================
// Profiles & panel draining
// ================================================================================================

pub fn user(raw: &str) -> UserId {
    UserId::parse(raw).unwrap()
}

pub fn provider_profile(id: &str, name: &str) -> UserProfile {
    let mut profile = UserProfile::default_for(user(id));
    profile.display_name = name.to_string();
    profile.role = Some("plumber".to_string());
    profile.payout_account_id = Some("acct_provider".to_string());
    profile
}

pub fn client_profile(id: &str, name: &str) -> UserProfile {
    let mut profile = UserProfile::default_for(user(id));
    profile.display_name = name.to_string();
    profile.role = Some("homeowner".to_string());
    profile
}

/// Wait (bounded) for the next panel message matching the predicate,
/// discarding everything else.
pub async fn await_panel<F>(
    rx: &mut mpsc::UnboundedReceiver<PanelFrame>,
    mut predicate: F,
) -> ServerPanelMessage
where
    F: FnMut(&ServerPanelMessage) -> bool,
{
    let deadline = std::time::Duration::from_secs(10);
    tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Some(PanelFrame::Message(message)) if predicate(&message) => return *message,
                Some(_) => continue,
                None => panic!("panel stream closed while waiting"),
            }
        }
    })
    .await
    .expect("panel message did not arrive in time")
}
