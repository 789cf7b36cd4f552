use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::AppConfig;
use crate::domain::money::{Amount, Currency};
use crate::error::{AccordResult, PaymentError, TransportError};

/// A transfer the provider should create, confirmed or authorization-only.
#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub amount: Amount,
    pub currency: Currency,
    pub recipient_account_id: String,
    pub description: String,
    pub idempotency_key: String,
}

/// What the provider created.
#[derive(Debug, Clone, Deserialize)]
pub struct IntentOutcome {
    pub payment_intent_id: String,
    #[serde(default)]
    pub transfer_id: Option<String>,
}

/// The payment-processor seam. One process-wide, concurrency-safe client.
/// The provider holds the authoritative record of every intent's status;
/// local state is a cache.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create and confirm an intent that transfers to the recipient.
    async fn create_confirmed_intent(&self, request: &IntentRequest) -> AccordResult<IntentOutcome>;

    /// Create a manual-capture intent authorized at the requested amount.
    async fn create_manual_capture_intent(
        &self,
        request: &IntentRequest,
    ) -> AccordResult<IntentOutcome>;

    /// Capture a held intent, at `amount` when given, in full otherwise.
    /// Returns the captured amount.
    async fn capture_intent(
        &self,
        payment_intent_id: &str,
        amount: Option<Amount>,
    ) -> AccordResult<Amount>;

    /// Cancel a held intent, voiding the authorization.
    async fn cancel_intent(&self, payment_intent_id: &str) -> AccordResult<()>;
}

// ================================================================================================
// HTTP binding
// ================================================================================================

const API_BASE: &str = "https://api.payments.example/v1";

pub struct HttpPaymentProvider {
    client: reqwest::Client,
    secret_key: String,
    platform_account_id: String,
}

impl HttpPaymentProvider {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key: config.payment_secret_key.clone(),
            platform_account_id: config.platform_account_id.clone(),
        }
    }

    async fn post(
        &self,
        path: &str,
        idempotency_key: Option<&str>,
        body: serde_json::Value,
    ) -> AccordResult<serde_json::Value> {
        let mut request = self
            .client
            .post(format!("{API_BASE}{path}"))
            .bearer_auth(&self.secret_key)
            .json(&body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(TransportError::Http)?;
        let status = response.status();
        let value: serde_json::Value = response.json().await.map_err(TransportError::Http)?;

        if status.is_success() {
            Ok(value)
        } else {
            let message = value
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown provider error")
                .to_string();
            // 4xx is a decline the caller can surface; 5xx is provider trouble.
            if status.is_client_error() {
                Err(PaymentError::Declined(message).into())
            } else {
                Err(PaymentError::Provider(message).into())
            }
        }
    }

    fn intent_body(&self, request: &IntentRequest, manual_capture: bool) -> serde_json::Value {
        json!({
            "amount": request.amount,
            "currency": request.currency.as_str().to_ascii_lowercase(),
            "destination": request.recipient_account_id,
            "on_behalf_of": self.platform_account_id,
            "description": request.description,
            "capture_method": if manual_capture { "manual" } else { "automatic" },
            "confirm": true,
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_confirmed_intent(&self, request: &IntentRequest) -> AccordResult<IntentOutcome> {
        let value = self
            .post(
                "/payment_intents",
                Some(&request.idempotency_key),
                self.intent_body(request, false),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| TransportError::Json(e).into())
    }

    async fn create_manual_capture_intent(
        &self,
        request: &IntentRequest,
    ) -> AccordResult<IntentOutcome> {
        let value = self
            .post(
                "/payment_intents",
                Some(&request.idempotency_key),
                self.intent_body(request, true),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| TransportError::Json(e).into())
    }

    async fn capture_intent(
        &self,
        payment_intent_id: &str,
        amount: Option<Amount>,
    ) -> AccordResult<Amount> {
        let mut body = json!({});
        if let Some(amount) = amount {
            body["amount_to_capture"] = json!(amount);
        }
        let value = self
            .post(
                &format!("/payment_intents/{payment_intent_id}/capture"),
                None,
                body,
            )
            .await?;
        let captured = value
            .get("amount_received")
            .and_then(|a| a.as_i64())
            .ok_or_else(|| PaymentError::Provider("capture response missing amount".to_string()))?;
        Ok(Amount(captured))
    }

    async fn cancel_intent(&self, payment_intent_id: &str) -> AccordResult<()> {
        self.post(
            &format!("/payment_intents/{payment_intent_id}/cancel"),
            None,
            json!({}),
        )
        .await?;
        Ok(())
    }
}
