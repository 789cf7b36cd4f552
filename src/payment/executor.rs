use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::escrow::{EscrowHold, EscrowStatus};
use crate::domain::ids::HoldId;
use crate::domain::money::{Amount, Currency};
use crate::domain::now_ms;
use crate::error::{AccordResult, PaymentError};
use crate::payment::provider::{IntentRequest, PaymentProvider};

/// A payment or hold the executor should place.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub amount: Amount,
    pub currency: Currency,
    pub recipient_account_id: String,
    pub description: String,
}

impl PaymentRequest {
    fn validate(&self) -> AccordResult<()> {
        if !self.amount.is_positive() {
            return Err(PaymentError::InvalidRequest("amount must be positive".to_string()).into());
        }
        if self.recipient_account_id.trim().is_empty() {
            return Err(PaymentError::InvalidRequest("recipient not set".to_string()).into());
        }
        Ok(())
    }

    /// Idempotency key derived from recipient, amount, and timestamp.
    fn idempotency_key(&self, now: i64) -> String {
        format!("{}-{}-{}", self.recipient_account_id, self.amount, now)
    }
}

/// Result of an immediate transfer, shaped for the agent's tool output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Process-wide payment surface: immediate transfers, manual-capture escrow
/// holds, partial capture, release.
///
/// The hold registry is a cache; the provider keeps the authoritative status
/// of every intent. Concurrent captures of one hold race to the provider,
/// which rejects the loser.
pub struct PaymentExecutor {
    provider: Arc<dyn PaymentProvider>,
    holds: Mutex<HashMap<HoldId, EscrowHold>>,
}

impl PaymentExecutor {
    pub fn new(provider: Arc<dyn PaymentProvider>) -> Self {
        Self {
            provider,
            holds: Mutex::new(HashMap::new()),
        }
    }

    pub fn hold(&self, hold_id: &HoldId) -> Option<EscrowHold> {
        self.holds.lock().get(hold_id).cloned()
    }

    /// Capture a hold addressed by its provider-side intent id. Used by the
    /// operator-facing release endpoint; falls back to the provider when no
    /// local hold matches (the provider's record is authoritative).
    pub async fn capture_by_intent(
        &self,
        payment_intent_id: &str,
        amount: Option<Amount>,
    ) -> AccordResult<Amount> {
        let local = self
            .holds
            .lock()
            .values()
            .find(|hold| hold.payment_intent_id == payment_intent_id)
            .map(|hold| hold.hold_id.clone());

        match local {
            Some(hold_id) => {
                let hold = self.capture_escrow(&hold_id, amount).await?;
                Ok(hold.captured_amount.unwrap_or(hold.amount))
            }
            None => self.provider.capture_intent(payment_intent_id, amount).await,
        }
    }

    /// Immediate transfer. Validation failures and provider declines both
    /// come back as an unsuccessful result, never an `Err`: the caller is an
    /// agent tool and the model should see the failure as text.
    pub async fn execute_payment(&self, request: PaymentRequest) -> PaymentResult {
        if let Err(err) = request.validate() {
            return PaymentResult {
                success: false,
                payment_intent_id: None,
                transfer_id: None,
                error: Some(err.to_string()),
            };
        }

        let key = request.idempotency_key(now_ms());
        let intent = IntentRequest {
            amount: request.amount,
            currency: request.currency.clone(),
            recipient_account_id: request.recipient_account_id.clone(),
            description: request.description.clone(),
            idempotency_key: key,
        };

        match self.provider.create_confirmed_intent(&intent).await {
            Ok(outcome) => {
                info!(
                    amount = %request.amount,
                    currency = %request.currency,
                    intent = %outcome.payment_intent_id,
                    "payment executed"
                );
                PaymentResult {
                    success: true,
                    payment_intent_id: Some(outcome.payment_intent_id),
                    transfer_id: outcome.transfer_id,
                    error: None,
                }
            }
            Err(err) => {
                warn!(%err, "payment failed");
                PaymentResult {
                    success: false,
                    payment_intent_id: None,
                    transfer_id: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Place a manual-capture hold authorized at the worst-case amount.
    pub async fn create_escrow_hold(&self, request: PaymentRequest) -> AccordResult<EscrowHold> {
        request.validate()?;

        let key = request.idempotency_key(now_ms());
        let intent = IntentRequest {
            amount: request.amount,
            currency: request.currency.clone(),
            recipient_account_id: request.recipient_account_id.clone(),
            description: request.description.clone(),
            idempotency_key: key,
        };
        let outcome = self.provider.create_manual_capture_intent(&intent).await?;

        let hold = EscrowHold {
            hold_id: HoldId::generate(),
            amount: request.amount,
            currency: request.currency,
            status: EscrowStatus::Held,
            payment_intent_id: outcome.payment_intent_id,
            recipient_account_id: request.recipient_account_id,
            captured_amount: None,
            created_at: now_ms(),
        };
        info!(hold = %hold.hold_id, amount = %hold.amount, "escrow hold created");
        self.holds.lock().insert(hold.hold_id.clone(), hold.clone());
        Ok(hold)
    }

    /// Capture a hold, at `amount` when given, in full otherwise. The
    /// capture amount never exceeds the authorization.
    pub async fn capture_escrow(
        &self,
        hold_id: &HoldId,
        amount: Option<Amount>,
    ) -> AccordResult<EscrowHold> {
        let (intent_id, authorized) = {
            let holds = self.holds.lock();
            let hold = holds
                .get(hold_id)
                .ok_or_else(|| PaymentError::HoldNotFound(hold_id.to_string()))?;
            if hold.status != EscrowStatus::Held {
                return Err(PaymentError::NotHeld {
                    id: hold_id.to_string(),
                    status: hold.status.to_string(),
                }
                .into());
            }
            (hold.payment_intent_id.clone(), hold.amount)
        };

        if let Some(requested) = amount {
            if requested > authorized {
                return Err(PaymentError::CaptureExceedsAuthorization {
                    requested: requested.into(),
                    authorized: authorized.into(),
                }
                .into());
            }
            if !requested.is_positive() {
                return Err(
                    PaymentError::InvalidRequest("capture amount must be positive".to_string())
                        .into(),
                );
            }
        }

        let captured = self.provider.capture_intent(&intent_id, amount).await?;

        let mut holds = self.holds.lock();
        let hold = holds
            .get_mut(hold_id)
            .ok_or_else(|| PaymentError::HoldNotFound(hold_id.to_string()))?;
        hold.status = EscrowStatus::Captured;
        hold.captured_amount = Some(captured);
        info!(hold = %hold_id, amount = %captured, "escrow captured");
        Ok(hold.clone())
    }

    /// Cancel a hold, voiding the authorization.
    pub async fn release_escrow(&self, hold_id: &HoldId) -> AccordResult<EscrowHold> {
        let intent_id = {
            let holds = self.holds.lock();
            let hold = holds
                .get(hold_id)
                .ok_or_else(|| PaymentError::HoldNotFound(hold_id.to_string()))?;
            if hold.status != EscrowStatus::Held {
                return Err(PaymentError::NotHeld {
                    id: hold_id.to_string(),
                    status: hold.status.to_string(),
                }
                .into());
            }
            hold.payment_intent_id.clone()
        };

        self.provider.cancel_intent(&intent_id).await?;

        let mut holds = self.holds.lock();
        let hold = holds
            .get_mut(hold_id)
            .ok_or_else(|| PaymentError::HoldNotFound(hold_id.to_string()))?;
        hold.status = EscrowStatus::Released;
        info!(hold = %hold_id, "escrow released");
        Ok(hold.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider double: succeeds, counts calls, captures what is asked.
    #[derive(Default)]
    struct FakeProvider {
        intents: AtomicUsize,
        captures: AtomicUsize,
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl PaymentProvider for FakeProvider {
        async fn create_confirmed_intent(
            &self,
            _request: &IntentRequest,
        ) -> AccordResult<crate::payment::provider::IntentOutcome> {
            let n = self.intents.fetch_add(1, Ordering::SeqCst);
            Ok(crate::payment::provider::IntentOutcome {
                payment_intent_id: format!("pi_{n}"),
                transfer_id: Some(format!("tr_{n}")),
            })
        }

        async fn create_manual_capture_intent(
            &self,
            _request: &IntentRequest,
        ) -> AccordResult<crate::payment::provider::IntentOutcome> {
            let n = self.intents.fetch_add(1, Ordering::SeqCst);
            Ok(crate::payment::provider::IntentOutcome {
                payment_intent_id: format!("pi_{n}"),
                transfer_id: None,
            })
        }

        async fn capture_intent(
            &self,
            _payment_intent_id: &str,
            amount: Option<Amount>,
        ) -> AccordResult<Amount> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(amount.unwrap_or(Amount(5_000)))
        }

        async fn cancel_intent(&self, _payment_intent_id: &str) -> AccordResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request(amount: i64) -> PaymentRequest {
        PaymentRequest {
            amount: Amount(amount),
            currency: Currency::gbp(),
            recipient_account_id: "acct_1".to_string(),
            description: "Labour".to_string(),
        }
    }

    #[tokio::test]
    async fn validation_failure_is_an_unsuccessful_result() {
        let executor = PaymentExecutor::new(Arc::new(FakeProvider::default()));
        let result = executor.execute_payment(request(0)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("positive"));
    }

    #[tokio::test]
    async fn immediate_payment_succeeds() {
        let executor = PaymentExecutor::new(Arc::new(FakeProvider::default()));
        let result = executor.execute_payment(request(15_000)).await;
        assert!(result.success);
        assert!(result.payment_intent_id.is_some());
        assert!(result.transfer_id.is_some());
    }

    #[tokio::test]
    async fn hold_then_partial_capture() {
        let executor = PaymentExecutor::new(Arc::new(FakeProvider::default()));
        let hold = executor.create_escrow_hold(request(80_000)).await.unwrap();
        assert_eq!(hold.status, EscrowStatus::Held);

        let captured = executor
            .capture_escrow(&hold.hold_id, Some(Amount(45_000)))
            .await
            .unwrap();
        assert_eq!(captured.status, EscrowStatus::Captured);
        assert_eq!(captured.captured_amount, Some(Amount(45_000)));
    }

    #[tokio::test]
    async fn second_capture_errors_and_status_sticks() {
        let executor = PaymentExecutor::new(Arc::new(FakeProvider::default()));
        let hold = executor.create_escrow_hold(request(5_000)).await.unwrap();
        executor.capture_escrow(&hold.hold_id, None).await.unwrap();

        let err = executor
            .capture_escrow(&hold.hold_id, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::AccordError::Payment(PaymentError::NotHeld { .. })
        ));
        assert_eq!(
            executor.hold(&hold.hold_id).unwrap().status,
            EscrowStatus::Captured
        );
    }

    #[tokio::test]
    async fn capture_above_authorization_is_rejected_locally() {
        let provider = Arc::new(FakeProvider::default());
        let executor = PaymentExecutor::new(provider.clone());
        let hold = executor.create_escrow_hold(request(80_000)).await.unwrap();

        let err = executor
            .capture_escrow(&hold.hold_id, Some(Amount(100_000)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::AccordError::Payment(PaymentError::CaptureExceedsAuthorization { .. })
        ));
        // The provider was never asked.
        assert_eq!(provider.captures.load(Ordering::SeqCst), 0);
        assert_eq!(
            executor.hold(&hold.hold_id).unwrap().status,
            EscrowStatus::Held
        );
    }

    #[tokio::test]
    async fn release_is_one_way() {
        let executor = PaymentExecutor::new(Arc::new(FakeProvider::default()));
        let hold = executor.create_escrow_hold(request(5_000)).await.unwrap();
        let released = executor.release_escrow(&hold.hold_id).await.unwrap();
        assert_eq!(released.status, EscrowStatus::Released);

        assert!(executor.capture_escrow(&hold.hold_id, None).await.is_err());
        assert!(executor.release_escrow(&hold.hold_id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_hold_is_distinct_error() {
        let executor = PaymentExecutor::new(Arc::new(FakeProvider::default()));
        let err = executor
            .capture_escrow(&HoldId::generate(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::AccordError::Payment(PaymentError::HoldNotFound(_))
        ));
    }
}
