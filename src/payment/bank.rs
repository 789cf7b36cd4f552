use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::money::{Amount, Currency};
use crate::error::AccordResult;

/// One transaction from the user's linked account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransaction {
    pub description: String,
    pub amount: Amount,
    /// Epoch milliseconds.
    pub posted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankBalance {
    pub available: Amount,
    pub currency: Currency,
}

/// Token-gated access to a user's linked bank account. Used by the
/// `check_balance` agent tool and the verification driver's payment-history
/// search. Users without a bank token never reach this seam.
#[async_trait]
pub trait BankClient: Send + Sync {
    async fn balance(&self, bank_token: &str) -> AccordResult<BankBalance>;

    /// Case-insensitive search of recent transactions by description.
    async fn search_transactions(
        &self,
        bank_token: &str,
        search_terms: &[String],
        days: u32,
    ) -> AccordResult<Vec<BankTransaction>>;
}

/// No-op client for deployments without bank connectivity.
pub struct UnconfiguredBank;

#[async_trait]
impl BankClient for UnconfiguredBank {
    async fn balance(&self, _bank_token: &str) -> AccordResult<BankBalance> {
        Ok(BankBalance {
            available: Amount(0),
            currency: Currency::gbp(),
        })
    }

    async fn search_transactions(
        &self,
        _bank_token: &str,
        _search_terms: &[String],
        _days: u32,
    ) -> AccordResult<Vec<BankTransaction>> {
        Ok(Vec::new())
    }
}
