use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AccordResult, PaymentError};
use crate::{impl_add_sub_primitive, impl_from_primitive};

/// A monetary amount in integer minor units (e.g. pence).
///
/// Negative values never appear in stored state; they may appear in delta
/// calculations. All arithmetic on amounts is integer arithmetic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(pub i64);
impl_from_primitive!(Amount, i64);
impl_add_sub_primitive!(Amount, i64);

impl Amount {
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO-4217 style 3-letter uppercase currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn parse(raw: &str) -> AccordResult<Self> {
        let code = raw.trim().to_ascii_uppercase();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(PaymentError::InvalidRequest(format!("invalid currency code '{raw}'")).into())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn gbp() -> Self {
        Self("GBP".to_string())
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::gbp()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
