use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AccordResult, RoomError};

/// Opaque identifier grammar accepted on the wire for rooms and users.
fn id_grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"))
}

macro_rules! external_id {
    ($name:ident) => {
        /// Wire-facing identifier, validated against `[A-Za-z0-9_-]{1,64}`.
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> AccordResult<Self> {
                if id_grammar().is_match(raw) {
                    Ok(Self(raw.to_string()))
                } else {
                    Err(RoomError::InvalidIdentifier(raw.to_string()).into())
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident, $prefix:literal) => {
        /// Server-generated, collision-resistant identifier.
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::new_v4().simple()))
            }

            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

external_id!(RoomId);
external_id!(UserId);

generated_id!(NegotiationId, "neg");
generated_id!(DocumentId, "doc");
generated_id!(MilestoneId, "mls");
generated_id!(HoldId, "hold");
generated_id!(TranscriptEntryId, "utt");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_grammar_conformant_ids() {
        assert!(RoomId::parse("room-1").is_ok());
        assert!(UserId::parse("alice_42").is_ok());
        assert!(RoomId::parse(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(RoomId::parse("").is_err());
        assert!(RoomId::parse("room 1").is_err());
        assert!(RoomId::parse("room/1").is_err());
        assert!(RoomId::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn generated_ids_carry_prefix_and_differ() {
        let a = NegotiationId::generate();
        let b = NegotiationId::generate();
        assert!(a.as_str().starts_with("neg_"));
        assert_ne!(a, b);
    }
}
