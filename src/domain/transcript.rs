use serde::{Deserialize, Serialize};

use crate::domain::ids::{TranscriptEntryId, UserId};

/// Per-word timing detail, when the STT provider supplies it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordTiming {
    pub word: String,
    pub offset_ms: i64,
    pub duration_ms: i64,
}

/// One utterance (or in-progress fragment) from one speaker.
///
/// Partial entries are overwritten by later partials from the same speaker;
/// final entries are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: TranscriptEntryId,
    pub speaker: UserId,
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<WordTiming>,
}

impl TranscriptEntry {
    pub fn partial(speaker: UserId, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: TranscriptEntryId::generate(),
            speaker,
            text: text.into(),
            timestamp,
            is_final: false,
            words: Vec::new(),
        }
    }

    pub fn final_utterance(speaker: UserId, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: TranscriptEntryId::generate(),
            speaker,
            text: text.into(),
            timestamp,
            is_final: true,
            words: Vec::new(),
        }
    }
}
