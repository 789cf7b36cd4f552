//! Trigger detection: the decision that a conversation has turned into a
//! financial agreement worth activating the agents for.
//!
//! Two independent paths feed the same latch: a case-insensitive keyword
//! match on any final utterance, and a periodic semantic classifier over the
//! recent transcript window. The latch admits at most one trigger per room
//! lifetime; `reset` re-arms it.

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::transcript::TranscriptEntry;
use crate::domain::trigger::{TriggerEvent, TriggerKind, TriggerRole};
use crate::error::{AccordResult, TriggerError};
use crate::llm::{ChatMessage, ChatRequest, LlmProvider};

/// Wall-time cadence of the semantic classifier.
pub const SEMANTIC_INTERVAL_MS: u64 = 10_000;
/// Utterances sent to the classifier per check.
pub const SEMANTIC_BATCH: usize = 20;
/// Bound on the retained transcript window.
pub const WINDOW_CAP: usize = 100;
/// Classifier confidence gate.
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

const CLASSIFIER_SYSTEM: &str = "You classify whether a live conversation between two people \
contains intent to form a financial agreement (a job, sale, or service for money). Respond with \
strict JSON only, no prose: {\"triggered\": bool, \"confidence\": number 0..1, \"role\": \
\"proposer\"|\"responder\"|\"unclear\" (the role of the most recent speaker), \"summary\": \
string, \"terms\": [string]}. `triggered` is true only when both sides have implicitly or \
explicitly signalled intent to transact.";

/// A snapshot of utterances handed to an offloaded classifier call.
#[derive(Debug, Clone)]
pub struct SemanticBatch {
    pub utterances: Vec<TranscriptEntry>,
}

#[derive(Debug, Deserialize)]
struct ClassifierVerdict {
    triggered: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    role: TriggerRole,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    terms: Vec<String>,
}

#[derive(Debug)]
pub struct TriggerDetector {
    keyword: String,
    semantic_enabled: bool,
    latched: bool,
    window: VecDeque<TranscriptEntry>,
    /// Number of leading window entries already covered by a semantic check.
    checked: usize,
    /// Overlap guard: a classifier call is in flight, skip this tick.
    in_flight: bool,
    /// `checked` value to commit when the in-flight call completes.
    pending_checked: usize,
}

impl TriggerDetector {
    pub fn new(keyword: impl Into<String>, semantic_enabled: bool) -> Self {
        Self {
            keyword: keyword.into().to_lowercase(),
            semantic_enabled,
            latched: false,
            window: VecDeque::with_capacity(WINDOW_CAP),
            checked: 0,
            in_flight: false,
            pending_checked: 0,
        }
    }

    pub fn set_keyword(&mut self, keyword: &str) {
        self.keyword = keyword.to_lowercase();
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// Re-arm the latch and forget the window. Called on membership change.
    pub fn reset(&mut self) {
        self.latched = false;
        self.window.clear();
        self.checked = 0;
        self.in_flight = false;
        self.pending_checked = 0;
    }

    /// Ingest one **final** transcript entry. Partials never reach the
    /// detector. Returns a keyword trigger if the utterance trips it.
    pub fn ingest(&mut self, entry: &TranscriptEntry) -> Option<TriggerEvent> {
        if self.latched {
            return None;
        }

        if self.window.len() == WINDOW_CAP {
            self.window.pop_front();
            self.checked = self.checked.saturating_sub(1);
            self.pending_checked = self.pending_checked.saturating_sub(1);
        }
        self.window.push_back(entry.clone());

        if !self.keyword.is_empty() && entry.text.to_lowercase().contains(&self.keyword) {
            self.latched = true;
            debug!(speaker = %entry.speaker, "keyword trigger tripped");
            return Some(TriggerEvent {
                kind: TriggerKind::Keyword,
                speaker_id: entry.speaker.clone(),
                confidence: 1.0,
                matched_text: entry.text.clone(),
                role: TriggerRole::Unclear,
                summary: None,
                terms: Vec::new(),
            });
        }
        None
    }

    /// Called on the 10 s tick. Returns the batch to classify, or `None`
    /// when latched, disabled, nothing new arrived, or a check is in flight.
    pub fn begin_semantic_check(&mut self) -> Option<SemanticBatch> {
        if self.latched || !self.semantic_enabled || self.in_flight {
            return None;
        }
        if self.window.len() <= self.checked {
            return None;
        }
        self.in_flight = true;
        self.pending_checked = self.window.len();
        let start = self.window.len().saturating_sub(SEMANTIC_BATCH);
        Some(SemanticBatch {
            utterances: self.window.iter().skip(start).cloned().collect(),
        })
    }

    /// Commit the result of an offloaded classifier call. Returns the
    /// trigger event when the verdict clears the gate and the latch is
    /// still open.
    pub fn complete_semantic_check(
        &mut self,
        batch: &SemanticBatch,
        verdict: Option<ClassifierOutcome>,
    ) -> Option<TriggerEvent> {
        self.in_flight = false;
        self.checked = self.pending_checked.min(self.window.len());

        let outcome = verdict?;
        if self.latched {
            return None;
        }
        if !(outcome.triggered && outcome.confidence >= CONFIDENCE_THRESHOLD) {
            return None;
        }

        let last = batch.utterances.last()?;
        self.latched = true;
        Some(TriggerEvent {
            kind: TriggerKind::Smart,
            speaker_id: last.speaker.clone(),
            confidence: outcome.confidence,
            matched_text: last.text.clone(),
            role: outcome.role,
            summary: outcome.summary,
            terms: outcome.terms,
        })
    }
}

/// A parsed classifier response.
#[derive(Debug, Clone)]
pub struct ClassifierOutcome {
    pub triggered: bool,
    pub confidence: f64,
    pub role: TriggerRole,
    pub summary: Option<String>,
    pub terms: Vec<String>,
}

/// Run the classifier over one batch. Transport or parse failures are
/// reported as `None` by the caller (a missed tick, never a crash).
pub async fn classify(
    llm: &dyn LlmProvider,
    batch: &SemanticBatch,
) -> AccordResult<ClassifierOutcome> {
    let transcript = batch
        .utterances
        .iter()
        .map(|u| format!("{}: {}", u.speaker, u.text))
        .collect::<Vec<_>>()
        .join("\n");

    let response = llm
        .complete(ChatRequest {
            system: CLASSIFIER_SYSTEM.to_string(),
            messages: vec![ChatMessage::user_text(transcript)],
            tools: Vec::new(),
            max_tokens: 512,
        })
        .await?;

    let verdict = parse_classifier_output(&response.text())?;
    Ok(ClassifierOutcome {
        triggered: verdict.triggered,
        confidence: verdict.confidence.clamp(0.0, 1.0),
        role: verdict.role,
        summary: verdict.summary,
        terms: verdict.terms,
    })
}

fn parse_classifier_output(raw: &str) -> AccordResult<ClassifierVerdict> {
    // Strict JSON expected; tolerate a fenced code block around it.
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| {
        warn!(error = %e, "classifier returned malformed JSON");
        TriggerError::MalformedClassifierOutput(e.to_string()).into()
    })
}
