pub mod document;
pub mod escrow;
pub mod ids;
pub mod milestone;
pub mod money;
pub mod negotiation;
pub mod profile;
pub mod proposal;
pub mod transcript;
pub mod trigger;

/// Current wall time as epoch milliseconds, the unit used on every
/// wire-facing timestamp.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
