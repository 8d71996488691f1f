//! Interpretation of engine error text.
//!
//! The engine reports conditions only through free-form messages. All string
//! matching against those messages lives here.

use super::EngineOp;

/// Substrings (lowercase) that mark a failure as worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset by peer",
    "unexpected eof",
    "timeout",
    "connection refused",
    "network error",
    "429 too many requests",
    "too many requests",
    "500 internal server error",
    "internal server error",
    "503 service unavailable",
    "service unavailable",
    "temporarily unavailable",
];

const ALREADY_INITIALIZED: &str = "already initialized";
const MASTER_KEY: &str = "repository master key";
const NO_LOCKS: &str = "no locks to remove";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The failure text actually describes the desired end state.
    Success,
    Transient,
    Permanent,
}

pub fn classify(op: EngineOp, text: &str) -> Classification {
    let lower = text.to_lowercase();

    match op {
        EngineOp::Init if lower.contains(ALREADY_INITIALIZED) => Classification::Success,
        EngineOp::Unlock if lower.contains(NO_LOCKS) => Classification::Success,
        _ if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) => Classification::Transient,
        _ => Classification::Permanent,
    }
}

pub fn is_transient(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// True when a failed listing still proves the repository exists.
pub fn indicates_existing_repository(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains(ALREADY_INITIALIZED) || lower.contains(MASTER_KEY)
}
