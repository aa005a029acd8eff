//! Error classification for recovery decisions.
//!
//! Severity and retryability are decided by case-insensitive substring on
//! the error message. The classifier is deliberately dumb: the external
//! engine and step executors are not required to speak a structured error
//! protocol, only to put the failure kind somewhere in the message.

use crate::models::ErrorSeverity;

/// Classify an error message into a severity bucket.
pub fn classify_severity(message: &str) -> ErrorSeverity {
    let lower = message.to_lowercase();
    const CRITICAL: [&str; 4] = ["panic", "fatal", "critical", "database"];
    const HIGH: [&str; 4] = ["timeout", "network", "auth_failure", "permission"];
    const MEDIUM: [&str; 3] = ["validation", "parse", "format"];

    if CRITICAL.iter().any(|needle| lower.contains(needle)) {
        ErrorSeverity::Critical
    } else if HIGH.iter().any(|needle| lower.contains(needle)) {
        ErrorSeverity::High
    } else if MEDIUM.iter().any(|needle| lower.contains(needle)) {
        ErrorSeverity::Medium
    } else {
        ErrorSeverity::Low
    }
}

/// Whether an error must bypass retry entirely.
pub fn is_non_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    const NON_RETRYABLE: [&str; 4] = [
        "auth_failure",
        "invalid credentials",
        "forbidden",
        "unauthorized",
    ];
    NON_RETRYABLE.iter().any(|needle| lower.contains(needle))
}

/// Short machine-readable error type derived from the message, used for
/// audit entries and error statistics.
pub fn error_type_of(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("timeout") {
        "timeout"
    } else if lower.contains("network") {
        "network"
    } else if lower.contains("auth_failure")
        || lower.contains("invalid credentials")
        || lower.contains("forbidden")
        || lower.contains("unauthorized")
    {
        "auth"
    } else if lower.contains("permission") {
        "permission"
    } else if lower.contains("validation") || lower.contains("parse") || lower.contains("format") {
        "validation"
    } else if lower.contains("panic") || lower.contains("fatal") || lower.contains("critical") {
        "critical"
    } else if lower.contains("database") {
        "database"
    } else if lower.contains("cancel") {
        "canceled"
    } else {
        "unknown"
    }
}
