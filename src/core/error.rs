//! Error types for tradebot operations.
//!
//! This module defines the canonical error type used throughout tradebot.
//! All subsystems return `Result<T, TbotError>` for error handling.
//!
//! Compliance rejects are deliberately NOT errors: a rejected ledger entry is
//! ordinary data (see [`RejectReason`]) that flows back to the caller, gets
//! audited, and is dropped. Only structural failures become `TbotError`.

use std::env;
use std::io;
use thiserror::Error;

/// Canonical error type for all tradebot operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Many variants auto-convert from standard library errors via `#[from]`.
#[derive(Error, Debug)]
pub enum TbotError {
    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encode/decode error (auto-converts from `serde_json::Error`)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Environment variable error (auto-converts from `std::env::VarError`)
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] env::VarError),

    /// Missing identity, malformed schedule inputs, invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Resource not found (missing live file, snapshot version, account, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Structural failure (unbalanced journal, duplicate codes, invalid HH:MM)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lots engine cannot satisfy a close; aborts the journal's posting batch
    #[error("Insufficient inventory: cannot close {requested} {side} {symbol} (remaining {available})")]
    InsufficientInventory {
        symbol: String,
        side: String,
        requested: String,
        available: String,
    },

    /// Retriable I/O failure (lock contention, broker HTTP 5xx/timeout)
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Unrecoverable failure; lifecycle transitions to `error`
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Per-entry compliance reject reasons.
///
/// Returned as data from the compliance filter, never raised. The wire form
/// (`as_str`) is what lands in the audit trail's `reason` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotARecord,
    UnmappedOrMissingAccount,
    InvalidSide,
    InvalidTotalValue,
    ZeroTotalValueNotAllowed,
    AmountExceedsPolicyLimit,
    MissingTimestamp,
    TimestampTooOld,
    TimestampInFuture,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotARecord => "not_a_record",
            RejectReason::UnmappedOrMissingAccount => "unmapped_or_missing_account",
            RejectReason::InvalidSide => "invalid_side",
            RejectReason::InvalidTotalValue => "invalid_total_value",
            RejectReason::ZeroTotalValueNotAllowed => "zero_total_value_not_allowed",
            RejectReason::AmountExceedsPolicyLimit => "amount_exceeds_policy_limit",
            RejectReason::MissingTimestamp => "missing_timestamp",
            RejectReason::TimestampTooOld => "timestamp_too_old",
            RejectReason::TimestampInFuture => "timestamp_in_future",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
