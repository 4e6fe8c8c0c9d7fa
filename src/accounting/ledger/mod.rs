//! Ledger engine: double-entry posting, compliance, balances, dedup, audit.

pub mod balance;
pub mod compliance;
pub mod dedupe;
pub mod double_entry;
pub mod entry;
pub mod grouping;
pub mod opening_balance;
pub mod posting;
pub mod snapshot;
