//! Pre-write compliance validation for ledger entries.
//!
//! Validation returns `Result<(), RejectReason>` — rejects are ordinary data,
//! audited and dropped, never raised. Entries are never mutated here.

use crate::accounting::ledger::entry::EntryMap;
use crate::accounting::mapping::{MappingTable, MatchSpec, get_for_transaction};
use crate::core::audit::{AuditEvent, append_best_effort};
use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::error::RejectReason;
use crate::core::time::parse_to_utc;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::str::FromStr;

const TS_KEYS: &[&str] = &["timestamp_utc", "datetime_utc", "created_at_utc"];

/// Policy knobs, lifted from config once per run.
#[derive(Debug, Clone)]
pub struct CompliancePolicy {
    pub max_abs_amount: Decimal,
    pub enforce_window: bool,
    pub max_back_days: i64,
    pub max_future_minutes: i64,
}

impl CompliancePolicy {
    pub fn from_config(cfg: &Config) -> Self {
        CompliancePolicy {
            max_abs_amount: Decimal::from_str(&cfg.ledger_max_abs_amount)
                .unwrap_or_else(|_| Decimal::from(100_000_000)),
            enforce_window: cfg.ledger_enforce_date_window,
            max_back_days: cfg.ledger_max_backdate_days,
            max_future_minutes: cfg.ledger_max_future_minutes,
        }
    }
}

fn to_decimal(v: Option<&JsonValue>) -> Option<Decimal> {
    match v? {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn has_account(entry: &EntryMap) -> bool {
    let acct = entry
        .get("account")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim();
    !acct.is_empty() && !acct.starts_with("Uncategorized")
}

fn mapping_resolvable(entry: &EntryMap, table: Option<&MappingTable>) -> bool {
    let Some(table) = table else {
        return false;
    };
    let want = MatchSpec {
        broker: entry
            .get("broker")
            .and_then(|v| v.as_str())
            .map(String::from),
        txn_type: entry.get("type").and_then(|v| v.as_str()).map(String::from),
        subtype: entry
            .get("subtype")
            .and_then(|v| v.as_str())
            .map(String::from),
        description: entry
            .get("description")
            .and_then(|v| v.as_str())
            .map(String::from),
    };
    let code = entry.get("code").and_then(|v| v.as_str());
    get_for_transaction(table, &want, code).is_some()
}

fn find_timestamp(entry: &EntryMap) -> Option<chrono::DateTime<Utc>> {
    for key in TS_KEYS {
        if let Some(s) = entry.get(*key).and_then(|v| v.as_str()) {
            if let Some(dt) = parse_to_utc(s) {
                return Some(dt);
            }
        }
    }
    None
}

/// Validate one entry against the policy. `mapping` is consulted only when
/// the entry has no resolved account yet.
pub fn validate_entry(
    entry: &EntryMap,
    policy: &CompliancePolicy,
    mapping: Option<&MappingTable>,
) -> Result<(), RejectReason> {
    if !has_account(entry) && !mapping_resolvable(entry, mapping) {
        return Err(RejectReason::UnmappedOrMissingAccount);
    }

    let side = entry
        .get("side")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if side != "debit" && side != "credit" {
        return Err(RejectReason::InvalidSide);
    }

    let Some(amount) = to_decimal(entry.get("total_value")) else {
        return Err(RejectReason::InvalidTotalValue);
    };

    if amount.is_zero() {
        let allowed = entry
            .get("allow_zero_value")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !allowed {
            return Err(RejectReason::ZeroTotalValueNotAllowed);
        }
    }

    if amount.abs() > policy.max_abs_amount {
        return Err(RejectReason::AmountExceedsPolicyLimit);
    }

    let Some(ts) = find_timestamp(entry) else {
        return Err(RejectReason::MissingTimestamp);
    };

    if policy.enforce_window {
        let now = Utc::now();
        if ts < now - Duration::days(policy.max_back_days) {
            return Err(RejectReason::TimestampTooOld);
        }
        if ts > now + Duration::minutes(policy.max_future_minutes) {
            return Err(RejectReason::TimestampInFuture);
        }
    }

    Ok(())
}

fn audit_reject(ctx: &Context, entry: &EntryMap, reason: RejectReason) {
    append_best_effort(
        ctx,
        AuditEvent {
            action: "compliance_reject",
            actor: "system",
            reason: Some(reason.as_str()),
            group_id: entry.get("group_id").and_then(|v| v.as_str()),
            fitid: entry.get("fitid").and_then(|v| v.as_str()),
            before: Some(JsonValue::Object(entry.clone())),
            extra: Some(serde_json::json!({"module": "ledger_compliance"})),
            ..Default::default()
        },
    );
}

/// Filter a batch: compliant entries pass through untouched, rejects are
/// audited and returned separately with their reasons.
pub fn filter_compliant(
    ctx: &Context,
    entries: Vec<EntryMap>,
    policy: &CompliancePolicy,
    mapping: Option<&MappingTable>,
) -> (Vec<EntryMap>, Vec<(EntryMap, RejectReason)>) {
    let mut kept = Vec::with_capacity(entries.len());
    let mut rejected = Vec::new();
    for entry in entries {
        match validate_entry(&entry, policy, mapping) {
            Ok(()) => kept.push(entry),
            Err(reason) => {
                audit_reject(ctx, &entry, reason);
                rejected.push((entry, reason));
            }
        }
    }
    (kept, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> CompliancePolicy {
        CompliancePolicy {
            max_abs_amount: Decimal::from(100_000_000),
            enforce_window: true,
            max_back_days: 14,
            max_future_minutes: 10,
        }
    }

    fn valid_entry() -> EntryMap {
        let mut e = EntryMap::new();
        e.insert("account".into(), json!("1110"));
        e.insert("side".into(), json!("debit"));
        e.insert("total_value".into(), json!(100.0));
        e.insert(
            "datetime_utc".into(),
            json!(crate::core::time::now_iso_z()),
        );
        e
    }

    #[test]
    fn test_valid_entry_passes() {
        assert!(validate_entry(&valid_entry(), &policy(), None).is_ok());
    }

    #[test]
    fn test_invalid_side() {
        let mut e = valid_entry();
        e.insert("side".into(), json!("neither"));
        assert_eq!(
            validate_entry(&e, &policy(), None),
            Err(RejectReason::InvalidSide)
        );
    }

    #[test]
    fn test_zero_value_gated() {
        let mut e = valid_entry();
        e.insert("total_value".into(), json!(0.0));
        assert_eq!(
            validate_entry(&e, &policy(), None),
            Err(RejectReason::ZeroTotalValueNotAllowed)
        );
        e.insert("allow_zero_value".into(), json!(true));
        assert!(validate_entry(&e, &policy(), None).is_ok());
    }

    #[test]
    fn test_amount_limit() {
        let mut e = valid_entry();
        e.insert("total_value".into(), json!(200_000_000.0));
        assert_eq!(
            validate_entry(&e, &policy(), None),
            Err(RejectReason::AmountExceedsPolicyLimit)
        );
    }

    #[test]
    fn test_timestamp_window() {
        let mut e = valid_entry();
        e.remove("datetime_utc");
        assert_eq!(
            validate_entry(&e, &policy(), None),
            Err(RejectReason::MissingTimestamp)
        );

        e.insert("datetime_utc".into(), json!("2019-01-01T00:00:00Z"));
        assert_eq!(
            validate_entry(&e, &policy(), None),
            Err(RejectReason::TimestampTooOld)
        );

        let future = Utc::now() + Duration::hours(2);
        e.insert(
            "datetime_utc".into(),
            json!(crate::core::time::iso_z(future)),
        );
        assert_eq!(
            validate_entry(&e, &policy(), None),
            Err(RejectReason::TimestampInFuture)
        );

        // Window disabled → old timestamps fine
        let mut relaxed = policy();
        relaxed.enforce_window = false;
        e.insert("datetime_utc".into(), json!("2019-01-01T00:00:00Z"));
        assert!(validate_entry(&e, &relaxed, None).is_ok());
    }

    #[test]
    fn test_uncategorized_account_needs_mapping() {
        let mut e = valid_entry();
        e.insert("account".into(), json!("Uncategorized:Debit"));
        assert_eq!(
            validate_entry(&e, &policy(), None),
            Err(RejectReason::UnmappedOrMissingAccount)
        );
    }
}
