//! Double-entry posting: one raw entry becomes a balanced debit/credit pair.
//!
//! The mapping table decides the account pair. When no rule matches, legs
//! route to Suspense vs Trading P&L so rows are never dropped and journals
//! stay zero-sum. `(trade_id, side)` pairs already present are refused at
//! insert; each journal is one transaction.

use crate::accounting::ledger::entry::{EntryMap, add_required_fields, to_sql_value};
use crate::accounting::mapping::{MappingTable, MatchSpec, apply_rule, get_for_transaction};
use crate::core::context::Context;
use crate::core::db::TableSchema;
use crate::core::error::TbotError;
use crate::core::schemas::TRADES_FIELDS;
use rusqlite::{Connection, TransactionBehavior, params};
use serde_json::json;

pub const SUSPENSE: &str = "3999_SUSPENSE";
pub const PNL: &str = "5000_TRADING_PNL";

/// Journal balance tolerance.
pub const ZERO_SUM_TOLERANCE: f64 = 1e-6;

fn match_spec_of(entry: &EntryMap) -> MatchSpec {
    MatchSpec {
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
    }
}

/// Suspense fallback when no mapping rule applies: route value against the
/// trading P&L account with signs that still zero-sum.
fn fallback_unmapped_legs(entry: &EntryMap) -> (EntryMap, EntryMap) {
    let val = entry
        .get("total_value")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let (debit_account, credit_account) = if val >= 0.0 {
        (SUSPENSE, PNL)
    } else {
        (PNL, SUSPENSE)
    };
    let mut debit = entry.clone();
    let mut credit = entry.clone();
    debit.insert("side".into(), json!("debit"));
    debit.insert("account".into(), json!(debit_account));
    debit.insert("total_value".into(), json!(val.abs()));
    debit.insert("amount".into(), json!(val.abs()));
    credit.insert("side".into(), json!("credit"));
    credit.insert("account".into(), json!(credit_account));
    credit.insert("total_value".into(), json!(-val.abs()));
    credit.insert("amount".into(), json!(-val.abs()));
    (debit, credit)
}

/// Insert one sanitized leg unless its `(trade_id, side)` already exists.
/// Returns whether a row was written.
pub fn insert_leg(
    conn: &Connection,
    schema: &TableSchema,
    leg: &EntryMap,
) -> Result<bool, TbotError> {
    let trade_id = leg.get("trade_id").and_then(|v| v.as_str());
    let side = leg.get("side").and_then(|v| v.as_str());
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM trades WHERE trade_id = ?1 AND side = ?2 LIMIT 1",
            params![trade_id, side],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if exists {
        return Ok(false);
    }

    let columns = schema.intersect(TRADES_FIELDS);
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO trades ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    let values: Vec<rusqlite::types::Value> = columns
        .iter()
        .map(|c| to_sql_value(leg.get(*c).unwrap_or(&serde_json::Value::Null)))
        .collect();
    conn.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(true)
}

/// Map each entry to debit/credit legs and write both, one transaction per
/// journal. Returns the `(debit_trade_id, credit_trade_id)` pairs attempted.
pub fn post_double_entry(
    ctx: &Context,
    conn: &mut Connection,
    entries: &[EntryMap],
    mapping: &MappingTable,
) -> Result<Vec<(Option<String>, Option<String>)>, TbotError> {
    let schema = TableSchema::load(conn, "trades")?;
    let mut inserted = Vec::with_capacity(entries.len());

    for entry in entries {
        let rule = get_for_transaction(
            mapping,
            &match_spec_of(entry),
            entry.get("code").and_then(|v| v.as_str()),
        );
        let (debit, credit) = match rule {
            Some(rule) => apply_rule(entry, Some(rule)),
            None => fallback_unmapped_legs(entry),
        };
        let debit = add_required_fields(&debit, &ctx.identity);
        let credit = add_required_fields(&credit, &ctx.identity);

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let schema_ref = &schema;
        insert_leg(&tx, schema_ref, &debit)?;
        insert_leg(&tx, schema_ref, &credit)?;
        tx.commit()?;

        inserted.push((
            debit.get("trade_id").and_then(|v| v.as_str()).map(String::from),
            credit
                .get("trade_id")
                .and_then(|v| v.as_str())
                .map(String::from),
        ));
    }
    Ok(inserted)
}

/// Integrity sweep: every `group_id` must sum to ~0 across its legs.
pub fn validate_double_entry(conn: &Connection) -> Result<(), TbotError> {
    let mut stmt = conn.prepare(
        "SELECT group_id, SUM(total_value) FROM trades
         WHERE group_id IS NOT NULL GROUP BY group_id",
    )?;
    let imbalances: Vec<(String, f64)> = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?.unwrap_or(0.0)))
        })?
        .filter_map(|r| r.ok())
        .filter(|(_, total)| total.abs() > ZERO_SUM_TOLERANCE)
        .collect();
    if imbalances.is_empty() {
        Ok(())
    } else {
        Err(TbotError::Validation(format!(
            "double-entry imbalance for group_ids: {:?}",
            imbalances
        )))
    }
}
