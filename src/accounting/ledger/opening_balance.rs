//! Opening balance bootstrap.
//!
//! When the ledger is empty and the `opening_balances_posted` meta flag is
//! unset, a broker snapshot seeds one balanced journal under the group id
//! `OPENING_BALANCE_YYYYMMDD`: cash debits against Opening-Balances equity,
//! and one debit per position at basis (or market value, flagged as
//! estimated). The whole batch is one transaction; a second call is a no-op.

use crate::accounting::coa;
use crate::accounting::ledger::double_entry::ZERO_SUM_TOLERANCE;
use crate::accounting::ledger::entry::{EntryMap, add_required_fields, to_sql_value};
use crate::core::audit::{AuditEvent, append_best_effort};
use crate::core::context::Context;
use crate::core::db::TableSchema;
use crate::core::error::TbotError;
use crate::core::schemas::TRADES_FIELDS;
use crate::core::time::{now_iso_z, yyyymmdd_from_iso};
use rusqlite::{Connection, TransactionBehavior, params};
use serde_json::{Value as JsonValue, json};

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn leg(
    group_id: &str,
    ts: &str,
    account: &str,
    total_value: f64,
    sync_run_id: &str,
    tags: &str,
    notes: &str,
) -> EntryMap {
    let mut e = EntryMap::new();
    e.insert("group_id".into(), json!(group_id));
    e.insert("datetime_utc".into(), json!(ts));
    e.insert("account".into(), json!(account));
    e.insert("total_value".into(), json!(total_value));
    e.insert(
        "side".into(),
        json!(if total_value >= 0.0 { "debit" } else { "credit" }),
    );
    e.insert("action".into(), json!("other"));
    e.insert("strategy".into(), json!("open"));
    e.insert("tags".into(), json!(tags));
    e.insert("notes".into(), json!(notes));
    e.insert("status".into(), json!("ok"));
    e.insert("sync_run_id".into(), json!(sync_run_id));
    e
}

/// Detect an empty ledger and post opening balances as one atomic batch.
/// Returns `true` only when this invocation posted the journal.
pub fn post_opening_balances_if_needed(
    ctx: &Context,
    conn: &mut Connection,
    sync_run_id: &str,
    snapshot: &JsonValue,
) -> Result<bool, TbotError> {
    let as_of = snapshot
        .get("as_of_utc")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(now_iso_z);
    let group_id = format!("OPENING_BALANCE_{}", yyyymmdd_from_iso(Some(&as_of)));

    let coa_bundle = coa::load(ctx)?;
    let cash_code = coa::find_code_by_name_path(&coa_bundle.accounts, &["Assets", "Brokerage", "Cash"]);
    let eq_opening_code =
        coa::find_code_by_name_path(&coa_bundle.accounts, &["Equity", "OpeningBalances"]);

    let schema = TableSchema::load(conn, "trades")?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    match crate::core::db::meta_get(&tx, "opening_balances_posted")? {
        Some(v) if v == "true" => {
            return Ok(false);
        }
        _ => {}
    }
    let rowcount: i64 = tx.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))?;
    if rowcount > 0 {
        // Ledger already has activity; latch the flag so future runs skip fast.
        crate::core::db::meta_set(&tx, "opening_balances_posted", "true")?;
        tx.commit()?;
        return Ok(false);
    }

    let mut legs: Vec<EntryMap> = Vec::new();
    let cash_amt = snapshot.get("cash").and_then(|v| v.as_f64()).unwrap_or(0.0);
    if cash_amt != 0.0 {
        let (Some(cash), Some(eq)) = (cash_code.as_deref(), eq_opening_code.as_deref()) else {
            return Err(TbotError::Validation(
                "required COA accounts for opening balance (Cash / Equity:OpeningBalances) not found"
                    .to_string(),
            ));
        };
        legs.push(leg(
            &group_id,
            &as_of,
            cash,
            round2(cash_amt),
            sync_run_id,
            "opening_balance,cash",
            "Opening cash",
        ));
        legs.push(leg(
            &group_id,
            &as_of,
            eq,
            round2(-cash_amt),
            sync_run_id,
            "opening_balance,equity",
            "Opening equity offset (cash)",
        ));
    }

    let empty = Vec::new();
    let positions = snapshot
        .get("positions")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);
    for p in positions {
        let symbol = p
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let qty = p
            .get("qty")
            .or_else(|| p.get("quantity"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let basis = p.get("basis").and_then(|v| v.as_f64());
        let market_value = p.get("market_value").and_then(|v| v.as_f64());
        let (value, estimated) = match (basis, market_value) {
            (Some(b), _) => (b, false),
            (None, Some(mv)) => (mv, true),
            (None, None) => continue,
        };
        if value == 0.0 {
            continue;
        }

        let symbol_code = coa::find_symbol_equity_code(&coa_bundle.accounts, &symbol);
        let (Some(asset), Some(eq)) = (symbol_code.as_deref(), eq_opening_code.as_deref()) else {
            return Err(TbotError::Validation(format!(
                "required COA account(s) for position {} not found",
                symbol
            )));
        };
        let note_suffix = if estimated { " (est @ MV)" } else { " (@ basis)" };
        let mut asset_leg = leg(
            &group_id,
            &as_of,
            asset,
            round2(value),
            sync_run_id,
            &format!("opening_balance,position,{}", symbol),
            &format!("Opening position {}{}", symbol, note_suffix),
        );
        asset_leg.insert("symbol".into(), json!(symbol));
        if qty != 0.0 {
            asset_leg.insert("quantity".into(), json!(qty));
        }
        legs.push(asset_leg);
        let mut eq_leg = leg(
            &group_id,
            &as_of,
            eq,
            round2(-value),
            sync_run_id,
            "opening_balance,equity",
            &format!("Opening equity offset ({})", symbol),
        );
        eq_leg.insert("symbol".into(), json!(symbol));
        legs.push(eq_leg);
    }

    let total: f64 = legs
        .iter()
        .map(|l| l.get("total_value").and_then(|v| v.as_f64()).unwrap_or(0.0))
        .sum();
    if total.abs() > ZERO_SUM_TOLERANCE {
        return Err(TbotError::Validation(format!(
            "opening balance legs not balanced (sum={:.2})",
            total
        )));
    }

    // Group header row, then the legs.
    tx.execute(
        "INSERT OR IGNORE INTO trade_groups (group_id, datetime_utc, type, status, sync_run_id, notes)
         VALUES (?1, ?2, 'OPENING_BALANCE', 'posted', ?3, 'Auto-posted opening balances')",
        params![group_id, as_of, sync_run_id],
    )?;
    let columns = schema.intersect(TRADES_FIELDS);
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO trades ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    let legs_count = legs.len();
    let positions_count = positions.len();
    for (i, mut leg) in legs.into_iter().enumerate() {
        // Per-leg sequence id keeps (trade_id, side) unique within the group.
        leg.insert("trade_id".into(), json!(format!("{}_{:02}", group_id, i + 1)));
        let sanitized = add_required_fields(&leg, &ctx.identity);
        let values: Vec<rusqlite::types::Value> = columns
            .iter()
            .map(|c| to_sql_value(sanitized.get(*c).unwrap_or(&JsonValue::Null)))
            .collect();
        tx.execute(&sql, rusqlite::params_from_iter(values))?;
    }
    crate::core::db::meta_set(&tx, "opening_balances_posted", "true")?;
    tx.commit()?;

    append_best_effort(
        ctx,
        AuditEvent {
            action: "opening_balance_posted",
            actor: "system",
            group_id: Some(&group_id),
            extra: Some(json!({
                "sync_run_id": sync_run_id,
                "legs_count": legs_count,
                "cash_posted": cash_amt,
                "positions_count": positions_count,
            })),
            ..Default::default()
        },
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::{meta_get, open_ledger};
    use crate::core::identity::Identity4;

    fn setup() -> (tempfile::TempDir, Context, Connection) {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::new(
            Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(),
            tmp.path(),
        );
        coa::bootstrap_default(&ctx, "test").unwrap();
        let conn = open_ledger(&ctx).unwrap();
        (tmp, ctx, conn)
    }

    fn snapshot() -> JsonValue {
        json!({
            "as_of_utc": "2025-02-10T14:00:00Z",
            "cash": 1000.0,
            "positions": [{"symbol": "AAPL", "qty": 10, "basis": 1500.0}]
        })
    }

    #[test]
    fn test_bootstrap_posts_four_balanced_legs() {
        let (_tmp, ctx, mut conn) = setup();
        let posted =
            post_opening_balances_if_needed(&ctx, &mut conn, "run-1", &snapshot()).unwrap();
        assert!(posted);

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM trades WHERE group_id = 'OPENING_BALANCE_20250210'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
        let total: f64 = conn
            .query_row("SELECT SUM(total_value) FROM trades", [], |r| r.get(0))
            .unwrap();
        assert!(total.abs() < ZERO_SUM_TOLERANCE);
        assert_eq!(
            meta_get(&conn, "opening_balances_posted").unwrap().as_deref(),
            Some("true")
        );
    }

    #[test]
    fn test_second_call_is_noop() {
        let (_tmp, ctx, mut conn) = setup();
        assert!(post_opening_balances_if_needed(&ctx, &mut conn, "run-1", &snapshot()).unwrap());
        assert!(!post_opening_balances_if_needed(&ctx, &mut conn, "run-2", &snapshot()).unwrap());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_market_value_fallback_notes_estimate() {
        let (_tmp, ctx, mut conn) = setup();
        let snap = json!({
            "as_of_utc": "2025-02-10T14:00:00Z",
            "cash": 0.0,
            "positions": [{"symbol": "MSFT", "qty": 5, "market_value": 900.0}]
        });
        post_opening_balances_if_needed(&ctx, &mut conn, "run-1", &snap).unwrap();
        let notes: String = conn
            .query_row(
                "SELECT notes FROM trades WHERE total_value > 0",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(notes.contains("est @ MV"));
    }

    #[test]
    fn test_nonempty_ledger_latches_flag_without_posting() {
        let (_tmp, ctx, mut conn) = setup();
        conn.execute(
            "INSERT INTO trades (trade_id, side, total_value, account, entity_code, jurisdiction_code, broker_code, bot_id)
             VALUES ('X', 'debit', 1.0, '1110', 'RIGD', 'USA', 'ALPACA', 'TB01')",
            [],
        )
        .unwrap();
        let posted =
            post_opening_balances_if_needed(&ctx, &mut conn, "run-1", &snapshot()).unwrap();
        assert!(!posted);
        assert_eq!(
            meta_get(&conn, "opening_balances_posted").unwrap().as_deref(),
            Some("true")
        );
    }
}
