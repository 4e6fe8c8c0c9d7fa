//! Per-account balance computation (Decimal-safe, UTC-aware).
//!
//! Computes opening balance, windowed debits/credits, and closing balance
//! as-of a UTC timestamp. Window start defaults to UTC midnight of the as-of
//! date. All amounts are quantized to 1e-4.

use crate::core::db::TableSchema;
use crate::core::error::TbotError;
use crate::core::time::{iso_z, parse_to_utc, utc_midnight};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rustc_hash::FxHashMap;

const BALANCE_DP: u32 = 4;

fn dec(x: f64) -> Decimal {
    Decimal::from_f64(x)
        .unwrap_or_default()
        .round_dp_with_strategy(BALANCE_DP, RoundingStrategy::MidpointNearestEven)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountBalance {
    pub opening_balance: Decimal,
    pub debits: Decimal,
    pub credits: Decimal,
    pub closing_balance: Decimal,
}

/// Compute per-account balances.
///
/// Sign convention: `total_value` is summed directly; within the window,
/// debits/credits are split by `side` when present, else by sign. Closing is
/// the direct as-of sum, falling back to `opening + debits − credits` when
/// the direct sum is zero but the window saw activity.
pub fn calculate_account_balances(
    conn: &Connection,
    as_of_utc: Option<&str>,
    window_start_utc: Option<&str>,
) -> Result<FxHashMap<String, AccountBalance>, TbotError> {
    let as_of: DateTime<Utc> = match as_of_utc {
        Some(s) => parse_to_utc(s)
            .ok_or_else(|| TbotError::Validation(format!("invalid as_of_utc '{}'", s)))?,
        None => Utc::now(),
    };
    let start: DateTime<Utc> = match window_start_utc {
        Some(s) => parse_to_utc(s)
            .ok_or_else(|| TbotError::Validation(format!("invalid window_start_utc '{}'", s)))?,
        None => utc_midnight(as_of),
    };
    let as_of_iso = iso_z(as_of);
    let start_iso = iso_z(start);

    let schema = TableSchema::load(conn, "trades")?;
    let ts_col = schema.ts_coalesce();

    let mut out: FxHashMap<String, AccountBalance> = FxHashMap::default();

    let q_open = format!(
        "SELECT account, SUM(total_value) FROM trades WHERE {} < ?1 GROUP BY account",
        ts_col
    );
    let mut stmt = conn.prepare(&q_open)?;
    let rows = stmt.query_map([&start_iso], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
    })?;
    for row in rows {
        let (account, amt) = row?;
        out.entry(account).or_default().opening_balance = dec(amt.unwrap_or(0.0));
    }

    let q_window = format!(
        "SELECT account,
                SUM(CASE WHEN (COALESCE(side,'') = 'debit' OR total_value > 0) THEN ABS(total_value) ELSE 0 END),
                SUM(CASE WHEN (COALESCE(side,'') = 'credit' OR total_value < 0) THEN ABS(total_value) ELSE 0 END)
         FROM trades WHERE {ts} >= ?1 AND {ts} <= ?2 GROUP BY account",
        ts = ts_col
    );
    let mut stmt = conn.prepare(&q_window)?;
    let rows = stmt.query_map([&start_iso, &as_of_iso], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<f64>>(1)?,
            row.get::<_, Option<f64>>(2)?,
        ))
    })?;
    for row in rows {
        let (account, debits, credits) = row?;
        let entry = out.entry(account).or_default();
        entry.debits = dec(debits.unwrap_or(0.0));
        entry.credits = dec(credits.unwrap_or(0.0));
    }

    let q_close = format!(
        "SELECT account, SUM(total_value) FROM trades WHERE {} <= ?1 GROUP BY account",
        ts_col
    );
    let mut stmt = conn.prepare(&q_close)?;
    let rows = stmt.query_map([&as_of_iso], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
    })?;
    for row in rows {
        let (account, amt) = row?;
        out.entry(account).or_default().closing_balance = dec(amt.unwrap_or(0.0));
    }

    for balance in out.values_mut() {
        if balance.closing_balance.is_zero() {
            balance.closing_balance = (balance.opening_balance + balance.debits
                - balance.credits)
                .round_dp_with_strategy(BALANCE_DP, RoundingStrategy::MidpointNearestEven);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::db::open_ledger;
    use crate::core::identity::Identity4;
    use rust_decimal_macros::dec as d;

    fn setup() -> (tempfile::TempDir, Connection) {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::new(
            Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(),
            tmp.path(),
        );
        let conn = open_ledger(&ctx).unwrap();
        (tmp, conn)
    }

    fn insert(conn: &Connection, account: &str, side: &str, total: f64, ts: &str) {
        conn.execute(
            "INSERT INTO trades (trade_id, group_id, datetime_utc, side, total_value, account,
                                 entity_code, jurisdiction_code, broker_code, bot_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'RIGD', 'USA', 'ALPACA', 'TB01')",
            rusqlite::params![
                format!("T-{}-{}-{}", account, side, ts),
                "G1",
                ts,
                side,
                total,
                account
            ],
        )
        .unwrap();
    }

    #[test]
    fn test_opening_window_closing_split() {
        let (_tmp, conn) = setup();
        // Prior day: +1000 cash
        insert(&conn, "1110", "debit", 1000.0, "2025-02-09T15:00:00Z");
        // Today: +200 debit, -50 credit
        insert(&conn, "1110", "debit", 200.0, "2025-02-10T14:00:00Z");
        insert(&conn, "1110", "credit", -50.0, "2025-02-10T16:00:00Z");

        let balances =
            calculate_account_balances(&conn, Some("2025-02-10T23:59:59Z"), None).unwrap();
        let cash = &balances["1110"];
        assert_eq!(cash.opening_balance, d!(1000.0000));
        assert_eq!(cash.debits, d!(200.0000));
        assert_eq!(cash.credits, d!(50.0000));
        assert_eq!(cash.closing_balance, d!(1150.0000));
    }

    #[test]
    fn test_closing_formula_fallback_when_direct_sum_zero() {
        let (_tmp, conn) = setup();
        insert(&conn, "4080", "debit", 25.0, "2025-02-10T14:00:00Z");
        insert(&conn, "4080", "credit", -25.0, "2025-02-10T15:00:00Z");
        let balances =
            calculate_account_balances(&conn, Some("2025-02-10T23:59:59Z"), None).unwrap();
        let acct = &balances["4080"];
        // direct sum is zero but window saw activity: opening + debits − credits
        assert_eq!(acct.closing_balance, d!(0.0000));
        assert_eq!(acct.debits, d!(25.0000));
        assert_eq!(acct.credits, d!(25.0000));
    }

    #[test]
    fn test_balances_match_signed_total_sum() {
        let (_tmp, conn) = setup();
        insert(&conn, "1110", "debit", 550.0, "2025-02-10T14:00:00Z");
        insert(&conn, "1120", "credit", -500.0, "2025-02-10T14:00:00Z");
        insert(&conn, "4010", "credit", -50.0, "2025-02-10T14:00:00Z");
        let balances =
            calculate_account_balances(&conn, Some("2025-02-10T23:59:59Z"), None).unwrap();
        let total: Decimal = balances.values().map(|b| b.closing_balance).sum();
        assert_eq!(total, d!(0.0000));
    }
}
