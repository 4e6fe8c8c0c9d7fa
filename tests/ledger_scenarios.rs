//! End-to-end ledger scenarios: opening bootstrap, realized P&L, compliance
//! rejects, and the zero-sum / unique-leg invariants.

use rust_decimal::Decimal;
use serde_json::{Value as JsonValue, json};
use std::str::FromStr;
use tradebot::accounting::ledger::balance::calculate_account_balances;
use tradebot::accounting::ledger::compliance::{CompliancePolicy, filter_compliant};
use tradebot::accounting::ledger::double_entry::validate_double_entry;
use tradebot::accounting::ledger::opening_balance::post_opening_balances_if_needed;
use tradebot::accounting::ledger::posting::{PostMeta, post_buy, post_sell};
use tradebot::accounting::{coa, mapping};
use tradebot::core::context::Context;
use tradebot::core::db::{meta_get, open_ledger};
use tradebot::core::identity::Identity4;
use tradebot::core::paths;

fn setup() -> (tempfile::TempDir, Context) {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = Context::new(
        Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(),
        tmp.path(),
    );
    coa::bootstrap_default(&ctx, "test").unwrap();
    (tmp, ctx)
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[test]
fn opening_bootstrap_posts_once_and_balances() {
    let (_tmp, ctx) = setup();
    let mut conn = open_ledger(&ctx).unwrap();
    let snapshot = json!({
        "as_of_utc": "2025-02-10T14:00:00Z",
        "cash": 1000.0,
        "positions": [{"symbol": "AAPL", "qty": 10, "basis": 1500.0}]
    });

    assert!(post_opening_balances_if_needed(&ctx, &mut conn, "run-1", &snapshot).unwrap());

    // One group, four legs, zero-sum
    let legs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM trades WHERE group_id = 'OPENING_BALANCE_20250210'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(legs, 4);
    validate_double_entry(&conn).unwrap();

    // Balances: cash +1000, position equity +1500, opening equity −2500
    let balances =
        calculate_account_balances(&conn, Some("2025-02-10T23:59:59Z"), None).unwrap();
    assert_eq!(balances["1110"].closing_balance, dec("1000"));
    assert_eq!(balances["1120"].closing_balance, dec("1500"));
    assert_eq!(balances["3010"].closing_balance, dec("-2500"));

    // Meta flag latched; second call inserts nothing
    assert_eq!(
        meta_get(&conn, "opening_balances_posted").unwrap().as_deref(),
        Some("true")
    );
    assert!(!post_opening_balances_if_needed(&ctx, &mut conn, "run-2", &snapshot).unwrap());
    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
        .unwrap();
    assert_eq!(total, 4);
}

#[test]
fn buy_then_sell_realizes_gain_with_closure_row() {
    let (_tmp, ctx) = setup();
    let mut conn = open_ledger(&ctx).unwrap();

    post_buy(
        &ctx, &mut conn, "AAPL", 5.0, 100.0, 0.5, "T1",
        Some("2025-02-10T15:04:05Z"), &PostMeta::default(),
    )
    .unwrap();
    let result = post_sell(
        &ctx, &mut conn, "AAPL", 5.0, 110.0, 0.5, "T2",
        Some("2025-02-10T19:00:00Z"), &PostMeta::default(),
    )
    .unwrap();
    assert_eq!(result.basis, Some(500.0));
    assert_eq!(result.proceeds, Some(550.0));
    assert_eq!(result.realized, Some(50.0));

    validate_double_entry(&conn).unwrap();

    // Closure row: basis=500, proceeds=550, realized=50
    let (basis, proceeds, realized): (f64, f64, f64) = conn
        .query_row(
            "SELECT basis_amount, proceeds_amount, realized_pnl FROM lot_closures",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!((basis, proceeds, realized), (500.0, 550.0, 50.0));

    // Lot fully consumed
    let remaining: f64 = conn
        .query_row("SELECT qty_remaining FROM lots", [], |r| r.get(0))
        .unwrap();
    assert_eq!(remaining, 0.0);

    // P2: no duplicate (trade_id, side)
    let dupes: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM (SELECT trade_id, side, COUNT(*) n FROM trades GROUP BY trade_id, side HAVING n > 1)",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(dupes, 0);

    // P4: every datetime_utc parses as aware UTC
    let stamps: Vec<String> = conn
        .prepare("SELECT datetime_utc FROM trades")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    for ts in stamps {
        assert!(
            tradebot::core::time::parse_to_utc(&ts).is_some(),
            "bad timestamp {}",
            ts
        );
        assert!(ts.ends_with('Z'));
    }
}

#[test]
fn balances_equal_signed_sums_after_posting_batch() {
    let (_tmp, ctx) = setup();
    let mut conn = open_ledger(&ctx).unwrap();
    post_buy(&ctx, &mut conn, "AAPL", 3.0, 50.0, 0.0, "B1", Some("2025-02-10T15:00:00Z"), &PostMeta::default()).unwrap();
    post_buy(&ctx, &mut conn, "MSFT", 2.0, 200.0, 0.0, "B2", Some("2025-02-10T15:30:00Z"), &PostMeta::default()).unwrap();
    post_sell(&ctx, &mut conn, "AAPL", 3.0, 55.0, 0.0, "S1", Some("2025-02-10T18:00:00Z"), &PostMeta::default()).unwrap();

    let balances =
        calculate_account_balances(&conn, Some("2025-02-10T23:59:59Z"), None).unwrap();
    // Each account's closing balance equals the direct signed sum
    for (account, bal) in &balances {
        let direct: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(total_value), 0) FROM trades WHERE account = ?1",
                [account],
                |r| r.get(0),
            )
            .unwrap();
        let direct = Decimal::from_str(&format!("{:.4}", direct)).unwrap();
        assert_eq!(bal.closing_balance, direct, "account {}", account);
    }
}

#[test]
fn compliance_reject_is_audited_and_dropped() {
    let (_tmp, ctx) = setup();
    let conn = open_ledger(&ctx).unwrap();

    let mut entry = serde_json::Map::new();
    entry.insert("account".into(), json!("1110"));
    entry.insert("side".into(), json!("neither"));
    entry.insert("total_value".into(), json!(-10.0));
    entry.insert("datetime_utc".into(), json!(tradebot::core::time::now_iso_z()));

    let policy = CompliancePolicy {
        max_abs_amount: dec("100000000"),
        enforce_window: true,
        max_back_days: 14,
        max_future_minutes: 10,
    };
    let (kept, rejected) = filter_compliant(&ctx, vec![entry], &policy, None);
    assert!(kept.is_empty());
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1.as_str(), "invalid_side");

    // No trades row was created
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 0);

    // Audit JSONL has exactly one reject record with the reason and snapshot
    let audit_raw =
        std::fs::read_to_string(paths::ledger_audit_path(&ctx).unwrap()).unwrap();
    let records: Vec<JsonValue> = audit_raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let rejects: Vec<&JsonValue> = records
        .iter()
        .filter(|r| r["action"] == "compliance_reject")
        .collect();
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0]["reason"], "invalid_side");
    assert_eq!(rejects[0]["entry_id"], JsonValue::Null);
    assert_eq!(rejects[0]["before"]["side"], "neither");
}

#[test]
fn unmapped_cash_activity_lands_in_suspense_not_dropped() {
    let (_tmp, ctx) = setup();
    let mut conn = open_ledger(&ctx).unwrap();
    let table = mapping::load(&ctx, None).unwrap();

    let mut entry = serde_json::Map::new();
    entry.insert("trade_id".into(), json!("ACT-1"));
    entry.insert("group_id".into(), json!("G-ACT-1"));
    entry.insert("type".into(), json!("OTHER"));
    entry.insert("total_value".into(), json!(42.0));
    entry.insert("datetime_utc".into(), json!("2025-02-10T15:00:00Z"));

    tradebot::accounting::ledger::double_entry::post_double_entry(
        &ctx, &mut conn, &[entry], &table,
    )
    .unwrap();
    let suspense_rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM trades WHERE account = '3999_SUSPENSE'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(suspense_rows, 1);
    validate_double_entry(&conn).unwrap();
}
