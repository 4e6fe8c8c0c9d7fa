//! Broker → ledger sync pipeline, end to end over a replay payload:
//! snapshot, normalize, dedupe, compliance, opening balances, lot-aware
//! posting, and idempotent re-runs.

use serde_json::{Value as JsonValue, json};
use tradebot::accounting::ledger::double_entry::validate_double_entry;
use tradebot::accounting::mapping::{self, MappingRule, MatchSpec};
use tradebot::accounting::{coa, normalize};
use tradebot::broker::ReplayAdapter;
use tradebot::core::config::Config;
use tradebot::core::context::Context;
use tradebot::core::db::open_ledger;
use tradebot::core::identity::Identity4;
use tradebot::core::paths;
use tradebot::runtime::sync;

fn setup() -> (tempfile::TempDir, Context, Config) {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = Context::new(
        Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(),
        tmp.path(),
    );
    coa::bootstrap_default(&ctx, "test").unwrap();
    let mut cfg = Config::load().unwrap();
    // Replay payloads carry fixed historical dates
    cfg.ledger_enforce_date_window = false;
    (tmp, ctx, cfg)
}

fn write_payload(dir: &std::path::Path, payload: &JsonValue) -> std::path::PathBuf {
    let path = dir.join("replay.json");
    std::fs::write(&path, serde_json::to_string_pretty(payload).unwrap()).unwrap();
    path
}

fn payload() -> JsonValue {
    json!({
        "trades": [
            {
                "id": "ord-1", "symbol": "AAPL", "action": "buy",
                "filled_qty": 5, "filled_avg_price": 100.0, "fee": 0.5,
                "filled_at": "2025-02-10T15:04:05Z", "status": "filled"
            },
            {
                "id": "ord-2", "symbol": "AAPL", "action": "sell",
                "filled_qty": 5, "filled_avg_price": 110.0, "fee": 0.5,
                "filled_at": "2025-02-10T19:00:00Z", "status": "filled"
            },
            {
                // duplicate fill report for ord-1; must dedupe away
                "id": "ord-1", "symbol": "AAPL", "action": "buy",
                "filled_qty": 5, "filled_avg_price": 100.0, "fee": 0.5,
                "filled_at": "2025-02-10T15:04:05Z", "status": "filled"
            }
        ],
        "activities": [
            {"id": "act-1", "activity_type": "DIV", "amount": 12.5, "symbol": "AAPL",
             "date": "2025-02-11"}
        ],
        "snapshot": {
            "as_of_utc": "2025-02-09T14:00:00Z",
            "cash": 1000.0,
            "positions": []
        }
    })
}

#[test]
fn full_sync_posts_balanced_journals() {
    let (tmp, ctx, cfg) = setup();
    mapping::assign(
        &ctx,
        &MappingRule {
            match_spec: MatchSpec {
                broker: Some("ALPACA".to_string()),
                txn_type: Some("DIV".to_string()),
                ..Default::default()
            },
            debit_account: "1110".to_string(),
            credit_account: "4080".to_string(),
            code: None,
        },
        "u1",
        None,
    )
    .unwrap();

    let adapter = ReplayAdapter::new(&write_payload(tmp.path(), &payload()));
    let report = sync::run(&ctx, &cfg, &adapter, "2025-02-01", "2025-02-28").unwrap();

    assert_eq!(report.fetched, 4);
    assert!(report.opening_balances_posted);
    assert_eq!(report.rejected, 0);
    assert_eq!(report.pending, 0);
    // buy + sell + dividend (duplicate fill deduped)
    assert_eq!(report.posted, 3);

    let conn = open_ledger(&ctx).unwrap();
    validate_double_entry(&conn).unwrap();

    // FIFO lot consumed by the sell, with realized gain recorded
    let realized: f64 = conn
        .query_row("SELECT SUM(realized_pnl) FROM lot_closures", [], |r| r.get(0))
        .unwrap();
    assert_eq!(realized, 50.0);

    // Dividend legs landed on the mapped accounts
    let div_credit: f64 = conn
        .query_row(
            "SELECT total_value FROM trades WHERE account = '4080'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(div_credit, -12.5);

    // Pre-mutation snapshot exists
    let snapshots: Vec<_> = std::fs::read_dir(paths::ledger_snapshot_dir(&ctx).unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(snapshots.len(), 1);

    // Audit trail carries the sync extras
    let audit_raw =
        std::fs::read_to_string(paths::ledger_audit_path(&ctx).unwrap()).unwrap();
    let complete: Vec<JsonValue> = audit_raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .filter(|r: &JsonValue| r["action"] == "sync_complete")
        .collect();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0]["sync_run_id"], report.sync_run_id.as_str());
    assert_eq!(complete[0]["response_hash"].as_str().unwrap().len(), 64);
}

#[test]
fn second_sync_run_is_idempotent() {
    let (tmp, ctx, cfg) = setup();
    let path = write_payload(tmp.path(), &payload());
    let adapter = ReplayAdapter::new(&path);

    sync::run(&ctx, &cfg, &adapter, "2025-02-01", "2025-02-28").unwrap();
    let conn = open_ledger(&ctx).unwrap();
    let rows_before: i64 = conn
        .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
        .unwrap();
    let lots_before: i64 = conn
        .query_row("SELECT COUNT(*) FROM lots", [], |r| r.get(0))
        .unwrap();
    drop(conn);

    sync::run(&ctx, &cfg, &adapter, "2025-02-01", "2025-02-28").unwrap();
    let conn = open_ledger(&ctx).unwrap();
    let rows_after: i64 = conn
        .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
        .unwrap();
    let lots_after: i64 = conn
        .query_row("SELECT COUNT(*) FROM lots", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows_before, rows_after, "re-sync must not add ledger rows");
    assert_eq!(lots_before, lots_after, "re-sync must not reopen lots");
    validate_double_entry(&conn).unwrap();
}

#[test]
fn short_round_trip_closes_the_lot_through_sync() {
    let (tmp, ctx, cfg) = setup();
    let shorts = json!({
        "trades": [
            {"id": "ord-s1", "symbol": "XYZ", "action": "sell_short",
             "filled_qty": 10, "filled_avg_price": 50.0,
             "filled_at": "2025-02-10T15:00:00Z"},
            {"id": "ord-s2", "symbol": "XYZ", "action": "buy_to_cover",
             "filled_qty": 10, "filled_avg_price": 45.0,
             "filled_at": "2025-02-10T19:00:00Z"}
        ],
        "activities": []
    });
    let adapter = ReplayAdapter::new(&write_payload(tmp.path(), &shorts));
    let report = sync::run(&ctx, &cfg, &adapter, "2025-02-01", "2025-02-28").unwrap();
    assert_eq!(report.posted, 2);
    assert_eq!(report.pending, 0);
    assert_eq!(report.rejected, 0);

    let conn = open_ledger(&ctx).unwrap();
    validate_double_entry(&conn).unwrap();

    // The cover consumed the short lot: inventory conserves to zero
    let remaining: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(qty_remaining), 0) FROM lots WHERE symbol = 'XYZ' AND side = 'short'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(remaining, 0.0);

    // Realized P&L from the closure: short 50, cover 45 → +50 gain
    let realized: f64 = conn
        .query_row("SELECT SUM(realized_pnl) FROM lot_closures", [], |r| r.get(0))
        .unwrap();
    assert_eq!(realized, 50.0);

    // Nothing leaked into the suspense fallback
    let suspense: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM trades WHERE account = '3999_SUSPENSE'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(suspense, 0);
}

#[test]
fn long_alias_verbs_route_through_lot_primitives() {
    let (tmp, ctx, cfg) = setup();
    let aliases = json!({
        "trades": [
            {"id": "ord-a1", "symbol": "AAPL", "action": "buy_to_open",
             "filled_qty": 4, "filled_avg_price": 100.0,
             "filled_at": "2025-02-10T15:00:00Z"},
            {"id": "ord-a2", "symbol": "AAPL", "action": "sell_to_close",
             "filled_qty": 4, "filled_avg_price": 101.0,
             "filled_at": "2025-02-10T18:00:00Z"}
        ],
        "activities": []
    });
    let adapter = ReplayAdapter::new(&write_payload(tmp.path(), &aliases));
    let report = sync::run(&ctx, &cfg, &adapter, "2025-02-01", "2025-02-28").unwrap();
    assert_eq!(report.posted, 2);
    assert_eq!(report.pending, 0);

    let conn = open_ledger(&ctx).unwrap();
    validate_double_entry(&conn).unwrap();
    let realized: f64 = conn
        .query_row("SELECT SUM(realized_pnl) FROM lot_closures", [], |r| r.get(0))
        .unwrap();
    assert_eq!(realized, 4.0);
    let remaining: f64 = conn
        .query_row("SELECT COALESCE(SUM(qty_remaining), 0) FROM lots", [], |r| r.get(0))
        .unwrap();
    assert_eq!(remaining, 0.0);
}

#[test]
fn cover_without_short_inventory_is_marked_pending() {
    let (tmp, ctx, cfg) = setup();
    let lone_cover = json!({
        "trades": [
            {"id": "ord-c9", "symbol": "XYZ", "action": "buy_to_cover",
             "filled_qty": 5, "filled_avg_price": 40.0,
             "filled_at": "2025-02-10T16:00:00Z"}
        ],
        "activities": []
    });
    let adapter = ReplayAdapter::new(&write_payload(tmp.path(), &lone_cover));
    let report = sync::run(&ctx, &cfg, &adapter, "2025-02-01", "2025-02-28").unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.posted, 0);
}

#[test]
fn sell_without_inventory_is_marked_pending() {
    let (tmp, ctx, cfg) = setup();
    let lone_sell = json!({
        "trades": [
            {"id": "ord-9", "symbol": "TSLA", "action": "sell",
             "filled_qty": 3, "filled_avg_price": 200.0,
             "filled_at": "2025-02-10T16:00:00Z"}
        ],
        "activities": []
    });
    let adapter = ReplayAdapter::new(&write_payload(tmp.path(), &lone_sell));
    let report = sync::run(&ctx, &cfg, &adapter, "2025-02-01", "2025-02-28").unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(report.posted, 0);

    let conn = open_ledger(&ctx).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 0, "failed journal must leave no partial legs");
}

#[test]
fn fitid_stable_across_renormalization_of_canonical_form() {
    let identity = Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap();
    let raw = json!({
        "id": "ord-1", "symbol": "AAPL", "action": "buy",
        "filled_qty": 5, "filled_avg_price": 100.0,
        "filled_at": "2025-02-10T15:04:05Z"
    });
    let first = normalize::normalize_trade(&raw, &identity);
    // Feed the canonical output back through the normalizer
    let canonical = json!({
        "trade_id": "ord-1",
        "symbol": "AAPL",
        "action": "buy",
        "quantity": 5.0,
        "price": 100.0,
        "stable_id": first.ofx.stable_id,
        "DTPOSTED": first.ofx.dtposted,
    });
    let second = normalize::normalize_trade(&canonical, &identity);
    assert_eq!(first.ofx.fitid, second.ofx.fitid);
    assert_eq!(first.ofx.group_id, second.ofx.group_id);
}
