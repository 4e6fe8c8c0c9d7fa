//! Broker → ledger sync driver.
//!
//! One run: snapshot the ledger DB, pull raw trades and cash activities from
//! the adapter, normalize, dedupe in memory, compliance-filter (rejects are
//! audited and dropped), bootstrap opening balances when the ledger is
//! fresh, then post — trades through the lot-aware primitives, cash through
//! mapped double-entry. Every audit record carries the `sync_run_id` and a
//! `response_hash` over the fetched payload.

use crate::accounting::ledger::compliance::{CompliancePolicy, filter_compliant};
use crate::accounting::ledger::dedupe::deduplicate_entries;
use crate::accounting::ledger::double_entry::post_double_entry;
use crate::accounting::ledger::entry::EntryMap;
use crate::accounting::ledger::opening_balance::post_opening_balances_if_needed;
use crate::accounting::ledger::posting::{self, PostMeta};
use crate::accounting::ledger::snapshot::snapshot_ledger_before_sync;
use crate::accounting::mapping;
use crate::accounting::normalize::{NormalizedRecord, normalize_cash, normalize_trade};
use crate::broker::BrokerAdapter;
use crate::core::audit::{AuditEvent, append_best_effort};
use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::db::open_ledger;
use crate::core::error::TbotError;
use crate::runtime::status;
use serde_json::json;
use sha2::{Digest, Sha256};
use ulid::Ulid;

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub sync_run_id: String,
    pub fetched: usize,
    pub posted: usize,
    pub rejected: usize,
    pub pending: usize,
    pub quarantined: usize,
    pub opening_balances_posted: bool,
}

fn response_hash(trades: &[serde_json::Value], activities: &[serde_json::Value]) -> String {
    let payload = json!({"trades": trades, "activities": activities});
    let digest = Sha256::digest(payload.to_string().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn action_of(entry: &EntryMap) -> Option<String> {
    entry
        .get("action")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
}

/// Trade verbs (and their broker aliases) that route through the lot-aware
/// posting primitives. Everything else is cash/admin activity.
fn is_trade_verb(action: Option<&str>) -> bool {
    matches!(
        action,
        Some(
            "buy" | "long" | "buy_to_open"
                | "sell" | "sell_to_close"
                | "short" | "short_open" | "sell_short" | "sell_to_open"
                | "cover" | "short_cover" | "buy_to_cover"
        )
    )
}

/// Short-side verbs hold inventory against the short liability account.
fn is_short_side_verb(action: Option<&str>) -> bool {
    matches!(
        action,
        Some(
            "short" | "short_open" | "sell_short" | "sell_to_open"
                | "cover" | "short_cover" | "buy_to_cover"
        )
    )
}

/// Cash leaves the account on sells and short opens; enters on buys/covers.
fn is_credit_side_verb(action: Option<&str>) -> bool {
    matches!(
        action,
        Some("sell" | "sell_to_close" | "short" | "short_open" | "sell_short" | "sell_to_open")
    )
}

/// Run one sync over `[from, to]` (inclusive ISO dates).
pub fn run(
    ctx: &Context,
    cfg: &Config,
    adapter: &dyn BrokerAdapter,
    from: &str,
    to: &str,
) -> Result<SyncReport, TbotError> {
    let sync_run_id = Ulid::new().to_string();
    let log = |msg: &str| status::log_line(ctx, "broker_sync", msg);
    log(&format!("sync {} starting for {}..{}", sync_run_id, from, to));

    // Open (and thereby create) the ledger before snapshotting it.
    let mut conn = open_ledger(ctx)?;
    let snapshot_path = snapshot_ledger_before_sync(ctx)?;
    log(&format!("ledger snapshot: {}", snapshot_path.display()));

    let raw_trades = adapter.fetch_trades(from, to)?;
    let raw_activities = adapter.fetch_activities(from, to)?;
    let hash = response_hash(&raw_trades, &raw_activities);
    let fetched = raw_trades.len() + raw_activities.len();

    let records: Vec<NormalizedRecord> = raw_trades
        .iter()
        .map(|r| NormalizedRecord::Trade(normalize_trade(r, &ctx.identity)))
        .chain(
            raw_activities
                .iter()
                .map(|r| NormalizedRecord::Cash(normalize_cash(r, &ctx.identity))),
        )
        .collect();

    // Entry maps drive dedupe + compliance; trade entries get their equity
    // account resolved up front so the account check can pass.
    let accounts = posting::discover_accounts(ctx);
    let entries: Vec<EntryMap> = records
        .iter()
        .map(|record| {
            let mut entry = record.to_entry_map();
            if let NormalizedRecord::Trade(t) = record {
                let action = t.action.as_deref();
                let account = if is_short_side_verb(action) {
                    accounts.short_account(t.symbol.as_deref())
                } else {
                    accounts.equity_account(t.symbol.as_deref())
                };
                entry.insert("account".into(), json!(account));
                entry.insert(
                    "side".into(),
                    json!(if is_credit_side_verb(action) { "credit" } else { "debit" }),
                );
            } else {
                entry.insert("side".into(), json!("debit"));
            }
            entry
        })
        .collect();

    let deduped = deduplicate_entries(entries);
    let deduped_count = deduped.len();

    let mapping_table = mapping::load(ctx, None)?;
    let policy = CompliancePolicy::from_config(cfg);
    let (compliant, rejected) = filter_compliant(ctx, deduped, &policy, Some(&mapping_table));
    if !rejected.is_empty() {
        log(&format!("{} entries rejected by compliance", rejected.len()));
    }
    // Unmapped rejects are quarantined on the mapping table for review.
    for (entry, reason) in &rejected {
        if *reason == crate::core::error::RejectReason::UnmappedOrMissingAccount {
            let _ = mapping::flag_unmapped(
                ctx,
                serde_json::Value::Object(entry.clone()),
                "broker_sync",
            );
        }
    }

    // Opening balances before any posting, when the broker gave a snapshot.
    let mut ob_posted = false;
    if let Some(snapshot) = adapter.fetch_snapshot()? {
        ob_posted = post_opening_balances_if_needed(ctx, &mut conn, &sync_run_id, &snapshot)?;
        if ob_posted {
            log("opening balances posted");
        }
    }

    let mut posted = 0usize;
    let mut pending = 0usize;
    let mut quarantined = 0usize;
    let mut cash_entries: Vec<EntryMap> = Vec::new();
    let meta = PostMeta {
        actor: Some("broker_sync".to_string()),
        ..Default::default()
    };

    for entry in compliant {
        let action = action_of(&entry);
        if !is_trade_verb(action.as_deref()) {
            cash_entries.push(entry);
            continue;
        }

        // On-disk dedupe: a trade already journaled must not reopen lots.
        if let Some(tid) = entry.get("trade_id").and_then(|v| v.as_str()) {
            if crate::accounting::ledger::dedupe::trade_exists(&conn, tid, None)? {
                continue;
            }
        }

        let symbol = entry
            .get("symbol")
            .and_then(|v| v.as_str())
            .map(String::from);
        let qty = entry.get("quantity").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let price = entry.get("price").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let fee = entry.get("fee").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let trade_id = entry
            .get("trade_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let ts = entry
            .get("datetime_utc")
            .and_then(|v| v.as_str())
            .map(String::from);
        let group_meta = PostMeta {
            group_id: entry
                .get("group_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            ..meta.clone()
        };

        // The posting router owns every trade verb and its aliases —
        // buy/sell, short open, and short cover all land on the lot-aware
        // primitives.
        let result = posting::post_trade(
            ctx,
            &mut conn,
            action.as_deref().unwrap_or(""),
            symbol.as_deref(),
            qty,
            price,
            fee,
            &trade_id,
            ts.as_deref(),
            &group_meta,
        );
        match result {
            Ok(_) => posted += 1,
            Err(TbotError::InsufficientInventory { .. }) => {
                // Journal rolled back; leave the entry for the next cycle.
                log(&format!("{}: insufficient inventory, marked pending", trade_id));
                pending += 1;
            }
            Err(TbotError::Validation(msg)) => {
                // Malformed single record (e.g. no symbol): quarantine it,
                // the rest of the run proceeds.
                log(&format!("{}: quarantined ({})", trade_id, msg));
                let _ = mapping::flag_unmapped(
                    ctx,
                    serde_json::Value::Object(entry.clone()),
                    "broker_sync",
                );
                quarantined += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if !cash_entries.is_empty() {
        let pairs = post_double_entry(ctx, &mut conn, &cash_entries, &mapping_table)?;
        posted += pairs.len();
    }

    append_best_effort(
        ctx,
        AuditEvent {
            action: "sync_complete",
            actor: "broker_sync",
            extra: Some(json!({
                "sync_run_id": sync_run_id,
                "response_hash": hash,
                "fetched": fetched,
                "deduped": deduped_count,
                "posted": posted,
                "rejected": rejected.len(),
                "pending": pending,
                "quarantined": quarantined,
                "opening_balances_posted": ob_posted,
                "from": from,
                "to": to,
            })),
            ..Default::default()
        },
    );
    log(&format!(
        "sync {} complete: fetched={} posted={} rejected={} pending={} quarantined={}",
        sync_run_id,
        fetched,
        posted,
        rejected.len(),
        pending,
        quarantined
    ));

    Ok(SyncReport {
        sync_run_id,
        fetched,
        posted,
        rejected: rejected.len(),
        pending,
        quarantined,
        opening_balances_posted: ob_posted,
    })
}
