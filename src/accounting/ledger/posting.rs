//! Posting router: normalized broker trades become multi-leg journals with
//! lot-backed cost basis and realized P&L.
//!
//! Conventions:
//! - Positive `total_value` = debit; negative = credit.
//! - Fees are expensed to Brokerage Fees and by default do NOT reduce
//!   realized P&L.
//! - Supplementary legs (fees, realized P&L) carry suffixed trade ids so the
//!   `(trade_id, side)` uniqueness invariant holds across a journal.

use crate::accounting::coa::{self, Account};
use crate::accounting::ledger::double_entry::{ZERO_SUM_TOLERANCE, insert_leg};
use crate::accounting::ledger::entry::{EntryMap, add_required_fields};
use crate::accounting::lots::{
    AllocationPolicy, LotSide, allocate_for_close, record_close, record_open,
};
use crate::core::audit::{AuditEvent, append_best_effort};
use crate::core::context::Context;
use crate::core::db::TableSchema;
use crate::core::error::TbotError;
use crate::core::time::now_iso_z;
use rusqlite::{Connection, TransactionBehavior};
use serde_json::json;

/// Fees reduce realized P&L only when this is flipped on.
pub const FEES_AFFECT_REALIZED_PNL: bool = false;

/// Account labels used by the posting primitives. Defaults match the stock
/// COA template; a loaded COA overrides them by name discovery.
#[derive(Debug, Clone)]
pub struct AccountMap {
    pub cash: String,
    pub equity_prefix: String,
    pub short_prefix: String,
    pub fees: String,
    pub realized_pnl: String,
    pub dividends: String,
    pub interest: String,
    pub equity_contrib: String,
    pub owner_withdrawals: String,
}

impl Default for AccountMap {
    fn default() -> Self {
        AccountMap {
            cash: "Assets:Brokerage:Cash".to_string(),
            equity_prefix: "Assets:Brokerage:Equity:".to_string(),
            short_prefix: "Liabilities:Short Positions:".to_string(),
            fees: "Expenses:Brokerage Fees".to_string(),
            realized_pnl: "Income:Realized Gains – Equities".to_string(),
            dividends: "Income:Dividends Earned".to_string(),
            interest: "Income:Interest Income".to_string(),
            equity_contrib: "Equity:Capital Contributions".to_string(),
            owner_withdrawals: "Equity:Owner Withdrawals".to_string(),
        }
    }
}

impl AccountMap {
    pub fn equity_account(&self, symbol: Option<&str>) -> String {
        format!(
            "{}{}",
            self.equity_prefix,
            symbol.unwrap_or("UNKNOWN").to_uppercase()
        )
    }

    pub fn short_account(&self, symbol: Option<&str>) -> String {
        format!(
            "{}{}",
            self.short_prefix,
            symbol.unwrap_or("UNKNOWN").to_uppercase()
        )
    }
}

/// Best-fit account discovery over the COA by name keywords, tolerant to
/// numbering and prefixes. Falls back to the defaults per slot.
pub fn discover_accounts(ctx: &Context) -> AccountMap {
    let mut acc = AccountMap::default();
    let Ok(bundle) = coa::load(ctx) else {
        return acc;
    };

    fn walk(nodes: &[Account], path: &str, acc: &mut AccountMap, found: &mut Vec<&'static str>) {
        for node in nodes {
            let full = if path.is_empty() {
                node.name.clone()
            } else {
                format!("{}:{}", path, node.name)
            };
            let lower = full.to_lowercase();
            let mut pick = |slot: &'static str, value: String| {
                if !found.contains(&slot) {
                    found.push(slot);
                    match slot {
                        "cash" => acc.cash = value,
                        "equity_prefix" => {
                            acc.equity_prefix =
                                if value.ends_with(':') { value } else { format!("{}:", value) }
                        }
                        "short_prefix" => {
                            acc.short_prefix =
                                if value.ends_with(':') { value } else { format!("{}:", value) }
                        }
                        "fees" => acc.fees = value,
                        "realized_pnl" => acc.realized_pnl = value,
                        "dividends" => acc.dividends = value,
                        "interest" => acc.interest = value,
                        "equity_contrib" => acc.equity_contrib = value,
                        "owner_withdrawals" => acc.owner_withdrawals = value,
                        _ => {}
                    }
                }
            };

            if lower.contains("broker") && lower.contains("cash") && !lower.contains("sweep") {
                pick("cash", node.code.clone());
            }
            if lower.contains("brokerage") && lower.ends_with("equity") {
                pick("equity_prefix", node.code.clone());
            }
            if lower.contains("short") && lower.contains("position") {
                pick("short_prefix", node.code.clone());
            }
            if lower.contains("realized") && lower.contains("gain") {
                pick("realized_pnl", node.code.clone());
            }
            if lower.contains("dividend") {
                pick("dividends", node.code.clone());
            }
            if lower.contains("interest") {
                pick("interest", node.code.clone());
            }
            if lower.contains("brokerage fee") || lower.contains("commission") {
                pick("fees", node.code.clone());
            }
            if lower.contains("capital") && lower.contains("contribution") {
                pick("equity_contrib", node.code.clone());
            }
            if lower.contains("owner") && lower.contains("withdraw") {
                pick("owner_withdrawals", node.code.clone());
            }

            walk(&node.children, &full, acc, found);
        }
    }
    let mut found = Vec::new();
    walk(&bundle.accounts, "", &mut acc, &mut found);
    acc
}

/// Caller-supplied posting context: actor, journal id, strategy tags.
#[derive(Debug, Clone, Default)]
pub struct PostMeta {
    pub actor: Option<String>,
    pub group_id: Option<String>,
    pub strategy: Option<String>,
    pub tags: Option<String>,
}

impl PostMeta {
    fn actor(&self) -> &str {
        self.actor.as_deref().unwrap_or("system")
    }

    fn group_id_or(&self, trade_id: &str) -> String {
        self.group_id
            .clone()
            .unwrap_or_else(|| trade_id.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostResult {
    pub legs: usize,
    pub basis: Option<f64>,
    pub proceeds: Option<f64>,
    pub realized: Option<f64>,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[allow(clippy::too_many_arguments)]
fn leg(
    ts: &str,
    symbol: Option<&str>,
    action: &str,
    account: &str,
    total_value: f64,
    trade_id: &str,
    group_id: &str,
    meta: &PostMeta,
    notes: &str,
) -> EntryMap {
    let mut e = EntryMap::new();
    e.insert("datetime_utc".into(), json!(ts));
    e.insert("symbol".into(), json!(symbol));
    e.insert("action".into(), json!(action));
    e.insert("account".into(), json!(account));
    e.insert("total_value".into(), json!(total_value));
    e.insert(
        "side".into(),
        json!(if total_value >= 0.0 { "debit" } else { "credit" }),
    );
    e.insert("trade_id".into(), json!(trade_id));
    e.insert("group_id".into(), json!(group_id));
    e.insert("strategy".into(), json!(meta.strategy));
    e.insert("tags".into(), json!(meta.tags));
    e.insert("notes".into(), json!(notes));
    e
}

fn fee_legs(
    ts: &str,
    symbol: Option<&str>,
    fee: f64,
    trade_id: &str,
    group_id: &str,
    meta: &PostMeta,
    acc: &AccountMap,
) -> Vec<EntryMap> {
    if fee == 0.0 {
        return Vec::new();
    }
    let fee_tid = format!("{}_fee", trade_id);
    vec![
        leg(
            ts,
            symbol,
            "other",
            &acc.fees,
            round2(fee),
            &fee_tid,
            group_id,
            meta,
            "Brokerage fee (debit)",
        ),
        leg(
            ts,
            symbol,
            "other",
            &acc.cash,
            round2(-fee),
            &fee_tid,
            group_id,
            meta,
            "Brokerage fee cash (credit)",
        ),
    ]
}

/// Realized P&L leg: gains credit the income account (negative value),
/// losses debit it (positive value).
fn pnl_leg(
    ts: &str,
    symbol: Option<&str>,
    realized: f64,
    trade_id: &str,
    group_id: &str,
    meta: &PostMeta,
    acc: &AccountMap,
    notes: &str,
) -> Option<EntryMap> {
    if realized == 0.0 {
        return None;
    }
    let value = if realized > 0.0 {
        -realized
    } else {
        realized.abs()
    };
    Some(leg(
        ts,
        symbol,
        "other",
        &acc.realized_pnl,
        round2(value),
        &format!("{}_pnl", trade_id),
        group_id,
        meta,
        notes,
    ))
}

fn insert_journal(
    ctx: &Context,
    conn: &mut Connection,
    legs: &[EntryMap],
) -> Result<(), TbotError> {
    let total: f64 = legs
        .iter()
        .map(|l| l.get("total_value").and_then(|v| v.as_f64()).unwrap_or(0.0))
        .sum();
    if total.abs() > ZERO_SUM_TOLERANCE {
        return Err(TbotError::Validation(format!(
            "journal legs not balanced (sum={:.6})",
            total
        )));
    }
    let schema = TableSchema::load(conn, "trades")?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if let Some(first) = legs.first() {
        tx.execute(
            "INSERT OR IGNORE INTO trade_groups (group_id, datetime_utc, type, status, notes)
             VALUES (?1, ?2, ?3, 'posted', NULL)",
            rusqlite::params![
                first.get("group_id").and_then(|v| v.as_str()),
                first.get("datetime_utc").and_then(|v| v.as_str()),
                first.get("action").and_then(|v| v.as_str()),
            ],
        )?;
    }
    for l in legs {
        let sanitized = add_required_fields(l, &ctx.identity);
        insert_leg(&tx, &schema, &sanitized)?;
    }
    tx.commit()?;
    Ok(())
}

/// Long BUY: Dr Equity{SYM}, Cr Cash, fee legs, open lot at `unit_cost=price`.
#[allow(clippy::too_many_arguments)]
pub fn post_buy(
    ctx: &Context,
    conn: &mut Connection,
    symbol: &str,
    qty: f64,
    price: f64,
    fee: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let ts = ts_utc.map(String::from).unwrap_or_else(now_iso_z);
    let group_id = meta.group_id_or(trade_id);
    let amt = round2(qty * price);
    let acc = discover_accounts(ctx);

    record_open(
        ctx,
        conn,
        symbol,
        qty,
        price,
        0.0,
        LotSide::Long,
        Some(trade_id),
        &ts,
    )?;

    let mut legs = vec![
        leg(&ts, Some(symbol), "long", &acc.equity_account(Some(symbol)), amt, trade_id, &group_id, meta, "BUY equity (debit)"),
        leg(&ts, Some(symbol), "long", &acc.cash, -amt, trade_id, &group_id, meta, "BUY cash (credit)"),
    ];
    legs.extend(fee_legs(&ts, Some(symbol), fee, trade_id, &group_id, meta, &acc));
    insert_journal(ctx, conn, &legs)?;

    append_best_effort(
        ctx,
        AuditEvent {
            action: "TRADE_POSTED_LONG_BUY",
            actor: meta.actor(),
            group_id: Some(&group_id),
            reason: Some("post_buy"),
            after: Some(json!({"qty": qty, "price": price, "fee": fee, "trade_id": trade_id})),
            ..Default::default()
        },
    );
    Ok(PostResult {
        legs: legs.len(),
        ..Default::default()
    })
}

/// Close LONG (SELL): Dr Cash at proceeds, Cr Equity at FIFO basis, P&L leg,
/// fee legs.
#[allow(clippy::too_many_arguments)]
pub fn post_sell(
    ctx: &Context,
    conn: &mut Connection,
    symbol: &str,
    qty: f64,
    price: f64,
    fee: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let ts = ts_utc.map(String::from).unwrap_or_else(now_iso_z);
    let group_id = meta.group_id_or(trade_id);
    let proceeds = round2(qty * price);
    let acc = discover_accounts(ctx);

    let allocations =
        allocate_for_close(conn, symbol, qty, LotSide::Long, AllocationPolicy::Fifo)?;
    let summary = record_close(
        ctx,
        conn,
        LotSide::Long,
        &allocations,
        Some(trade_id),
        proceeds,
        fee,
        &ts,
        FEES_AFFECT_REALIZED_PNL,
    )?;
    let basis = round2(summary.basis_total);
    // Residual against the rounded legs so the journal balances exactly.
    let realized = round2(proceeds - basis);

    let mut legs = vec![
        leg(&ts, Some(symbol), "short", &acc.cash, proceeds, trade_id, &group_id, meta, "SELL proceeds (debit cash)"),
        leg(&ts, Some(symbol), "short", &acc.equity_account(Some(symbol)), -basis, trade_id, &group_id, meta, "SELL remove basis (credit equity)"),
    ];
    if let Some(pnl) = pnl_leg(&ts, Some(symbol), realized, trade_id, &group_id, meta, &acc, "Realized P&L on SELL") {
        legs.push(pnl);
    }
    legs.extend(fee_legs(&ts, Some(symbol), fee, trade_id, &group_id, meta, &acc));
    insert_journal(ctx, conn, &legs)?;

    append_best_effort(
        ctx,
        AuditEvent {
            action: "TRADE_POSTED_LONG_SELL",
            actor: meta.actor(),
            group_id: Some(&group_id),
            reason: Some("post_sell"),
            after: Some(json!({"qty": qty, "price": price, "fee": fee, "pnl": realized})),
            ..Default::default()
        },
    );
    Ok(PostResult {
        legs: legs.len(),
        basis: Some(basis),
        proceeds: Some(proceeds),
        realized: Some(realized),
    })
}

/// Open SHORT (sell to open): Dr Cash at proceeds, Cr short liability; lot
/// opened with `unit_cost` = proceeds per share.
#[allow(clippy::too_many_arguments)]
pub fn post_short_open(
    ctx: &Context,
    conn: &mut Connection,
    symbol: &str,
    qty: f64,
    price: f64,
    fee: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let ts = ts_utc.map(String::from).unwrap_or_else(now_iso_z);
    let group_id = meta.group_id_or(trade_id);
    let proceeds = round2(qty * price);
    let acc = discover_accounts(ctx);

    record_open(
        ctx,
        conn,
        symbol,
        qty,
        price,
        0.0,
        LotSide::Short,
        Some(trade_id),
        &ts,
    )?;

    let mut legs = vec![
        leg(&ts, Some(symbol), "short", &acc.cash, proceeds, trade_id, &group_id, meta, "SHORT open: receive proceeds (debit cash)"),
        leg(&ts, Some(symbol), "short", &acc.short_account(Some(symbol)), -proceeds, trade_id, &group_id, meta, "SHORT open: liability (credit)"),
    ];
    legs.extend(fee_legs(&ts, Some(symbol), fee, trade_id, &group_id, meta, &acc));
    insert_journal(ctx, conn, &legs)?;

    append_best_effort(
        ctx,
        AuditEvent {
            action: "TRADE_POSTED_SHORT_OPEN",
            actor: meta.actor(),
            group_id: Some(&group_id),
            reason: Some("post_short_open"),
            after: Some(json!({"qty": qty, "price": price, "fee": fee})),
            ..Default::default()
        },
    );
    Ok(PostResult {
        legs: legs.len(),
        proceeds: Some(proceeds),
        ..Default::default()
    })
}

/// Close SHORT (buy to cover): Dr liability at basis, Cr Cash at cover cost,
/// P&L leg, fee legs.
#[allow(clippy::too_many_arguments)]
pub fn post_short_cover(
    ctx: &Context,
    conn: &mut Connection,
    symbol: &str,
    qty: f64,
    price: f64,
    fee: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let ts = ts_utc.map(String::from).unwrap_or_else(now_iso_z);
    let group_id = meta.group_id_or(trade_id);
    let cover_cost = round2(qty * price);
    let acc = discover_accounts(ctx);

    let allocations =
        allocate_for_close(conn, symbol, qty, LotSide::Short, AllocationPolicy::Fifo)?;
    let summary = record_close(
        ctx,
        conn,
        LotSide::Short,
        &allocations,
        Some(trade_id),
        cover_cost,
        fee,
        &ts,
        FEES_AFFECT_REALIZED_PNL,
    )?;
    let basis = round2(summary.basis_total);
    // Residual against the rounded legs so the journal balances exactly.
    let realized = round2(basis - cover_cost);

    let mut legs = vec![
        leg(&ts, Some(symbol), "long", &acc.short_account(Some(symbol)), basis, trade_id, &group_id, meta, "SHORT cover: remove liability (debit)"),
        leg(&ts, Some(symbol), "long", &acc.cash, -cover_cost, trade_id, &group_id, meta, "SHORT cover: pay cash (credit)"),
    ];
    if let Some(pnl) = pnl_leg(&ts, Some(symbol), realized, trade_id, &group_id, meta, &acc, "Realized P&L on SHORT cover") {
        legs.push(pnl);
    }
    legs.extend(fee_legs(&ts, Some(symbol), fee, trade_id, &group_id, meta, &acc));
    insert_journal(ctx, conn, &legs)?;

    append_best_effort(
        ctx,
        AuditEvent {
            action: "TRADE_POSTED_SHORT_COVER",
            actor: meta.actor(),
            group_id: Some(&group_id),
            reason: Some("post_short_cover"),
            after: Some(json!({"qty": qty, "price": price, "fee": fee, "pnl": realized})),
            ..Default::default()
        },
    );
    Ok(PostResult {
        legs: legs.len(),
        basis: Some(basis),
        proceeds: Some(cover_cost),
        realized: Some(realized),
    })
}

#[allow(clippy::too_many_arguments)]
fn post_cash_pair(
    ctx: &Context,
    conn: &mut Connection,
    action_name: &'static str,
    audit_action: &'static str,
    debit_account: &str,
    credit_account: &str,
    amount: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
    symbol: Option<&str>,
    notes: (&str, &str),
) -> Result<PostResult, TbotError> {
    let ts = ts_utc.map(String::from).unwrap_or_else(now_iso_z);
    let group_id = meta.group_id_or(trade_id);
    let amt = round2(amount);
    let legs = vec![
        leg(&ts, symbol, "other", debit_account, amt, trade_id, &group_id, meta, notes.0),
        leg(&ts, symbol, "other", credit_account, -amt, trade_id, &group_id, meta, notes.1),
    ];
    insert_journal(ctx, conn, &legs)?;
    append_best_effort(
        ctx,
        AuditEvent {
            action: audit_action,
            actor: meta.actor(),
            group_id: Some(&group_id),
            reason: Some(action_name),
            after: Some(json!({"amount": amt, "symbol": symbol})),
            ..Default::default()
        },
    );
    Ok(PostResult {
        legs: 2,
        ..Default::default()
    })
}

/// Cash DEPOSIT (owner contribution): Dr Cash, Cr Capital Contributions.
pub fn post_deposit(
    ctx: &Context,
    conn: &mut Connection,
    amount: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let acc = discover_accounts(ctx);
    post_cash_pair(
        ctx, conn, "post_deposit", "CASH_DEPOSIT",
        &acc.cash, &acc.equity_contrib,
        amount, trade_id, ts_utc, meta, None,
        ("Deposit received", "Owner contribution"),
    )
}

/// Cash WITHDRAWAL (owner draw): Dr Owner Withdrawals, Cr Cash.
pub fn post_withdrawal(
    ctx: &Context,
    conn: &mut Connection,
    amount: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let acc = discover_accounts(ctx);
    post_cash_pair(
        ctx, conn, "post_withdrawal", "CASH_WITHDRAWAL",
        &acc.owner_withdrawals, &acc.cash,
        amount, trade_id, ts_utc, meta, None,
        ("Owner withdrawal", "Withdrawal cash"),
    )
}

/// DIVIDEND: Dr Cash, Cr Dividend income.
#[allow(clippy::too_many_arguments)]
pub fn post_dividend(
    ctx: &Context,
    conn: &mut Connection,
    amount: f64,
    trade_id: &str,
    symbol: Option<&str>,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let acc = discover_accounts(ctx);
    post_cash_pair(
        ctx, conn, "post_dividend", "DIVIDEND_POSTED",
        &acc.cash, &acc.dividends,
        amount, trade_id, ts_utc, meta, symbol,
        ("Dividend received", "Dividend income"),
    )
}

/// INTEREST: Dr Cash, Cr Interest income.
pub fn post_interest(
    ctx: &Context,
    conn: &mut Connection,
    amount: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let acc = discover_accounts(ctx);
    post_cash_pair(
        ctx, conn, "post_interest", "INTEREST_POSTED",
        &acc.cash, &acc.interest,
        amount, trade_id, ts_utc, meta, None,
        ("Interest received", "Interest income"),
    )
}

/// FEE / COMMISSION: Dr Brokerage Fees, Cr Cash.
pub fn post_fee(
    ctx: &Context,
    conn: &mut Connection,
    amount: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let acc = discover_accounts(ctx);
    post_cash_pair(
        ctx, conn, "post_fee", "FEE_POSTED",
        &acc.fees, &acc.cash,
        amount, trade_id, ts_utc, meta, None,
        ("Broker fee (debit)", "Broker fee cash (credit)"),
    )
}

/// Convenience router over normalized action verbs.
#[allow(clippy::too_many_arguments)]
pub fn post_trade(
    ctx: &Context,
    conn: &mut Connection,
    action: &str,
    symbol: Option<&str>,
    qty: f64,
    price: f64,
    fee: f64,
    trade_id: &str,
    ts_utc: Option<&str>,
    meta: &PostMeta,
) -> Result<PostResult, TbotError> {
    let verb = action.trim().to_uppercase();
    let need_symbol = || {
        symbol.ok_or_else(|| {
            TbotError::Validation(format!("action '{}' requires a symbol", verb))
        })
    };
    // Cash/admin amounts arrive through whichever numeric slot the caller used.
    let amount = [qty, price, fee].into_iter().find(|v| *v != 0.0).unwrap_or(0.0);

    match verb.as_str() {
        "BUY" | "LONG" | "BUY_TO_OPEN" => {
            post_buy(ctx, conn, need_symbol()?, qty, price, fee, trade_id, ts_utc, meta)
        }
        "SELL" | "SELL_TO_CLOSE" => {
            post_sell(ctx, conn, need_symbol()?, qty, price, fee, trade_id, ts_utc, meta)
        }
        "SHORT" | "SHORT_OPEN" | "SELL_SHORT" | "SELL_TO_OPEN" => {
            post_short_open(ctx, conn, need_symbol()?, qty, price, fee, trade_id, ts_utc, meta)
        }
        "COVER" | "SHORT_COVER" | "BUY_TO_COVER" => {
            post_short_cover(ctx, conn, need_symbol()?, qty, price, fee, trade_id, ts_utc, meta)
        }
        "DIVIDEND" | "DIV" => post_dividend(ctx, conn, amount, trade_id, symbol, ts_utc, meta),
        "INTEREST" | "INT" => post_interest(ctx, conn, amount, trade_id, ts_utc, meta),
        "DEPOSIT" | "TRANSFER_IN" => post_deposit(ctx, conn, amount, trade_id, ts_utc, meta),
        "WITHDRAWAL" | "TRANSFER_OUT" => post_withdrawal(ctx, conn, amount, trade_id, ts_utc, meta),
        "FEE" | "COMMISSION" => post_fee(ctx, conn, amount, trade_id, ts_utc, meta),
        other => Err(TbotError::Validation(format!(
            "unsupported action '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::ledger::double_entry::validate_double_entry;
    use crate::core::db::open_ledger;
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

    #[test]
    fn test_buy_then_sell_realizes_gain() {
        let (_tmp, ctx, mut conn) = setup();
        post_buy(&ctx, &mut conn, "AAPL", 5.0, 100.0, 0.5, "T1", Some("2025-02-10T15:04:05Z"), &PostMeta::default()).unwrap();
        let result = post_sell(&ctx, &mut conn, "AAPL", 5.0, 110.0, 0.5, "T2", Some("2025-02-10T19:00:00Z"), &PostMeta::default()).unwrap();

        assert_eq!(result.basis, Some(500.0));
        assert_eq!(result.proceeds, Some(550.0));
        assert_eq!(result.realized, Some(50.0));

        validate_double_entry(&conn).unwrap();

        // Closure row captured basis/proceeds/realized
        let (basis, proceeds, realized): (f64, f64, f64) = conn
            .query_row(
                "SELECT basis_amount, proceeds_amount, realized_pnl FROM lot_closures",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((basis, proceeds, realized), (500.0, 550.0, 50.0));

        // Realized gain sits as a credit on the income account
        let pnl_total: f64 = conn
            .query_row(
                "SELECT total_value FROM trades WHERE trade_id = 'T2_pnl'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(pnl_total, -50.0);
    }

    #[test]
    fn test_buy_without_inventory_fails_sell() {
        let (_tmp, ctx, mut conn) = setup();
        let err = post_sell(&ctx, &mut conn, "AAPL", 5.0, 110.0, 0.0, "T2", None, &PostMeta::default());
        assert!(matches!(err, Err(TbotError::InsufficientInventory { .. })));
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0, "failed close must not write legs");
    }

    #[test]
    fn test_short_open_and_cover() {
        let (_tmp, ctx, mut conn) = setup();
        post_short_open(&ctx, &mut conn, "XYZ", 10.0, 50.0, 0.0, "S1", Some("2025-02-10T15:00:00Z"), &PostMeta::default()).unwrap();
        let result = post_short_cover(&ctx, &mut conn, "XYZ", 10.0, 45.0, 0.0, "S2", Some("2025-02-10T19:00:00Z"), &PostMeta::default()).unwrap();
        assert_eq!(result.realized, Some(50.0));
        validate_double_entry(&conn).unwrap();
    }

    #[test]
    fn test_cash_primitives_zero_sum() {
        let (_tmp, ctx, mut conn) = setup();
        post_deposit(&ctx, &mut conn, 1000.0, "D1", Some("2025-02-10T14:00:00Z"), &PostMeta::default()).unwrap();
        post_dividend(&ctx, &mut conn, 12.5, "V1", Some("AAPL"), Some("2025-02-10T15:00:00Z"), &PostMeta::default()).unwrap();
        post_interest(&ctx, &mut conn, 1.25, "I1", Some("2025-02-10T15:00:00Z"), &PostMeta::default()).unwrap();
        post_withdrawal(&ctx, &mut conn, 200.0, "W1", Some("2025-02-10T16:00:00Z"), &PostMeta::default()).unwrap();
        post_fee(&ctx, &mut conn, 3.0, "F1", Some("2025-02-10T16:30:00Z"), &PostMeta::default()).unwrap();
        validate_double_entry(&conn).unwrap();
        let total: f64 = conn
            .query_row("SELECT SUM(total_value) FROM trades", [], |r| r.get(0))
            .unwrap();
        assert!(total.abs() < ZERO_SUM_TOLERANCE);
    }

    #[test]
    fn test_router_short_and_cover_aliases() {
        let (_tmp, ctx, mut conn) = setup();
        post_trade(&ctx, &mut conn, "SHORT", Some("XYZ"), 10.0, 50.0, 0.0, "S1", Some("2025-02-10T15:00:00Z"), &PostMeta::default()).unwrap();
        let result = post_trade(&ctx, &mut conn, "COVER", Some("XYZ"), 10.0, 45.0, 0.0, "S2", Some("2025-02-10T19:00:00Z"), &PostMeta::default()).unwrap();
        assert_eq!(result.realized, Some(50.0));
        let remaining: f64 = conn
            .query_row("SELECT SUM(qty_remaining) FROM lots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0.0);
        validate_double_entry(&conn).unwrap();
    }

    #[test]
    fn test_router_rejects_unknown_action() {
        let (_tmp, ctx, mut conn) = setup();
        let err = post_trade(&ctx, &mut conn, "SPLIT", Some("AAPL"), 1.0, 1.0, 0.0, "R1", None, &PostMeta::default());
        assert!(matches!(err, Err(TbotError::Validation(_))));
    }

    #[test]
    fn test_discover_accounts_uses_coa_codes() {
        let (_tmp, ctx, _conn) = setup();
        let acc = discover_accounts(&ctx);
        assert_eq!(acc.cash, "1110");
        assert_eq!(acc.dividends, "4080");
        assert_eq!(acc.realized_pnl, "4010");
        assert!(acc.equity_prefix.starts_with("1120"));
    }
}
