//! Lot engine for position basis tracking (FIFO by default).
//!
//! Maintains the `lots` and `lot_closures` tables. Long lots carry cost per
//! share in `unit_cost`; short lots carry short proceeds per share. Closures
//! decrement `qty_remaining` and record per-allocation realized P&L inside a
//! single transaction. Opens and closes emit immutable audit events.

use crate::core::audit::{AuditEvent, append_best_effort};
use crate::core::context::Context;
use crate::core::error::TbotError;
use rusqlite::{Connection, TransactionBehavior, params};
use serde_json::json;

/// Tolerance below which leftover inventory is treated as satisfied.
const QTY_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotSide {
    Long,
    Short,
}

impl LotSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotSide::Long => "long",
            LotSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TbotError> {
        match s.trim().to_lowercase().as_str() {
            "long" => Ok(LotSide::Long),
            "short" => Ok(LotSide::Short),
            other => Err(TbotError::Validation(format!(
                "lot side must be 'long' or 'short', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPolicy {
    Fifo,
    Lifo,
}

/// One slice of an open lot consumed by a close.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub lot_id: i64,
    pub qty: f64,
    pub unit_cost: f64,
    pub fees_alloc: f64,
    pub opened_at: String,
    pub opened_trade_id: Option<String>,
}

/// Totals returned from `record_close`.
#[derive(Debug, Clone)]
pub struct CloseSummary {
    pub side: LotSide,
    pub qty_closed: f64,
    pub basis_total: f64,
    pub proceeds_total: f64,
    pub fees_total: f64,
    pub realized_pnl_total: f64,
    pub closed_at: String,
}

/// Insert an opening lot; returns the new lot id. For shorts, `unit_cost` is
/// the short proceeds per share.
#[allow(clippy::too_many_arguments)]
pub fn record_open(
    ctx: &Context,
    conn: &Connection,
    symbol: &str,
    qty: f64,
    unit_cost: f64,
    fees: f64,
    side: LotSide,
    opened_trade_id: Option<&str>,
    opened_at_iso: &str,
) -> Result<i64, TbotError> {
    if qty <= 0.0 {
        return Err(TbotError::Validation(
            "qty must be > 0 for a new lot".to_string(),
        ));
    }
    conn.execute(
        "INSERT INTO lots(symbol, side, qty_open, qty_remaining, unit_cost, fees_alloc, opened_trade_id, opened_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            symbol,
            side.as_str(),
            qty,
            qty,
            unit_cost,
            fees,
            opened_trade_id,
            opened_at_iso
        ],
    )?;
    let lot_id = conn.last_insert_rowid();

    append_best_effort(
        ctx,
        AuditEvent {
            action: "LOT_OPENED",
            entry_id: Some(lot_id),
            actor: "system",
            after: Some(json!({
                "symbol": symbol,
                "side": side.as_str(),
                "qty_open": qty,
                "unit_cost": unit_cost,
                "fees_alloc": fees,
            })),
            extra: Some(json!({
                "opened_trade_id": opened_trade_id,
                "opened_at": opened_at_iso,
                "source": "lots.record_open",
            })),
            ..Default::default()
        },
    );
    Ok(lot_id)
}

/// Scan open lots of `(symbol, side)` in policy order and return allocations
/// summing to `qty_to_close`. Errors with `InsufficientInventory` when total
/// remaining falls short by more than the epsilon.
pub fn allocate_for_close(
    conn: &Connection,
    symbol: &str,
    qty_to_close: f64,
    side: LotSide,
    policy: AllocationPolicy,
) -> Result<Vec<Allocation>, TbotError> {
    if qty_to_close <= 0.0 {
        return Err(TbotError::Validation(
            "qty_to_close must be > 0".to_string(),
        ));
    }
    let order = match policy {
        AllocationPolicy::Fifo => "ASC",
        AllocationPolicy::Lifo => "DESC",
    };
    let sql = format!(
        "SELECT id, qty_remaining, unit_cost, fees_alloc, opened_at, opened_trade_id
         FROM lots
         WHERE symbol = ?1 AND side = ?2 AND qty_remaining > 0
         ORDER BY opened_at {order}, id {order}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![symbol, side.as_str()], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut remaining = qty_to_close;
    let mut allocations = Vec::new();
    for row in rows {
        if remaining <= 0.0 {
            break;
        }
        let (lot_id, qty_remaining, unit_cost, fees_alloc, opened_at, opened_trade_id) = row?;
        let take = remaining.min(qty_remaining);
        allocations.push(Allocation {
            lot_id,
            qty: take,
            unit_cost,
            fees_alloc,
            opened_at,
            opened_trade_id,
        });
        remaining -= take;
    }

    if remaining > QTY_EPSILON {
        let available = qty_to_close - remaining;
        return Err(TbotError::InsufficientInventory {
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            requested: format!("{}", qty_to_close),
            available: format!("{}", available),
        });
    }
    Ok(allocations)
}

/// Persist lot closures inside one transaction.
///
/// Long SELL: `proceeds_total` is cash in; realized = proceeds − basis.
/// Short COVER: `proceeds_total` is cover cash out; realized = basis − proceeds.
/// Fees reduce realized P&L only when `pnl_fees_affect` is set.
#[allow(clippy::too_many_arguments)]
pub fn record_close(
    ctx: &Context,
    conn: &mut Connection,
    side: LotSide,
    allocations: &[Allocation],
    close_trade_id: Option<&str>,
    proceeds_total: f64,
    total_close_fees: f64,
    closed_at_iso: &str,
    pnl_fees_affect: bool,
) -> Result<CloseSummary, TbotError> {
    if allocations.is_empty() {
        return Err(TbotError::Validation("allocations required".to_string()));
    }

    let qty_total: f64 = allocations.iter().map(|a| a.qty).sum();
    let basis_total: f64 = allocations.iter().map(|a| a.qty * a.unit_cost).sum();

    // Pro-rata apportioning by closed quantity.
    let shares: Vec<f64> = allocations
        .iter()
        .map(|a| if qty_total > 0.0 { a.qty / qty_total } else { 0.0 })
        .collect();
    let fee_rows: Vec<f64> = shares.iter().map(|s| total_close_fees * s).collect();
    let proceeds_rows: Vec<f64> = shares.iter().map(|s| proceeds_total * s).collect();

    let mut realized_rows = Vec::with_capacity(allocations.len());
    for (i, a) in allocations.iter().enumerate() {
        let basis = a.qty * a.unit_cost;
        let proceeds = proceeds_rows[i];
        let fees = if pnl_fees_affect { fee_rows[i] } else { 0.0 };
        let realized = match side {
            LotSide::Long => (proceeds - basis) - fees,
            LotSide::Short => (basis - proceeds) - fees,
        };
        realized_rows.push(realized);
    }
    let realized_total: f64 = realized_rows.iter().sum();

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for (i, a) in allocations.iter().enumerate() {
        tx.execute(
            "UPDATE lots SET qty_remaining = qty_remaining - ?1 WHERE id = ?2",
            params![a.qty, a.lot_id],
        )?;
        tx.execute(
            "INSERT INTO lot_closures(lot_id, close_trade_id, close_qty, basis_amount,
                                      proceeds_amount, fees_alloc, realized_pnl, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                a.lot_id,
                close_trade_id,
                a.qty,
                a.qty * a.unit_cost,
                proceeds_rows[i],
                fee_rows[i],
                realized_rows[i],
                closed_at_iso
            ],
        )?;
    }
    tx.commit()?;

    append_best_effort(
        ctx,
        AuditEvent {
            action: "LOT_CLOSED",
            actor: "system",
            after: Some(json!({
                "side": side.as_str(),
                "qty_closed": qty_total,
                "basis_total": basis_total,
                "proceeds_total": proceeds_total,
                "fees_total": total_close_fees,
                "realized_pnl_total": realized_total,
            })),
            extra: Some(json!({
                "close_trade_id": close_trade_id,
                "closed_at": closed_at_iso,
                "allocations_count": allocations.len(),
                "source": "lots.record_close",
            })),
            ..Default::default()
        },
    );

    Ok(CloseSummary {
        side,
        qty_closed: qty_total,
        basis_total,
        proceeds_total,
        fees_total: total_close_fees,
        realized_pnl_total: realized_total,
        closed_at: closed_at_iso.to_string(),
    })
}

/// One open-inventory row for operator views.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OpenLot {
    pub id: i64,
    pub symbol: String,
    pub side: String,
    pub qty_open: f64,
    pub qty_remaining: f64,
    pub unit_cost: f64,
    pub opened_trade_id: Option<String>,
    pub opened_at: String,
}

/// All lots with remaining quantity, oldest first.
pub fn open_lots(conn: &Connection) -> Result<Vec<OpenLot>, TbotError> {
    let mut stmt = conn.prepare(
        "SELECT id, symbol, side, qty_open, qty_remaining, unit_cost, opened_trade_id, opened_at
         FROM lots WHERE qty_remaining > 0 ORDER BY opened_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(OpenLot {
            id: row.get(0)?,
            symbol: row.get(1)?,
            side: row.get(2)?,
            qty_open: row.get(3)?,
            qty_remaining: row.get(4)?,
            unit_cost: row.get(5)?,
            opened_trade_id: row.get(6)?,
            opened_at: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Realized P&L summary per symbol over all closures.
pub fn realized_by_symbol(conn: &Connection) -> Result<Vec<(String, f64)>, TbotError> {
    let mut stmt = conn.prepare(
        "SELECT l.symbol, SUM(c.realized_pnl)
         FROM lot_closures c JOIN lots l ON l.id = c.lot_id
         GROUP BY l.symbol ORDER BY l.symbol",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// `Σ qty_open − Σ qty_closed − Σ qty_remaining` for one inventory; zero when
/// the lot tables are conserved.
pub fn conservation_drift(
    conn: &Connection,
    symbol: &str,
    side: LotSide,
) -> Result<f64, TbotError> {
    let (open_sum, remaining_sum): (f64, f64) = conn.query_row(
        "SELECT COALESCE(SUM(qty_open), 0), COALESCE(SUM(qty_remaining), 0)
         FROM lots WHERE symbol = ?1 AND side = ?2",
        params![symbol, side.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let closed_sum: f64 = conn.query_row(
        "SELECT COALESCE(SUM(c.close_qty), 0)
         FROM lot_closures c JOIN lots l ON l.id = c.lot_id
         WHERE l.symbol = ?1 AND l.side = ?2",
        params![symbol, side.as_str()],
        |row| row.get(0),
    )?;
    Ok(open_sum - closed_sum - remaining_sum)
}
