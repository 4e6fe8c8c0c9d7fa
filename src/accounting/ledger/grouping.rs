//! Journal grouping queries and UI collapse state.
//!
//! Groups are lists of legs sharing a `group_id`, ordered by whichever UTC
//! timestamp column the live schema carries (dynamic COALESCE), tie-broken
//! by id. The `trade_group_collapsed` table persists per-group UI collapse
//! state across sessions.

use crate::core::db::TableSchema;
use crate::core::error::TbotError;
use crate::core::time::now_iso_z;
use rusqlite::{Connection, params};
use serde_json::{Map, Value as JsonValue};

/// Rows of one journal, as column-name → value maps.
pub type GroupRows = Vec<Map<String, JsonValue>>;

fn row_to_map(
    row: &rusqlite::Row<'_>,
    columns: &[String],
) -> Result<Map<String, JsonValue>, rusqlite::Error> {
    use rusqlite::types::ValueRef;
    let mut m = Map::new();
    for (i, name) in columns.iter().enumerate() {
        let v = match row.get_ref(i)? {
            ValueRef::Null => JsonValue::Null,
            ValueRef::Integer(n) => JsonValue::from(n),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).to_string()),
            ValueRef::Blob(_) => JsonValue::Null,
        };
        m.insert(name.clone(), v);
    }
    Ok(m)
}

/// Fetch the most recent `limit` journals as lists-of-legs, newest first.
/// Legs within a journal keep timestamp-then-id order.
pub fn fetch_groups(conn: &Connection, limit: usize) -> Result<Vec<GroupRows>, TbotError> {
    let schema = TableSchema::load(conn, "trades")?;
    let ts_col = schema.ts_coalesce();

    let group_sql = format!(
        "SELECT group_id, MAX({ts}) AS latest FROM trades
         WHERE group_id IS NOT NULL
         GROUP BY group_id
         ORDER BY latest DESC, group_id DESC
         LIMIT ?1",
        ts = ts_col
    );
    let mut stmt = conn.prepare(&group_sql)?;
    let group_ids: Vec<String> = stmt
        .query_map(params![limit as i64], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let legs_sql = format!(
        "SELECT * FROM trades WHERE group_id = ?1 ORDER BY {ts} ASC, id ASC",
        ts = ts_col
    );
    let mut stmt = conn.prepare(&legs_sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut out = Vec::with_capacity(group_ids.len());
    for gid in group_ids {
        let rows: Vec<Map<String, JsonValue>> = stmt
            .query_map(params![gid], |row| row_to_map(row, &columns))?
            .collect::<Result<_, _>>()?;
        out.push(rows);
    }
    Ok(out)
}

/// Filters for flat entry queries.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub account: Option<String>,
    pub symbol: Option<String>,
    pub since_utc: Option<String>,
    pub until_utc: Option<String>,
    pub limit: usize,
}

/// Flat entry listing, newest first, with optional account/symbol/date
/// filters. Ordering follows the same dynamic timestamp COALESCE.
pub fn fetch_entries(
    conn: &Connection,
    filter: &EntryFilter,
) -> Result<Vec<Map<String, JsonValue>>, TbotError> {
    let schema = TableSchema::load(conn, "trades")?;
    let ts_col = schema.ts_coalesce();

    let mut sql = String::from("SELECT * FROM trades WHERE 1=1");
    let mut params_vec: Vec<String> = Vec::new();
    if let Some(account) = &filter.account {
        sql.push_str(" AND account = ?");
        params_vec.push(account.clone());
    }
    if let Some(symbol) = &filter.symbol {
        sql.push_str(" AND symbol = ?");
        params_vec.push(symbol.clone());
    }
    if let Some(since) = &filter.since_utc {
        sql.push_str(&format!(" AND {} >= ?", ts_col));
        params_vec.push(since.clone());
    }
    if let Some(until) = &filter.until_utc {
        sql.push_str(&format!(" AND {} <= ?", ts_col));
        params_vec.push(until.clone());
    }
    sql.push_str(&format!(
        " ORDER BY {} DESC, id DESC LIMIT {}",
        ts_col,
        filter.limit.max(1)
    ));

    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt.query_map(
        rusqlite::params_from_iter(params_vec.iter()),
        |row| row_to_map(row, &columns),
    )?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Persist UI collapse state for a group.
pub fn set_group_collapsed(
    conn: &Connection,
    group_id: &str,
    collapsed: bool,
) -> Result<(), TbotError> {
    conn.execute(
        "INSERT INTO trade_group_collapsed (group_id, collapsed, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(group_id) DO UPDATE SET collapsed = excluded.collapsed,
                                             updated_at = excluded.updated_at",
        params![group_id, collapsed as i64, now_iso_z()],
    )?;
    Ok(())
}

pub fn group_collapsed(conn: &Connection, group_id: &str) -> Result<bool, TbotError> {
    let collapsed: Option<i64> = conn
        .query_row(
            "SELECT collapsed FROM trade_group_collapsed WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )
        .ok();
    Ok(collapsed.unwrap_or(0) != 0)
}
