//! Ledger deduplication.
//!
//! Two layers: an in-memory first-wins pass over normalized entries before
//! posting, and the on-disk `(trade_id, side)` refusal at insert time. A
//! repair helper removes duplicate pairs that slipped in through older
//! schemas, keeping the lowest id.

use crate::accounting::ledger::entry::EntryMap;
use crate::core::error::TbotError;
use rusqlite::{Connection, params};
use rustc_hash::FxHashSet;
use serde_json::Value as JsonValue;

/// True when a `(trade_id[, side])` row already exists.
pub fn trade_exists(
    conn: &Connection,
    trade_id: &str,
    side: Option<&str>,
) -> Result<bool, TbotError> {
    if trade_id.is_empty() {
        return Ok(false);
    }
    let found = match side {
        Some(side) => conn
            .query_row(
                "SELECT 1 FROM trades WHERE trade_id = ?1 AND side = ?2 LIMIT 1",
                params![trade_id, side],
                |_| Ok(()),
            )
            .is_ok(),
        None => conn
            .query_row(
                "SELECT 1 FROM trades WHERE trade_id = ?1 LIMIT 1",
                params![trade_id],
                |_| Ok(()),
            )
            .is_ok(),
    };
    Ok(found)
}

#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub trade_id: String,
    pub side: Option<String>,
    pub count: i64,
}

/// List `(trade_id, side)` pairs present more than once.
pub fn find_duplicates(conn: &Connection, limit: usize) -> Result<Vec<DuplicatePair>, TbotError> {
    let mut stmt = conn.prepare(
        "SELECT trade_id, side, COUNT(*) AS n
         FROM trades
         WHERE trade_id IS NOT NULL
         GROUP BY trade_id, side
         HAVING n > 1
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(DuplicatePair {
            trade_id: row.get(0)?,
            side: row.get(1)?,
            count: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Delete all but the lowest-id row of each duplicate `(trade_id, side)`
/// pair. Returns the number of rows removed.
pub fn remove_duplicates(conn: &Connection) -> Result<usize, TbotError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM (
            SELECT id,
                   ROW_NUMBER() OVER (PARTITION BY trade_id, side ORDER BY id) AS rn
            FROM trades
            WHERE trade_id IS NOT NULL
         ) WHERE rn > 1",
    )?;
    let ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    for id in &ids {
        conn.execute("DELETE FROM trades WHERE id = ?1", params![id])?;
    }
    Ok(ids.len())
}

/// In-memory dedupe of normalized entries before posting: first occurrence
/// of each `trade_id` wins; entries without a trade id pass through for the
/// compliance/mapping stages to judge. Missing group ids inherit the trade
/// id so the double-entry writer still journals them together.
pub fn deduplicate_entries(entries: Vec<EntryMap>) -> Vec<EntryMap> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut result = Vec::with_capacity(entries.len());
    for mut entry in entries {
        let tid = entry
            .get("trade_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        match tid {
            None => result.push(entry),
            Some(tid) if tid.is_empty() => result.push(entry),
            Some(tid) => {
                if seen.contains(&tid) {
                    continue;
                }
                seen.insert(tid.clone());
                let has_group = entry
                    .get("group_id")
                    .and_then(|v| v.as_str())
                    .map(|s| !s.is_empty())
                    .unwrap_or(false);
                if !has_group {
                    entry.insert("group_id".into(), JsonValue::String(tid));
                }
                result.push(entry);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::core::db::open_ledger;
    use crate::core::identity::Identity4;
    use serde_json::json;

    fn setup() -> (tempfile::TempDir, Connection) {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::new(
            Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(),
            tmp.path(),
        );
        let conn = open_ledger(&ctx).unwrap();
        (tmp, conn)
    }

    fn raw_insert(conn: &Connection, trade_id: &str, side: &str) {
        conn.execute(
            "INSERT INTO trades (trade_id, side, total_value, account, entity_code, jurisdiction_code, broker_code, bot_id)
             VALUES (?1, ?2, 1.0, '1110', 'RIGD', 'USA', 'ALPACA', 'TB01')",
            params![trade_id, side],
        )
        .unwrap();
    }

    #[test]
    fn test_find_and_remove_duplicates() {
        let (_tmp, conn) = setup();
        raw_insert(&conn, "T1", "debit");
        raw_insert(&conn, "T1", "debit");
        raw_insert(&conn, "T1", "credit");
        let dups = find_duplicates(&conn, 100).unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].count, 2);

        let removed = remove_duplicates(&conn).unwrap();
        assert_eq!(removed, 1);
        // Lowest id kept
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 2);
        let kept_id: i64 = conn
            .query_row(
                "SELECT id FROM trades WHERE trade_id = 'T1' AND side = 'debit'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(kept_id, 1);
    }

    #[test]
    fn test_in_memory_first_wins() {
        let mut a = EntryMap::new();
        a.insert("trade_id".into(), json!("T1"));
        a.insert("total_value".into(), json!(1.0));
        let mut b = EntryMap::new();
        b.insert("trade_id".into(), json!("T1"));
        b.insert("total_value".into(), json!(2.0));
        let mut c = EntryMap::new();
        c.insert("total_value".into(), json!(3.0)); // no trade_id: passes

        let out = deduplicate_entries(vec![a, b, c]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["total_value"], json!(1.0));
        assert_eq!(out[0]["group_id"], json!("T1"));
    }

    #[test]
    fn test_trade_exists() {
        let (_tmp, conn) = setup();
        raw_insert(&conn, "T9", "debit");
        assert!(trade_exists(&conn, "T9", None).unwrap());
        assert!(trade_exists(&conn, "T9", Some("debit")).unwrap());
        assert!(!trade_exists(&conn, "T9", Some("credit")).unwrap());
        assert!(!trade_exists(&conn, "", None).unwrap());
    }
}
