//! Ledger database connection and initialization utilities.
//!
//! Single-writer model per identity: writers open a connection here and wrap
//! mutations in `BEGIN IMMEDIATE` transactions; WAL journaling and a 5-second
//! busy timeout absorb reader/writer overlap across processes.

use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use crate::core::schemas;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;

/// Establish a SQLite connection with tradebot's standard configuration.
///
/// Enables:
/// - WAL (Write-Ahead Logging) mode for cross-process concurrency
/// - Foreign key constraints
/// - 5-second busy timeout for lock contention
pub fn db_connect(db_path: &Path) -> Result<Connection, TbotError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Open the identity-scoped ledger DB, creating schema + indexes if absent.
pub fn open_ledger(ctx: &Context) -> Result<Connection, TbotError> {
    let db_path = paths::ledger_db_path(ctx)?;
    let conn = db_connect(&db_path)?;
    initialize_ledger_schema(&conn)?;
    Ok(conn)
}

pub fn initialize_ledger_schema(conn: &Connection) -> Result<(), TbotError> {
    conn.execute(schemas::LEDGER_DB_SCHEMA_TRADES, [])?;
    conn.execute(schemas::LEDGER_DB_SCHEMA_TRADE_GROUPS, [])?;
    conn.execute(schemas::LEDGER_DB_SCHEMA_GROUP_COLLAPSED, [])?;
    conn.execute(schemas::LEDGER_DB_SCHEMA_META, [])?;
    conn.execute(schemas::LEDGER_DB_SCHEMA_LOTS, [])?;
    conn.execute(schemas::LEDGER_DB_SCHEMA_LOT_CLOSURES, [])?;
    for idx in schemas::LEDGER_DB_INDEXES {
        conn.execute(idx, [])?;
    }
    Ok(())
}

/// Column registry for one table, loaded once per connection.
///
/// Dynamic inserts intersect the canonical field list with the columns the
/// live table actually has; any column outside the registry is refused.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<String>,
    column_set: HashSet<String>,
}

impl TableSchema {
    pub fn load(conn: &Connection, table: &str) -> Result<Self, TbotError> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TbotError::Validation(format!(
                "invalid table name '{}'",
                table
            )));
        }
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        if columns.is_empty() {
            return Err(TbotError::NotFound(format!(
                "table '{}' has no columns (missing table?)",
                table
            )));
        }
        let column_set = columns.iter().cloned().collect();
        Ok(TableSchema {
            table: table.to_string(),
            columns,
            column_set,
        })
    }

    pub fn has(&self, column: &str) -> bool {
        self.column_set.contains(column)
    }

    /// Preserve `wanted` order, keeping only columns the table registers.
    pub fn intersect<'a>(&self, wanted: &[&'a str]) -> Vec<&'a str> {
        wanted.iter().copied().filter(|c| self.has(c)).collect()
    }

    /// COALESCE expression over the preferred timestamp columns present.
    pub fn ts_coalesce(&self) -> String {
        let present = self.intersect(schemas::TRADES_TS_COLUMNS);
        match present.len() {
            0 => "created_at".to_string(),
            1 => present[0].to_string(),
            _ => format!("COALESCE({})", present.join(", ")),
        }
    }
}

/// Read a meta key from the ledger DB.
pub fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>, TbotError> {
    let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
    let mut rows = stmt.query_map([key], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(v) => Ok(Some(v?)),
        None => Ok(None),
    }
}

/// Upsert a meta key in the ledger DB.
pub fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<(), TbotError> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}
