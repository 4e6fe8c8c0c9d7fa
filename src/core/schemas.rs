// src/core/schemas.rs
// Centralized database schema definitions and canonical column lists for the
// ledger database. Import these everywhere to keep schema alignment and
// prevent drift between writers.

/// Canonical `trades` column order used by dynamic inserts. The live table
/// may carry a subset or superset; writers intersect this list with
/// `PRAGMA table_info` via `TableSchema`.
pub const TRADES_FIELDS: &[&str] = &[
    "trade_id",
    "group_id",
    "datetime_utc",
    "symbol",
    "action",
    "side",
    "quantity",
    "price",
    "total_value",
    "amount",
    "fee",
    "commission",
    "account",
    "strategy",
    "tags",
    "notes",
    "entity_code",
    "jurisdiction_code",
    "broker_code",
    "bot_id",
    "fitid",
    "status",
    "sync_run_id",
    "raw_broker_json",
    "json_metadata",
    "created_at",
    "updated_at",
];

/// Timestamp columns ordered by preference; queries COALESCE over whichever
/// of these the live table actually has.
pub const TRADES_TS_COLUMNS: &[&str] = &[
    "timestamp_utc",
    "datetime_utc",
    "created_at_utc",
    "DTPOSTED",
    "posted_at_utc",
    "created_at",
];

pub const LEDGER_DB_SCHEMA_TRADES: &str = "
    CREATE TABLE IF NOT EXISTS trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trade_id TEXT,
        group_id TEXT,
        datetime_utc TEXT,
        symbol TEXT,
        action TEXT,
        side TEXT,
        quantity REAL,
        price REAL,
        total_value REAL,
        amount REAL,
        fee REAL DEFAULT 0,
        commission REAL DEFAULT 0,
        account TEXT NOT NULL,
        strategy TEXT,
        tags TEXT,
        notes TEXT,
        entity_code TEXT NOT NULL,
        jurisdiction_code TEXT NOT NULL,
        broker_code TEXT NOT NULL,
        bot_id TEXT NOT NULL,
        fitid TEXT,
        status TEXT DEFAULT 'ok',
        sync_run_id TEXT,
        raw_broker_json TEXT DEFAULT '{}',
        json_metadata TEXT DEFAULT '{}',
        created_at TEXT,
        updated_at TEXT
    )
";

pub const LEDGER_DB_SCHEMA_TRADE_GROUPS: &str = "
    CREATE TABLE IF NOT EXISTS trade_groups (
        group_id TEXT PRIMARY KEY,
        datetime_utc TEXT,
        type TEXT,
        status TEXT,
        sync_run_id TEXT,
        notes TEXT
    )
";

pub const LEDGER_DB_SCHEMA_GROUP_COLLAPSED: &str = "
    CREATE TABLE IF NOT EXISTS trade_group_collapsed (
        group_id TEXT PRIMARY KEY,
        collapsed INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT
    )
";

pub const LEDGER_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const LEDGER_DB_SCHEMA_LOTS: &str = "
    CREATE TABLE IF NOT EXISTS lots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL CHECK(side IN ('long','short')),
        qty_open REAL NOT NULL,
        qty_remaining REAL NOT NULL,
        unit_cost REAL NOT NULL,
        fees_alloc REAL NOT NULL DEFAULT 0,
        opened_trade_id TEXT,
        opened_at TEXT NOT NULL
    )
";

pub const LEDGER_DB_SCHEMA_LOT_CLOSURES: &str = "
    CREATE TABLE IF NOT EXISTS lot_closures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        lot_id INTEGER NOT NULL,
        close_trade_id TEXT,
        close_qty REAL NOT NULL,
        basis_amount REAL NOT NULL,
        proceeds_amount REAL NOT NULL,
        fees_alloc REAL NOT NULL DEFAULT 0,
        realized_pnl REAL NOT NULL,
        closed_at TEXT NOT NULL,
        FOREIGN KEY(lot_id) REFERENCES lots(id)
    )
";

pub const LEDGER_DB_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_trades_group_id ON trades(group_id)",
    "CREATE INDEX IF NOT EXISTS idx_trades_account ON trades(account)",
    "CREATE INDEX IF NOT EXISTS idx_trades_trade_id_side ON trades(trade_id, side)",
    "CREATE INDEX IF NOT EXISTS idx_lots_symbol_side_remaining ON lots(symbol, side, qty_remaining)",
    "CREATE INDEX IF NOT EXISTS idx_lot_closures_lot_id ON lot_closures(lot_id)",
];
