//! Deterministic path resolution for all per-identity state.
//!
//! Layout under the runtime root:
//!
//! ```text
//! <root>/control/                     lifecycle token, flags, holidays, stamps
//! <root>/output/<IDENTITY>/logs/      schedule.json, status.json, process logs
//! <root>/output/<IDENTITY>/locks/     per-day supervisor/dispatcher locks
//! <root>/output/<IDENTITY>/ledgers/   <IDENTITY>_BOT_ledger.db, snapshots/, audit/
//! <root>/output/<IDENTITY>/accounting/  COA json + metadata, mapping table + versions
//! ```
//!
//! Nothing in here performs provisioning beyond `create_dir_all` of the
//! parent directory being resolved.

use crate::core::context::Context;
use crate::core::error::TbotError;
use std::fs;
use std::path::PathBuf;

fn identity_dir(ctx: &Context) -> PathBuf {
    ctx.root.join("output").join(ctx.identity.to_string())
}

fn ensured(dir: PathBuf) -> Result<PathBuf, TbotError> {
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn control_dir(ctx: &Context) -> Result<PathBuf, TbotError> {
    ensured(ctx.root.join("control"))
}

pub fn logs_dir(ctx: &Context) -> Result<PathBuf, TbotError> {
    ensured(identity_dir(ctx).join("logs"))
}

pub fn locks_dir(ctx: &Context) -> Result<PathBuf, TbotError> {
    ensured(identity_dir(ctx).join("locks"))
}

pub fn ledgers_dir(ctx: &Context) -> Result<PathBuf, TbotError> {
    ensured(identity_dir(ctx).join("ledgers"))
}

pub fn accounting_dir(ctx: &Context) -> Result<PathBuf, TbotError> {
    ensured(identity_dir(ctx).join("accounting"))
}

// --- Control files ---

pub fn bot_state_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(control_dir(ctx)?.join("bot_state.txt"))
}

pub fn control_flag_path(ctx: &Context, flag: &str) -> Result<PathBuf, TbotError> {
    Ok(control_dir(ctx)?.join(format!("control_{}.txt", flag)))
}

pub fn test_mode_flag_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(control_dir(ctx)?.join("test_mode.flag"))
}

pub fn holidays_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(control_dir(ctx)?.join("market_holidays.txt"))
}

pub fn strategy_stamp_path(ctx: &Context, phase: &str) -> Result<PathBuf, TbotError> {
    Ok(control_dir(ctx)?.join(format!("last_strategy_{}_utc.txt", phase)))
}

// --- Logs / status ---

pub fn schedule_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(logs_dir(ctx)?.join("schedule.json"))
}

pub fn status_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(logs_dir(ctx)?.join("status.json"))
}

pub fn bot_state_history_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(logs_dir(ctx)?.join("bot_state_history.log"))
}

pub fn process_log_path(ctx: &Context, name: &str) -> Result<PathBuf, TbotError> {
    Ok(logs_dir(ctx)?.join(format!("{}.log", name)))
}

pub fn stamp_file_path(ctx: &Context, name: &str) -> Result<PathBuf, TbotError> {
    Ok(logs_dir(ctx)?.join(name.to_string()))
}

pub fn supervisor_lock_path(ctx: &Context, trading_date: &str) -> Result<PathBuf, TbotError> {
    Ok(locks_dir(ctx)?.join(format!("supervisor_{}.lock", trading_date)))
}

pub fn dispatcher_lock_path(ctx: &Context, trading_date: &str) -> Result<PathBuf, TbotError> {
    Ok(locks_dir(ctx)?.join(format!("dispatcher_{}.lock", trading_date)))
}

// --- Ledger ---

pub fn ledger_db_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(ledgers_dir(ctx)?.join(format!("{}_BOT_ledger.db", ctx.identity)))
}

pub fn ledger_snapshot_dir(ctx: &Context) -> Result<PathBuf, TbotError> {
    ensured(ledgers_dir(ctx)?.join("snapshots"))
}

pub fn ledger_audit_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    let dir = ensured(ledgers_dir(ctx)?.join("audit"))?;
    Ok(dir.join("ledger_audit.jsonl"))
}

// --- Accounting (COA + mapping) ---

pub fn coa_json_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(accounting_dir(ctx)?.join("tbot_ledger_coa.json"))
}

pub fn coa_metadata_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(accounting_dir(ctx)?.join("tbot_ledger_coa_metadata.json"))
}

pub fn coa_audit_log_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(accounting_dir(ctx)?.join("tbot_ledger_coa_audit.json"))
}

pub fn mapping_table_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    Ok(accounting_dir(ctx)?.join("coa_mapping_table.json"))
}

pub fn mapping_versions_dir(ctx: &Context) -> Result<PathBuf, TbotError> {
    ensured(accounting_dir(ctx)?.join("coa_mapping_versions"))
}

pub fn mapping_audit_path(ctx: &Context) -> Result<PathBuf, TbotError> {
    let dir = ensured(accounting_dir(ctx)?.join("audit"))?;
    Ok(dir.join("coa_mapping_audit.jsonl"))
}
