//! Pre-sync ledger snapshots.
//!
//! Before a sync run mutates anything, the ledger DB file is byte-copied
//! into the snapshots directory under a timestamped name.

use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use crate::core::time::now_compact_z;
use std::fs;
use std::path::PathBuf;

pub fn snapshot_ledger_before_sync(ctx: &Context) -> Result<PathBuf, TbotError> {
    let db_path = paths::ledger_db_path(ctx)?;
    if !db_path.exists() {
        return Err(TbotError::NotFound(format!(
            "ledger DB missing: {}",
            db_path.display()
        )));
    }
    let dir = paths::ledger_snapshot_dir(ctx)?;
    let snapshot_path = dir.join(format!("ledger_snapshot_{}.db", now_compact_z()));
    fs::copy(&db_path, &snapshot_path)?;
    Ok(snapshot_path)
}
