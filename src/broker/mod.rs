//! Broker adapter boundary.
//!
//! HTTP broker adapters live outside this crate; the sync driver only sees
//! this trait. Raw records are opaque JSON objects — the normalizer owns the
//! canonical shape. A file-backed replay adapter serves tests, dry runs, and
//! offline reconciliation from a captured payload.

use crate::core::error::TbotError;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};

/// One sync run's view of the broker. Date bounds are inclusive ISO dates.
pub trait BrokerAdapter {
    /// Raw trade/order fill records for the range.
    fn fetch_trades(&self, from: &str, to: &str) -> Result<Vec<JsonValue>, TbotError>;

    /// Raw cash activity records (dividends, interest, transfers, fees).
    fn fetch_activities(&self, from: &str, to: &str) -> Result<Vec<JsonValue>, TbotError>;

    /// Account snapshot `{as_of_utc, cash, positions[]}` for opening-balance
    /// bootstrap. `None` when the broker cannot produce one.
    fn fetch_snapshot(&self) -> Result<Option<JsonValue>, TbotError>;
}

/// Replay adapter over a captured payload file:
/// `{"trades": [...], "activities": [...], "snapshot": {...}}`.
pub struct ReplayAdapter {
    path: PathBuf,
}

impl ReplayAdapter {
    pub fn new(path: &Path) -> Self {
        ReplayAdapter {
            path: path.to_path_buf(),
        }
    }

    fn payload(&self) -> Result<JsonValue, TbotError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            TbotError::TransientIo(format!(
                "replay payload unreadable at {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn section(&self, key: &str) -> Result<Vec<JsonValue>, TbotError> {
        Ok(self
            .payload()?
            .get(key)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

fn in_range(record: &JsonValue, from: &str, to: &str) -> bool {
    let keys = [
        "DTPOSTED",
        "datetime_utc",
        "filled_at",
        "transaction_time",
        "date",
        "post_date",
    ];
    for key in keys {
        if let Some(s) = record.get(key).and_then(|v| v.as_str()) {
            // str::get keeps this safe should a timestamp ever carry
            // multibyte text; short strings compare whole.
            let date = s.get(..10).unwrap_or(s);
            return date >= from && date <= to;
        }
    }
    // Records without a parsable date pass through; compliance judges them.
    true
}

impl BrokerAdapter for ReplayAdapter {
    fn fetch_trades(&self, from: &str, to: &str) -> Result<Vec<JsonValue>, TbotError> {
        Ok(self
            .section("trades")?
            .into_iter()
            .filter(|r| in_range(r, from, to))
            .collect())
    }

    fn fetch_activities(&self, from: &str, to: &str) -> Result<Vec<JsonValue>, TbotError> {
        Ok(self
            .section("activities")?
            .into_iter()
            .filter(|r| in_range(r, from, to))
            .collect())
    }

    fn fetch_snapshot(&self) -> Result<Option<JsonValue>, TbotError> {
        Ok(self.payload()?.get("snapshot").cloned().filter(|v| !v.is_null()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_payload(dir: &Path) -> PathBuf {
        let path = dir.join("replay.json");
        fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "trades": [
                    {"id": "T1", "symbol": "AAPL", "action": "buy", "filled_at": "2025-02-10T15:00:00Z"},
                    {"id": "T2", "symbol": "AAPL", "action": "sell", "filled_at": "2025-03-01T15:00:00Z"}
                ],
                "activities": [
                    {"id": "A1", "activity_type": "DIV", "amount": 5.0, "date": "2025-02-11"}
                ],
                "snapshot": {"as_of_utc": "2025-02-10T14:00:00Z", "cash": 1000.0, "positions": []}
            }))
            .unwrap(),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_replay_filters_by_date_range() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = ReplayAdapter::new(&write_payload(tmp.path()));
        let trades = adapter.fetch_trades("2025-02-01", "2025-02-28").unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0]["id"], "T1");
        let acts = adapter.fetch_activities("2025-02-01", "2025-02-28").unwrap();
        assert_eq!(acts.len(), 1);
    }

    #[test]
    fn test_replay_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = ReplayAdapter::new(&write_payload(tmp.path()));
        let snap = adapter.fetch_snapshot().unwrap().unwrap();
        assert_eq!(snap["cash"], 1000.0);
    }

    #[test]
    fn test_missing_payload_is_transient() {
        let adapter = ReplayAdapter::new(Path::new("/nonexistent/replay.json"));
        assert!(matches!(
            adapter.fetch_trades("2025-01-01", "2025-01-31"),
            Err(TbotError::TransientIo(_))
        ));
    }
}
