//! Runtime configuration, delivered through environment variables.
//!
//! All times are UTC wall-clock `HH:MM`; delays are integer minutes. Every
//! key has a default so a bare environment still yields a runnable (paper)
//! configuration. Parsing failures on malformed values surface as
//! `TbotError::Config` at load time, not at use time.

use crate::core::error::TbotError;
use crate::core::time::parse_hhmm;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    // Phase wall-clock times (UTC HH:MM)
    pub open_hhmm: String,
    pub mid_hhmm: String,
    pub close_hhmm: String,
    pub market_close_hhmm: String,

    // Minute offsets
    pub hold_open_min: i64,
    pub hold_mid_min: i64,
    pub univ_after_close_min: i64,

    // Dispatch
    pub trading_days: Vec<String>,
    pub phase_grace_min: i64,

    // Strategy enables + sizing
    pub strat_open_enabled: bool,
    pub strat_mid_enabled: bool,
    pub strat_close_enabled: bool,
    pub max_trades: usize,
    pub candidate_multiplier: usize,
    pub weights: Vec<f64>,

    // Risk + trailing stops
    pub trading_trailing_stop_pct: f64,
    pub trail_pct_open: Option<f64>,
    pub trail_pct_mid: Option<f64>,
    pub trail_pct_close: Option<f64>,
    pub max_risk_per_trade: f64,
    pub daily_loss_limit: f64,
    pub hard_close_buffer_sec: i64,
    pub trail_tighten_factor: f64,

    // Ledger compliance policy
    pub ledger_max_abs_amount: String,
    pub ledger_enforce_date_window: bool,
    pub ledger_max_backdate_days: i64,
    pub ledger_max_future_minutes: i64,

    // Operator display timezone (IANA name); UTC is the storage zone
    pub timezone: String,

    // Binary to spawn for dispatcher/phase children; current_exe when unset.
    // Delivered via TBOT_BIN (tests point it at a stub).
    pub phase_bin: Option<std::path::PathBuf>,
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_i64(key: &str, default: i64) -> Result<i64, TbotError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<i64>()
            .map_err(|_| TbotError::Config(format!("{} must be an integer, got '{}'", key, v))),
        _ => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64, TbotError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<f64>()
            .map_err(|_| TbotError::Config(format!("{} must be a number, got '{}'", key, v))),
        _ => Ok(default),
    }
}

fn env_f64_opt(key: &str) -> Result<Option<f64>, TbotError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| TbotError::Config(format!("{} must be a number, got '{}'", key, v))),
        _ => Ok(None),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

impl Config {
    pub fn load() -> Result<Self, TbotError> {
        let cfg = Config {
            open_hhmm: env_str("OPEN_HHMM", "14:30"),
            mid_hhmm: env_str("MID_HHMM", "16:30"),
            close_hhmm: env_str("CLOSE_HHMM", "19:30"),
            market_close_hhmm: env_str("MARKET_CLOSE_HHMM", "21:00"),
            hold_open_min: env_i64("HOLD_OPEN_MIN", 20)?,
            hold_mid_min: env_i64("HOLD_MID_MIN", 20)?,
            univ_after_close_min: env_i64("UNIV_AFTER_CLOSE_MIN", 30)?,
            trading_days: env_str("TRADING_DAYS", "mon,tue,wed,thu,fri")
                .to_lowercase()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            phase_grace_min: env_i64("PHASE_GRACE_MIN", 2)?,
            strat_open_enabled: env_bool("STRAT_OPEN_ENABLED", true),
            strat_mid_enabled: env_bool("STRAT_MID_ENABLED", true),
            strat_close_enabled: env_bool("STRAT_CLOSE_ENABLED", true),
            max_trades: env_i64("MAX_TRADES", 3)?.max(0) as usize,
            candidate_multiplier: env_i64("CANDIDATE_MULTIPLIER", 3)?.max(1) as usize,
            weights: env_str("WEIGHTS", "0.5,0.3,0.2")
                .split(',')
                .filter_map(|s| s.trim().parse::<f64>().ok())
                .collect(),
            trading_trailing_stop_pct: env_f64("TRADING_TRAILING_STOP_PCT", 0.02)?,
            trail_pct_open: env_f64_opt("TRAIL_PCT_OPEN")?,
            trail_pct_mid: env_f64_opt("TRAIL_PCT_MID")?,
            trail_pct_close: env_f64_opt("TRAIL_PCT_CLOSE")?,
            max_risk_per_trade: env_f64("MAX_RISK_PER_TRADE", 0.05)?,
            daily_loss_limit: env_f64("DAILY_LOSS_LIMIT", 0.03)?,
            hard_close_buffer_sec: env_i64("HARD_CLOSE_BUFFER_SEC", 150)?,
            trail_tighten_factor: env_f64("TRAIL_TIGHTEN_FACTOR", 0.5)?,
            ledger_max_abs_amount: env_str("LEDGER_MAX_ABS_AMOUNT", "100000000"),
            ledger_enforce_date_window: env_bool("LEDGER_ENFORCE_DATE_WINDOW", true),
            ledger_max_backdate_days: env_i64("LEDGER_MAX_BACKDATE_DAYS", 14)?,
            ledger_max_future_minutes: env_i64("LEDGER_MAX_FUTURE_MINUTES", 10)?,
            timezone: env_str("TIMEZONE", "UTC"),
            phase_bin: env::var("TBOT_BIN")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(std::path::PathBuf::from),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), TbotError> {
        for (key, val) in [
            ("OPEN_HHMM", &self.open_hhmm),
            ("MID_HHMM", &self.mid_hhmm),
            ("CLOSE_HHMM", &self.close_hhmm),
            ("MARKET_CLOSE_HHMM", &self.market_close_hhmm),
        ] {
            parse_hhmm(val)
                .map_err(|_| TbotError::Config(format!("{} invalid HH:MM '{}'", key, val)))?;
        }
        if self.phase_grace_min < 0 {
            return Err(TbotError::Config("PHASE_GRACE_MIN must be >= 0".to_string()));
        }
        Ok(())
    }

    /// Per-session trailing percent, falling back to the global default.
    pub fn trail_pct_for(&self, session: &str) -> f64 {
        let specific = match session {
            "open" => self.trail_pct_open,
            "mid" => self.trail_pct_mid,
            "close" => self.trail_pct_close,
            _ => None,
        };
        specific.unwrap_or(self.trading_trailing_stop_pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        // Fresh env in test harness may carry keys; defaults must still parse.
        let cfg = Config::load().unwrap();
        assert!(!cfg.trading_days.is_empty());
        assert!(cfg.phase_grace_min >= 0);
    }

    #[test]
    fn test_trail_pct_fallback() {
        let mut cfg = Config::load().unwrap();
        cfg.trading_trailing_stop_pct = 0.02;
        cfg.trail_pct_mid = Some(0.015);
        assert_eq!(cfg.trail_pct_for("mid"), 0.015);
        assert_eq!(cfg.trail_pct_for("open"), cfg.trail_pct_for("unknown"));
    }
}
