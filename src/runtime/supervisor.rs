//! Supervisor: computes the day's schedule, skips non-trading days, and
//! spawns the dispatcher.
//!
//! Thin by design — the supervisor writes `logs/schedule.json`, updates
//! status, takes the per-day lock, launches the dispatcher subprocess, and
//! either detaches or babysits it (flag-driven graceful termination:
//! kill → wait up to 8s → hard kill).

use crate::core::atomicfile::write_json_atomic;
use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::flags::{self, ControlFlag};
use crate::core::paths;
use crate::core::state;
use crate::core::time::{iso_z, now_iso_z, parse_hhmm, today_utc_at, weekday_name};
use crate::runtime::status;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// One trading day's phase targets, all UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub trading_date: String,
    pub created_at_utc: String,
    pub open_utc: String,
    pub mid_utc: String,
    pub close_utc: String,
    pub market_close_utc_hint: String,
    pub holdings_after_open_min: i64,
    pub holdings_open_utc: String,
    pub holdings_after_mid_min: i64,
    pub holdings_mid_utc: String,
    pub universe_after_close_min: i64,
    pub universe_utc: String,
}

/// Compute today's schedule from the configured wall-clock times + offsets.
pub fn compute_schedule(cfg: &Config) -> Result<Schedule, TbotError> {
    let (oh, om) = parse_hhmm(&cfg.open_hhmm)?;
    let (mh, mm) = parse_hhmm(&cfg.mid_hhmm)?;
    let (ch, cm) = parse_hhmm(&cfg.close_hhmm)?;

    let open_at = today_utc_at(oh, om);
    let mid_at = today_utc_at(mh, mm);
    let close_at = today_utc_at(ch, cm);
    let holdings_open_at = open_at + Duration::minutes(cfg.hold_open_min);
    let holdings_mid_at = mid_at + Duration::minutes(cfg.hold_mid_min);
    let universe_at = close_at + Duration::minutes(cfg.univ_after_close_min);

    Ok(Schedule {
        trading_date: open_at.date_naive().to_string(),
        created_at_utc: now_iso_z(),
        open_utc: iso_z(open_at),
        mid_utc: iso_z(mid_at),
        close_utc: iso_z(close_at),
        market_close_utc_hint: cfg.market_close_hhmm.clone(),
        holdings_after_open_min: cfg.hold_open_min,
        holdings_open_utc: iso_z(holdings_open_at),
        holdings_after_mid_min: cfg.hold_mid_min,
        holdings_mid_utc: iso_z(holdings_mid_at),
        universe_after_close_min: cfg.univ_after_close_min,
        universe_utc: iso_z(universe_at),
    })
}

fn load_holiday_set(ctx: &Context) -> Vec<String> {
    let Ok(path) = paths::holidays_path(ctx) else {
        return Vec::new();
    };
    let Ok(raw) = fs::read_to_string(&path) else {
        return Vec::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| NaiveDate::parse_from_str(l, "%Y-%m-%d").is_ok())
        .map(String::from)
        .collect()
}

/// `Some(reason)` when the date must be skipped (weekday excluded or listed
/// holiday), else `None`.
pub fn non_trading_reason(ctx: &Context, cfg: &Config, date: NaiveDate) -> Option<String> {
    let day = weekday_name(date);
    if !cfg.trading_days.iter().any(|d| d == day) {
        return Some(format!("Non-trading day ({})", day));
    }
    if load_holiday_set(ctx).contains(&date.to_string()) {
        return Some("Holiday (in market_holidays.txt)".to_string());
    }
    None
}

fn spawn_dispatcher(ctx: &Context, cfg: &Config) -> Result<Child, TbotError> {
    let bin = match cfg.phase_bin.clone() {
        Some(b) => b,
        None => std::env::current_exe()?,
    };
    let mut cmd = Command::new(bin);
    cmd.arg("dispatcher").arg("run");
    for (k, v) in ctx.child_env() {
        cmd.env(k, v);
    }
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    cmd.spawn()
        .map_err(|e| TbotError::TransientIo(format!("failed to spawn dispatcher: {}", e)))
}

/// Flag-driven babysit of the dispatcher child: on a kill flag, terminate,
/// wait up to 8 seconds, then hard-kill; lifecycle ends at `idle`.
fn supervise_child(ctx: &Context, mut child: Child) -> Result<i32, TbotError> {
    loop {
        if let Some(code) = child.try_wait()? {
            return Ok(code.code().unwrap_or(1));
        }
        if flags::flag_present(ctx, ControlFlag::Kill) {
            status::log_line(ctx, "supervisor", "kill flag observed; terminating dispatcher");
            let _ = child.kill();
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(8);
            while std::time::Instant::now() < deadline {
                if child.try_wait()?.is_some() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            let _ = child.kill();
            let _ = child.wait();
            state::set_state(ctx, "idle", Some("kill"))?;
            return Ok(1);
        }
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
}

/// Supervisor entry point. Writes the schedule, skips non-trading days,
/// locks the date, spawns the dispatcher (and waits unless `detach`).
pub fn run(ctx: &Context, cfg: &Config, detach: bool) -> Result<i32, TbotError> {
    state::set_state(ctx, "analyzing", None)?;
    status::log_line(ctx, "supervisor", "supervisor start (thin mode)");
    status::update_supervisor_status(
        ctx,
        json!({"supervisor_status": "launched", "supervisor_message": "Supervisor launched."}),
    )?;

    let schedule = match compute_schedule(cfg) {
        Ok(s) => s,
        Err(e) => {
            status::log_line(ctx, "supervisor", &format!("schedule error: {}", e));
            state::set_state(ctx, "error", Some("shutdown"))?;
            status::update_supervisor_status(
                ctx,
                json!({"supervisor_status": "failed", "supervisor_message": format!("Schedule error: {}", e)}),
            )?;
            return Ok(1);
        }
    };
    write_json_atomic(&paths::schedule_path(ctx)?, &schedule)?;
    status::log_line(
        ctx,
        "supervisor",
        &format!("schedule written for {}", schedule.trading_date),
    );
    status::update_supervisor_status(
        ctx,
        json!({"supervisor_status": "scheduled", "schedule": &schedule}),
    )?;

    let date = NaiveDate::parse_from_str(&schedule.trading_date, "%Y-%m-%d")
        .map_err(|e| TbotError::Validation(format!("bad trading_date: {}", e)))?;
    if let Some(reason) = non_trading_reason(ctx, cfg, date) {
        status::log_line(
            ctx,
            "supervisor",
            &format!("skipping dispatcher for {}: {}", schedule.trading_date, reason),
        );
        state::set_state(ctx, "idle", Some("shutdown"))?;
        status::update_supervisor_status(
            ctx,
            json!({
                "supervisor_status": "skipped",
                "supervisor_message": format!("Supervisor skipped {}: {}.", schedule.trading_date, reason),
                "trading_date": schedule.trading_date,
                "skip_reason": reason,
            }),
        )?;
        return Ok(0);
    }

    let lock = paths::supervisor_lock_path(ctx, &schedule.trading_date)?;
    if !lock.exists() {
        if let Err(e) = fs::write(&lock, format!("{}\n", now_iso_z())) {
            status::log_line(ctx, "supervisor", &format!("could not write lock: {}", e));
        }
    }

    let child = match spawn_dispatcher(ctx, cfg) {
        Ok(child) => child,
        Err(e) => {
            status::log_line(ctx, "supervisor", &format!("spawn error: {}", e));
            state::set_state(ctx, "error", Some("shutdown"))?;
            status::update_supervisor_status(
                ctx,
                json!({"supervisor_status": "failed", "supervisor_message": "Failed to spawn dispatcher."}),
            )?;
            return Ok(1);
        }
    };
    status::update_supervisor_status(
        ctx,
        json!({"supervisor_status": "running", "supervisor_message": "Dispatcher spawned."}),
    )?;
    state::set_state(ctx, "monitoring", None)?;

    if detach {
        return Ok(0);
    }
    supervise_child(ctx, child)
}

/// Read the current schedule file.
pub fn read_schedule(path: &Path) -> Result<Schedule, TbotError> {
    if !path.exists() {
        return Err(TbotError::NotFound(format!(
            "schedule missing: {}",
            path.display()
        )));
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Identity4;

    fn test_ctx(root: &std::path::Path) -> Context {
        Context::new(Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(), root)
    }

    #[test]
    fn test_schedule_offsets() {
        let mut cfg = Config::load().unwrap();
        cfg.open_hhmm = "14:30".to_string();
        cfg.mid_hhmm = "16:30".to_string();
        cfg.close_hhmm = "19:30".to_string();
        cfg.hold_open_min = 20;
        cfg.hold_mid_min = 25;
        cfg.univ_after_close_min = 30;
        let s = compute_schedule(&cfg).unwrap();
        assert!(s.open_utc.ends_with("T14:30:00Z"));
        assert!(s.holdings_open_utc.ends_with("T14:50:00Z"));
        assert!(s.holdings_mid_utc.ends_with("T16:55:00Z"));
        assert!(s.universe_utc.ends_with("T20:00:00Z"));
        assert_eq!(s.holdings_after_open_min, 20);
    }

    #[test]
    fn test_invalid_hhmm_is_config_error() {
        let mut cfg = Config::load().unwrap();
        cfg.open_hhmm = "25:99".to_string();
        assert!(compute_schedule(&cfg).is_err());
    }

    #[test]
    fn test_non_trading_weekday() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        let mut cfg = Config::load().unwrap();
        cfg.trading_days = vec!["mon".into(), "tue".into(), "wed".into(), "thu".into(), "fri".into()];
        let saturday = NaiveDate::from_ymd_opt(2025, 2, 8).unwrap();
        let monday = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
        assert!(non_trading_reason(&ctx, &cfg, saturday).unwrap().contains("sat"));
        assert_eq!(non_trading_reason(&ctx, &cfg, monday), None);
    }

    #[test]
    fn test_holiday_file_skip() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        let cfg = Config::load().unwrap();
        fs::write(
            paths::holidays_path(&ctx).unwrap(),
            "# market holidays\n2025-02-10\nnot-a-date\n",
        )
        .unwrap();
        let monday = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
        let reason = non_trading_reason(&ctx, &cfg, monday).unwrap();
        assert!(reason.contains("Holiday"));
    }

    #[test]
    fn test_schedule_roundtrip_via_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        let cfg = Config::load().unwrap();
        let schedule = compute_schedule(&cfg).unwrap();
        let path = paths::schedule_path(&ctx).unwrap();
        write_json_atomic(&path, &schedule).unwrap();
        let loaded = read_schedule(&path).unwrap();
        assert_eq!(loaded.open_utc, schedule.open_utc);
        assert_eq!(loaded.trading_date, schedule.trading_date);
    }
}
