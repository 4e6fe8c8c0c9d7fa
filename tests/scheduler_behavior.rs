//! Scheduler and dispatcher behavior: non-trading skip, grace windows,
//! stop/kill flags, per-day locks, and lifecycle transitions.

use chrono::{Datelike, Utc};
use serde_json::Value as JsonValue;
use tradebot::core::atomicfile::write_json_atomic;
use tradebot::core::config::Config;
use tradebot::core::context::Context;
use tradebot::core::flags::{self, ControlFlag};
use tradebot::core::identity::Identity4;
use tradebot::core::paths;
use tradebot::core::state;
use tradebot::core::time::{iso_z, weekday_name};
use tradebot::runtime::dispatcher;
use tradebot::runtime::supervisor::{self, Schedule};

fn setup() -> (tempfile::TempDir, Context) {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = Context::new(
        Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(),
        tmp.path(),
    );
    (tmp, ctx)
}

fn status_of(ctx: &Context) -> JsonValue {
    let raw = std::fs::read_to_string(paths::status_path(ctx).unwrap()).unwrap();
    serde_json::from_str(&raw).unwrap()
}

/// Schedule whose targets all sit on the previous day, so every phase is
/// missed beyond grace and skipped without spawning workers.
fn stale_schedule() -> Schedule {
    let today = Utc::now().date_naive();
    let yesterday = today.pred_opt().unwrap();
    let past = |h: u32, m: u32| {
        format!("{}T{:02}:{:02}:00Z", yesterday, h, m)
    };
    Schedule {
        trading_date: today.to_string(),
        created_at_utc: iso_z(Utc::now()),
        open_utc: past(0, 1),
        mid_utc: past(0, 2),
        close_utc: past(0, 3),
        market_close_utc_hint: "21:00".to_string(),
        holdings_after_open_min: 1,
        holdings_open_utc: past(0, 2),
        holdings_after_mid_min: 1,
        holdings_mid_utc: past(0, 3),
        universe_after_close_min: 1,
        universe_utc: past(0, 4),
    }
}

#[test]
fn supervisor_skips_non_trading_day_but_writes_schedule() {
    let (_tmp, ctx) = setup();
    let mut cfg = Config::load().unwrap();
    // Exclude today's weekday → guaranteed skip
    let today = weekday_name(Utc::now().date_naive());
    cfg.trading_days = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
        .iter()
        .filter(|d| **d != today)
        .map(|d| d.to_string())
        .collect();

    let rc = supervisor::run(&ctx, &cfg, true).unwrap();
    assert_eq!(rc, 0);

    // Schedule still written
    assert!(paths::schedule_path(&ctx).unwrap().exists());

    // Status reports skipped with a reason; no dispatcher lock taken
    let status = status_of(&ctx);
    assert_eq!(status["supervisor_status"], "skipped");
    assert!(
        status["skip_reason"]
            .as_str()
            .unwrap()
            .contains("Non-trading day")
    );
    assert_eq!(state::get_state(&ctx, "running"), "idle");
    let date = Utc::now().date_naive().to_string();
    assert!(!paths::dispatcher_lock_path(&ctx, &date).unwrap().exists());
}

#[test]
fn supervisor_holiday_skip() {
    let (_tmp, ctx) = setup();
    let mut cfg = Config::load().unwrap();
    cfg.trading_days = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
        .iter()
        .map(|d| d.to_string())
        .collect();
    std::fs::write(
        paths::holidays_path(&ctx).unwrap(),
        format!("{}\n", Utc::now().date_naive()),
    )
    .unwrap();

    let rc = supervisor::run(&ctx, &cfg, true).unwrap();
    assert_eq!(rc, 0);
    let status = status_of(&ctx);
    assert_eq!(status["supervisor_status"], "skipped");
    assert!(status["skip_reason"].as_str().unwrap().contains("Holiday"));
}

#[test]
fn dispatcher_skips_missed_phases_and_completes_idle() {
    let (_tmp, ctx) = setup();
    let cfg = Config::load().unwrap();
    write_json_atomic(&paths::schedule_path(&ctx).unwrap(), &stale_schedule()).unwrap();

    let rc = dispatcher::run(&ctx, &cfg).unwrap();
    assert_eq!(rc, 0, "skipped phases are not failures");

    let status = status_of(&ctx);
    assert_eq!(status["dispatcher_status"], "complete");
    assert_eq!(status["rc_nonzero"], 0);
    assert_eq!(state::get_state(&ctx, "running"), "idle");

    // Missed-by log lines present for skipped phases
    let log = std::fs::read_to_string(
        paths::process_log_path(&ctx, "schedule_dispatcher").unwrap(),
    )
    .unwrap();
    assert!(log.contains("missed by"));
    assert!(log.contains("skipping"));
}

#[test]
fn dispatcher_lock_prevents_second_run() {
    let (_tmp, ctx) = setup();
    let cfg = Config::load().unwrap();
    write_json_atomic(&paths::schedule_path(&ctx).unwrap(), &stale_schedule()).unwrap();

    assert_eq!(dispatcher::run(&ctx, &cfg).unwrap(), 0);
    assert_eq!(dispatcher::run(&ctx, &cfg).unwrap(), 0);
    let status = status_of(&ctx);
    assert_eq!(status["dispatcher_status"], "already_ran");
}

#[test]
fn stop_flag_halts_before_any_phase() {
    let (_tmp, ctx) = setup();
    let cfg = Config::load().unwrap();
    write_json_atomic(&paths::schedule_path(&ctx).unwrap(), &stale_schedule()).unwrap();
    state::set_state(&ctx, "trading", None).unwrap();
    flags::raise_flag(&ctx, ControlFlag::Stop).unwrap();

    let rc = dispatcher::run(&ctx, &cfg).unwrap();
    assert_eq!(rc, 0);

    let status = status_of(&ctx);
    assert_eq!(status["dispatcher_status"], "stopped");
    assert_eq!(status["reason"], "stop");
    assert_eq!(state::get_state(&ctx, "running"), "graceful_closing_positions");
    // Flag consumed by the handler
    assert!(!flags::flag_present(&ctx, ControlFlag::Stop));
}

#[test]
fn kill_flag_aborts_with_shutdown_state() {
    let (_tmp, ctx) = setup();
    let cfg = Config::load().unwrap();
    write_json_atomic(&paths::schedule_path(&ctx).unwrap(), &stale_schedule()).unwrap();
    flags::raise_flag(&ctx, ControlFlag::Kill).unwrap();

    let rc = dispatcher::run(&ctx, &cfg).unwrap();
    assert_eq!(rc, 0);
    let status = status_of(&ctx);
    assert_eq!(status["dispatcher_status"], "aborted");
    assert_eq!(status["reason"], "kill");
    assert_eq!(state::get_state(&ctx, "running"), "shutdown_triggered");
}

#[test]
fn missing_schedule_fails_with_error_state() {
    let (_tmp, ctx) = setup();
    let cfg = Config::load().unwrap();
    let rc = dispatcher::run(&ctx, &cfg).unwrap();
    assert_eq!(rc, 1);
    let status = status_of(&ctx);
    assert_eq!(status["dispatcher_status"], "failed");
    assert_eq!(state::get_state(&ctx, "running"), "error");
}

#[test]
fn schedule_trading_date_matches_today() {
    let cfg = Config::load().unwrap();
    let schedule = supervisor::compute_schedule(&cfg).unwrap();
    let today = Utc::now();
    assert_eq!(
        schedule.trading_date,
        format!("{:04}-{:02}-{:02}", today.year(), today.month(), today.day())
    );
}
