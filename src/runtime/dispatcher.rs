//! Schedule dispatcher: single source of truth for executing the daily
//! schedule the supervisor produced.
//!
//! Phases run strictly in canonical order: OPEN → HOLDINGS(open) → MID →
//! HOLDINGS(mid) → CLOSE → UNIVERSE. At each boundary the control flags are
//! consulted (kill aborts, stop skips the remainder); each phase either
//! sleeps until its target, runs within the grace window, or is skipped as
//! missed. Phase workers are child processes of this same binary; their exit
//! codes land in per-phase logs and roll up into `rc_nonzero`.

use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::flags::{self, ControlFlag};
use crate::core::paths;
use crate::core::state;
use crate::core::time::{now_iso_z, parse_to_utc};
use crate::runtime::status;
use crate::runtime::supervisor::{Schedule, read_schedule};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::process::Command;

/// What to do about one phase target at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDecision {
    /// No target recorded — run immediately.
    RunNow,
    /// Target is in the future — sleep until it.
    SleepUntil(i64),
    /// Late but inside the grace window — run immediately.
    RunLate(i64),
    /// Missed beyond grace — skip.
    Skip(i64),
}

/// Pure scheduling decision, separated from the sleep/spawn machinery.
pub fn decide_phase(
    now: DateTime<Utc>,
    target: Option<DateTime<Utc>>,
    grace_min: i64,
) -> PhaseDecision {
    let Some(target) = target else {
        return PhaseDecision::RunNow;
    };
    let delta = (now - target).num_seconds();
    if delta < 0 {
        return PhaseDecision::SleepUntil(-delta);
    }
    if delta <= grace_min.max(0) * 60 {
        return PhaseDecision::RunLate(delta);
    }
    PhaseDecision::Skip(delta)
}

struct Phase {
    name: &'static str,
    log_name: &'static str,
    lifecycle: &'static str,
    args: &'static [&'static str],
    target: Option<DateTime<Utc>>,
}

fn phases_for(schedule: &Schedule) -> Vec<Phase> {
    let t = |s: &str| parse_to_utc(s);
    vec![
        Phase {
            name: "OPEN",
            log_name: "open",
            lifecycle: "trading",
            args: &["strategy", "open"],
            target: t(&schedule.open_utc),
        },
        Phase {
            name: "HOLDINGS(open)",
            log_name: "holdings_open",
            lifecycle: "updating",
            args: &["holdings", "--session", "open"],
            target: t(&schedule.holdings_open_utc),
        },
        Phase {
            name: "MID",
            log_name: "mid",
            lifecycle: "trading",
            args: &["strategy", "mid"],
            target: t(&schedule.mid_utc),
        },
        Phase {
            name: "HOLDINGS(mid)",
            log_name: "holdings_mid",
            lifecycle: "updating",
            args: &["holdings", "--session", "mid"],
            target: t(&schedule.holdings_mid_utc),
        },
        Phase {
            name: "CLOSE",
            log_name: "close",
            lifecycle: "trading",
            args: &["strategy", "close"],
            target: t(&schedule.close_utc),
        },
        Phase {
            name: "UNIVERSE",
            log_name: "universe",
            lifecycle: "updating",
            args: &["universe", "rebuild"],
            target: t(&schedule.universe_utc),
        },
    ]
}

fn log(ctx: &Context, msg: &str) {
    status::log_line(ctx, "schedule_dispatcher", msg);
}

/// Kill aborts the day; stop halts further phases. Flags are cleared once
/// handled.
fn boundary_check(ctx: &Context) -> Result<Option<ControlFlag>, TbotError> {
    match flags::pending_flag(ctx) {
        Some(ControlFlag::Kill) => {
            state::set_state(ctx, "shutdown_triggered", Some("kill"))?;
            log(ctx, "kill flag detected; aborting");
            status::update_dispatcher_status(
                ctx,
                json!({"dispatcher_status": "aborted", "reason": "kill"}),
            )?;
            flags::clear_flag(ctx, ControlFlag::Kill)?;
            Ok(Some(ControlFlag::Kill))
        }
        Some(ControlFlag::Stop) => {
            state::set_state(ctx, "graceful_closing_positions", Some("stop"))?;
            log(ctx, "stop flag detected; halting further phases");
            status::update_dispatcher_status(
                ctx,
                json!({"dispatcher_status": "stopped", "reason": "stop"}),
            )?;
            flags::clear_flag(ctx, ControlFlag::Stop)?;
            Ok(Some(ControlFlag::Stop))
        }
        _ => Ok(None),
    }
}

/// Sleep in coarse (≤60s) slices until the target passes.
fn sleep_until(target: DateTime<Utc>) {
    loop {
        let remaining = (target - Utc::now()).num_seconds();
        if remaining <= 0 {
            return;
        }
        std::thread::sleep(std::time::Duration::from_secs(remaining.min(60) as u64));
    }
}

fn spawn_phase(ctx: &Context, cfg: &Config, phase: &Phase) -> i32 {
    let bin = match cfg
        .phase_bin
        .clone()
        .map(Ok)
        .unwrap_or_else(std::env::current_exe)
    {
        Ok(b) => b,
        Err(e) => {
            log(ctx, &format!("[{}] cannot resolve binary: {}", phase.name, e));
            return 1;
        }
    };

    let log_path = match paths::process_log_path(ctx, phase.log_name) {
        Ok(p) => p,
        Err(e) => {
            log(ctx, &format!("[{}] log path error: {}", phase.name, e));
            return 1;
        }
    };
    let open_log = || {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    };

    log(ctx, &format!("exec[{}]: {:?}", phase.name, phase.args));
    let mut cmd = Command::new(bin);
    cmd.args(phase.args);
    for (k, v) in ctx.child_env() {
        cmd.env(k, v);
    }
    match (open_log(), open_log()) {
        (Ok(out), Ok(err)) => {
            cmd.stdout(out).stderr(err);
        }
        _ => {}
    }
    match cmd.status() {
        Ok(exit) => {
            let rc = exit.code().unwrap_or(1);
            log(ctx, &format!("exit[{}]: {}", phase.name, rc));
            rc
        }
        Err(e) => {
            log(ctx, &format!("[{}] spawn error: {}", phase.name, e));
            1
        }
    }
}

/// Dispatcher entry point. Returns the process exit code.
pub fn run(ctx: &Context, cfg: &Config) -> Result<i32, TbotError> {
    let schedule = match read_schedule(&paths::schedule_path(ctx)?) {
        Ok(s) => s,
        Err(e) => {
            log(ctx, &format!("ERROR reading schedule.json: {}", e));
            status::update_dispatcher_status(
                ctx,
                json!({"dispatcher_status": "failed", "message": format!("schedule read error: {}", e)}),
            )?;
            state::set_state(ctx, "error", Some("shutdown"))?;
            return Ok(1);
        }
    };

    let lock = paths::dispatcher_lock_path(ctx, &schedule.trading_date)?;
    if lock.exists() {
        log(
            ctx,
            &format!(
                "lock exists for {}; another dispatcher likely ran. exiting.",
                schedule.trading_date
            ),
        );
        status::update_dispatcher_status(
            ctx,
            json!({"dispatcher_status": "already_ran", "trading_date": schedule.trading_date}),
        )?;
        return Ok(0);
    }
    if let Err(e) = fs::write(&lock, format!("{}\n", now_iso_z())) {
        log(ctx, &format!("cannot write dispatcher lock: {}", e));
    }

    let mut rc_nonzero = false;
    status::update_dispatcher_status(
        ctx,
        json!({"dispatcher_status": "running", "trading_date": schedule.trading_date}),
    )?;

    for phase in phases_for(&schedule) {
        match boundary_check(ctx)? {
            Some(ControlFlag::Kill) => return Ok(0),
            Some(ControlFlag::Stop) => return Ok(0),
            _ => {}
        }

        let run_it = match decide_phase(Utc::now(), phase.target, cfg.phase_grace_min) {
            PhaseDecision::RunNow => {
                log(ctx, &format!("{}: no scheduled time, running now", phase.name));
                true
            }
            PhaseDecision::SleepUntil(_) => {
                let target = phase.target.expect("sleep implies target");
                log(
                    ctx,
                    &format!("{}: sleeping until {}", phase.name, crate::core::time::iso_z(target)),
                );
                sleep_until(target);
                true
            }
            PhaseDecision::RunLate(late) => {
                log(
                    ctx,
                    &format!(
                        "{}: late by {}s (within {}m grace), running now",
                        phase.name, late, cfg.phase_grace_min
                    ),
                );
                true
            }
            PhaseDecision::Skip(late) => {
                log(
                    ctx,
                    &format!(
                        "{}: missed by {}m {}s (> grace), skipping",
                        phase.name,
                        late / 60,
                        late % 60
                    ),
                );
                false
            }
        };
        if !run_it {
            continue;
        }

        state::set_state(ctx, phase.lifecycle, None)?;
        let rc = spawn_phase(ctx, cfg, &phase);
        rc_nonzero |= rc != 0;
    }

    state::set_state(ctx, "idle", Some("shutdown"))?;
    status::update_dispatcher_status(
        ctx,
        json!({"dispatcher_status": "complete", "rc_nonzero": rc_nonzero as i64}),
    )?;
    log(ctx, &format!("dispatcher complete. rc_nonzero={}", rc_nonzero as i64));
    Ok(if rc_nonzero { 1 } else { 0 })
}
