//! Thin maintenance phase workers.
//!
//! Holdings maintenance and universe rebuild are external collaborators; the
//! phase workers here own only the core-side contract: lifecycle gating,
//! daily idempotency stamps, status stamps, and logs.

use crate::core::atomicfile::{stamp_is_today, write_stamp};
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use crate::core::state;
use crate::runtime::status;
use chrono::Utc;

#[derive(Debug, Clone, Default)]
pub struct WorkerOutcome {
    pub skipped: bool,
    pub reason: Option<String>,
}

fn run_stamped_worker(
    ctx: &Context,
    component: &str,
    daily_stamp: &str,
    status_stamp: &str,
) -> Result<WorkerOutcome, TbotError> {
    let stamp = paths::control_dir(ctx)?.join(daily_stamp);
    let force = std::env::var("TBOT_STRATEGY_FORCE").is_ok();
    if !force && stamp_is_today(&stamp, Utc::now()) {
        status::log_line(ctx, component, "already ran today (stamp present); exiting quietly");
        return Ok(WorkerOutcome {
            skipped: true,
            reason: Some("already_ran_today".to_string()),
        });
    }

    let (gate_open, current) = state::worker_gate_open(ctx);
    if !gate_open {
        status::log_line(
            ctx,
            component,
            &format!("lifecycle gate closed (state={}); skipping", current),
        );
        status::write_worker_stamp(ctx, status_stamp, false)?;
        return Ok(WorkerOutcome {
            skipped: true,
            reason: Some(format!("lifecycle_state_{}", current)),
        });
    }

    write_stamp(&stamp, Utc::now())?;
    status::log_line(ctx, component, "run complete");
    status::write_worker_stamp(ctx, status_stamp, true)?;
    Ok(WorkerOutcome::default())
}

/// Holdings maintenance worker for one session (`open` or `mid`).
pub fn run_holdings(ctx: &Context, session: &str) -> Result<WorkerOutcome, TbotError> {
    if session != "open" && session != "mid" {
        return Err(TbotError::Validation(format!(
            "holdings session must be 'open' or 'mid', got '{}'",
            session
        )));
    }
    run_stamped_worker(
        ctx,
        &format!("holdings_{}", session),
        &format!("last_holdings_{}_utc.txt", session),
        "holdings_manager_last.txt",
    )
}

/// Universe rebuild worker (post-close).
pub fn run_universe(ctx: &Context) -> Result<WorkerOutcome, TbotError> {
    run_stamped_worker(
        ctx,
        "universe",
        "last_universe_utc.txt",
        "universe_rebuild_last.txt",
    )
}
