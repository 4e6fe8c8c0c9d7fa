//! Strategy phase workers: thin threshold-breakout signal producers.
//!
//! A worker stamps its start (daily idempotency), checks the lifecycle gate,
//! screens candidate ranges for breakouts, ranks signals by breakout
//! strength, sizes them by the configured weights, attaches trailing-stop
//! thresholds, and writes the signal file for the external order router.
//! No alpha beyond threshold breakouts lives here.

pub mod trailing;

use crate::core::atomicfile::{stamp_is_today, write_json_atomic, write_stamp};
use crate::core::config::Config;
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::flags;
use crate::core::paths;
use crate::core::state;
use crate::core::time::{now_iso_z, parse_to_utc, today_utc_at};
use crate::runtime::status;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use trailing::{TrailInputs, TrailSide, compute_exit_threshold, tightened_trail_pct};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Open,
    Mid,
    Close,
}

impl Session {
    pub fn as_str(&self) -> &'static str {
        match self {
            Session::Open => "open",
            Session::Mid => "mid",
            Session::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TbotError> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(Session::Open),
            "mid" => Ok(Session::Mid),
            "close" => Ok(Session::Close),
            other => Err(TbotError::Validation(format!(
                "unknown strategy session '{}'",
                other
            ))),
        }
    }

    fn enabled(&self, cfg: &Config) -> bool {
        match self {
            Session::Open => cfg.strat_open_enabled,
            Session::Mid => cfg.strat_mid_enabled,
            Session::Close => cfg.strat_close_enabled,
        }
    }
}

/// Candidate row produced by the external screener/universe builder:
/// a symbol with its observed session range and last price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub price: f64,
    pub range_high: f64,
    pub range_low: f64,
}

/// One emitted signal, consumed by the external order router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub breakout_strength: f64,
    pub allocation_weight: f64,
    pub trail_pct: f64,
    pub trailing_exit_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyOutcome {
    pub skipped: bool,
    pub reason: Option<String>,
    pub signals: usize,
}

fn breakout_buffer() -> f64 {
    std::env::var("STRAT_BUFFER_PCT")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.005)
}

fn read_candidates(ctx: &Context, session: Session) -> Result<Vec<Candidate>, TbotError> {
    // Session-specific candidate file, falling back to the shared one.
    let specific = paths::logs_dir(ctx)?.join(format!("candidates_{}.json", session.as_str()));
    let shared = paths::logs_dir(ctx)?.join("candidates.json");
    let path = if specific.exists() { specific } else { shared };
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
}

/// Threshold-breakout screen: price above the range high (long) or below the
/// range low (short), beyond the configured buffer.
pub fn detect_breakouts(candidates: &[Candidate], buffer: f64) -> Vec<(Candidate, TrailSide, f64)> {
    let mut hits = Vec::new();
    for c in candidates {
        if c.range_high <= 0.0 || c.range_low <= 0.0 {
            continue;
        }
        let up_trigger = c.range_high * (1.0 + buffer);
        let down_trigger = c.range_low * (1.0 - buffer);
        if c.price >= up_trigger {
            hits.push((c.clone(), TrailSide::Long, (c.price - c.range_high) / c.range_high));
        } else if c.price <= down_trigger {
            hits.push((c.clone(), TrailSide::Short, (c.range_low - c.price) / c.range_low));
        }
    }
    hits.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    hits
}

fn seconds_to_hard_close(cfg: &Config) -> i64 {
    let Ok((hh, mm)) = crate::core::time::parse_hhmm(&cfg.market_close_hhmm) else {
        return i64::MAX;
    };
    (today_utc_at(hh, mm) - Utc::now()).num_seconds()
}

fn build_signals(
    cfg: &Config,
    session: Session,
    hits: Vec<(Candidate, TrailSide, f64)>,
) -> Vec<Signal> {
    let base_pct = cfg.trail_pct_for(session.as_str());
    let pct = tightened_trail_pct(
        base_pct,
        seconds_to_hard_close(cfg),
        cfg.hard_close_buffer_sec,
        cfg.trail_tighten_factor,
    );
    hits.into_iter()
        .take(cfg.max_trades)
        .enumerate()
        .map(|(rank, (c, side, strength))| {
            let weight = cfg.weights.get(rank).copied().unwrap_or_else(|| {
                cfg.weights.last().copied().unwrap_or(1.0 / cfg.max_trades.max(1) as f64)
            });
            let threshold = compute_exit_threshold(&TrailInputs {
                side,
                entry_price: c.price,
                peak_or_trough: c.price,
                trail_pct: pct,
                atr: None,
                atr_mult: None,
                min_stop_pct: None,
                max_stop_pct: Some(cfg.max_risk_per_trade),
            });
            Signal {
                symbol: c.symbol,
                side: match side {
                    TrailSide::Long => "long".to_string(),
                    TrailSide::Short => "short".to_string(),
                },
                price: c.price,
                breakout_strength: strength,
                allocation_weight: weight,
                trail_pct: pct,
                trailing_exit_threshold: threshold,
            }
        })
        .collect()
}

fn write_last_stamp(ctx: &Context, session: Session, kind: &str) -> Result<(), TbotError> {
    let stamp = paths::stamp_file_path(ctx, &format!("strategy_{}_last.json", session.as_str()))?;
    write_json_atomic(&stamp, &json!({"kind": kind, "last_run_utc": now_iso_z()}))
}

/// Run one strategy session end to end. Returns the outcome rather than
/// erroring on gate/idempotency skips — skipping is a normal day. `force`
/// bypasses the daily stamp and the lifecycle gate (test mode, reruns).
pub fn run_session(
    ctx: &Context,
    cfg: &Config,
    session: Session,
    force: bool,
) -> Result<StrategyOutcome, TbotError> {
    let log = |msg: &str| status::log_line(ctx, &format!("strategy_{}", session.as_str()), msg);

    let stamp = paths::strategy_stamp_path(ctx, session.as_str())?;
    if !force && stamp_is_today(&stamp, Utc::now()) {
        log("already ran today (stamp present); exiting quietly");
        return Ok(StrategyOutcome {
            skipped: true,
            reason: Some("already_ran_today".to_string()),
            signals: 0,
        });
    }

    let (gate_open, current) = if force {
        (true, state::get_state(ctx, "running"))
    } else {
        state::state_in(ctx, state::WORKER_RUNNABLE_STATES)
    };
    if !gate_open {
        log(&format!("lifecycle gate closed (state={}); skipping", current));
        write_last_stamp(ctx, session, "Failed")?;
        return Ok(StrategyOutcome {
            skipped: true,
            reason: Some(format!("lifecycle_state_{}", current)),
            signals: 0,
        });
    }

    write_stamp(&stamp, Utc::now())?;

    if !session.enabled(cfg) {
        log("session disabled by configuration; skipping");
        write_last_stamp(ctx, session, "OK")?;
        return Ok(StrategyOutcome {
            skipped: true,
            reason: Some("disabled".to_string()),
            signals: 0,
        });
    }

    let mut candidates = read_candidates(ctx, session)?;
    if candidates.is_empty() {
        log("no candidates available; no signals this session");
    }
    candidates.truncate(cfg.max_trades * cfg.candidate_multiplier);
    let hits = detect_breakouts(&candidates, breakout_buffer());
    let signals = build_signals(cfg, session, hits);

    let out_path =
        paths::logs_dir(ctx)?.join(format!("strategy_{}_signals.json", session.as_str()));
    write_json_atomic(
        &out_path,
        &json!({
            "session": session.as_str(),
            "generated_at_utc": now_iso_z(),
            "signals": signals,
        }),
    )?;
    log(&format!("emitted {} signal(s)", signals.len()));
    write_last_stamp(ctx, session, "OK")?;

    Ok(StrategyOutcome {
        skipped: false,
        reason: None,
        signals: signals.len(),
    })
}

/// Route a session by name. With `test_mode.flag` present all three sessions
/// execute immediately once (stamps and gate bypassed), then the flag is
/// cleared. The `TBOT_STRATEGY_FORCE` environment override is honored here,
/// at the process entry point.
pub fn route(ctx: &Context, cfg: &Config, session: &str) -> Result<StrategyOutcome, TbotError> {
    if flags::test_mode_active(ctx) {
        status::log_line(ctx, "strategy_router", "TEST_MODE active: executing all sessions once");
        let mut last = StrategyOutcome::default();
        for s in [Session::Open, Session::Mid, Session::Close] {
            last = run_session(ctx, cfg, s, true)?;
        }
        flags::clear_test_mode(ctx)?;
        return Ok(last);
    }
    let force = std::env::var("TBOT_STRATEGY_FORCE").is_ok();
    run_session(ctx, cfg, Session::parse(session)?, force)
}

/// Stamp freshness probe used by the supervisor's status report.
pub fn last_run_today(ctx: &Context, session: Session) -> bool {
    paths::strategy_stamp_path(ctx, session.as_str())
        .map(|p| {
            fs::read_to_string(&p)
                .ok()
                .and_then(|raw| parse_to_utc(raw.trim()))
                .map(|ts| crate::core::time::same_utc_day(ts, Utc::now()))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(symbol: &str, price: f64, high: f64, low: f64) -> Candidate {
        Candidate {
            symbol: symbol.to_string(),
            price,
            range_high: high,
            range_low: low,
        }
    }

    #[test]
    fn test_breakout_detection_both_sides() {
        let candidates = vec![
            candidate("UP", 102.0, 100.0, 95.0),   // long breakout
            candidate("DOWN", 89.0, 100.0, 95.0),  // short breakout
            candidate("FLAT", 98.0, 100.0, 95.0),  // inside range
        ];
        let hits = detect_breakouts(&candidates, 0.005);
        assert_eq!(hits.len(), 2);
        let symbols: Vec<&str> = hits.iter().map(|(c, _, _)| c.symbol.as_str()).collect();
        assert!(symbols.contains(&"UP"));
        assert!(symbols.contains(&"DOWN"));
    }

    #[test]
    fn test_breakouts_ranked_by_strength() {
        let candidates = vec![
            candidate("WEAK", 100.6, 100.0, 95.0),
            candidate("STRONG", 105.0, 100.0, 95.0),
        ];
        let hits = detect_breakouts(&candidates, 0.005);
        assert_eq!(hits[0].0.symbol, "STRONG");
    }

    #[test]
    fn test_buffer_suppresses_marginal_moves() {
        let candidates = vec![candidate("EDGE", 100.2, 100.0, 95.0)];
        assert!(detect_breakouts(&candidates, 0.005).is_empty());
        assert_eq!(detect_breakouts(&candidates, 0.001).len(), 1);
    }

    #[test]
    fn test_session_parse() {
        assert_eq!(Session::parse("OPEN").unwrap(), Session::Open);
        assert!(Session::parse("brunch").is_err());
    }
}
