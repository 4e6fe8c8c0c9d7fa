//! Lifecycle state manager for `control/bot_state.txt`.
//!
//! Single source of truth for the bot's lifecycle token across every process.
//! Writes are atomic (temp file + rename) and each transition is appended to
//! `logs/bot_state_history.log` as `"<ISO8601Z> <token> [reason=<x>]"`.
//! History append failures never block a state write.

use crate::core::atomicfile;
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use crate::core::time::now_iso_z;
use std::fs;

/// Valid lifecycle tokens, lowercase, one per write.
pub const VALID_STATES: &[&str] = &[
    "initializing",
    "provisioning",
    "bootstrapping",
    "registration",
    "idle",
    "analyzing",
    "trading",
    "monitoring",
    "updating",
    "running",
    "graceful_closing_positions",
    "shutdown_triggered",
    "error",
];

/// States in which phase workers are allowed to run.
pub const WORKER_RUNNABLE_STATES: &[&str] = &["running", "trading", "monitoring", "analyzing"];

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Read the current lifecycle token; `default` when missing or unreadable.
pub fn get_state(ctx: &Context, default: &str) -> String {
    let path = match paths::bot_state_path(ctx) {
        Ok(p) => p,
        Err(_) => return normalize(default),
    };
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let first = raw.lines().next().unwrap_or("").trim();
            if first.is_empty() {
                normalize(default)
            } else {
                normalize(first)
            }
        }
        Err(_) => normalize(default),
    }
}

/// Atomically write a new lifecycle token; unknown tokens are rejected.
pub fn set_state(ctx: &Context, state: &str, reason: Option<&str>) -> Result<String, TbotError> {
    let s = normalize(state);
    if s.is_empty() {
        return Err(TbotError::Validation("lifecycle state is empty".to_string()));
    }
    if !VALID_STATES.contains(&s.as_str()) {
        return Err(TbotError::Validation(format!(
            "invalid lifecycle state '{}'",
            state
        )));
    }
    atomicfile::write_line_atomic(&paths::bot_state_path(ctx)?, &s)?;
    append_history(ctx, &s, reason);
    Ok(s)
}

fn append_history(ctx: &Context, state: &str, reason: Option<&str>) {
    let Ok(history) = paths::bot_state_history_path(ctx) else {
        return;
    };
    let mut line = format!("{} {}", now_iso_z(), state);
    if let Some(r) = reason {
        let r = normalize(r);
        if !r.is_empty() {
            line.push_str(&format!(" reason={}", r));
        }
    }
    let _ = atomicfile::append_line(&history, &line);
}

/// True when the current state is one of `expected`.
pub fn state_in(ctx: &Context, expected: &[&str]) -> (bool, String) {
    let cur = get_state(ctx, "running");
    (expected.iter().any(|e| normalize(e) == cur), cur)
}

/// Gate used by phase workers before doing any work. The
/// `TBOT_STRATEGY_FORCE` environment override bypasses the gate for tests.
pub fn worker_gate_open(ctx: &Context) -> (bool, String) {
    if std::env::var("TBOT_STRATEGY_FORCE").is_ok() {
        return (true, get_state(ctx, "running"));
    }
    state_in(ctx, WORKER_RUNNABLE_STATES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Identity4;
    use std::path::Path;

    fn test_ctx(root: &Path) -> Context {
        Context::new(Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(), root)
    }

    #[test]
    fn test_set_then_get() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        set_state(&ctx, "trading", Some("open:launch")).unwrap();
        assert_eq!(get_state(&ctx, "running"), "trading");
    }

    #[test]
    fn test_invalid_state_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        assert!(set_state(&ctx, "dancing", None).is_err());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        assert_eq!(get_state(&ctx, "running"), "running");
    }

    #[test]
    fn test_history_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        set_state(&ctx, "analyzing", None).unwrap();
        set_state(&ctx, "idle", Some("stop")).unwrap();
        let history =
            std::fs::read_to_string(paths::bot_state_history_path(&ctx).unwrap()).unwrap();
        let lines: Vec<&str> = history.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" analyzing"));
        assert!(lines[1].ends_with(" idle reason=stop"));
    }

    #[test]
    fn test_worker_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        set_state(&ctx, "trading", None).unwrap();
        assert!(worker_gate_open(&ctx).0);
        set_state(&ctx, "idle", Some("stop")).unwrap();
        let (ok, cur) = worker_gate_open(&ctx);
        // TBOT_STRATEGY_FORCE may be absent in test env; gate must close on idle
        if std::env::var("TBOT_STRATEGY_FORCE").is_err() {
            assert!(!ok);
            assert_eq!(cur, "idle");
        }
    }
}
