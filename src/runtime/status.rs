//! Status document and process log sinks.
//!
//! `logs/status.json` is the UI's window into the core: the supervisor and
//! dispatcher merge their fields into it (read-modify-write, atomic replace)
//! and stamp `{supervisor,dispatcher}_updated_at`. Process logs are plain
//! append-only files with `"<ISO8601Z> [component] message"` lines.

use crate::core::atomicfile::{append_line, write_json_atomic};
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use crate::core::time::now_iso_z;
use serde_json::{Map, Value as JsonValue, json};
use std::fs;

/// Append one line to `logs/<component>.log`. Logging failures are swallowed;
/// a full disk must not take down a phase.
pub fn log_line(ctx: &Context, component: &str, msg: &str) {
    if let Ok(path) = paths::process_log_path(ctx, component) {
        let _ = append_line(&path, &format!("{} [{}] {}", now_iso_z(), component, msg));
    }
}

fn read_status(ctx: &Context) -> Map<String, JsonValue> {
    paths::status_path(ctx)
        .ok()
        .and_then(|p| fs::read_to_string(p).ok())
        .and_then(|raw| serde_json::from_str::<JsonValue>(&raw).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

fn write_status_with_stamp(
    ctx: &Context,
    extra: JsonValue,
    stamp_key: &str,
) -> Result<(), TbotError> {
    let mut payload = read_status(ctx);
    if let JsonValue::Object(extra) = extra {
        for (k, v) in extra {
            payload.insert(k, v);
        }
    }
    payload.insert(stamp_key.to_string(), json!(now_iso_z()));
    write_json_atomic(&paths::status_path(ctx)?, &JsonValue::Object(payload))
}

/// Merge supervisor-owned fields into status.json.
pub fn update_supervisor_status(ctx: &Context, extra: JsonValue) -> Result<(), TbotError> {
    write_status_with_stamp(ctx, extra, "supervisor_updated_at")
}

/// Merge dispatcher-owned fields into status.json.
pub fn update_dispatcher_status(ctx: &Context, extra: JsonValue) -> Result<(), TbotError> {
    write_status_with_stamp(ctx, extra, "dispatcher_updated_at")
}

pub fn current_status(ctx: &Context) -> JsonValue {
    JsonValue::Object(read_status(ctx))
}

/// Worker result stamp (`{kind: "OK"|"Failed", last_run_utc}`), e.g.
/// `holdings_manager_last.txt` or `universe_rebuild_last.txt`.
pub fn write_worker_stamp(ctx: &Context, filename: &str, ok: bool) -> Result<(), TbotError> {
    let stamp = paths::stamp_file_path(ctx, filename)?;
    write_json_atomic(
        &stamp,
        &json!({"kind": if ok { "OK" } else { "Failed" }, "last_run_utc": now_iso_z()}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Identity4;

    fn test_ctx(root: &std::path::Path) -> Context {
        Context::new(Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap(), root)
    }

    #[test]
    fn test_status_merges_and_stamps() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        update_supervisor_status(&ctx, json!({"supervisor_status": "scheduled"})).unwrap();
        update_dispatcher_status(&ctx, json!({"dispatcher_status": "running"})).unwrap();
        let status = current_status(&ctx);
        assert_eq!(status["supervisor_status"], "scheduled");
        assert_eq!(status["dispatcher_status"], "running");
        assert!(status["supervisor_updated_at"].is_string());
        assert!(status["dispatcher_updated_at"].is_string());
    }

    #[test]
    fn test_worker_stamp_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        write_worker_stamp(&ctx, "holdings_manager_last.txt", true).unwrap();
        let raw = fs::read_to_string(
            paths::stamp_file_path(&ctx, "holdings_manager_last.txt").unwrap(),
        )
        .unwrap();
        let v: JsonValue = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["kind"], "OK");
        assert!(v["last_run_utc"].is_string());
    }

    #[test]
    fn test_log_line_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        log_line(&ctx, "supervisor", "first");
        log_line(&ctx, "supervisor", "second");
        let raw =
            fs::read_to_string(paths::process_log_path(&ctx, "supervisor").unwrap()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.lines().next().unwrap().contains("[supervisor] first"));
    }
}
