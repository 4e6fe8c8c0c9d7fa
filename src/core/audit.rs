//! Append-only JSONL audit trail.
//!
//! Every mutation of consequence (ledger posting, lot open/close, compliance
//! reject, mapping change, opening-balance bootstrap) lands here as one JSON
//! object per line. Records are never mutated or deleted; consumers must
//! tolerate additional keys. A read-only timeline renderer makes the trail
//! legible to operators.

use crate::core::atomicfile::append_line;
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use crate::core::time::now_iso_z;
use colored::Colorize;
use serde_json::{Map, Value as JsonValue, json};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use ulid::Ulid;

/// One audit event; `before`/`after` carry full record snapshots where
/// applicable, `extra` is merged in without overwriting core keys.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent<'a> {
    pub action: &'a str,
    pub entry_id: Option<i64>,
    pub actor: &'a str,
    pub reason: Option<&'a str>,
    pub audit_reference: Option<&'a str>,
    pub group_id: Option<&'a str>,
    pub fitid: Option<&'a str>,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub extra: Option<JsonValue>,
}

/// Append a single event to the ledger audit trail.
pub fn append(ctx: &Context, ev: AuditEvent) -> Result<(), TbotError> {
    let path = paths::ledger_audit_path(ctx)?;
    append_to(ctx, &path, ev)
}

/// Append a single event to an explicit JSONL file (used by the mapping
/// table, which keeps its own trail next to the live file).
pub fn append_to(ctx: &Context, path: &Path, ev: AuditEvent) -> Result<(), TbotError> {
    let mut record = Map::new();
    record.insert("ts_utc".into(), json!(now_iso_z()));
    record.insert("event_id".into(), json!(Ulid::new().to_string()));
    record.insert("action".into(), json!(ev.action));
    record.insert("entry_id".into(), json!(ev.entry_id));
    record.insert("actor".into(), json!(ev.actor));
    record.insert("reason".into(), json!(ev.reason));
    record.insert("audit_reference".into(), json!(ev.audit_reference));
    record.insert("group_id".into(), json!(ev.group_id));
    record.insert("fitid".into(), json!(ev.fitid));
    record.insert("before".into(), ev.before.unwrap_or(JsonValue::Null));
    record.insert("after".into(), ev.after.unwrap_or(JsonValue::Null));
    record.insert("entity_code".into(), json!(ctx.identity.entity_code));
    record.insert(
        "jurisdiction_code".into(),
        json!(ctx.identity.jurisdiction_code),
    );
    record.insert("broker_code".into(), json!(ctx.identity.broker_code));
    record.insert("bot_id".into(), json!(ctx.identity.bot_id));

    // Shallow extras, core keys win.
    if let Some(JsonValue::Object(extra)) = ev.extra {
        for (k, v) in extra {
            record.entry(k).or_insert(v);
        }
    }

    append_line(path, &serde_json::to_string(&JsonValue::Object(record))?)
}

/// Best-effort append: audit failures must never break the posting path.
pub fn append_best_effort(ctx: &Context, ev: AuditEvent) {
    if let Err(e) = append(ctx, ev) {
        eprintln!("[audit] append failed (continuing): {}", e);
    }
}

// --- Timeline rendering (read-only) ---

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub source: String,
    pub ts: String,
    pub action: String,
    pub actor: String,
    pub group_id: Option<String>,
    pub details: JsonValue,
}

fn read_events(path: &Path, limit: usize) -> Result<Vec<TimelineEvent>, TbotError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(v) = serde_json::from_str::<JsonValue>(&line) else {
            continue;
        };
        events.push(TimelineEvent {
            source: String::new(),
            ts: v
                .get("ts_utc")
                .or_else(|| v.get("ts"))
                .and_then(|x| x.as_str())
                .unwrap_or("unknown")
                .to_string(),
            action: v
                .get("action")
                .or_else(|| v.get("event"))
                .and_then(|x| x.as_str())
                .unwrap_or("unknown")
                .to_string(),
            actor: v
                .get("actor")
                .and_then(|x| x.as_str())
                .unwrap_or("-")
                .to_string(),
            group_id: v
                .get("group_id")
                .and_then(|x| x.as_str())
                .map(String::from),
            details: v,
        });
        if events.len() >= limit {
            break;
        }
    }
    Ok(events)
}

/// Merge the ledger and mapping audit trails into one time-sorted view.
pub fn collect_timeline(ctx: &Context, limit: usize) -> Result<Vec<TimelineEvent>, TbotError> {
    let sources = [
        ("ledger", paths::ledger_audit_path(ctx)?),
        ("mapping", paths::mapping_audit_path(ctx)?),
    ];
    let mut all = Vec::new();
    for (name, path) in sources {
        if !path.exists() {
            continue;
        }
        for mut ev in read_events(&path, limit)? {
            ev.source = name.to_string();
            all.push(ev);
        }
    }
    all.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(all)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    // str::get refuses non-boundary cuts; fall back to a char walk.
    match s.get(..keep) {
        Some(head) => format!("{}...", head),
        None => format!("{}...", s.chars().take(keep).collect::<String>()),
    }
}

pub fn render_timeline(ctx: &Context, limit: usize, format: &str) -> Result<(), TbotError> {
    let events = collect_timeline(ctx, limit)?;
    if format == "json" {
        let details: Vec<&JsonValue> = events.iter().map(|e| &e.details).collect();
        println!("{}", serde_json::to_string_pretty(&details)?);
        return Ok(());
    }
    println!(
        "{}",
        format!("AUDIT TIMELINE — {} ({} events)", ctx.identity, events.len()).bold()
    );
    println!(
        "{:<22} {:<28} {:<14} {:<10} {}",
        "TIME".dimmed(),
        "ACTION".dimmed(),
        "ACTOR".dimmed(),
        "SOURCE".dimmed(),
        "GROUP".dimmed()
    );
    for ev in &events {
        let action = if ev.action.contains("reject") {
            truncate(&ev.action, 28).red().to_string()
        } else {
            truncate(&ev.action, 28).to_string()
        };
        println!(
            "{:<22} {:<28} {:<14} {:<10} {}",
            truncate(&ev.ts, 22),
            action,
            truncate(&ev.actor, 14),
            ev.source,
            ev.group_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
