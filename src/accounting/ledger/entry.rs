//! Ledger entry sanitization: required fields, action routing, and SQLite
//! binding safety.
//!
//! Entries travel through the posting pipeline as JSON maps (the normalizer
//! boundary form). Before any insert they pass through
//! [`add_required_fields`], which stamps identity, normalizes the action
//! verb, coerces numerics, derives the signed `amount` from `side`, and
//! JSON-encodes complex values so SQLite bindings never see objects.

use crate::core::identity::Identity4;
use crate::core::schemas::TRADES_FIELDS;
use crate::core::time::now_iso_z;
use serde_json::{Map, Value as JsonValue, json};

pub type EntryMap = Map<String, JsonValue>;

/// Map broker/raw actions to normalized ledger schema actions.
pub fn map_action(action: Option<&str>) -> &'static str {
    match action.unwrap_or("").trim().to_lowercase().as_str() {
        "buy" | "long" => "long",
        "sell" | "short" => "short",
        "put" => "put",
        "call" => "call",
        "assignment" => "assignment",
        "exercise" => "exercise",
        "expire" => "expire",
        "reorg" => "reorg",
        "inverse" => "inverse",
        _ => "other",
    }
}

pub fn as_f64(v: Option<&JsonValue>) -> f64 {
    match v {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn jsonify_if_needed(v: JsonValue) -> JsonValue {
    match v {
        JsonValue::Object(_) | JsonValue::Array(_) => {
            JsonValue::String(serde_json::to_string(&v).unwrap_or_else(|_| "{}".to_string()))
        }
        other => other,
    }
}

/// Fallback trade id for entries that arrive without one: a content hash
/// scoped by broker and bot so retries of the same payload collide.
fn fallback_trade_id(entry: &EntryMap, identity: &Identity4) -> String {
    let mut keys: Vec<&String> = entry.keys().collect();
    keys.sort();
    let canonical: String = keys
        .iter()
        .map(|k| format!("{}={}", k, entry[k.as_str()]))
        .collect::<Vec<_>>()
        .join("|");
    let digest = crate::accounting::normalize::fitid_hash(&[Some(canonical.as_str())]);
    format!(
        "{}_{}_{}",
        identity.broker_code,
        identity.bot_id,
        &digest[..16]
    )
}

/// Ensure mandatory columns exist, coerce numerics, normalize actions, set
/// ids, and JSON-encode complex values. Returns a new map; never mutates the
/// caller's entry.
pub fn add_required_fields(entry: &EntryMap, identity: &Identity4) -> EntryMap {
    let mut e = entry.clone();

    e.insert("entity_code".into(), json!(identity.entity_code));
    e.insert("jurisdiction_code".into(), json!(identity.jurisdiction_code));
    e.insert("broker_code".into(), json!(identity.broker_code));
    e.insert("bot_id".into(), json!(identity.bot_id));

    let action = e.get("action").and_then(|v| v.as_str()).map(String::from);
    e.insert("action".into(), json!(map_action(action.as_deref())));
    if e.get("status").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
        e.insert("status".into(), json!("ok"));
    }

    for key in ["fee", "commission", "price", "quantity", "total_value"] {
        let v = as_f64(e.get(key));
        e.insert(key.into(), json!(v));
    }

    // Signed amount from side when missing: credit ⇒ negative, debit ⇒ positive.
    if e.get("amount").map(|v| v.is_null()).unwrap_or(true) {
        let val = as_f64(e.get("total_value"));
        let side = e
            .get("side")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let amount = if side == "credit" { -val.abs() } else { val.abs() };
        e.insert("amount".into(), json!(amount));
    }

    let has_trade_id = e
        .get("trade_id")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    if !has_trade_id {
        let tid = fallback_trade_id(&e, identity);
        e.insert("trade_id".into(), json!(tid));
    }
    let has_group = e
        .get("group_id")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    if !has_group {
        let tid = e.get("trade_id").cloned().unwrap_or(JsonValue::Null);
        e.insert("group_id".into(), tid);
    }

    for key in ["json_metadata", "raw_broker_json"] {
        if e.get(key).map(|v| v.is_null()).unwrap_or(true) {
            e.insert(key.into(), json!("{}"));
        }
    }

    let now = now_iso_z();
    if e.get("created_at").map(|v| v.is_null()).unwrap_or(true) {
        e.insert("created_at".into(), json!(now));
    }
    e.insert("updated_at".into(), json!(now));

    for field in TRADES_FIELDS {
        e.entry(field.to_string()).or_insert(JsonValue::Null);
    }

    let keys: Vec<String> = e.keys().cloned().collect();
    for k in keys {
        let v = e.remove(&k).unwrap();
        e.insert(k, jsonify_if_needed(v));
    }
    e
}

/// JSON value → SQLite binding value. Objects/arrays were stringified by
/// `add_required_fields`; anything slipping through binds as JSON text.
pub fn to_sql_value(v: &JsonValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match v {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Integer(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}
