//! COA mapping table for broker ledger sync: persistent, versioned,
//! immutable rows with an active flag.
//!
//! All edits are append-only. Each change increments `version_id` and writes
//! a full-table snapshot for audit/rollback; the live file is only ever
//! replaced atomically. For a given rule code at most one row is active, and
//! a newer row for the same code deactivates its predecessor.

use crate::core::atomicfile::write_json_atomic;
use crate::core::audit::{AuditEvent, append_to};
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use crate::core::time::now_iso_z;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::fs;

/// Discriminator subset a rule matches on. Missing keys are wildcards at
/// fallback-match time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub txn_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MatchSpec {
    /// Deterministic rule code: `broker:type:subtype:description`.
    pub fn rule_code(&self) -> String {
        [
            self.broker.as_deref().unwrap_or(""),
            self.txn_type.as_deref().unwrap_or(""),
            self.subtype.as_deref().unwrap_or(""),
            self.description.as_deref().unwrap_or(""),
        ]
        .map(str::trim)
        .join(":")
    }

    fn fields(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("broker", self.broker.as_deref()),
            ("type", self.txn_type.as_deref()),
            ("subtype", self.subtype.as_deref()),
            ("description", self.description.as_deref()),
        ]
    }

    /// Exact match on the keys `want` carries, ignoring keys it omits.
    fn matches(&self, want: &MatchSpec) -> bool {
        self.fields()
            .iter()
            .zip(want.fields().iter())
            .all(|((_, have), (_, wanted))| match wanted {
                Some(w) => have.as_deref() == Some(*w),
                None => true,
            })
    }
}

/// Immutable mapping row; create a new row to change a mapping. Previous
/// rows remain in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingRow {
    pub code: String,
    pub debit_account: String,
    pub credit_account: String,
    pub active: bool,
    pub version_id: i64,
    pub updated_by: String,
    pub updated_at_utc: String,
    pub reason: String,
    #[serde(rename = "match", default)]
    pub match_spec: MatchSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingMeta {
    pub entity_code: String,
    pub jurisdiction_code: String,
    pub broker_code: String,
    pub bot_id: String,
    pub created_at_utc: String,
    pub updated_at_utc: String,
    pub coa_version: String,
    pub version_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version_id: i64,
    pub timestamp_utc: String,
    pub user: String,
    pub reason: String,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmappedEntry {
    pub transaction: JsonValue,
    pub flagged_at_utc: String,
    pub flagged_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingTable {
    pub meta: MappingMeta,
    /// Back-compat mirror of `meta.version_id`.
    pub version: i64,
    pub rows: Vec<MappingRow>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub unmapped: Vec<UnmappedEntry>,
}

/// Rule assignment input: discriminators plus the account pair.
#[derive(Debug, Clone)]
pub struct MappingRule {
    pub match_spec: MatchSpec,
    pub debit_account: String,
    pub credit_account: String,
    /// Explicit override code; computed from the match spec when absent.
    pub code: Option<String>,
}

fn audit(ctx: &Context, event: &str, extra: JsonValue) {
    if let Ok(path) = paths::mapping_audit_path(ctx) {
        let _ = append_to(
            ctx,
            &path,
            AuditEvent {
                action: event,
                actor: "system",
                extra: Some(extra),
                ..Default::default()
            },
        );
    }
}

fn bootstrap_table(ctx: &Context) -> Result<MappingTable, TbotError> {
    let now = now_iso_z();
    let table = MappingTable {
        meta: MappingMeta {
            entity_code: ctx.identity.entity_code.clone(),
            jurisdiction_code: ctx.identity.jurisdiction_code.clone(),
            broker_code: ctx.identity.broker_code.clone(),
            bot_id: ctx.identity.bot_id.clone(),
            created_at_utc: now.clone(),
            updated_at_utc: now,
            coa_version: "v1.0.0".to_string(),
            version_id: 1,
        },
        version: 1,
        rows: Vec::new(),
        history: Vec::new(),
        unmapped: Vec::new(),
    };
    write_json_atomic(&paths::mapping_table_path(ctx)?, &table)?;
    write_snapshot(ctx, &table)?;
    audit(ctx, "bootstrap", json!({"version_id": 1}));
    Ok(table)
}

fn snapshot_name(table: &MappingTable) -> String {
    format!(
        "coa_mapping_v{}_{}.json",
        table.meta.version_id,
        table.meta.updated_at_utc.replace(':', "-")
    )
}

fn write_snapshot(ctx: &Context, table: &MappingTable) -> Result<(), TbotError> {
    let dir = paths::mapping_versions_dir(ctx)?;
    write_json_atomic(&dir.join(snapshot_name(table)), table)
}

/// Load the current table, or a specific version's snapshot. Lazy-creates
/// the live file when missing.
pub fn load(ctx: &Context, version_id: Option<i64>) -> Result<MappingTable, TbotError> {
    let live = paths::mapping_table_path(ctx)?;
    match version_id {
        None => {
            if !live.exists() {
                return bootstrap_table(ctx);
            }
            let mut table: MappingTable = serde_json::from_str(&fs::read_to_string(&live)?)?;
            table.version = table.meta.version_id;
            Ok(table)
        }
        Some(v) => {
            let dir = paths::mapping_versions_dir(ctx)?;
            let prefix = format!("coa_mapping_v{}_", v);
            let mut candidates: Vec<_> = fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .map(|n| {
                            let n = n.to_string_lossy();
                            n.starts_with(&prefix) && n.ends_with(".json")
                        })
                        .unwrap_or(false)
                })
                .collect();
            candidates.sort();
            let Some(path) = candidates.last() else {
                return Err(TbotError::NotFound(format!(
                    "COA mapping snapshot v{} not found",
                    v
                )));
            };
            let mut table: MappingTable = serde_json::from_str(&fs::read_to_string(path)?)?;
            table.version = table.meta.version_id;
            Ok(table)
        }
    }
}

fn save(
    ctx: &Context,
    mut table: MappingTable,
    user: &str,
    reason: &str,
) -> Result<MappingTable, TbotError> {
    table.meta.version_id += 1;
    table.meta.updated_at_utc = now_iso_z();
    table.version = table.meta.version_id;
    let entry = HistoryEntry {
        version_id: table.meta.version_id,
        timestamp_utc: table.meta.updated_at_utc.clone(),
        user: user.to_string(),
        reason: reason.to_string(),
        row_count: table.rows.len(),
    };
    table.history.push(entry.clone());
    write_json_atomic(&paths::mapping_table_path(ctx)?, &table)?;
    write_snapshot(ctx, &table)?;
    audit(
        ctx,
        "save",
        json!({
            "version_id": entry.version_id,
            "user": entry.user,
            "reason": entry.reason,
            "row_count": entry.row_count,
        }),
    );
    Ok(table)
}

pub fn get_version(ctx: &Context) -> Result<i64, TbotError> {
    Ok(load(ctx, None)?.meta.version_id)
}

/// Create/replace a mapping rule (append-only). Any currently active row for
/// the same rule code is deactivated; the new row carries the next version.
pub fn assign(
    ctx: &Context,
    rule: &MappingRule,
    user: &str,
    reason: Option<&str>,
) -> Result<MappingTable, TbotError> {
    let mut table = load(ctx, None)?;
    let code = rule
        .code
        .clone()
        .unwrap_or_else(|| rule.match_spec.rule_code());
    for row in table.rows.iter_mut() {
        if row.code == code && row.active {
            row.active = false;
        }
    }
    let reason = reason.unwrap_or("manual assignment").to_string();
    let next_version = table.meta.version_id + 1;
    table.rows.push(MappingRow {
        code,
        debit_account: rule.debit_account.clone(),
        credit_account: rule.credit_account.clone(),
        active: true,
        version_id: next_version,
        updated_by: user.to_string(),
        updated_at_utc: now_iso_z(),
        reason: reason.clone(),
        match_spec: rule.match_spec.clone(),
    });
    save(ctx, table, user, &reason)
}

/// Wholesale replacement import. Previous states remain reachable through
/// the versions directory.
pub fn import(ctx: &Context, json_data: &str, user: &str) -> Result<MappingTable, TbotError> {
    let incoming: JsonValue = serde_json::from_str(json_data)?;
    let mut table = load(ctx, None)?;
    let next_version = table.meta.version_id + 1;
    let now = now_iso_z();

    let empty = Vec::new();
    let incoming_rows = incoming
        .get("rows")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);
    let mut rows = Vec::with_capacity(incoming_rows.len());
    for m in incoming_rows {
        let match_spec: MatchSpec = m
            .get("match")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let code = m
            .get("code")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| match_spec.rule_code());
        rows.push(MappingRow {
            code,
            debit_account: m
                .get("debit_account")
                .and_then(|v| v.as_str())
                .unwrap_or("Uncategorized:Debit")
                .to_string(),
            credit_account: m
                .get("credit_account")
                .and_then(|v| v.as_str())
                .unwrap_or("Uncategorized:Credit")
                .to_string(),
            active: m.get("active").and_then(|v| v.as_bool()).unwrap_or(true),
            version_id: next_version,
            updated_by: m
                .get("updated_by")
                .and_then(|v| v.as_str())
                .unwrap_or(user)
                .to_string(),
            updated_at_utc: m
                .get("updated_at_utc")
                .and_then(|v| v.as_str())
                .unwrap_or(&now)
                .to_string(),
            reason: m
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("imported")
                .to_string(),
            match_spec,
        });
    }
    table.rows = rows;
    if let Some(cv) = incoming.get("coa_version").and_then(|v| v.as_str()) {
        table.meta.coa_version = cv.to_string();
    }
    save(ctx, table, user, "imported mapping")
}

/// Export the table (current or a specific version) as pretty JSON.
pub fn export(ctx: &Context, version_id: Option<i64>) -> Result<String, TbotError> {
    let table = load(ctx, version_id)?;
    Ok(serde_json::to_string_pretty(&table)?)
}

/// Rollback the live table to a previous snapshot. The rollback itself is a
/// new save, so `version_id` keeps increasing and history stays monotonic.
pub fn rollback(ctx: &Context, version_id: i64) -> Result<MappingTable, TbotError> {
    let current = load(ctx, None)?.meta.version_id;
    let mut snap = load(ctx, Some(version_id))?;
    audit(
        ctx,
        "rollback_requested",
        json!({"to_version": version_id, "from_version": current}),
    );
    // Resume numbering from the live head, not the snapshot's.
    snap.meta.version_id = current;
    save(ctx, snap, "system", &format!("rollback to v{}", version_id))
}

/// Look up the active row for a transaction's discriminators. Explicit code
/// match wins; fallback is exact match on the keys the txn carries. Ties are
/// broken by highest `version_id`.
pub fn get_for_transaction<'t>(
    table: &'t MappingTable,
    want: &MatchSpec,
    code: Option<&str>,
) -> Option<&'t MappingRow> {
    let code = code
        .map(String::from)
        .unwrap_or_else(|| want.rule_code());
    let by_code = table
        .rows
        .iter()
        .filter(|r| r.active && r.code == code)
        .max_by_key(|r| r.version_id);
    if by_code.is_some() {
        return by_code;
    }
    table
        .rows
        .iter()
        .filter(|r| r.active && r.match_spec.matches(want))
        .max_by_key(|r| r.version_id)
}

/// Split an entry into debit/credit legs per the matched rule (or the
/// Uncategorized placeholders when none matched). Magnitude goes on the
/// debit leg, the negation on the credit leg.
pub fn apply_rule(
    entry: &Map<String, JsonValue>,
    mapping: Option<&MappingRow>,
) -> (Map<String, JsonValue>, Map<String, JsonValue>) {
    let debit_account = mapping
        .map(|m| m.debit_account.clone())
        .unwrap_or_else(|| "Uncategorized:Debit".to_string());
    let credit_account = mapping
        .map(|m| m.credit_account.clone())
        .unwrap_or_else(|| "Uncategorized:Credit".to_string());
    let amount = entry
        .get("total_value")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
        .abs();

    let mut debit = entry.clone();
    let mut credit = entry.clone();
    debit.insert("account".into(), json!(debit_account));
    debit.insert("side".into(), json!("debit"));
    debit.insert("total_value".into(), json!(amount));
    credit.insert("account".into(), json!(credit_account));
    credit.insert("side".into(), json!("credit"));
    credit.insert("total_value".into(), json!(-amount));
    (debit, credit)
}

/// Record an unmapped transaction for operator review.
pub fn flag_unmapped(ctx: &Context, txn: JsonValue, user: &str) -> Result<MappingTable, TbotError> {
    let mut table = load(ctx, None)?;
    table.unmapped.push(UnmappedEntry {
        transaction: txn.clone(),
        flagged_at_utc: now_iso_z(),
        flagged_by: user.to_string(),
    });
    audit(ctx, "flag_unmapped", json!({"user": user, "txn": txn}));
    save(ctx, table, user, "unmapped_txn")
}

/// Verify the active rows reference every required COA code. A trailing `x`
/// makes a prefix wildcard: `"111x"` matches any account starting with `111`.
pub fn ensure_required(ctx: &Context, required: &[&str]) -> Result<(), TbotError> {
    let table = load(ctx, None)?;
    let mut accounts: Vec<&str> = Vec::new();
    for row in table.rows.iter().filter(|r| r.active) {
        if !row.debit_account.is_empty() {
            accounts.push(&row.debit_account);
        }
        if !row.credit_account.is_empty() {
            accounts.push(&row.credit_account);
        }
    }
    let mut missing = Vec::new();
    for needle in required {
        let prefix = needle.strip_suffix('x').unwrap_or(needle);
        if !accounts.iter().any(|a| a.starts_with(prefix)) {
            missing.push(*needle);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TbotError::Validation(format!(
            "required COA codes missing from mapping: {}",
            missing.join(", ")
        )))
    }
}
