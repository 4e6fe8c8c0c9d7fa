//! Chart of Accounts store: hierarchical account forest + metadata document.
//!
//! The COA lives as two JSON files under the identity's accounting dir:
//! the account forest (`tbot_ledger_coa.json`) and a metadata document with
//! currency/version/timestamps. Saves are atomic and prepend to a bounded
//! audit log that records who changed what, with a unified diff of the JSON.

use crate::core::atomicfile::{write_atomic, write_json_atomic};
use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use crate::core::time::now_iso_z;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

/// One COA node. Codes are globally unique across the forest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub code: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Account>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoaMetadata {
    pub currency_code: String,
    pub entity_code: String,
    pub jurisdiction_code: String,
    pub coa_version: String,
    pub created_at_utc: String,
    pub last_updated_utc: String,
}

/// Loaded view: the forest plus its flattened projections.
#[derive(Debug, Clone)]
pub struct CoaBundle {
    pub metadata: CoaMetadata,
    pub accounts: Vec<Account>,
    /// `(code, name)` for every node.
    pub accounts_flat: Vec<(String, String)>,
    /// `(code, "code – colon:delimited:path")` for active nodes only.
    pub accounts_flat_dropdown: Vec<(String, String)>,
}

const AUDIT_LOG_CAP: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CoaAuditEntry {
    ts_utc: String,
    user: String,
    summary: String,
    diff: String,
}

pub fn load(ctx: &Context) -> Result<CoaBundle, TbotError> {
    let coa_path = paths::coa_json_path(ctx)?;
    let meta_path = paths::coa_metadata_path(ctx)?;
    if !coa_path.exists() {
        return Err(TbotError::NotFound(format!(
            "COA file missing: {}",
            coa_path.display()
        )));
    }
    if !meta_path.exists() {
        return Err(TbotError::NotFound(format!(
            "COA metadata missing: {}",
            meta_path.display()
        )));
    }
    let accounts: Vec<Account> = serde_json::from_str(&fs::read_to_string(&coa_path)?)?;
    let metadata: CoaMetadata = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
    validate(&accounts)?;

    let mut flat = Vec::new();
    let mut dropdown = Vec::new();
    flatten(&accounts, "", &mut flat, &mut dropdown);

    Ok(CoaBundle {
        metadata,
        accounts,
        accounts_flat: flat,
        accounts_flat_dropdown: dropdown,
    })
}

fn flatten(
    nodes: &[Account],
    path: &str,
    flat: &mut Vec<(String, String)>,
    dropdown: &mut Vec<(String, String)>,
) {
    for node in nodes {
        let node_path = if path.is_empty() {
            node.name.clone()
        } else {
            format!("{}:{}", path, node.name)
        };
        flat.push((node.code.clone(), node.name.clone()));
        if node.active {
            dropdown.push((node.code.clone(), format!("{} – {}", node.code, node_path)));
        }
        flatten(&node.children, &node_path, flat, dropdown);
    }
}

/// Structural validation: non-empty forest, code+name on every node, codes
/// unique across the tree. Errors name the offending node.
pub fn validate(accounts: &[Account]) -> Result<(), TbotError> {
    if accounts.is_empty() {
        return Err(TbotError::Validation(
            "COA accounts must be a non-empty forest".to_string(),
        ));
    }
    let mut seen: HashSet<String> = HashSet::new();
    fn check(node: &Account, seen: &mut HashSet<String>) -> Result<(), TbotError> {
        if node.code.trim().is_empty() || node.name.trim().is_empty() {
            return Err(TbotError::Validation(format!(
                "COA node missing code or name (code='{}', name='{}')",
                node.code, node.name
            )));
        }
        if !seen.insert(node.code.clone()) {
            return Err(TbotError::Validation(format!(
                "duplicate COA code '{}' ({})",
                node.code, node.name
            )));
        }
        for child in &node.children {
            check(child, seen)?;
        }
        Ok(())
    }
    for node in accounts {
        check(node, &mut seen)?;
    }
    Ok(())
}

/// Save the forest atomically, bump metadata `last_updated_utc`, and prepend
/// an audit entry (user, summary, unified diff) keeping the last 100 entries.
pub fn save(
    ctx: &Context,
    accounts: &[Account],
    user: &str,
    summary: &str,
) -> Result<(), TbotError> {
    validate(accounts)?;
    let coa_path = paths::coa_json_path(ctx)?;
    let meta_path = paths::coa_metadata_path(ctx)?;

    let old_body = fs::read_to_string(&coa_path).unwrap_or_default();
    let new_body = serde_json::to_string_pretty(accounts)?;
    let diff = unified_diff(&old_body, &new_body);

    write_atomic(&coa_path, new_body.as_bytes())?;

    let now = now_iso_z();
    let metadata = match fs::read_to_string(&meta_path) {
        Ok(raw) => {
            let mut m: CoaMetadata = serde_json::from_str(&raw)?;
            m.last_updated_utc = now.clone();
            m
        }
        Err(_) => CoaMetadata {
            currency_code: "USD".to_string(),
            entity_code: ctx.identity.entity_code.clone(),
            jurisdiction_code: ctx.identity.jurisdiction_code.clone(),
            coa_version: "v1.0.0".to_string(),
            created_at_utc: now.clone(),
            last_updated_utc: now.clone(),
        },
    };
    write_json_atomic(&meta_path, &metadata)?;

    let audit_path = paths::coa_audit_log_path(ctx)?;
    let mut entries: Vec<CoaAuditEntry> = match fs::read_to_string(&audit_path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    entries.insert(
        0,
        CoaAuditEntry {
            ts_utc: now,
            user: user.to_string(),
            summary: summary.to_string(),
            diff,
        },
    );
    entries.truncate(AUDIT_LOG_CAP);
    write_json_atomic(&audit_path, &entries)?;
    Ok(())
}

/// Seed the default COA when none exists yet. No-op if already present.
pub fn bootstrap_default(ctx: &Context, user: &str) -> Result<bool, TbotError> {
    let coa_path = paths::coa_json_path(ctx)?;
    if coa_path.exists() {
        return Ok(false);
    }
    save(ctx, &default_template(), user, "bootstrap default COA")?;
    Ok(true)
}

/// Default account forest for a new identity.
pub fn default_template() -> Vec<Account> {
    fn leaf(code: &str, name: &str) -> Account {
        Account {
            code: code.to_string(),
            name: name.to_string(),
            active: true,
            children: Vec::new(),
        }
    }
    fn parent(code: &str, name: &str, children: Vec<Account>) -> Account {
        Account {
            code: code.to_string(),
            name: name.to_string(),
            active: true,
            children,
        }
    }
    vec![
        parent(
            "1000",
            "Assets",
            vec![parent(
                "1100",
                "Brokerage",
                vec![
                    leaf("1110", "Cash"),
                    parent("1120", "Equity", vec![]),
                    leaf("1130", "Cash Sweep"),
                ],
            )],
        ),
        parent(
            "2000",
            "Liabilities",
            vec![parent("2100", "Short Positions", vec![])],
        ),
        parent(
            "3000",
            "Equity",
            vec![
                leaf("3010", "OpeningBalances"),
                leaf("3020", "Capital Contributions"),
                leaf("3030", "Owner Withdrawals"),
                leaf("3999", "Suspense"),
            ],
        ),
        parent(
            "4000",
            "Income",
            vec![
                leaf("4010", "Realized Gains – Equities"),
                leaf("4080", "Dividends Earned"),
                leaf("4090", "Interest Income"),
            ],
        ),
        parent(
            "5000",
            "Expenses",
            vec![leaf("5010", "Brokerage Fees"), leaf("5020", "Trading P&L")],
        ),
    ]
}

/// Find an account code by a case-insensitive list of names forming a path,
/// e.g. `["Assets", "Brokerage", "Cash"]`. Inactive terminals are skipped.
pub fn find_code_by_name_path(accounts: &[Account], names: &[&str]) -> Option<String> {
    fn walk(nodes: &[Account], names: &[&str], depth: usize) -> Option<String> {
        let target = names.get(depth)?.trim().to_lowercase();
        for node in nodes {
            if node.name.trim().to_lowercase() == target {
                if depth == names.len() - 1 {
                    if node.active {
                        return Some(node.code.clone());
                    }
                } else if let Some(code) = walk(&node.children, names, depth + 1) {
                    return Some(code);
                }
            }
        }
        None
    }
    walk(accounts, names, 0)
}

/// Exact symbol equity path, falling back to the aggregate equity account.
pub fn find_symbol_equity_code(accounts: &[Account], symbol: &str) -> Option<String> {
    find_code_by_name_path(accounts, &["Assets", "Brokerage", "Equity", symbol])
        .or_else(|| find_code_by_name_path(accounts, &["Assets", "Brokerage", "Equity"]))
}

// --- Exports ---

pub fn export_markdown(metadata: &CoaMetadata, accounts: &[Account]) -> String {
    let mut out = Vec::new();
    out.push(format!(
        "# Chart of Accounts — {}/{} v{}",
        metadata.entity_code, metadata.jurisdiction_code, metadata.coa_version
    ));
    out.push(format!("**Currency:** {}", metadata.currency_code));
    out.push(format!("**Created:** {}", metadata.created_at_utc));
    out.push(format!("**Last Updated:** {}\n", metadata.last_updated_utc));
    fn walk(nodes: &[Account], depth: usize, out: &mut Vec<String>) {
        for node in nodes {
            out.push(format!(
                "{}- **{}**: {}",
                "  ".repeat(depth),
                node.code,
                node.name
            ));
            walk(&node.children, depth + 1, out);
        }
    }
    walk(accounts, 0, &mut out);
    out.join("\n")
}

pub fn export_csv(accounts: &[Account]) -> String {
    let mut rows = vec!["code,name,depth,active".to_string()];
    fn walk(nodes: &[Account], depth: usize, rows: &mut Vec<String>) {
        for node in nodes {
            rows.push(format!(
                "{},{},{},{}",
                node.code, node.name, depth, node.active
            ));
            walk(&node.children, depth + 1, rows);
        }
    }
    walk(accounts, 0, &mut rows);
    rows.join("\n")
}

// --- Minimal unified diff over lines (for the COA audit log) ---

fn unified_diff(old: &str, new: &str) -> String {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    // LCS table; COA documents are small enough for the quadratic table.
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }
    let mut out = vec![
        "--- coa.json".to_string(),
        "+++ coa.json".to_string(),
        format!("@@ -1,{} +1,{} @@", a.len(), b.len()),
    ];
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(format!("-{}", a[i]));
            i += 1;
        } else {
            out.push(format!("+{}", b[j]));
            j += 1;
        }
    }
    while i < a.len() {
        out.push(format!("-{}", a[i]));
        i += 1;
    }
    while j < b.len() {
        out.push(format!("+{}", b[j]));
        j += 1;
    }
    out.join("\n")
}
