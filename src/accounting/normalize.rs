//! Broker record normalization. Pure functions, zero I/O.
//!
//! Three raw families (trades, cash activities, position snapshots) become
//! one tagged sum type with an OFX-aligned core: a `TRNTYPE` from a fixed
//! table, a millisecond-precision UTC `DTPOSTED`, a stable SHA-1 `FITID`,
//! and a deterministic UUIDv5 `group_id`. Re-normalizing the same input
//! always yields the same FITID.

use crate::core::identity::Identity4;
use crate::core::time::{iso_millis_z, parse_to_utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Map, Value as JsonValue, json};
use sha1::{Digest, Sha1};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------
// Decimal / quantization
// ---------------------------

pub const MONEY_DP: u32 = 2;
pub const PRICE_DP: u32 = 6;
pub const QTY_DP: u32 = 8;

/// Best-effort Decimal conversion; invalid input becomes zero.
pub fn to_decimal(value: &JsonValue) -> Decimal {
    match value {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string()).unwrap_or_default(),
        JsonValue::String(s) => Decimal::from_str(s.trim()).unwrap_or_default(),
        _ => Decimal::ZERO,
    }
}

fn quantize(d: Decimal, dp: u32) -> Decimal {
    d.round_dp_with_strategy(dp, RoundingStrategy::MidpointNearestEven)
}

pub fn sanitize_money(value: &JsonValue) -> Decimal {
    quantize(to_decimal(value), MONEY_DP)
}

pub fn sanitize_price(value: &JsonValue) -> Decimal {
    quantize(to_decimal(value), PRICE_DP)
}

pub fn sanitize_qty(value: &JsonValue) -> Decimal {
    quantize(to_decimal(value), QTY_DP)
}

pub fn quantize_money(d: Decimal) -> Decimal {
    quantize(d, MONEY_DP)
}

// ---------------------------
// OFX TRNTYPE maps
// ---------------------------

pub fn trntype_for_trade(action: Option<&str>) -> &'static str {
    match action.unwrap_or("").to_lowercase().as_str() {
        "buy" | "long" => "BUY",
        "sell" | "short" => "SELL",
        "assignment" | "exercise" => "TRANSFER",
        _ => "OTHER",
    }
}

pub fn trntype_for_cash(activity_type: Option<&str>) -> &'static str {
    match activity_type.unwrap_or("").to_uppercase().as_str() {
        "DIV" => "DIV",
        "INT" => "INT",
        "FEE" => "FEE",
        "TRANS" | "JOURNAL" => "XFER",
        "WITHDRAWAL" => "WITHDRAWAL",
        "DEPOSIT" => "DEPOSIT",
        _ => "OTHER",
    }
}

// ---------------------------
// Deterministic IDs
// ---------------------------

/// Fixed namespace for deterministic UUIDv5 group ids.
const GROUP_NS: Uuid = Uuid::from_bytes([
    0x76, 0xb5, 0xc9, 0xf8, 0xbf, 0x65, 0x4b, 0x6a, 0x9d, 0x93, 0x2f, 0x7b, 0x0b, 0x5d, 0x7a,
    0x44,
]);

/// Deterministic SHA-1 hex over `|`-joined parts (None renders empty).
pub fn fitid_hash(parts: &[Option<&str>]) -> String {
    let buf = parts
        .iter()
        .map(|p| p.unwrap_or(""))
        .collect::<Vec<_>>()
        .join("|");
    let digest = Sha1::digest(buf.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Deterministic UUIDv5 over `|`-joined parts using the fixed namespace.
pub fn uuid5_deterministic(parts: &[&str]) -> String {
    Uuid::new_v5(&GROUP_NS, parts.join("|").as_bytes()).to_string()
}

// ---------------------------
// Raw-record access
// ---------------------------

/// First non-empty value among `keys`.
fn get<'v>(raw: &'v JsonValue, keys: &[&str]) -> Option<&'v JsonValue> {
    for k in keys {
        match raw.get(k) {
            Some(JsonValue::Null) => continue,
            Some(JsonValue::String(s)) if s.is_empty() => continue,
            Some(v) => return Some(v),
            None => continue,
        }
    }
    None
}

fn get_str(raw: &JsonValue, keys: &[&str]) -> Option<String> {
    get(raw, keys).and_then(|v| match v {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn utc_iso_of(raw: &JsonValue, keys: &[&str]) -> Option<String> {
    get_str(raw, keys)
        .and_then(|s| parse_to_utc(&s))
        .map(iso_millis_z)
}

// ---------------------------
// Canonical records
// ---------------------------

/// OFX-aligned core shared by all three families.
#[derive(Debug, Clone, PartialEq)]
pub struct OfxCore {
    pub trntype: String,
    pub dtposted: Option<String>,
    pub fitid: String,
    pub group_id: String,
    pub stable_id: String,
}

#[derive(Debug, Clone)]
pub struct NormalizedTrade {
    pub ofx: OfxCore,
    pub trade_id: Option<String>,
    pub symbol: Option<String>,
    pub action: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub total_value: Decimal,
    pub fee: Decimal,
    pub commission: Decimal,
    pub status: Option<String>,
    pub description: Option<String>,
    pub identity: Identity4,
    pub raw_broker: JsonValue,
}

#[derive(Debug, Clone)]
pub struct NormalizedCash {
    pub ofx: OfxCore,
    pub activity_id: Option<String>,
    pub symbol: Option<String>,
    pub activity_type: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub commission: Decimal,
    pub status: Option<String>,
    pub description: Option<String>,
    pub identity: Identity4,
    pub raw_broker: JsonValue,
}

#[derive(Debug, Clone)]
pub struct NormalizedPosition {
    pub ofx: OfxCore,
    pub symbol: Option<String>,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub identity: Identity4,
    pub raw_broker: JsonValue,
}

/// Tagged union over the three normalized families.
#[derive(Debug, Clone)]
pub enum NormalizedRecord {
    Trade(NormalizedTrade),
    Cash(NormalizedCash),
    Position(NormalizedPosition),
}

impl NormalizedRecord {
    /// Flatten to the ledger-entry map the posting pipeline consumes.
    /// `map<string, JSONValue>` exists only at this boundary.
    pub fn to_entry_map(&self) -> Map<String, JsonValue> {
        let mut m = Map::new();
        match self {
            NormalizedRecord::Trade(t) => {
                m.insert("TRNTYPE".into(), json!(t.ofx.trntype));
                m.insert("type".into(), json!(t.ofx.trntype));
                m.insert("DTPOSTED".into(), json!(t.ofx.dtposted));
                m.insert("datetime_utc".into(), json!(t.ofx.dtposted));
                m.insert("fitid".into(), json!(t.ofx.fitid));
                m.insert("group_id".into(), json!(t.ofx.group_id));
                m.insert(
                    "trade_id".into(),
                    json!(t.trade_id.clone().unwrap_or_else(|| t.ofx.fitid.clone())),
                );
                m.insert("symbol".into(), json!(t.symbol));
                m.insert("action".into(), json!(t.action));
                m.insert("quantity".into(), json!(t.quantity.to_f64()));
                m.insert("price".into(), json!(t.price.to_f64()));
                m.insert("total_value".into(), json!(t.total_value.to_f64()));
                m.insert("fee".into(), json!(t.fee.to_f64()));
                m.insert("commission".into(), json!(t.commission.to_f64()));
                m.insert("status".into(), json!(t.status));
                m.insert("description".into(), json!(t.description));
                m.insert("broker".into(), json!(t.identity.broker_code));
                self.insert_identity(&mut m, &t.identity);
                m.insert(
                    "json_metadata".into(),
                    json!({"raw_broker": t.raw_broker, "stable_id": t.ofx.stable_id}),
                );
                m.insert("raw_broker_json".into(), t.raw_broker.clone());
            }
            NormalizedRecord::Cash(c) => {
                m.insert("TRNTYPE".into(), json!(c.ofx.trntype));
                m.insert("type".into(), json!(c.ofx.trntype));
                m.insert("DTPOSTED".into(), json!(c.ofx.dtposted));
                m.insert("datetime_utc".into(), json!(c.ofx.dtposted));
                m.insert("fitid".into(), json!(c.ofx.fitid));
                m.insert("group_id".into(), json!(c.ofx.group_id));
                m.insert(
                    "trade_id".into(),
                    json!(c.activity_id.clone().unwrap_or_else(|| c.ofx.fitid.clone())),
                );
                m.insert("symbol".into(), json!(c.symbol));
                m.insert("activity_type".into(), json!(c.activity_type));
                m.insert("quantity".into(), json!(c.quantity.to_f64()));
                m.insert("price".into(), json!(c.price.to_f64()));
                m.insert("total_value".into(), json!(c.amount.to_f64()));
                m.insert("amount".into(), json!(c.amount.to_f64()));
                m.insert("fee".into(), json!(c.fee.to_f64()));
                m.insert("commission".into(), json!(c.commission.to_f64()));
                m.insert("status".into(), json!(c.status));
                m.insert("description".into(), json!(c.description));
                m.insert("broker".into(), json!(c.identity.broker_code));
                self.insert_identity(&mut m, &c.identity);
                m.insert(
                    "json_metadata".into(),
                    json!({"raw_broker": c.raw_broker, "stable_id": c.ofx.stable_id}),
                );
                m.insert("raw_broker_json".into(), c.raw_broker.clone());
            }
            NormalizedRecord::Position(p) => {
                m.insert("TRNTYPE".into(), json!("POS"));
                m.insert("type".into(), json!("POS"));
                m.insert("DTPOSTED".into(), json!(p.ofx.dtposted));
                m.insert("datetime_utc".into(), json!(p.ofx.dtposted));
                m.insert("fitid".into(), json!(p.ofx.fitid));
                m.insert("group_id".into(), json!(p.ofx.group_id));
                m.insert("trade_id".into(), json!(p.ofx.fitid));
                m.insert("symbol".into(), json!(p.symbol));
                m.insert("quantity".into(), json!(p.qty.to_f64()));
                m.insert("price".into(), json!(p.avg_entry_price.to_f64()));
                m.insert("total_value".into(), json!(p.cost_basis.to_f64()));
                m.insert("broker".into(), json!(p.identity.broker_code));
                self.insert_identity(&mut m, &p.identity);
                m.insert(
                    "json_metadata".into(),
                    json!({"raw_broker": p.raw_broker, "stable_id": p.ofx.stable_id}),
                );
                m.insert("raw_broker_json".into(), p.raw_broker.clone());
            }
        }
        m
    }

    fn insert_identity(&self, m: &mut Map<String, JsonValue>, id: &Identity4) {
        m.insert("entity_code".into(), json!(id.entity_code));
        m.insert("jurisdiction_code".into(), json!(id.jurisdiction_code));
        m.insert("broker_code".into(), json!(id.broker_code));
        m.insert("bot_id".into(), json!(id.bot_id));
    }
}

// ---------------------------
// Family normalizers
// ---------------------------

pub fn normalize_trade(raw: &JsonValue, identity: &Identity4) -> NormalizedTrade {
    let symbol = get_str(raw, &["symbol", "underlying"]);
    let action = get_str(raw, &["action", "side"]).map(|s| s.to_lowercase());
    let quantity = sanitize_qty(get(raw, &["quantity", "qty", "filled_qty"]).unwrap_or(&json!(0)));
    let price = sanitize_price(
        get(raw, &["price", "filled_avg_price", "fill_price"]).unwrap_or(&json!(0)),
    );
    let fee = sanitize_money(get(raw, &["fee"]).unwrap_or(&json!(0)));
    let commission = sanitize_money(get(raw, &["commission"]).unwrap_or(&json!(0)));
    let dtposted = utc_iso_of(
        raw,
        &[
            "DTPOSTED",
            "datetime_utc",
            "filled_at",
            "transaction_time",
            "submitted_at",
        ],
    );
    let total_value = quantize_money(quantity * price);

    let trade_id = get_str(raw, &["trade_id", "order_id", "id"]);
    let stable = get_str(raw, &["stable_id"]).unwrap_or_else(|| {
        fitid_hash(&[
            Some(&identity.broker_code),
            Some("TRD"),
            trade_id.as_deref(),
            symbol.as_deref(),
            dtposted.as_deref(),
            Some(&quantity.to_string()),
            Some(&price.to_string()),
        ])
    });
    let fitid = fitid_hash(&[Some("TRD"), Some(&stable)]);
    let group_seed = get_str(raw, &["order_id"]).unwrap_or_else(|| stable.clone());
    let group_id = uuid5_deterministic(&["TRD", &group_seed]);

    NormalizedTrade {
        ofx: OfxCore {
            trntype: trntype_for_trade(action.as_deref()).to_string(),
            dtposted,
            fitid,
            group_id,
            stable_id: stable,
        },
        trade_id,
        symbol,
        action,
        quantity,
        price,
        total_value,
        fee,
        commission,
        status: get_str(raw, &["status", "order_status"]),
        description: get_str(raw, &["description"]),
        identity: identity.clone(),
        raw_broker: raw.clone(),
    }
}

pub fn normalize_cash(raw: &JsonValue, identity: &Identity4) -> NormalizedCash {
    let symbol = get_str(raw, &["symbol"]);
    let activity_type = get_str(raw, &["activity_type", "action", "type"]);
    let quantity = sanitize_qty(get(raw, &["quantity", "qty"]).unwrap_or(&json!(0)));
    let price = sanitize_price(get(raw, &["price"]).unwrap_or(&json!(0)));
    let fee = sanitize_money(get(raw, &["fee"]).unwrap_or(&json!(0)));
    let commission = sanitize_money(get(raw, &["commission"]).unwrap_or(&json!(0)));
    let amount = match get(raw, &["amount"]) {
        Some(v) => sanitize_money(v),
        None => quantize_money(quantity * price),
    };
    let dtposted = utc_iso_of(
        raw,
        &["DTPOSTED", "datetime_utc", "transaction_time", "date", "post_date"],
    );

    let activity_id = get_str(raw, &["activity_id", "id"]);
    let stable = get_str(raw, &["stable_id"]).unwrap_or_else(|| {
        fitid_hash(&[
            Some(&identity.broker_code),
            Some("ACT"),
            activity_type.as_deref(),
            activity_id.as_deref(),
            dtposted.as_deref(),
            Some(&amount.to_string()),
        ])
    });
    let fitid = fitid_hash(&[Some("ACT"), Some(&stable)]);
    let group_seed = activity_type.clone().unwrap_or_else(|| "UNKNOWN".to_string());
    let group_tail = activity_id.clone().unwrap_or_else(|| stable.clone());
    let group_id = uuid5_deterministic(&["ACT", &group_seed, &group_tail]);

    NormalizedCash {
        ofx: OfxCore {
            trntype: trntype_for_cash(activity_type.as_deref()).to_string(),
            dtposted,
            fitid,
            group_id,
            stable_id: stable,
        },
        activity_id,
        symbol,
        activity_type,
        quantity,
        price,
        amount,
        fee,
        commission,
        status: get_str(raw, &["status"]),
        description: get_str(raw, &["description"]),
        identity: identity.clone(),
        raw_broker: raw.clone(),
    }
}

pub fn normalize_position(raw: &JsonValue, identity: &Identity4) -> NormalizedPosition {
    let symbol = get_str(raw, &["symbol"]);
    let qty = sanitize_qty(get(raw, &["qty", "quantity"]).unwrap_or(&json!(0)));
    let avg = sanitize_price(get(raw, &["avg_entry_price", "avg_price"]).unwrap_or(&json!(0)));
    let market_value = match get(raw, &["market_value"]) {
        Some(v) => sanitize_money(v),
        None => quantize_money(qty * avg),
    };
    let cost_basis = match get(raw, &["cost_basis", "basis"]) {
        Some(v) => sanitize_money(v),
        None => quantize_money(qty * avg),
    };
    let dtposted = utc_iso_of(raw, &["DTPOSTED", "datetime_utc", "updated_at", "timestamp"]);

    let position_id =
        get_str(raw, &["position_id", "asset_id"]).or_else(|| symbol.clone());
    let stable = get_str(raw, &["stable_id"]).unwrap_or_else(|| {
        fitid_hash(&[
            Some(&identity.broker_code),
            Some("POS"),
            position_id.as_deref(),
            symbol.as_deref(),
            Some(&qty.to_string()),
            Some(&avg.to_string()),
        ])
    });
    let fitid = fitid_hash(&[Some("POS"), Some(&stable)]);
    let group_id =
        uuid5_deterministic(&["POS", symbol.as_deref().unwrap_or("UNKNOWN")]);

    NormalizedPosition {
        ofx: OfxCore {
            trntype: "POS".to_string(),
            dtposted,
            fitid,
            group_id,
            stable_id: stable,
        },
        symbol,
        qty,
        avg_entry_price: avg,
        market_value,
        cost_basis,
        identity: identity.clone(),
        raw_broker: raw.clone(),
    }
}
