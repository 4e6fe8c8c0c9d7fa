//! Bot identity: the 4-tuple that scopes every piece of persistent state.
//!
//! An [`Identity4`] is `(entity_code, jurisdiction_code, broker_code, bot_id)`,
//! rendered as `ENTITY_JURISDICTION_BROKER_BOTID`. Ledger databases, mapping
//! tables, logs, locks, and audit records are all namespaced under it.

use crate::core::error::TbotError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Four tokens of uppercase alphanumerics joined by `_`.
pub const IDENTITY_PATTERN: &str = r"^[A-Z]{2,6}_[A-Z]{2,4}_[A-Z]{2,10}_[A-Z0-9]{2,6}$";

fn identity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(IDENTITY_PATTERN).expect("identity pattern compiles"))
}

/// Immutable identity tuple scoping all persistent paths and records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity4 {
    pub entity_code: String,
    pub jurisdiction_code: String,
    pub broker_code: String,
    pub bot_id: String,
}

impl Identity4 {
    pub fn new(
        entity_code: &str,
        jurisdiction_code: &str,
        broker_code: &str,
        bot_id: &str,
    ) -> Result<Self, TbotError> {
        let id = Identity4 {
            entity_code: entity_code.to_string(),
            jurisdiction_code: jurisdiction_code.to_string(),
            broker_code: broker_code.to_string(),
            bot_id: bot_id.to_string(),
        };
        id.validate()?;
        Ok(id)
    }

    /// Parse `ENTITY_JURISDICTION_BROKER_BOTID` into an [`Identity4`].
    pub fn parse(s: &str) -> Result<Self, TbotError> {
        let trimmed = s.trim();
        if !identity_regex().is_match(trimmed) {
            return Err(TbotError::Config(format!(
                "invalid bot identity '{}'; expected 'ENTITY_JURISDICTION_BROKER_BOTID' matching {}",
                trimmed, IDENTITY_PATTERN
            )));
        }
        let parts: Vec<&str> = trimmed.split('_').collect();
        Ok(Identity4 {
            entity_code: parts[0].to_string(),
            jurisdiction_code: parts[1].to_string(),
            broker_code: parts[2].to_string(),
            bot_id: parts[3].to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), TbotError> {
        let joined = self.to_string();
        if !identity_regex().is_match(&joined) {
            return Err(TbotError::Config(format!(
                "invalid bot identity '{}'",
                joined
            )));
        }
        Ok(())
    }

    /// Identity from the `TBOT_IDENTITY` environment variable.
    pub fn from_env() -> Result<Self, TbotError> {
        let raw = std::env::var("TBOT_IDENTITY").map_err(|_| {
            TbotError::Config(
                "TBOT_IDENTITY not set; expected 'ENTITY_JURISDICTION_BROKER_BOTID'".to_string(),
            )
        })?;
        Identity4::parse(&raw)
    }
}

impl fmt::Display for Identity4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.entity_code, self.jurisdiction_code, self.broker_code, self.bot_id
        )
    }
}
