//! Execution context passed explicitly through call sites.
//!
//! There are no process-wide singletons: the supervisor, dispatcher, phase
//! workers, and CLI commands all construct a [`Context`] up front and hand it
//! down. Child processes receive the same context through `TBOT_ROOT` and
//! `TBOT_IDENTITY` environment variables that address on-disk state only.

use crate::core::error::TbotError;
use crate::core::identity::Identity4;
use std::path::{Path, PathBuf};

/// Identity plus runtime root directory; everything else derives from these.
#[derive(Debug, Clone)]
pub struct Context {
    pub identity: Identity4,
    /// Absolute path to the runtime root (holds `output/`, `control/`).
    pub root: PathBuf,
}

impl Context {
    pub fn new(identity: Identity4, root: &Path) -> Self {
        Context {
            identity,
            root: root.to_path_buf(),
        }
    }

    /// Build a context from `TBOT_IDENTITY` and `TBOT_ROOT` (default: CWD).
    pub fn from_env() -> Result<Self, TbotError> {
        let identity = Identity4::from_env()?;
        let root = match std::env::var("TBOT_ROOT") {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
            _ => std::env::current_dir()?,
        };
        Ok(Context { identity, root })
    }

    /// Environment pairs that let a spawned child rebuild this context.
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("TBOT_IDENTITY", self.identity.to_string()),
            ("TBOT_ROOT", self.root.to_string_lossy().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_env_roundtrips_identity() {
        let id = Identity4::parse("RIGD_USA_ALPACA_TB01").unwrap();
        let ctx = Context::new(id.clone(), Path::new("/tmp/bot"));
        let env = ctx.child_env();
        assert!(env.contains(&("TBOT_IDENTITY", "RIGD_USA_ALPACA_TB01".to_string())));
        assert!(env.contains(&("TBOT_ROOT", "/tmp/bot".to_string())));
    }
}
