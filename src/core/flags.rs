//! Presence-based control flags under `control/`.
//!
//! The web UI (or an operator) creates the files; the supervisor/dispatcher
//! reads them at phase boundaries. Existence is the only signal; contents are
//! ignored, and the reader removes the file upon handling.

use crate::core::context::Context;
use crate::core::error::TbotError;
use crate::core::paths;
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    Start,
    Stop,
    Kill,
}

impl ControlFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlFlag::Start => "start",
            ControlFlag::Stop => "stop",
            ControlFlag::Kill => "kill",
        }
    }
}

pub fn flag_present(ctx: &Context, flag: ControlFlag) -> bool {
    paths::control_flag_path(ctx, flag.as_str())
        .map(|p| p.exists())
        .unwrap_or(false)
}

/// Raise a flag (used by tests and the start path; the UI writes these too).
pub fn raise_flag(ctx: &Context, flag: ControlFlag) -> Result<(), TbotError> {
    let p = paths::control_flag_path(ctx, flag.as_str())?;
    fs::write(&p, b"")?;
    Ok(())
}

/// Remove a flag after handling it. Missing file is fine.
pub fn clear_flag(ctx: &Context, flag: ControlFlag) -> Result<(), TbotError> {
    let p = paths::control_flag_path(ctx, flag.as_str())?;
    match fs::remove_file(&p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TbotError::Io(e)),
    }
}

/// Kill takes precedence over stop when both are present.
pub fn pending_flag(ctx: &Context) -> Option<ControlFlag> {
    if flag_present(ctx, ControlFlag::Kill) {
        return Some(ControlFlag::Kill);
    }
    if flag_present(ctx, ControlFlag::Stop) {
        return Some(ControlFlag::Stop);
    }
    None
}

pub fn test_mode_active(ctx: &Context) -> bool {
    paths::test_mode_flag_path(ctx)
        .map(|p| p.exists())
        .unwrap_or(false)
}

pub fn clear_test_mode(ctx: &Context) -> Result<(), TbotError> {
    let p = paths::test_mode_flag_path(ctx)?;
    match fs::remove_file(&p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TbotError::Io(e)),
    }
}
