//! Host checks before a debug session.
//!
//! Two things are worth knowing before spawning a debugger: whether the
//! debugger binary is actually reachable, and whether device access rules
//! are installed so USB probes work without elevated permissions. The rules
//! check is advisory; callers print it as a warning and continue.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::error::FwError;
use crate::process::ensure_exists;

/// Locations where the device access rules may be installed.
pub const DEVICE_RULES_CANDIDATES: &[&str] = &[
    "/etc/udev/rules.d/99-fwbuild-udev.rules",
    "/lib/udev/rules.d/99-fwbuild-udev.rules",
    "/usr/lib/udev/rules.d/99-fwbuild-udev.rules",
];

/// True when a command can be found on PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Resolve the debugger executable reported by the build metadata.
///
/// Explicit paths must exist; bare names are looked up on PATH.
pub fn resolve_debugger(debugger: &Path) -> Result<PathBuf> {
    if debugger.components().count() > 1 || debugger.is_absolute() {
        ensure_exists(debugger, "Debugger")?;
        return Ok(debugger.to_path_buf());
    }
    match which::which(debugger) {
        Ok(path) => Ok(path),
        Err(_) => bail!("debugger '{}' not found on PATH", debugger.display()),
    }
}

/// Check that device access rules are installed somewhere.
///
/// Only meaningful on Linux; elsewhere the check passes. A missing rules
/// file is reported as [`FwError::DeviceRules`], which callers downgrade to
/// a warning.
pub fn check_device_access_rules() -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Ok(());
    }
    let candidates: Vec<PathBuf> = DEVICE_RULES_CANDIDATES.iter().map(PathBuf::from).collect();
    check_rules_at(&candidates)
}

fn check_rules_at(candidates: &[PathBuf]) -> Result<()> {
    if candidates.iter().any(|p| p.is_file()) {
        return Ok(());
    }
    Err(FwError::DeviceRules(
        "Warning! Device access rules are not installed (`99-fwbuild-udev.rules`). \
         Debug probes may need elevated permissions until they are."
            .to_string(),
    )
    .into())
}
