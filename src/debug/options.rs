//! Debug session settings and capability negotiation.
//!
//! Settings resolve in three layers: built-in defaults, then whatever the
//! platform manifest's `[debug]` table offers, then the environment's own
//! `debug_*` keys. The environment always wins. Platforms without a `[debug]`
//! table are legacy; for those the load commands may instead be derived from
//! the flash images the engine reported.

use anyhow::{bail, Result};

use crate::debug::decision::{self, LoadMode};
use crate::metadata::BuildMetadata;
use crate::platform::Platform;
use crate::project::EnvConfig;

/// Load commands assumed when nobody says otherwise.
pub const DEFAULT_LOAD_CMDS: &[&str] = &["load"];

/// Initial breakpoint assumed when nobody says otherwise.
pub const DEFAULT_INIT_BREAK: &str = "tbreak main";

/// Init script template used when the platform offers none. `$DEBUG_PORT`,
/// `$LOAD_CMDS` and `$INIT_BREAK` are substituted at render time.
pub const DEFAULT_INIT_CMDS: &[&str] = &[
    "target extended-remote $DEBUG_PORT",
    "$LOAD_CMDS",
    "$INIT_BREAK",
];

/// Frontend protocol the session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugInterface {
    #[default]
    Gdb,
}

impl DebugInterface {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "gdb" => Ok(DebugInterface::Gdb),
            other => bail!(
                "unsupported debug interface '{}' (only 'gdb' is available)",
                other
            ),
        }
    }
}

/// Fully resolved settings for one debug session.
#[derive(Debug, Clone)]
pub struct DebugOptions {
    pub env_name: String,
    pub tool: Option<String>,
    pub port: Option<String>,
    pub load_mode: LoadMode,
    pub load_cmds: Vec<String>,
    pub init_break: String,
    pub init_cmds: Vec<String>,
}

impl DebugOptions {
    /// Environment settings over built-in defaults, no platform input. This
    /// is both the early-validation pass (a bad `debug_load_mode` fails here,
    /// before any engine runs) and the fallback for legacy platforms.
    pub fn initial(env: &EnvConfig) -> Result<Self> {
        let load_mode = match env.debug_load_mode.as_deref() {
            Some(raw) => LoadMode::parse(raw)?,
            None => LoadMode::default(),
        };
        Ok(DebugOptions {
            env_name: env.name.clone(),
            tool: env.debug_tool.clone(),
            port: env.debug_port.clone(),
            load_mode,
            load_cmds: env
                .debug_load_cmds
                .clone()
                .unwrap_or_else(|| to_strings(DEFAULT_LOAD_CMDS)),
            init_break: env
                .debug_init_break
                .clone()
                .unwrap_or_else(|| DEFAULT_INIT_BREAK.to_string()),
            init_cmds: to_strings(DEFAULT_INIT_CMDS),
        })
    }

    pub fn preload_active(&self) -> bool {
        decision::preload_active(&self.load_cmds)
    }
}

/// Offer the platform the session and let its `[debug]` manifest fill every
/// setting the environment left open. `None` means the platform is legacy
/// and brings no debug settings at all.
pub fn negotiate_debug_options(
    platform: &Platform,
    env: &EnvConfig,
) -> Result<Option<DebugOptions>> {
    let Some(manifest) = platform.manifest.debug.as_ref() else {
        return Ok(None);
    };
    let mut options = DebugOptions::initial(env)?;
    if options.tool.is_none() {
        options.tool = manifest.tool.clone();
    }
    if options.port.is_none() {
        options.port = manifest.port.clone();
    }
    if env.debug_load_cmds.is_none() {
        if let Some(cmds) = manifest.load_cmds.as_ref() {
            options.load_cmds = cmds.clone();
        }
    }
    if let Some(cmds) = manifest.init_cmds.as_ref() {
        options.init_cmds = cmds.clone();
    }
    Ok(Some(options))
}

/// Legacy load commands: when the settings still say plain `load` but the
/// engine reported flash images, restore each image at its offset first.
/// Anything else, including a missing image file, leaves the commands alone.
pub fn derive_legacy_load_cmds(load_cmds: &[String], metadata: &BuildMetadata) -> Vec<String> {
    if load_cmds != to_strings(DEFAULT_LOAD_CMDS).as_slice() || metadata.flash_images.is_empty() {
        return load_cmds.to_vec();
    }
    if !metadata.flash_images.iter().all(|image| image.path.is_file()) {
        return load_cmds.to_vec();
    }
    let mut derived: Vec<String> = metadata
        .flash_images
        .iter()
        .map(|image| format!("restore {} binary {}", image.path.display(), image.offset))
        .collect();
    derived.push("load".to_string());
    derived
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
