//! Installed development platforms.
//!
//! A platform bundles the build engine, its build script, and tool metadata
//! for one device family. Platforms live under `<core>/platforms/<id>/` and
//! are described by a `platform.toml` manifest.
//!
//! Engine resolution order:
//! 1. Platform-relative path (when the manifest entry contains a separator)
//! 2. System PATH (`which <engine>`)

pub mod installer;
pub mod resolver;

pub use installer::PlatformInstaller;
pub use resolver::PlatformResolver;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::FwError;
use crate::process::{ensure_exists, Cmd};

/// Manifest file name inside an installed platform directory.
pub const PLATFORM_MANIFEST_NAME: &str = "platform.toml";

/// Environment variable overriding the per-user core directory.
pub const CORE_DIR_ENV: &str = "FWBUILD_CORE_DIR";

/// Environment variable overriding the package registry directory.
pub const REGISTRY_DIR_ENV: &str = "FWBUILD_REGISTRY_DIR";

/// Debug settings a platform ships in its manifest. Absence of the whole
/// table marks a legacy platform that predates debugger integration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugManifest {
    pub tool: Option<String>,
    pub port: Option<String>,
    pub load_cmds: Option<Vec<String>>,
    pub init_cmds: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Build engine entry point: platform-relative path or PATH name.
    pub engine: String,
    /// Engine build script, relative to the platform directory.
    pub build_script: Option<String>,
    #[serde(default)]
    pub default_packages: Vec<String>,
    pub default_upload_protocol: Option<String>,
    /// Capability map: capability name -> host tool.
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
    pub debug: Option<DebugManifest>,
}

/// An installed platform: its directory plus the parsed manifest.
#[derive(Debug, Clone)]
pub struct Platform {
    pub dir: PathBuf,
    pub manifest: PlatformManifest,
}

impl Platform {
    /// Load the platform installed at `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(PLATFORM_MANIFEST_NAME);
        let raw = fs::read_to_string(&manifest_path)
            .with_context(|| format!("reading platform manifest '{}'", manifest_path.display()))?;
        let manifest: PlatformManifest = toml::from_str(&raw)
            .with_context(|| format!("parsing platform manifest '{}'", manifest_path.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    /// Look up an installed platform by id.
    ///
    /// A missing directory or manifest is reported as
    /// [`FwError::UnknownPlatform`] so callers can install and retry; a
    /// manifest that exists but fails to parse is a plain error.
    pub fn find(platforms_dir: &Path, id: &str) -> Result<Self> {
        let dir = platforms_dir.join(id);
        if !dir.join(PLATFORM_MANIFEST_NAME).is_file() {
            return Err(FwError::UnknownPlatform { id: id.to_string() }.into());
        }
        Self::load(&dir)
    }

    pub fn id(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(PLATFORM_MANIFEST_NAME)
    }

    /// Absolute path of the engine build script, when the manifest names one.
    pub fn build_script_path(&self) -> Option<PathBuf> {
        self.manifest
            .build_script
            .as_ref()
            .map(|rel| self.dir.join(rel))
    }

    /// Resolve the engine executable (see module docs for the order).
    pub fn engine_command(&self) -> Result<PathBuf> {
        let entry = &self.manifest.engine;
        if entry.contains(std::path::MAIN_SEPARATOR) || entry.contains('/') {
            let path = self.dir.join(entry);
            ensure_exists(&path, "Platform engine")?;
            return Ok(path);
        }
        match which::which(entry) {
            Ok(path) => Ok(path),
            Err(_) => {
                // Last resort: a bare name shipped inside the platform dir.
                let local = self.dir.join(entry);
                if local.is_file() {
                    return Ok(local);
                }
                bail!(
                    "engine '{}' for platform '{}' not found on PATH",
                    entry,
                    self.id()
                );
            }
        }
    }

    /// Capability map from the manifest `[tools]` table.
    pub fn capabilities(&self) -> &BTreeMap<String, String> {
        &self.manifest.tools
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.manifest.tools.contains_key(name)
    }

    fn engine_cmd(
        &self,
        variables: &BTreeMap<String, String>,
        targets: &[String],
        verbose: bool,
        silent: bool,
        jobs: usize,
    ) -> Result<Cmd> {
        let engine = self.engine_command()?;
        let mut cmd = Cmd::new(engine.display().to_string())
            .arg("--jobs")
            .arg(jobs.to_string());
        if silent {
            cmd = cmd.arg("--silent");
        }
        if verbose {
            cmd = cmd.arg("--verbose");
        }
        for (key, value) in variables {
            cmd = cmd.arg(format!("{}={}", key, value));
        }
        for target in targets {
            cmd = cmd.arg(target);
        }
        Ok(cmd)
    }

    /// Run the engine with inherited stdio. Returns whether it succeeded;
    /// a failing build is an outcome, not an error.
    pub fn run(
        &self,
        variables: &BTreeMap<String, String>,
        targets: &[String],
        verbose: bool,
        silent: bool,
        jobs: usize,
    ) -> Result<bool> {
        let code = self
            .engine_cmd(variables, targets, verbose, silent, jobs)?
            .allow_fail()
            .run_interactive()?;
        Ok(code == 0)
    }

    /// Run the engine with output pumped through `on_line` (used when the
    /// caller must re-frame build output for a machine-interface consumer).
    pub fn run_streamed(
        &self,
        variables: &BTreeMap<String, String>,
        targets: &[String],
        verbose: bool,
        jobs: usize,
        on_line: impl FnMut(&str),
    ) -> Result<bool> {
        let code = self
            .engine_cmd(variables, targets, verbose, false, jobs)?
            .allow_fail()
            .run_streamed(on_line)?;
        Ok(code == 0)
    }
}

/// Per-user core directory (`~/.fwbuild` unless overridden).
pub fn core_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CORE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = dirs::home_dir().context("could not determine the home directory")?;
    Ok(home.join(".fwbuild"))
}

/// Directory holding installed platforms.
pub fn platforms_dir() -> Result<PathBuf> {
    Ok(core_dir()?.join("platforms"))
}

/// Directory the installer fetches platform archives from.
pub fn registry_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(REGISTRY_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    Ok(core_dir()?.join("registry"))
}

/// All platforms installed under `platforms_dir`, sorted by id.
pub fn list_installed(platforms_dir: &Path) -> Result<Vec<Platform>> {
    let mut out = Vec::new();
    if !platforms_dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(platforms_dir)
        .with_context(|| format!("reading platforms dir '{}'", platforms_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dir = entry.path();
        if dir.join(PLATFORM_MANIFEST_NAME).is_file() {
            out.push(Platform::load(&dir)?);
        }
    }
    out.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    Ok(out)
}
