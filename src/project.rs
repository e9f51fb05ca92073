//! Project configuration (`firmware.toml`).
//!
//! A project declares one or more build environments plus optional
//! project-wide settings. The TOML shape:
//!
//! ```toml
//! [project]
//! default_envs = ["uno"]
//!
//! [env.uno]
//! platform = "atmelavr"
//! board = "uno"
//! ```
//!
//! Unknown keys are rejected so typos surface as config errors instead of
//! silently ignored options.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::FwError;

/// File name that marks a directory as a firmware project.
pub const PROJECT_CONFIG_NAME: &str = "firmware.toml";

/// Build flavor of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildType {
    #[default]
    Release,
    Debug,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectToml {
    project: Option<ProjectSectionToml>,
    env: BTreeMap<String, EnvSectionToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectSectionToml {
    default_envs: Option<Vec<String>>,
    workspace_dir: Option<String>,
    build_dir: Option<String>,
    cache_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvSectionToml {
    platform: Option<String>,
    board: Option<String>,
    build_type: Option<String>,
    targets: Option<Vec<String>>,
    upload_port: Option<String>,
    upload_protocol: Option<String>,
    extra_scripts: Option<Vec<String>>,
    build_vars: Option<BTreeMap<String, String>>,
    debug_tool: Option<String>,
    debug_port: Option<String>,
    debug_load_mode: Option<String>,
    debug_load_cmds: Option<Vec<String>>,
    debug_init_break: Option<String>,
}

/// One `[env.NAME]` section, normalized.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub name: String,
    pub platform: Option<String>,
    pub board: Option<String>,
    pub build_type: BuildType,
    pub targets: Vec<String>,
    pub upload_port: Option<String>,
    pub upload_protocol: Option<String>,
    pub extra_scripts: Vec<String>,
    pub build_vars: BTreeMap<String, String>,
    pub debug_tool: Option<String>,
    pub debug_port: Option<String>,
    pub debug_load_mode: Option<String>,
    pub debug_load_cmds: Option<Vec<String>>,
    pub debug_init_break: Option<String>,
}

/// Project-wide settings from `[project]`.
#[derive(Debug, Clone, Default)]
pub struct ProjectSettings {
    pub default_envs: Vec<String>,
    pub workspace_dir: Option<String>,
    pub build_dir: Option<String>,
    pub cache_dir: Option<String>,
}

/// Loaded and validated project configuration.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// Absolute path of the config file.
    pub path: PathBuf,
    /// Directory containing the config file.
    pub project_dir: PathBuf,
    pub settings: ProjectSettings,
    /// Environments keyed by name (sorted, so iteration is deterministic).
    pub envs: BTreeMap<String, EnvConfig>,
}

impl ProjectConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(config_path)
            .with_context(|| format!("reading project config '{}'", config_path.display()))?;
        let parsed: ProjectToml = toml::from_str(&raw)
            .with_context(|| format!("parsing project config '{}'", config_path.display()))?;

        if parsed.env.is_empty() {
            bail!(
                "invalid project config '{}': at least one [env.NAME] section is required",
                config_path.display()
            );
        }

        let mut envs = BTreeMap::new();
        for (name, section) in parsed.env {
            let name = name.trim().to_string();
            if name.is_empty() {
                bail!(
                    "invalid project config '{}': empty environment name",
                    config_path.display()
                );
            }
            let build_type = parse_build_type(section.build_type.as_deref(), &name, config_path)?;
            envs.insert(
                name.clone(),
                EnvConfig {
                    name,
                    platform: none_if_blank(section.platform),
                    board: none_if_blank(section.board),
                    build_type,
                    targets: section.targets.unwrap_or_default(),
                    upload_port: none_if_blank(section.upload_port),
                    upload_protocol: none_if_blank(section.upload_protocol),
                    extra_scripts: section.extra_scripts.unwrap_or_default(),
                    build_vars: section.build_vars.unwrap_or_default(),
                    debug_tool: none_if_blank(section.debug_tool),
                    debug_port: none_if_blank(section.debug_port),
                    debug_load_mode: none_if_blank(section.debug_load_mode),
                    debug_load_cmds: section.debug_load_cmds,
                    debug_init_break: none_if_blank(section.debug_init_break),
                },
            );
        }

        let project = parsed.project.unwrap_or_default();
        let default_envs = project.default_envs.unwrap_or_default();
        for name in &default_envs {
            if !envs.contains_key(name) {
                bail!(
                    "invalid project config '{}': default_envs names undeclared environment '{}'",
                    config_path.display(),
                    name
                );
            }
        }

        let path = config_path
            .canonicalize()
            .unwrap_or_else(|_| config_path.to_path_buf());
        let project_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            path,
            project_dir,
            settings: ProjectSettings {
                default_envs,
                workspace_dir: none_if_blank(project.workspace_dir),
                build_dir: none_if_blank(project.build_dir),
                cache_dir: none_if_blank(project.cache_dir),
            },
            envs,
        })
    }

    pub fn env(&self, name: &str) -> Result<&EnvConfig> {
        self.envs.get(name).ok_or_else(|| {
            FwError::UnknownEnvironments {
                names: vec![name.to_string()],
            }
            .into()
        })
    }

    /// Environments to process for this invocation: the explicit request if
    /// any, else `default_envs`, else every declared environment.
    pub fn select_envs(&self, requested: &[String]) -> Result<Vec<String>> {
        if !requested.is_empty() {
            let unknown: Vec<String> = requested
                .iter()
                .filter(|name| !self.envs.contains_key(name.as_str()))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(FwError::UnknownEnvironments { names: unknown }.into());
            }
            return Ok(requested.to_vec());
        }
        if !self.settings.default_envs.is_empty() {
            return Ok(self.settings.default_envs.clone());
        }
        Ok(self.envs.keys().cloned().collect())
    }

    /// Environment a bare `debug` invocation targets: the first default env
    /// built for debugging, else any env built for debugging, else the first
    /// default env, else the first declared env.
    pub fn default_debug_env(&self) -> &str {
        for name in &self.settings.default_envs {
            if let Some(env) = self.envs.get(name) {
                if env.build_type == BuildType::Debug {
                    return &env.name;
                }
            }
        }
        for env in self.envs.values() {
            if env.build_type == BuildType::Debug {
                return &env.name;
            }
        }
        if let Some(name) = self.settings.default_envs.first() {
            return name;
        }
        // envs is never empty after load().
        self.envs
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// True when `dir` contains a project config file.
pub fn is_project_dir(dir: &Path) -> bool {
    dir.join(PROJECT_CONFIG_NAME).is_file()
}

/// Resolve the project directory, falling back through well-known environment
/// variables when the initial candidate is not a project. Terminal launchers
/// and IDE shells often start the tool outside the project tree but leave one
/// of these variables pointing at it.
pub fn discover_project_dir(initial: &Path) -> PathBuf {
    discover_project_dir_with(initial, |key| std::env::var(key).ok())
}

fn discover_project_dir_with(
    initial: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> PathBuf {
    let mut dir = initial.to_path_buf();
    for key in ["CWD", "PWD", "FWBUILD_PROJECT_DIR"] {
        if is_project_dir(&dir) {
            break;
        }
        if let Some(value) = lookup(key) {
            if !value.trim().is_empty() {
                dir = PathBuf::from(value);
            }
        }
    }
    dir
}

fn parse_build_type(value: Option<&str>, env: &str, config_path: &Path) -> Result<BuildType> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("release") => Ok(BuildType::Release),
        Some("debug") => Ok(BuildType::Debug),
        Some(other) => bail!(
            "invalid project config '{}': unsupported build_type '{}' for env '{}' (expected 'release' or 'debug')",
            config_path.display(),
            other,
            env
        ),
    }
}

fn none_if_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
