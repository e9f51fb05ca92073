//! Per-environment directory layout.
//!
//! Every path is derived from the project root and the environment name
//! (plus the optional `[project]` overrides), so repeated invocations always
//! land on the same directories.

use std::path::{Path, PathBuf};

use crate::project::ProjectSettings;

/// Workspace directory created under the project root.
pub const DEFAULT_WORKSPACE_DIR: &str = ".fwbuild";

/// File name of the linked program artifact inside an env build dir.
pub const PROGRAM_NAME: &str = "firmware.elf";

/// Compilation database the engine emits for IDE consumers.
pub const COMPILEDB_NAME: &str = "compile_commands.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLayout {
    pub project_dir: PathBuf,
    pub workspace_dir: PathBuf,
    /// Parent of all per-env build dirs.
    pub build_root: PathBuf,
    pub env_build_dir: PathBuf,
    pub build_src_dir: PathBuf,
    pub build_test_dir: PathBuf,
    pub build_include_dir: PathBuf,
    pub compiledb_path: PathBuf,
    pub program_path: PathBuf,
}

impl EnvLayout {
    pub fn new(project_dir: &Path, settings: &ProjectSettings, env_name: &str) -> Self {
        let workspace_dir = workspace_dir(project_dir, settings);
        let build_root = build_root(project_dir, settings);
        let env_build_dir = build_root.join(env_name);

        Self {
            project_dir: project_dir.to_path_buf(),
            workspace_dir,
            build_src_dir: env_build_dir.join("src"),
            build_test_dir: env_build_dir.join("test"),
            build_include_dir: env_build_dir.join("include"),
            compiledb_path: env_build_dir.join(COMPILEDB_NAME),
            program_path: env_build_dir.join(PROGRAM_NAME),
            build_root,
            env_build_dir,
        }
    }
}

/// Workspace directory for a project (`[project] workspace_dir` override).
pub fn workspace_dir(project_dir: &Path, settings: &ProjectSettings) -> PathBuf {
    match &settings.workspace_dir {
        Some(dir) => resolve_project_path(project_dir, dir),
        None => project_dir.join(DEFAULT_WORKSPACE_DIR),
    }
}

/// Parent directory of all per-env build dirs.
pub fn build_root(project_dir: &Path, settings: &ProjectSettings) -> PathBuf {
    match &settings.build_dir {
        Some(dir) => resolve_project_path(project_dir, dir),
        None => workspace_dir(project_dir, settings).join("build"),
    }
}

/// Optional shared build cache directory from `[project] cache_dir`.
pub fn cache_dir(project_dir: &Path, settings: &ProjectSettings) -> Option<PathBuf> {
    settings
        .cache_dir
        .as_ref()
        .map(|dir| resolve_project_path(project_dir, dir))
}

fn resolve_project_path(project_dir: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project_dir.join(candidate)
    }
}
