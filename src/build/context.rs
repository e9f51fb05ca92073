//! Once-per-invocation build context.
//!
//! `BuildContext::bootstrap` runs exactly once per CLI invocation and the
//! resulting value is threaded through every environment run. Everything an
//! environment needs from the orchestrator (paths, variables, target plan,
//! hooks, capabilities) comes out of [`BuildContext::prepare`] as an
//! immutable [`EnvBuildSetup`]; nothing here is global or mutated later.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::build::layout::{self, EnvLayout};
use crate::build::scripts::{parse_extra_scripts, ExtensionHook};
use crate::build::variables::{
    compose_build_variables, merge_recognized_overrides, BuildVariableSet, VAR_BUILD_CACHE_DIR,
    VAR_BUILD_SCRIPT, VAR_PLATFORM_MANIFEST,
};
use crate::platform::Platform;
use crate::project::{EnvConfig, ProjectConfig};

/// Checksum marker guarding the build root against config edits.
pub const CHECKSUM_NAME: &str = "project.checksum";

/// Per-env target plan handed to the engine.
pub const TARGET_PLAN_NAME: &str = "target-plan.json";

/// Variable carrying the target plan path.
pub const VAR_TARGET_PLAN: &str = "TARGET_PLAN";

/// Engine step that reports the program size against the board limits.
pub const SIZE_CHECK_TARGET: &str = "checkprogsize";

/// Targets that only inspect existing build products; requesting one of
/// these disables the size-check wiring.
const DIAGNOSTIC_TARGETS: &[&str] = &["nobuild", "sizedata"];

/// Engine label variables substituted for raw tool command lines when the
/// run is not verbose.
const PHASE_LABELS: &[(&str, &str)] = &[
    ("COMPILE_STR", "Compiling"),
    ("LINK_STR", "Linking"),
    ("ARCHIVE_STR", "Archiving"),
    ("INDEX_STR", "Indexing"),
];

/// CLI-level options consumed by the context and the processors.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Targets from the command line (replace, not extend, env targets).
    pub targets: Vec<String>,
    /// Parsed `--build-var KEY=VALUE` overrides.
    pub variable_overrides: Vec<(String, String)>,
    pub upload_port: Option<String>,
    pub test_run_name: Option<String>,
    pub verbose: bool,
    pub silent: bool,
    pub jobs: usize,
}

impl RunOptions {
    pub fn effective_jobs(&self) -> usize {
        self.jobs.max(1)
    }
}

/// Build-graph adjustments the orchestrator asks of the engine. Written as
/// JSON next to the other per-env build products; the engine applies it when
/// constructing its graph.
#[derive(Debug, Clone, Serialize)]
pub struct TargetPlan {
    /// Replacement default targets; empty means the engine's own default.
    pub default_targets: Vec<String>,
    /// target -> prerequisite steps.
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Aliases that must never be considered up to date.
    pub always_stale: Vec<String>,
}

/// Everything one environment run needs, assembled once.
#[derive(Debug, Clone)]
pub struct EnvBuildSetup {
    pub layout: EnvLayout,
    pub variables: BuildVariableSet,
    pub plan: TargetPlan,
    pub hooks: Vec<ExtensionHook>,
    /// Environment exported to extension hooks.
    pub hook_env: BTreeMap<String, String>,
    /// Named platform capabilities, fixed for the whole run.
    pub capabilities: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    pub config: ProjectConfig,
    pub options: RunOptions,
}

impl BuildContext {
    /// Construct the shared context. Outside clean mode this also creates
    /// the optional build cache dir and wipes the build root when the
    /// project config changed since the last run.
    pub fn bootstrap(config: ProjectConfig, options: RunOptions) -> Result<Self> {
        let ctx = Self { config, options };
        if !ctx.is_clean_mode() {
            if let Some(cache) = ctx.cache_dir() {
                if !cache.is_dir() {
                    fs::create_dir_all(&cache).with_context(|| {
                        format!("creating build cache dir '{}'", cache.display())
                    })?;
                }
            }
            ctx.refresh_config_checksum()?;
        }
        Ok(ctx)
    }

    /// A `clean` target short-circuits all other setup.
    pub fn is_clean_mode(&self) -> bool {
        self.options.targets.iter().any(|t| t == "clean")
    }

    /// Same context, different target list. Used where one invocation runs a
    /// follow-up build (a debug rebuild on top of the requested targets).
    pub fn with_targets(&self, targets: Vec<String>) -> Self {
        let mut derived = self.clone();
        derived.options.targets = targets;
        derived
    }

    pub fn layout(&self, env_name: &str) -> EnvLayout {
        EnvLayout::new(&self.config.project_dir, &self.config.settings, env_name)
    }

    pub fn cache_dir(&self) -> Option<PathBuf> {
        layout::cache_dir(&self.config.project_dir, &self.config.settings)
    }

    /// Delete the build products of one environment.
    pub fn clean_environment(&self, env_name: &str) -> Result<()> {
        let dir = self.layout(env_name).env_build_dir;
        if dir.is_dir() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("removing build dir '{}'", dir.display()))?;
            println!("Removed build artifacts for '{}'", env_name);
        } else {
            println!("Build artifacts for '{}' already clean", env_name);
        }
        Ok(())
    }

    /// Build-graph plan for one engine run.
    pub fn target_plan(&self, platform: &Platform, requested: &[String]) -> TargetPlan {
        let mut plan = TargetPlan {
            default_targets: Vec::new(),
            dependencies: BTreeMap::new(),
            always_stale: vec!["debug".to_string(), "test".to_string()],
        };

        let diagnostic_requested = requested
            .iter()
            .any(|t| DIAGNOSTIC_TARGETS.contains(&t.as_str()));
        if platform.has_capability("size") && !diagnostic_requested {
            for target in ["upload", "program"] {
                plan.dependencies
                    .insert(target.to_string(), vec![SIZE_CHECK_TARGET.to_string()]);
            }
            plan.default_targets = vec![SIZE_CHECK_TARGET.to_string()];
        }
        plan
    }

    /// Assemble the per-environment setup: layout dirs, the full engine
    /// variable set, the target plan file, hooks and capability map.
    pub fn prepare(
        &self,
        env: &EnvConfig,
        platform: &Platform,
        targets: &[String],
    ) -> Result<EnvBuildSetup> {
        let layout = self.layout(&env.name);
        fs::create_dir_all(&layout.env_build_dir).with_context(|| {
            format!("creating build dir '{}'", layout.env_build_dir.display())
        })?;

        let mut variables = compose_build_variables(
            env,
            &self.config.path,
            self.options.test_run_name.as_deref(),
            self.options.upload_port.as_deref(),
        );

        // Project-declared extra variables pass through untouched; only CLI
        // overrides are restricted to recognized names.
        for (key, value) in &env.build_vars {
            variables.insert(key.clone(), value.clone());
        }

        variables.insert(
            VAR_PLATFORM_MANIFEST.to_string(),
            platform.manifest_path().display().to_string(),
        );
        if let Some(script) = platform.build_script_path() {
            variables.insert(VAR_BUILD_SCRIPT.to_string(), script.display().to_string());
        }
        if let Some(cache) = self.cache_dir() {
            variables.insert(VAR_BUILD_CACHE_DIR.to_string(), cache.display().to_string());
        }

        variables.insert(
            "BUILD_DIR".to_string(),
            layout.env_build_dir.display().to_string(),
        );
        variables.insert(
            "BUILD_SRC_DIR".to_string(),
            layout.build_src_dir.display().to_string(),
        );
        variables.insert(
            "BUILD_TEST_DIR".to_string(),
            layout.build_test_dir.display().to_string(),
        );
        variables.insert(
            "BUILD_INCLUDE_DIR".to_string(),
            layout.build_include_dir.display().to_string(),
        );
        variables.insert(
            "COMPILEDB_PATH".to_string(),
            layout.compiledb_path.display().to_string(),
        );
        variables.insert(
            "PROG_PATH".to_string(),
            layout.program_path.display().to_string(),
        );

        if self.options.verbose {
            variables.insert("VERBOSE".to_string(), "1".to_string());
        } else {
            for (name, label) in PHASE_LABELS {
                variables.insert((*name).to_string(), format!("{} $TARGET", label));
            }
        }

        let plan = self.target_plan(platform, targets);
        let plan_path = layout.env_build_dir.join(TARGET_PLAN_NAME);
        let plan_bytes = serde_json::to_vec_pretty(&plan)?;
        fs::write(&plan_path, plan_bytes)
            .with_context(|| format!("writing target plan '{}'", plan_path.display()))?;
        variables.insert(VAR_TARGET_PLAN.to_string(), plan_path.display().to_string());

        merge_recognized_overrides(&mut variables, &self.options.variable_overrides);

        let hooks = parse_extra_scripts(&self.config.project_dir, &env.extra_scripts);
        let mut hook_env = BTreeMap::new();
        hook_env.insert(
            "FWBUILD_PROJECT_DIR".to_string(),
            self.config.project_dir.display().to_string(),
        );
        hook_env.insert("FWBUILD_ENV_NAME".to_string(), env.name.clone());
        hook_env.insert(
            "FWBUILD_BUILD_DIR".to_string(),
            layout.env_build_dir.display().to_string(),
        );
        hook_env.insert(
            "FWBUILD_PROGRAM_PATH".to_string(),
            layout.program_path.display().to_string(),
        );

        Ok(EnvBuildSetup {
            layout,
            variables,
            plan,
            hooks,
            hook_env,
            capabilities: platform.capabilities().clone(),
        })
    }

    fn refresh_config_checksum(&self) -> Result<()> {
        let build_root = layout::build_root(&self.config.project_dir, &self.config.settings);
        let marker = build_root.join(CHECKSUM_NAME);

        let config_bytes = fs::read(&self.config.path).with_context(|| {
            format!("reading project config '{}'", self.config.path.display())
        })?;
        let checksum = format!("{:x}", Sha256::digest(&config_bytes));

        if let Ok(stored) = fs::read_to_string(&marker) {
            if stored.trim() == checksum {
                return Ok(());
            }
        }

        if build_root.is_dir() {
            println!("Project config changed, removing stale build artifacts");
            fs::remove_dir_all(&build_root)
                .with_context(|| format!("removing build root '{}'", build_root.display()))?;
        }
        fs::create_dir_all(&build_root)
            .with_context(|| format!("creating build root '{}'", build_root.display()))?;
        fs::write(&marker, &checksum)
            .with_context(|| format!("writing checksum '{}'", marker.display()))?;
        Ok(())
    }
}
