//! Debug session orchestration.
//!
//! `launch` takes a project environment from config discovery to an attached
//! debugger: resolve the platform, ask the engine for the build metadata,
//! rebuild the firmware when the load mode calls for it, render the init
//! script and bridge the operator's terminal to the debugger. Frontends that
//! drive the session through the machine interface get every orchestrator
//! message re-framed as MI console records.

pub mod decision;
pub mod mi;
pub mod options;
pub mod session;

pub use options::{DebugInterface, DebugOptions};
pub use session::DebugSession;

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::artifact;
use crate::build::context::{BuildContext, RunOptions};
use crate::build::processor::EnvironmentProcessor;
use crate::debug::decision::{decide, ArtifactState, Decision, LoadMode};
use crate::error::FwError;
use crate::metadata;
use crate::platform::{self, PlatformResolver};
use crate::preflight;
use crate::project::{discover_project_dir, ProjectConfig, PROJECT_CONFIG_NAME};

/// Delay after a preload upload before the debugger attaches, giving the
/// freshly flashed target time to come back up.
const PRELOAD_SETTLE: Duration = Duration::from_secs(5);

/// Everything the CLI hands over for one debug session.
#[derive(Debug, Clone)]
pub struct DebugRequest {
    pub project_dir: PathBuf,
    /// Explicit config path; default is `firmware.toml` in the project dir.
    pub config_path: Option<PathBuf>,
    /// Environment name; default is the project's debug environment.
    pub environment: Option<String>,
    pub interface: DebugInterface,
    pub verbose: bool,
    pub jobs: usize,
    /// Arguments passed through to the debugger client verbatim.
    pub client_args: Vec<String>,
}

/// Run a debug session with the default platform resolver. Returns the
/// debugger's exit code (0 for the version short-circuit).
pub fn launch(request: &DebugRequest) -> Result<i32> {
    let resolver = PlatformResolver::new(&platform::platforms_dir()?, &platform::registry_dir()?);
    launch_with(request, &resolver)
}

pub fn launch_with(request: &DebugRequest, resolver: &PlatformResolver) -> Result<i32> {
    let mi_mode = mi::is_mi_mode(&request.client_args);

    let project_dir = discover_project_dir(&request.project_dir);
    let config_path = match &request.config_path {
        Some(path) => path.clone(),
        None => project_dir.join(PROJECT_CONFIG_NAME),
    };
    let config = ProjectConfig::load(&config_path)?;

    let env_name = match &request.environment {
        Some(name) => name.clone(),
        None => config.default_debug_env().to_string(),
    };
    let env = config.env(&env_name)?.clone();

    let platform_id = match (&env.platform, &env.board) {
        (Some(platform), Some(_)) => platform.clone(),
        (platform, board) => {
            let mut missing = Vec::new();
            if platform.is_none() {
                missing.push("platform".to_string());
            }
            if board.is_none() {
                missing.push("board".to_string());
            }
            return Err(FwError::EnvNotDebuggable {
                env: env.name.clone(),
                missing,
            }
            .into());
        }
    };
    let platform = resolver.resolve(&platform_id)?;

    // Env settings are validated before any engine work happens; platform
    // refinements only arrive through negotiation further down.
    let initial = DebugOptions::initial(&env)?;

    let ctx = BuildContext::bootstrap(
        config,
        RunOptions {
            verbose: request.verbose,
            jobs: request.jobs,
            ..RunOptions::default()
        },
    )?;

    let build = metadata::load_build_metadata(&ctx, &platform, &env)?;
    let debugger = preflight::resolve_debugger(&build.debugger_path)?;

    if request.client_args.iter().any(|arg| arg == "--version") {
        let banner = session::query_version(&debugger)?;
        print!("{banner}");
        return Ok(0);
    }

    if let Err(warning) = preflight::check_device_access_rules() {
        emit(mi_mode, &format!("{warning}\n"));
    }

    let options = match options::negotiate_debug_options(&platform, &env)? {
        Some(negotiated) => negotiated,
        None => {
            let mut legacy = initial;
            legacy.load_cmds = options::derive_legacy_load_cmds(&legacy.load_cmds, &build);
            legacy
        }
    };

    let prog_path = build.prog_path.clone();
    let preload = options.preload_active();
    let state = probe_artifact(options.load_mode, preload, &prog_path)?;
    let verdict = decide(options.load_mode, preload, state);

    if verdict == Decision::NeedsRebuild {
        rebuild_firmware(&ctx, resolver, &env.name, preload, mi_mode)?;
        if preload {
            thread::sleep(PRELOAD_SETTLE);
        }
        if options.load_mode == LoadMode::Modified {
            // Record the fresh artifact's fingerprint for later sessions.
            artifact::is_fingerprint_stale(&prog_path)?;
        }
    }

    if !prog_path.is_file() {
        return Err(FwError::MissingProgram { path: prog_path }.into());
    }

    let load_cmds = if decision::should_clear_load_cmds(options.load_mode, preload, verdict) {
        Vec::new()
    } else {
        options.load_cmds.clone()
    };
    let init_script = ctx
        .layout(&env.name)
        .env_build_dir
        .join(session::INIT_SCRIPT_NAME);
    let script = session::render_init_script(
        &options.init_cmds,
        &load_cmds,
        &options.init_break,
        options.port.as_deref(),
        &prog_path,
    );
    session::write_init_script(&init_script, &script)?;

    let session = DebugSession {
        debugger,
        program: prog_path,
        init_script,
        client_args: request.client_args.clone(),
    };
    session.run()
}

fn emit(mi_mode: bool, text: &str) {
    if mi_mode {
        print!("{}", mi::console(text));
    } else {
        print!("{text}");
    }
}

/// Probe only what the mode consults; a status-quo session never scans the
/// binary. In modified mode the fingerprint check runs first so the sidecar
/// records this session's view even when the symbol scan fails the artifact.
fn probe_artifact(mode: LoadMode, preload: bool, prog: &std::path::Path) -> Result<ArtifactState> {
    let mut state = ArtifactState {
        exists: prog.is_file(),
        ..Default::default()
    };
    match mode {
        LoadMode::Always => {
            if preload {
                state.has_debug_symbols = artifact::has_debug_symbols(prog)?;
            }
        }
        LoadMode::Modified => {
            state.fingerprint_stale = artifact::is_fingerprint_stale(prog)?;
            state.has_debug_symbols = artifact::has_debug_symbols(prog)?;
        }
        LoadMode::StatusQuo => {}
    }
    Ok(state)
}

/// Run the build pipeline on the debug target, plus an upload when the
/// debugger will not load the program itself. In MI mode the whole rebuild,
/// banner included, is captured and re-framed so it never interleaves with
/// debugger records.
fn rebuild_firmware(
    ctx: &BuildContext,
    resolver: &PlatformResolver,
    env_name: &str,
    preload: bool,
    mi_mode: bool,
) -> Result<()> {
    let mut targets = vec!["debug".to_string()];
    if preload {
        targets.push("upload".to_string());
    }
    let rebuild_ctx = ctx.with_targets(targets);
    let processor = EnvironmentProcessor::new(&rebuild_ctx, resolver);

    let banner = "Preparing firmware for debugging...\n";
    let succeeded = if mi_mode {
        let mut captured = String::from(banner);
        let ok = processor.process_captured(env_name, &mut |line| {
            captured.push_str(line);
            captured.push('\n');
        })?;
        print!("{}", mi::console(&captured));
        ok
    } else {
        print!("{banner}");
        processor.process(env_name)?
    };
    if !succeeded {
        bail!("firmware rebuild for debugging failed");
    }
    Ok(())
}
