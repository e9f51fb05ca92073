//! Per-environment build runs.
//!
//! `EnvironmentProcessor` takes one declared environment through a full
//! engine invocation: precondition checks, target selection, platform
//! resolution, engine setup, hooks, and the engine itself. The debug flow
//! reuses the same processor with output captured line by line so build
//! output can be re-framed for machine-interface consumers.

use anyhow::Result;
use std::time::Instant;

use crate::build::context::{BuildContext, EnvBuildSetup};
use crate::build::scripts::{run_hooks, run_hooks_captured, ExtensionHook, HookPhase};
use crate::build::variables::VAR_UPLOAD_PORT;
use crate::error::FwError;
use crate::platform::PlatformResolver;

const SEPARATOR_WIDTH: usize = 72;

/// Where processor and engine output goes.
enum Sink<'s> {
    /// Inherited stdio; the engine writes straight to the terminal.
    Terminal,
    /// Every line is handed to the callback instead.
    Capture(&'s mut dyn FnMut(&str)),
}

impl Sink<'_> {
    fn line(&mut self, text: &str) {
        match self {
            Sink::Terminal => println!("{}", text),
            Sink::Capture(emit) => emit(text),
        }
    }
}

pub struct EnvironmentProcessor<'a> {
    ctx: &'a BuildContext,
    resolver: &'a PlatformResolver,
}

impl<'a> EnvironmentProcessor<'a> {
    pub fn new(ctx: &'a BuildContext, resolver: &'a PlatformResolver) -> Self {
        Self { ctx, resolver }
    }

    /// Run one environment against the terminal. `Ok(false)` is an engine
    /// failure; `Err` is an orchestration failure (bad config, missing
    /// platform declaration, failing hook).
    pub fn process(&self, env_name: &str) -> Result<bool> {
        self.run_env(env_name, &mut Sink::Terminal)
    }

    /// Same flow with all output (banner, hooks, engine) captured.
    pub fn process_captured(
        &self,
        env_name: &str,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<bool> {
        self.run_env(env_name, &mut Sink::Capture(on_line))
    }

    fn run_env(&self, env_name: &str, sink: &mut Sink) -> Result<bool> {
        let started = Instant::now();
        let env = self.ctx.config.env(env_name)?.clone();
        let options = &self.ctx.options;

        if !options.silent {
            let mut traits = Vec::new();
            if let Some(platform) = &env.platform {
                traits.push(format!("platform: {}", platform));
            }
            if let Some(board) = &env.board {
                traits.push(format!("board: {}", board));
            }
            let banner = if traits.is_empty() {
                format!("Processing {}", env.name)
            } else {
                format!("Processing {} ({})", env.name, traits.join("; "))
            };
            sink.line(&banner);
            sink.line(&"-".repeat(SEPARATOR_WIDTH));
            if !options.verbose {
                sink.line("Verbose mode can be enabled via `-v, --verbose` option");
            }
        }

        // No platform declaration means no build, ever; this fires before
        // any resolution or engine work is observable.
        let Some(platform_id) = env.platform.clone() else {
            return Err(FwError::UndefinedEnvPlatform {
                env: env.name.clone(),
            }
            .into());
        };

        // An explicit CLI target list replaces the declared one. `monitor`
        // is a long-running serial session, never a build step.
        let mut targets = if !options.targets.is_empty() {
            options.targets.clone()
        } else {
            env.targets.clone()
        };
        targets.retain(|t| t != "monitor");

        let platform = self.resolver.resolve(&platform_id)?;
        let setup = self.ctx.prepare(&env, &platform, &targets)?;

        let wants_upload = targets.iter().any(|t| t == "upload" || t == "program");
        if wants_upload && !options.silent {
            sink.line("Configuring upload protocol...");
            let protocol = env
                .upload_protocol
                .as_deref()
                .or(platform.manifest.default_upload_protocol.as_deref())
                .unwrap_or("default");
            let port = setup
                .variables
                .get(VAR_UPLOAD_PORT)
                .map(String::as_str)
                .unwrap_or("auto-detect");
            sink.line(&format!("  Using '{}' on port '{}'", protocol, port));
        }

        run_phase_hooks(sink, &setup, HookPhase::Pre)?;

        let succeeded = match sink {
            Sink::Terminal => platform.run(
                &setup.variables,
                &targets,
                options.verbose,
                options.silent,
                options.effective_jobs(),
            )?,
            Sink::Capture(emit) => {
                let mut forward = |line: &str| emit(line);
                platform.run_streamed(
                    &setup.variables,
                    &targets,
                    options.verbose,
                    options.effective_jobs(),
                    &mut forward,
                )?
            }
        };

        if succeeded {
            run_phase_hooks(sink, &setup, HookPhase::Post)?;
        }

        if !options.silent || !succeeded {
            let status = if succeeded { "SUCCESS" } else { "FAILED" };
            sink.line(&format!(
                "[{}] Took {:.2} seconds",
                status,
                started.elapsed().as_secs_f64()
            ));
        }
        Ok(succeeded)
    }
}

fn run_phase_hooks(sink: &mut Sink, setup: &EnvBuildSetup, phase: HookPhase) -> Result<()> {
    let hooks: &[ExtensionHook] = &setup.hooks;
    match sink {
        Sink::Terminal => run_hooks(hooks, phase, &setup.hook_env),
        Sink::Capture(emit) => run_hooks_captured(hooks, phase, &setup.hook_env, &mut **emit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::context::RunOptions;
    use crate::platform::test_support::write_fake_platform;
    use crate::platform::PLATFORM_MANIFEST_NAME;
    use crate::project::{ProjectConfig, PROJECT_CONFIG_NAME};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Fixture {
        _project: TempDir,
        _core: TempDir,
        config: ProjectConfig,
        platforms_dir: PathBuf,
        resolver: PlatformResolver,
    }

    fn fixture(config_body: &str) -> Fixture {
        let project = TempDir::new().unwrap();
        let core = TempDir::new().unwrap();
        fs::write(project.path().join(PROJECT_CONFIG_NAME), config_body).unwrap();
        let config = ProjectConfig::load(&project.path().join(PROJECT_CONFIG_NAME)).unwrap();

        let platforms_dir = core.path().join("platforms");
        let registry_dir = core.path().join("registry");
        fs::create_dir_all(&platforms_dir).unwrap();
        fs::create_dir_all(&registry_dir).unwrap();
        let resolver = PlatformResolver::new(&platforms_dir, &registry_dir);

        Fixture {
            _project: project,
            _core: core,
            config,
            platforms_dir,
            resolver,
        }
    }

    fn make_executable(path: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(path, perms).unwrap();
        }
    }

    /// Platform whose engine runs the given shell body.
    fn write_scripted_platform(platforms_dir: &Path, id: &str, script: &str) -> PathBuf {
        let dir = platforms_dir.join(id);
        fs::create_dir_all(dir.join("builder")).unwrap();
        fs::write(
            dir.join(PLATFORM_MANIFEST_NAME),
            format!(
                "name = \"{id}\"\nversion = \"1.0.0\"\nengine = \"builder/engine.sh\"\n"
            ),
        )
        .unwrap();
        let engine = dir.join("builder/engine.sh");
        fs::write(&engine, format!("#!/bin/sh\n{script}\n")).unwrap();
        make_executable(&engine);
        dir
    }

    fn engine_args(platform_dir: &Path) -> Vec<String> {
        fs::read_to_string(platform_dir.join("engine-args.txt"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[cfg(unix)]
    #[test]
    fn missing_platform_declaration_fails_before_any_engine_run() {
        let fx = fixture("[env.bare]\nboard = \"uno\"\n");
        let dir = write_fake_platform(&fx.platforms_dir, "atmelavr");

        let ctx = BuildContext::bootstrap(fx.config.clone(), RunOptions::default()).unwrap();
        let processor = EnvironmentProcessor::new(&ctx, &fx.resolver);

        let err = processor.process("bare").unwrap_err();
        let fw = err.downcast_ref::<FwError>().unwrap();
        assert!(matches!(fw, FwError::UndefinedEnvPlatform { .. }));
        assert!(!dir.join("engine-args.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn declared_targets_are_used_when_cli_gives_none() {
        let fx = fixture(
            "[env.uno]\nplatform = \"atmelavr\"\nboard = \"uno\"\ntargets = [\"upload\"]\n",
        );
        let dir = write_fake_platform(&fx.platforms_dir, "atmelavr");

        let ctx = BuildContext::bootstrap(fx.config.clone(), RunOptions::default()).unwrap();
        let processor = EnvironmentProcessor::new(&ctx, &fx.resolver);

        assert!(processor.process("uno").unwrap());
        let args = engine_args(&dir);
        assert_eq!(args.last().map(String::as_str), Some("upload"));
    }

    #[cfg(unix)]
    #[test]
    fn cli_targets_replace_declared_ones_and_monitor_is_stripped() {
        let fx = fixture(
            "[env.uno]\nplatform = \"atmelavr\"\nboard = \"uno\"\ntargets = [\"test\"]\n",
        );
        let dir = write_fake_platform(&fx.platforms_dir, "atmelavr");

        let options = RunOptions {
            targets: vec!["monitor".to_string(), "upload".to_string()],
            ..Default::default()
        };
        let ctx = BuildContext::bootstrap(fx.config.clone(), options).unwrap();
        let processor = EnvironmentProcessor::new(&ctx, &fx.resolver);

        assert!(processor.process("uno").unwrap());
        let args = engine_args(&dir);
        assert!(!args.contains(&"monitor".to_string()));
        assert!(!args.contains(&"test".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("upload"));
    }

    #[cfg(unix)]
    #[test]
    fn engine_failure_is_an_outcome_and_skips_post_hooks() {
        let fx = fixture(
            r#"
[env.uno]
platform = "broken"
extra_scripts = ["post:after.sh"]
"#,
        );
        write_scripted_platform(&fx.platforms_dir, "broken", "exit 3");
        let marker = fx.config.project_dir.join("post-ran");
        fs::write(
            fx.config.project_dir.join("after.sh"),
            format!("touch {}\n", marker.display()),
        )
        .unwrap();

        let ctx = BuildContext::bootstrap(fx.config.clone(), RunOptions::default()).unwrap();
        let processor = EnvironmentProcessor::new(&ctx, &fx.resolver);

        assert!(!processor.process("uno").unwrap());
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[test]
    fn hooks_run_around_a_successful_engine() {
        let fx = fixture(
            r#"
[env.uno]
platform = "atmelavr"
extra_scripts = ["pre:before.sh", "after.sh"]
"#,
        );
        write_fake_platform(&fx.platforms_dir, "atmelavr");
        fs::write(
            fx.config.project_dir.join("before.sh"),
            "touch \"$FWBUILD_BUILD_DIR/pre-ran\"\n",
        )
        .unwrap();
        fs::write(
            fx.config.project_dir.join("after.sh"),
            "touch \"$FWBUILD_BUILD_DIR/post-ran\"\n",
        )
        .unwrap();

        let ctx = BuildContext::bootstrap(fx.config.clone(), RunOptions::default()).unwrap();
        let processor = EnvironmentProcessor::new(&ctx, &fx.resolver);

        assert!(processor.process("uno").unwrap());
        let build_dir = ctx.layout("uno").env_build_dir;
        assert!(build_dir.join("pre-ran").exists());
        assert!(build_dir.join("post-ran").exists());
    }

    #[cfg(unix)]
    #[test]
    fn captured_mode_collects_engine_and_announcement_output() {
        let fx = fixture("[env.uno]\nplatform = \"echoer\"\nupload_port = \"/dev/ttyACM0\"\n");
        write_scripted_platform(&fx.platforms_dir, "echoer", "echo \"compiling main.o\"");

        let options = RunOptions {
            targets: vec!["upload".to_string()],
            ..Default::default()
        };
        let ctx = BuildContext::bootstrap(fx.config.clone(), options).unwrap();
        let processor = EnvironmentProcessor::new(&ctx, &fx.resolver);

        let mut lines = Vec::new();
        let ok = processor
            .process_captured("uno", &mut |line| lines.push(line.to_string()))
            .unwrap();
        assert!(ok);
        assert!(lines.iter().any(|l| l == "compiling main.o"));
        assert!(lines.iter().any(|l| l == "Configuring upload protocol..."));
        assert!(lines.iter().any(|l| l.contains("/dev/ttyACM0")));
        assert!(lines.iter().any(|l| l.starts_with("[SUCCESS]")));
    }
}
