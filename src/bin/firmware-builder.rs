use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};

use firmware_builder::build::variables::parse_variable_override;
use firmware_builder::debug::{self, DebugInterface, DebugRequest};
use firmware_builder::platform::installer::read_receipt;
use firmware_builder::platform::{self, PlatformInstaller, PlatformResolver};
use firmware_builder::project::{ProjectConfig, PROJECT_CONFIG_NAME};
use firmware_builder::{BuildContext, EnvironmentProcessor, RunOptions};

#[derive(Parser)]
#[command(name = "firmware-builder")]
#[command(version)]
#[command(propagate_version = true)]
#[command(about = "Build and debug orchestration for embedded firmware projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process build environments from the project configuration
    ///
    /// Runs the requested environments in order (default environments when
    /// none are requested), invoking each environment's platform engine.
    /// A `clean` target removes build products instead of building.
    ///
    /// EXAMPLES:
    ///     firmware-builder run                     Build default environments
    ///     firmware-builder run -e uno -t upload    Build and flash one env
    ///     firmware-builder run -t clean            Remove build products
    Run {
        /// Project directory
        #[arg(short = 'd', long, value_name = "DIR", default_value = ".")]
        project_dir: PathBuf,
        /// Project configuration file [default: DIR/firmware.toml]
        #[arg(short = 'c', long, value_name = "FILE")]
        project_conf: Option<PathBuf>,
        /// Environment to process (repeatable)
        #[arg(short = 'e', long = "environment", value_name = "ENV")]
        environments: Vec<String>,
        /// Build target (repeatable; replaces the env's declared targets)
        #[arg(short = 't', long = "target", value_name = "TARGET")]
        targets: Vec<String>,
        /// Serial port for firmware upload
        #[arg(long, value_name = "PORT")]
        upload_port: Option<String>,
        /// Engine variable override (recognized keys only)
        #[arg(long = "build-var", value_name = "KEY=VALUE")]
        build_vars: Vec<String>,
        /// Parallel engine jobs [default: CPU count]
        #[arg(short = 'j', long, value_name = "N")]
        jobs: Option<usize>,
        /// Suppress progress output
        #[arg(short = 's', long)]
        silent: bool,
        /// Show full tool command lines
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Launch a debug session for one environment
    ///
    /// Builds debuggable firmware when the load mode calls for it, renders
    /// the debugger init script and attaches the debugger client to the
    /// target. Arguments after `--` go to the debugger client verbatim.
    ///
    /// EXAMPLES:
    ///     firmware-builder debug                   Debug the default env
    ///     firmware-builder debug -e disco          Debug a specific env
    ///     firmware-builder debug -- --version      Probe the client version
    Debug {
        /// Project directory
        #[arg(short = 'd', long, value_name = "DIR", default_value = ".")]
        project_dir: PathBuf,
        /// Project configuration file [default: DIR/firmware.toml]
        #[arg(short = 'c', long, value_name = "FILE")]
        project_conf: Option<PathBuf>,
        /// Environment to debug [default: the project's debug environment]
        #[arg(short = 'e', long, value_name = "ENV")]
        environment: Option<String>,
        /// Debugger interface
        #[arg(long, value_name = "NAME", default_value = "gdb")]
        interface: String,
        /// Show full build output during rebuilds
        #[arg(short = 'v', long)]
        verbose: bool,
        /// Arguments passed to the debugger client
        #[arg(last = true, value_name = "CLIENT_ARGS")]
        client_args: Vec<String>,
    },

    /// Manage installed development platforms
    Platform {
        #[command(subcommand)]
        command: PlatformCommands,
    },
}

#[derive(Subcommand)]
enum PlatformCommands {
    /// Install platforms from the package registry
    Install {
        /// Platform ids to install
        #[arg(required = true, value_name = "ID")]
        ids: Vec<String>,
        /// Unpack the platform only, skipping its default packages
        #[arg(long)]
        skip_default_packages: bool,
    },
    /// List installed platforms
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run {
            project_dir,
            project_conf,
            environments,
            targets,
            upload_port,
            build_vars,
            jobs,
            silent,
            verbose,
        } => {
            let mut variable_overrides = Vec::with_capacity(build_vars.len());
            for raw in &build_vars {
                variable_overrides.push(parse_variable_override(raw)?);
            }
            let options = RunOptions {
                targets,
                variable_overrides,
                upload_port,
                test_run_name: None,
                verbose,
                silent,
                jobs: jobs.unwrap_or_else(default_jobs),
            };
            let config_path =
                project_conf.unwrap_or_else(|| project_dir.join(PROJECT_CONFIG_NAME));
            run_environments(&config_path, &environments, options)?
        }
        Commands::Debug {
            project_dir,
            project_conf,
            environment,
            interface,
            verbose,
            client_args,
        } => {
            let request = DebugRequest {
                project_dir,
                config_path: project_conf,
                environment,
                interface: DebugInterface::parse(&interface)?,
                verbose,
                jobs: default_jobs(),
                client_args,
            };
            debug::launch(&request)?
        }
        Commands::Platform { command } => match command {
            PlatformCommands::Install {
                ids,
                skip_default_packages,
            } => {
                install_platforms(&ids, skip_default_packages)?;
                0
            }
            PlatformCommands::List => {
                list_platforms()?;
                0
            }
        },
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Process the selected environments in order. Engine failures are recorded
/// per environment and turn into a non-zero exit code after every env ran;
/// orchestration errors abort immediately.
fn run_environments(
    config_path: &Path,
    requested: &[String],
    options: RunOptions,
) -> Result<i32> {
    let config = ProjectConfig::load(config_path)?;
    let env_names = config.select_envs(requested)?;
    let ctx = BuildContext::bootstrap(config, options)?;

    if ctx.is_clean_mode() {
        for name in &env_names {
            ctx.clean_environment(name)?;
        }
        return Ok(0);
    }

    let resolver =
        PlatformResolver::new(&platform::platforms_dir()?, &platform::registry_dir()?);
    let processor = EnvironmentProcessor::new(&ctx, &resolver);

    let mut outcomes = Vec::with_capacity(env_names.len());
    for (index, name) in env_names.iter().enumerate() {
        if index > 0 && !ctx.options.silent {
            println!();
        }
        let started = Instant::now();
        let succeeded = processor.process(name)?;
        outcomes.push(EnvOutcome {
            env: name.clone(),
            succeeded,
            duration: started.elapsed(),
        });
    }

    if outcomes.len() > 1 {
        print_run_summary(&outcomes);
    }

    Ok(if outcomes.iter().all(|o| o.succeeded) {
        0
    } else {
        1
    })
}

struct EnvOutcome {
    env: String,
    succeeded: bool,
    duration: Duration,
}

fn print_run_summary(outcomes: &[EnvOutcome]) {
    let name_width = outcomes
        .iter()
        .map(|o| o.env.len())
        .max()
        .unwrap_or(0)
        .max("Environment".len());

    println!();
    println!("{:<name_width$}  {:<7}  Duration", "Environment", "Status");
    println!("{:-<name_width$}  {:-<7}  {:-<11}", "", "", "");
    for outcome in outcomes {
        let status = if outcome.succeeded { "SUCCESS" } else { "FAILED" };
        println!(
            "{:<name_width$}  {:<7}  {}",
            outcome.env,
            status,
            format_duration(outcome.duration)
        );
    }

    let total: Duration = outcomes.iter().map(|o| o.duration).sum();
    let succeeded = outcomes.iter().filter(|o| o.succeeded).count();
    let failed = outcomes.len() - succeeded;
    let tally = if failed == 0 {
        format!("{} succeeded", succeeded)
    } else {
        format!("{} failed, {} succeeded", failed, succeeded)
    };
    println!("{} in {}", tally, format_duration(total));
}

fn install_platforms(ids: &[String], skip_default_packages: bool) -> Result<()> {
    let installer =
        PlatformInstaller::new(&platform::platforms_dir()?, &platform::registry_dir()?);
    for id in ids {
        installer.install(id, skip_default_packages)?;
    }
    Ok(())
}

fn list_platforms() -> Result<()> {
    let platforms = platform::list_installed(&platform::platforms_dir()?)?;
    if platforms.is_empty() {
        println!("No platforms installed");
        return Ok(());
    }
    for entry in &platforms {
        match read_receipt(&entry.dir)? {
            Some(receipt) => println!(
                "{} {} (installed {})",
                entry.id(),
                entry.manifest.version,
                receipt.installed_at_utc
            ),
            None => println!("{} {}", entry.id(), entry.manifest.version),
        }
    }
    Ok(())
}

fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// `HH:MM:SS.cc`, computed in centiseconds so a long second never rounds up
/// to `60.00`.
fn format_duration(elapsed: Duration) -> String {
    let centis = elapsed.as_millis() / 10;
    let (hours, rem) = (centis / 360_000, centis % 360_000);
    let (minutes, rem) = (rem / 6_000, rem % 6_000);
    format!("{:02}:{:02}:{:02}.{:02}", hours, minutes, rem / 100, rem % 100)
}
