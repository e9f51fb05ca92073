//! Build and debug orchestration for embedded firmware projects.
//!
//! A project declares its environments in `firmware.toml`; every environment
//! names a platform whose installed manifest describes the build engine, its
//! packages and debug settings. This crate provides the orchestration around
//! those engines:
//!
//! - **Environment runs** - Per-env build context, engine variables, target
//!   plans and extension hooks
//! - **Platform management** - Resolver plus registry installer with
//!   install-on-demand for unknown platforms
//! - **Debug sessions** - Build metadata handoff, rebuild decisions, init
//!   script rendering and the debugger bridge
//! - **Preflight checks** - Host tool and device-rule validation before
//!   sessions
//!
//! # Architecture
//!
//! ```text
//! firmware-builder (this crate)
//!     │
//!     ├── project: config parsing, project dir discovery, env selection
//!     ├── build: BuildContext, variables, target plan, EnvironmentProcessor
//!     ├── platform: installed platforms, resolver, registry installer
//!     ├── debug: session launcher, load decision, MI framing, gdb bridge
//!     ├── metadata: build facts reported by the engine
//!     ├── artifact: debug-symbol and fingerprint probes
//!     └── preflight / process: host checks and subprocess plumbing
//! ```

pub mod artifact;
pub mod build;
pub mod debug;
pub mod error;
pub mod metadata;
pub mod platform;
pub mod preflight;
pub mod process;
pub mod project;

pub use build::{BuildContext, EnvironmentProcessor, RunOptions};
pub use debug::{launch, DebugRequest};
pub use error::FwError;
pub use platform::{Platform, PlatformResolver};
pub use project::ProjectConfig;
