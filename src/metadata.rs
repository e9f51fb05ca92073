//! Build metadata handoff from the engine.
//!
//! The debug flow needs facts only the build engine knows: which debugger
//! binary matches the toolchain, where the program artifact lands, and which
//! extra images a flash cycle writes. The engine dumps them as JSON through
//! a dedicated target; this module runs that target and reads the file back.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::build::context::BuildContext;
use crate::error::FwError;
use crate::platform::Platform;
use crate::project::EnvConfig;

/// Engine target that writes the metadata file.
pub const METADATA_TARGET: &str = "metadata-dump";

/// Metadata file name inside the per-env build dir.
pub const METADATA_NAME: &str = "build-metadata.json";

/// One extra image flashed alongside the program.
#[derive(Debug, Clone, Deserialize)]
pub struct FlashImage {
    pub path: PathBuf,
    pub offset: String,
}

/// Facts the engine reports about one environment's build.
///
/// Extra fields are tolerated; engines are free to report more than the
/// debug flow consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildMetadata {
    pub debugger_path: PathBuf,
    pub prog_path: PathBuf,
    #[serde(default)]
    pub flash_images: Vec<FlashImage>,
}

/// Ask the engine for the environment's build configuration.
///
/// The engine run is fully captured so nothing leaks into the session's
/// output stream. Any failure here (engine error, missing file, bad JSON)
/// means debugging cannot be configured and is reported as one error.
pub fn load_build_metadata(
    ctx: &BuildContext,
    platform: &Platform,
    env: &EnvConfig,
) -> Result<BuildMetadata> {
    let targets = vec![METADATA_TARGET.to_string()];
    let setup = ctx.prepare(env, platform, &targets)?;
    let path = setup.layout.env_build_dir.join(METADATA_NAME);

    let ok = platform.run_streamed(
        &setup.variables,
        &targets,
        false,
        ctx.options.effective_jobs(),
        |_line| {},
    )?;
    if !ok || !path.is_file() {
        return Err(unavailable());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading build metadata '{}'", path.display()))?;
    serde_json::from_str(&raw).map_err(|_| unavailable())
}

fn unavailable() -> anyhow::Error {
    FwError::InvalidDebugConfig("could not load a build configuration".to_string()).into()
}
