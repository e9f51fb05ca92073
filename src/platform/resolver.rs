//! Platform resolution with install-on-miss.
//!
//! Both the build and the debug flows resolve platforms through this one
//! type: look up the installed platform, and on the first miss install it
//! from the registry (skipping default packages) and look up exactly once
//! more. There is never a second install attempt.

use anyhow::Result;
use std::path::{Path, PathBuf};

use super::installer::PlatformInstaller;
use super::Platform;
use crate::error::FwError;

/// Seam over installation so resolution policy is testable without a
/// registry on disk.
pub trait InstallPlatform {
    fn install(&self, id: &str, skip_default_packages: bool) -> Result<Platform>;
}

impl InstallPlatform for PlatformInstaller {
    fn install(&self, id: &str, skip_default_packages: bool) -> Result<Platform> {
        PlatformInstaller::install(self, id, skip_default_packages)
    }
}

pub struct PlatformResolver<I = PlatformInstaller> {
    platforms_dir: PathBuf,
    installer: I,
}

impl PlatformResolver<PlatformInstaller> {
    pub fn new(platforms_dir: &Path, registry_dir: &Path) -> Self {
        Self {
            platforms_dir: platforms_dir.to_path_buf(),
            installer: PlatformInstaller::new(platforms_dir, registry_dir),
        }
    }
}

impl<I: InstallPlatform> PlatformResolver<I> {
    pub fn with_installer(platforms_dir: &Path, installer: I) -> Self {
        Self {
            platforms_dir: platforms_dir.to_path_buf(),
            installer,
        }
    }

    pub fn platforms_dir(&self) -> &Path {
        &self.platforms_dir
    }

    /// Resolve `id` to an installed platform, installing at most once.
    pub fn resolve(&self, id: &str) -> Result<Platform> {
        match Platform::find(&self.platforms_dir, id) {
            Ok(platform) => Ok(platform),
            Err(err) if is_unknown_platform(&err) => {
                println!("Platform '{}' is not installed yet", id);
                self.installer.install(id, true)?;
                Platform::find(&self.platforms_dir, id)
            }
            Err(err) => Err(err),
        }
    }
}

fn is_unknown_platform(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<FwError>(),
        Some(FwError::UnknownPlatform { .. })
    )
}
