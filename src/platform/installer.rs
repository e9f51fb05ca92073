//! Platform installation from the local package registry.
//!
//! The registry is a directory of `<name>.tar.zst` archives (platforms and
//! their packages). Installation unpacks into a temp dir and renames into
//! place, so a crashed install never leaves a half-populated platform behind.
//! Concurrent installs of the same platform are serialized with an exclusive
//! lock file.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use walkdir::WalkDir;

use super::{Platform, PLATFORM_MANIFEST_NAME};

/// Receipt written into the platform directory after a successful install.
pub const RECEIPT_NAME: &str = ".install-receipt.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub platform: String,
    pub version: String,
    pub source_archive: String,
    pub file_count: u64,
    pub installed_at_utc: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Installs platforms from a registry directory into the platforms root.
#[derive(Debug, Clone)]
pub struct PlatformInstaller {
    platforms_dir: PathBuf,
    registry_dir: PathBuf,
}

impl PlatformInstaller {
    pub fn new(platforms_dir: &Path, registry_dir: &Path) -> Self {
        Self {
            platforms_dir: platforms_dir.to_path_buf(),
            registry_dir: registry_dir.to_path_buf(),
        }
    }

    /// Install `id` from the registry. Already-installed platforms are left
    /// untouched. With `skip_default_packages` only the platform itself is
    /// unpacked, none of its `default_packages`.
    pub fn install(&self, id: &str, skip_default_packages: bool) -> Result<Platform> {
        validate_platform_id(id)?;
        let dest = self.platforms_dir.join(id);
        if dest.join(PLATFORM_MANIFEST_NAME).is_file() {
            println!("Platform '{}' is already installed", id);
            return Platform::load(&dest);
        }

        fs::create_dir_all(&self.platforms_dir).with_context(|| {
            format!(
                "creating platforms dir '{}'",
                self.platforms_dir.display()
            )
        })?;
        let _lock = self.acquire_lock(id)?;

        // Another process may have completed the install while we waited on
        // the lock path.
        if dest.join(PLATFORM_MANIFEST_NAME).is_file() {
            return Platform::load(&dest);
        }

        let archive = self.registry_dir.join(format!("{}.tar.zst", id));
        if !archive.is_file() {
            bail!(
                "platform '{}' not found in registry '{}' (expected {})",
                id,
                self.registry_dir.display(),
                archive.display()
            );
        }

        println!("Installing platform '{}'...", id);
        let tmp = self.platforms_dir.join(tmp_name(id));
        let unpack_result = unpack_archive(&archive, &tmp)
            .and_then(|()| archive_root(&tmp))
            .and_then(|root| {
                // Parse the manifest before committing the directory.
                let platform = Platform::load(&root)?;
                if platform.manifest.name != id {
                    bail!(
                        "archive '{}' contains platform '{}', not '{}'",
                        archive.display(),
                        platform.manifest.name,
                        id
                    );
                }
                fs::rename(&root, &dest).with_context(|| {
                    format!("moving unpacked platform into '{}'", dest.display())
                })?;
                Ok(())
            });
        if tmp.exists() {
            let _ = fs::remove_dir_all(&tmp);
        }
        unpack_result?;

        let platform = Platform::load(&dest)?;
        let mut installed_packages = Vec::new();
        if !skip_default_packages {
            for package in &platform.manifest.default_packages {
                self.install_package(&dest, package)?;
                installed_packages.push(package.clone());
            }
        }

        let file_count = count_files(&dest);
        let receipt = InstallReceipt {
            platform: platform.manifest.name.clone(),
            version: platform.manifest.version.clone(),
            source_archive: archive.display().to_string(),
            file_count,
            installed_at_utc: now_utc_compact(),
            packages: installed_packages,
        };
        let receipt_bytes = serde_json::to_vec_pretty(&receipt)?;
        fs::write(dest.join(RECEIPT_NAME), receipt_bytes)
            .with_context(|| format!("writing install receipt in '{}'", dest.display()))?;

        println!(
            "  Installed platform {} {} ({} files)",
            platform.manifest.name, platform.manifest.version, file_count
        );
        Ok(platform)
    }

    fn install_package(&self, platform_dir: &Path, package: &str) -> Result<()> {
        validate_platform_id(package)?;
        let dest = platform_dir.join("packages").join(package);
        if dest.is_dir() {
            return Ok(());
        }

        let archive = self.registry_dir.join(format!("{}.tar.zst", package));
        if !archive.is_file() {
            bail!(
                "package '{}' not found in registry '{}' (expected {})",
                package,
                self.registry_dir.display(),
                archive.display()
            );
        }

        println!("  Installing package '{}'...", package);
        let tmp = platform_dir.join(tmp_name(package));
        // Package archives carry their content at the top level, so the
        // unpack dir itself becomes the package dir.
        let result = unpack_archive(&archive, &tmp).and_then(|()| {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&tmp, &dest).with_context(|| {
                format!("moving unpacked package into '{}'", dest.display())
            })?;
            Ok(())
        });
        if tmp.exists() {
            let _ = fs::remove_dir_all(&tmp);
        }
        result
    }

    fn acquire_lock(&self, id: &str) -> Result<InstallLock> {
        let lock_path = self.platforms_dir.join(format!(".{}.lock", id));

        // Never unlink a "stale" lock file here: a second process could then
        // create a fresh file at the same path and hold a separate lock.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            drop(lock_file);
            bail!(
                "platform '{}' is being installed by another process (lock: {})",
                id,
                lock_path.display()
            );
        }

        Ok(InstallLock {
            _file: lock_file,
            path: lock_path,
        })
    }
}

/// Read the install receipt of an installed platform, if one exists.
pub fn read_receipt(platform_dir: &Path) -> Result<Option<InstallReceipt>> {
    let path = platform_dir.join(RECEIPT_NAME);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes =
        fs::read(&path).with_context(|| format!("reading receipt '{}'", path.display()))?;
    let receipt = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing receipt '{}'", path.display()))?;
    Ok(Some(receipt))
}

/// RAII guard: unlocks and removes the lock file on drop.
#[derive(Debug)]
struct InstallLock {
    _file: File,
    path: PathBuf,
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let file = File::open(archive)
        .with_context(|| format!("opening archive '{}'", archive.display()))?;
    let decoder = zstd::stream::Decoder::new(file)?;
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest)
        .with_context(|| format!("unpacking '{}'", archive.display()))?;
    Ok(())
}

/// Root of an unpacked platform: the unpack dir itself when the manifest sits
/// at top level, else a single top-level directory containing it.
fn archive_root(unpacked: &Path) -> Result<PathBuf> {
    if unpacked.join(PLATFORM_MANIFEST_NAME).is_file() {
        return Ok(unpacked.to_path_buf());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(unpacked)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    if dirs.len() == 1 {
        return Ok(dirs.remove(0));
    }

    // No manifest anywhere obvious; let the manifest load report it.
    Ok(unpacked.to_path_buf())
}

fn count_files(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .count() as u64
}

fn tmp_name(id: &str) -> String {
    let n = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(".tmp-{}-{}", id, n)
}

fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn validate_platform_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("platform id must not be empty");
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        bail!("platform id must be a safe directory name: {}", id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pack_tar_zst(src_dir: &Path, out: &Path) {
        let file = File::create(out).unwrap();
        let encoder = zstd::stream::Encoder::new(file, 3).unwrap();
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all("", src_dir).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn seed_registry(registry: &Path, id: &str, packages: &[&str]) {
        fs::create_dir_all(registry).unwrap();

        let staging = registry.join(format!(".stage-{}", id));
        fs::create_dir_all(staging.join("builder")).unwrap();
        let package_list = packages
            .iter()
            .map(|p| format!("\"{}\"", p))
            .collect::<Vec<_>>()
            .join(", ");
        fs::write(
            staging.join(PLATFORM_MANIFEST_NAME),
            format!(
                "name = \"{id}\"\nversion = \"2.1.0\"\nengine = \"builder/engine.sh\"\ndefault_packages = [{package_list}]\n"
            ),
        )
        .unwrap();
        fs::write(staging.join("builder/engine.sh"), "#!/bin/sh\nexit 0\n").unwrap();
        pack_tar_zst(&staging, &registry.join(format!("{}.tar.zst", id)));
        fs::remove_dir_all(&staging).unwrap();

        for package in packages {
            let staging = registry.join(format!(".stage-{}", package));
            fs::create_dir_all(staging.join("bin")).unwrap();
            fs::write(staging.join("bin/tool"), "#!/bin/sh\n").unwrap();
            pack_tar_zst(&staging, &registry.join(format!("{}.tar.zst", package)));
            fs::remove_dir_all(&staging).unwrap();
        }
    }

    #[test]
    fn installs_platform_with_receipt() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        let platforms = tmp.path().join("platforms");
        seed_registry(&registry, "atmelavr", &[]);

        let installer = PlatformInstaller::new(&platforms, &registry);
        let platform = installer.install("atmelavr", true).unwrap();
        assert_eq!(platform.manifest.version, "2.1.0");

        let receipt = read_receipt(&platforms.join("atmelavr")).unwrap().unwrap();
        assert_eq!(receipt.platform, "atmelavr");
        assert!(receipt.file_count >= 2);
        assert!(receipt.installed_at_utc.ends_with('Z'));

        // Lock file must not survive the install.
        assert!(!platforms.join(".atmelavr.lock").exists());
    }

    #[test]
    fn install_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        let platforms = tmp.path().join("platforms");
        seed_registry(&registry, "atmelavr", &[]);

        let installer = PlatformInstaller::new(&platforms, &registry);
        installer.install("atmelavr", true).unwrap();

        // A marker added after install survives a second install call.
        let marker = platforms.join("atmelavr/.local-marker");
        fs::write(&marker, "keep").unwrap();
        installer.install("atmelavr", true).unwrap();
        assert!(marker.exists());
    }

    #[test]
    fn default_packages_honor_skip_flag() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        seed_registry(&registry, "atmelavr", &["toolchain-avr"]);

        let skipped = tmp.path().join("platforms-skip");
        PlatformInstaller::new(&skipped, &registry)
            .install("atmelavr", true)
            .unwrap();
        assert!(!skipped.join("atmelavr/packages/toolchain-avr").exists());

        let full = tmp.path().join("platforms-full");
        PlatformInstaller::new(&full, &registry)
            .install("atmelavr", false)
            .unwrap();
        assert!(full
            .join("atmelavr/packages/toolchain-avr/bin/tool")
            .is_file());
    }

    #[test]
    fn missing_archive_names_the_registry() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        fs::create_dir_all(&registry).unwrap();
        let platforms = tmp.path().join("platforms");

        let err = PlatformInstaller::new(&platforms, &registry)
            .install("ghost", true)
            .unwrap_err();
        assert!(err.to_string().contains("registry"));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn mismatched_manifest_name_fails_and_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        seed_registry(&registry, "real-name", &[]);
        fs::rename(
            registry.join("real-name.tar.zst"),
            registry.join("alias.tar.zst"),
        )
        .unwrap();

        let platforms = tmp.path().join("platforms");
        let err = PlatformInstaller::new(&platforms, &registry)
            .install("alias", true)
            .unwrap_err();
        assert!(err.to_string().contains("real-name"));
        assert!(!platforms.join("alias").exists());

        // No temp debris either.
        let leftovers: Vec<_> = fs::read_dir(&platforms)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn receipt_roundtrips_through_json() {
        let receipt = InstallReceipt {
            platform: "atmelavr".into(),
            version: "2.1.0".into(),
            source_archive: "/registry/atmelavr.tar.zst".into(),
            file_count: 12,
            installed_at_utc: "20260821T120000Z".into(),
            packages: vec!["toolchain-avr".into()],
        };
        let bytes = serde_json::to_vec(&receipt).unwrap();
        let back: InstallReceipt = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.version, "2.1.0");
        assert_eq!(back.packages, vec!["toolchain-avr".to_string()]);

        // Old receipts without a packages list still parse.
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value.as_object_mut().unwrap().remove("packages");
        let legacy: InstallReceipt =
            serde_json::from_value(value).unwrap();
        assert!(legacy.packages.is_empty());
    }
}
