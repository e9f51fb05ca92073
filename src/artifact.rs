//! Program artifact probes for the debug flow.
//!
//! Two questions get asked about a firmware image before attaching a
//! debugger: does it carry debug symbols, and has it changed since the last
//! session. Both are answered from file contents alone, without an ELF
//! parser.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// DWARF section names looked for in the image. Any one of them marks the
/// build as carrying debug info.
const DEBUG_SECTION_NAMES: &[&[u8]] = &[b".debug_info", b".debug_abbrev", b".debug_line"];

const SCAN_CHUNK: usize = 1024 * 1024;

/// Sidecar extension recording the last-seen program fingerprint.
const FINGERPRINT_EXT: &str = "sha256";

/// True when the image contains a DWARF section name.
///
/// The file is scanned in chunks with the previous chunk's tail kept as
/// overlap, so a name straddling a chunk boundary is still found. A missing
/// file has no symbols.
pub fn has_debug_symbols(prog_path: &Path) -> Result<bool> {
    if !prog_path.is_file() {
        return Ok(false);
    }
    let longest = DEBUG_SECTION_NAMES
        .iter()
        .map(|name| name.len())
        .max()
        .unwrap_or(0);

    let file = File::open(prog_path)
        .with_context(|| format!("opening program '{}'", prog_path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; SCAN_CHUNK];
    let mut window: Vec<u8> = Vec::with_capacity(SCAN_CHUNK + longest);

    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading program '{}'", prog_path.display()))?;
        if n == 0 {
            break;
        }
        window.extend_from_slice(&buf[..n]);
        if DEBUG_SECTION_NAMES
            .iter()
            .any(|name| contains(&window, name))
        {
            return Ok(true);
        }
        // Keep only the tail that could prefix a name split across reads.
        let tail_start = window.len().saturating_sub(longest.saturating_sub(1));
        window.drain(..tail_start);
    }
    Ok(false)
}

/// True when the program changed since the previous check (or was never
/// checked). A changed or missing fingerprint is recorded in the sidecar as
/// part of the probe; an unchanged one leaves the sidecar untouched. A
/// missing program is stale and records nothing.
pub fn is_fingerprint_stale(prog_path: &Path) -> Result<bool> {
    if !prog_path.is_file() {
        return Ok(true);
    }
    let sidecar = fingerprint_path(prog_path);
    let current = sha256_file(prog_path)?;

    if let Ok(stored) = fs::read_to_string(&sidecar) {
        if stored.trim() == current {
            return Ok(false);
        }
    }
    fs::write(&sidecar, &current)
        .with_context(|| format!("writing fingerprint '{}'", sidecar.display()))?;
    Ok(true)
}

/// Sidecar file path next to the program (`firmware.elf.sha256`).
pub fn fingerprint_path(prog_path: &Path) -> PathBuf {
    let mut name = prog_path.as_os_str().to_os_string();
    name.push(".");
    name.push(FINGERPRINT_EXT);
    PathBuf::from(name)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
