//! Rebuild policy before a debug session.
//!
//! A pure state machine: given the configured load mode, whether preload is
//! active, and what is known about the program artifact, decide whether the
//! firmware must be rebuilt before the debugger attaches. Probing the
//! artifact is the caller's job (`crate::artifact`); nothing here touches
//! the filesystem.

use anyhow::{bail, Result};

/// When firmware gets rebuilt and re-flashed for debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Rebuild for every session.
    Always,
    /// Rebuild when the program changed or lost its debug info.
    Modified,
    /// Reuse whatever exists; rebuild only when nothing does.
    #[default]
    StatusQuo,
}

impl LoadMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "always" => Ok(LoadMode::Always),
            "modified" => Ok(LoadMode::Modified),
            "status-quo" => Ok(LoadMode::StatusQuo),
            other => bail!(
                "unsupported debug_load_mode '{}' (expected 'always', 'modified' or 'status-quo')",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Always => "always",
            LoadMode::Modified => "modified",
            LoadMode::StatusQuo => "status-quo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NeedsRebuild,
    ReuseExisting,
}

/// What the artifact probes reported. Fields a mode does not consult may be
/// left false.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactState {
    pub exists: bool,
    pub has_debug_symbols: bool,
    pub fingerprint_stale: bool,
}

/// Preload means the debugger itself performs the load; detected by exact
/// equality with the single-element command list.
pub fn preload_active(load_cmds: &[String]) -> bool {
    load_cmds == ["preload"]
}

pub fn decide(mode: LoadMode, preload: bool, artifact: ArtifactState) -> Decision {
    let rebuild = match mode {
        LoadMode::Always => {
            if preload {
                !artifact.exists || !artifact.has_debug_symbols
            } else {
                true
            }
        }
        LoadMode::Modified => artifact.fingerprint_stale || !artifact.has_debug_symbols,
        LoadMode::StatusQuo => !artifact.exists,
    };
    if rebuild {
        Decision::NeedsRebuild
    } else {
        Decision::ReuseExisting
    }
}

/// Whether the load commands handed to the debugger must be dropped: never
/// re-flash a binary the session did not just produce.
pub fn should_clear_load_cmds(mode: LoadMode, preload: bool, decision: Decision) -> bool {
    preload || (decision == Decision::ReuseExisting && mode != LoadMode::Always)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_accepts_the_three_modes() {
        assert_eq!(LoadMode::parse("always").unwrap(), LoadMode::Always);
        assert_eq!(LoadMode::parse("modified").unwrap(), LoadMode::Modified);
        assert_eq!(LoadMode::parse("status-quo").unwrap(), LoadMode::StatusQuo);
        assert!(LoadMode::parse("sometimes").is_err());
        assert_eq!(LoadMode::default(), LoadMode::StatusQuo);
    }

    #[test]
    fn preload_requires_the_exact_single_command() {
        assert!(preload_active(&strs(&["preload"])));
        assert!(!preload_active(&strs(&["load"])));
        assert!(!preload_active(&strs(&["preload", "load"])));
        assert!(!preload_active(&strs(&[])));
    }

    #[test]
    fn always_mode_rebuilds_even_with_good_symbols() {
        let state = ArtifactState {
            exists: true,
            has_debug_symbols: true,
            fingerprint_stale: false,
        };
        assert_eq!(
            decide(LoadMode::Always, false, state),
            Decision::NeedsRebuild
        );
    }

    #[test]
    fn always_mode_with_preload_only_needs_a_usable_artifact() {
        let good = ArtifactState {
            exists: true,
            has_debug_symbols: true,
            fingerprint_stale: false,
        };
        assert_eq!(decide(LoadMode::Always, true, good), Decision::ReuseExisting);

        let missing = ArtifactState::default();
        assert_eq!(
            decide(LoadMode::Always, true, missing),
            Decision::NeedsRebuild
        );

        let stripped = ArtifactState {
            exists: true,
            has_debug_symbols: false,
            fingerprint_stale: false,
        };
        assert_eq!(
            decide(LoadMode::Always, true, stripped),
            Decision::NeedsRebuild
        );
    }

    #[test]
    fn status_quo_only_rebuilds_a_missing_artifact() {
        let exists = ArtifactState {
            exists: true,
            ..Default::default()
        };
        assert_eq!(
            decide(LoadMode::StatusQuo, false, exists),
            Decision::ReuseExisting
        );
        assert_eq!(
            decide(LoadMode::StatusQuo, false, ArtifactState::default()),
            Decision::NeedsRebuild
        );
    }

    #[test]
    fn modified_mode_tracks_fingerprint_and_symbols() {
        let settled = ArtifactState {
            exists: true,
            has_debug_symbols: true,
            fingerprint_stale: false,
        };
        assert_eq!(
            decide(LoadMode::Modified, false, settled),
            Decision::ReuseExisting
        );

        let changed = ArtifactState {
            fingerprint_stale: true,
            ..settled
        };
        assert_eq!(
            decide(LoadMode::Modified, false, changed),
            Decision::NeedsRebuild
        );

        let stripped = ArtifactState {
            has_debug_symbols: false,
            ..settled
        };
        assert_eq!(
            decide(LoadMode::Modified, false, stripped),
            Decision::NeedsRebuild
        );
    }

    #[test]
    fn rebuild_under_always_keeps_load_cmds() {
        // A fresh binary is about to exist; the debugger should flash it.
        let state = ArtifactState {
            exists: true,
            has_debug_symbols: false,
            fingerprint_stale: false,
        };
        let decision = decide(LoadMode::Always, false, state);
        assert_eq!(decision, Decision::NeedsRebuild);
        assert!(!should_clear_load_cmds(LoadMode::Always, false, decision));
    }

    #[test]
    fn reuse_under_non_always_clears_load_cmds() {
        let state = ArtifactState {
            exists: true,
            has_debug_symbols: true,
            fingerprint_stale: false,
        };
        let decision = decide(LoadMode::Modified, false, state);
        assert_eq!(decision, Decision::ReuseExisting);
        assert!(should_clear_load_cmds(LoadMode::Modified, false, decision));
    }

    #[test]
    fn preload_always_clears_load_cmds() {
        assert!(should_clear_load_cmds(
            LoadMode::Always,
            true,
            Decision::NeedsRebuild
        ));
        assert!(should_clear_load_cmds(
            LoadMode::StatusQuo,
            true,
            Decision::ReuseExisting
        ));
    }
}
