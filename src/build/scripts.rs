//! Project extension hooks.
//!
//! An environment may declare `extra_scripts`, each entry optionally tagged
//! `pre:` or `post:` (untagged entries run post). Hooks run with the build
//! context exported in their environment; a failing hook fails the build.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::process::{ensure_exists, Cmd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    fn label(self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtensionHook {
    pub phase: HookPhase,
    pub path: PathBuf,
}

/// Parse `extra_scripts` entries into hooks, resolving relative paths
/// against the project directory.
pub fn parse_extra_scripts(project_dir: &Path, entries: &[String]) -> Vec<ExtensionHook> {
    entries
        .iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (phase, raw) = if let Some(rest) = entry.strip_prefix("pre:") {
                (HookPhase::Pre, rest)
            } else if let Some(rest) = entry.strip_prefix("post:") {
                (HookPhase::Post, rest)
            } else {
                (HookPhase::Post, entry)
            };
            let candidate = Path::new(raw.trim());
            let path = if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                project_dir.join(candidate)
            };
            Some(ExtensionHook { phase, path })
        })
        .collect()
}

/// Run every hook of `phase` with the terminal attached.
pub fn run_hooks(
    hooks: &[ExtensionHook],
    phase: HookPhase,
    context_env: &BTreeMap<String, String>,
) -> Result<()> {
    for hook in hooks.iter().filter(|h| h.phase == phase) {
        println!(
            "  Running {} script: {}",
            phase.label(),
            hook.path.display()
        );
        hook_cmd(hook, context_env)?.run_interactive()?;
    }
    Ok(())
}

/// Run every hook of `phase` with output forwarded through `on_line`.
pub fn run_hooks_captured(
    hooks: &[ExtensionHook],
    phase: HookPhase,
    context_env: &BTreeMap<String, String>,
    on_line: &mut dyn FnMut(&str),
) -> Result<()> {
    for hook in hooks.iter().filter(|h| h.phase == phase) {
        on_line(&format!(
            "Running {} script: {}",
            phase.label(),
            hook.path.display()
        ));
        hook_cmd(hook, context_env)?.run_streamed(&mut *on_line)?;
    }
    Ok(())
}

fn hook_cmd(hook: &ExtensionHook, context_env: &BTreeMap<String, String>) -> Result<Cmd> {
    ensure_exists(&hook.path, "Extension script")?;
    Ok(Cmd::new("sh")
        .arg_path(&hook.path)
        .envs(context_env)
        .error_msg(format!(
            "extension script failed: {}",
            hook.path.display()
        )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn prefixes_select_the_phase() {
        let hooks = parse_extra_scripts(
            Path::new("/proj"),
            &[
                "pre:scripts/before.sh".to_string(),
                "post:scripts/after.sh".to_string(),
                "scripts/untagged.sh".to_string(),
            ],
        );
        assert_eq!(hooks.len(), 3);
        assert_eq!(hooks[0].phase, HookPhase::Pre);
        assert_eq!(hooks[0].path, Path::new("/proj/scripts/before.sh"));
        assert_eq!(hooks[1].phase, HookPhase::Post);
        assert_eq!(hooks[2].phase, HookPhase::Post);
    }

    #[test]
    fn runs_only_the_requested_phase() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("pre.sh"), "touch \"$FWBUILD_BUILD_DIR/pre-ran\"\n").unwrap();
        fs::write(tmp.path().join("post.sh"), "touch \"$FWBUILD_BUILD_DIR/post-ran\"\n").unwrap();

        let hooks = parse_extra_scripts(
            tmp.path(),
            &["pre:pre.sh".to_string(), "post:post.sh".to_string()],
        );
        let mut context = BTreeMap::new();
        context.insert(
            "FWBUILD_BUILD_DIR".to_string(),
            tmp.path().display().to_string(),
        );

        run_hooks(&hooks, HookPhase::Pre, &context).unwrap();
        assert!(tmp.path().join("pre-ran").exists());
        assert!(!tmp.path().join("post-ran").exists());
    }

    #[test]
    fn failing_hook_propagates() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("bad.sh"), "exit 7\n").unwrap();
        let hooks = parse_extra_scripts(tmp.path(), &["pre:bad.sh".to_string()]);

        let err = run_hooks(&hooks, HookPhase::Pre, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("bad.sh"));
    }

    #[test]
    fn missing_script_is_an_error() {
        let hooks = parse_extra_scripts(Path::new("/proj"), &["pre:gone.sh".to_string()]);
        assert!(run_hooks(&hooks, HookPhase::Pre, &BTreeMap::new()).is_err());
    }

    #[test]
    fn captured_hooks_forward_their_output() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("noisy.sh"), "echo hook says hi\n").unwrap();
        let hooks = parse_extra_scripts(tmp.path(), &["post:noisy.sh".to_string()]);

        let mut lines = Vec::new();
        run_hooks_captured(&hooks, HookPhase::Post, &BTreeMap::new(), &mut |l| {
            lines.push(l.to_string())
        })
        .unwrap();
        assert!(lines.iter().any(|l| l.contains("hook says hi")));
    }
}
