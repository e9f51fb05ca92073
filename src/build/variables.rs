//! Engine variable composition.
//!
//! Variables are the only channel the orchestrator uses to hand settings to
//! the build engine; they travel as `KEY=VALUE` arguments. Composition is a
//! pure function of its inputs: no filesystem access, no engine interaction,
//! and calling it twice yields the same set.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::project::EnvConfig;

pub const VAR_ENV_NAME: &str = "ENV_NAME";
pub const VAR_PROJECT_CONFIG: &str = "PROJECT_CONFIG";
pub const VAR_TEST_RUN_NAME: &str = "TEST_RUN_NAME";
pub const VAR_UPLOAD_PORT: &str = "UPLOAD_PORT";
pub const VAR_PLATFORM_MANIFEST: &str = "PLATFORM_MANIFEST";
pub const VAR_BUILD_SCRIPT: &str = "BUILD_SCRIPT";
pub const VAR_BUILD_CACHE_DIR: &str = "BUILD_CACHE_DIR";

/// Variable names CLI overrides may set. Anything else on the command line
/// is ignored so older CLIs keep working against newer engines.
pub const RECOGNIZED_VARIABLES: &[&str] = &[
    VAR_PLATFORM_MANIFEST,
    VAR_BUILD_SCRIPT,
    VAR_PROJECT_CONFIG,
    VAR_ENV_NAME,
    VAR_TEST_RUN_NAME,
    VAR_UPLOAD_PORT,
    VAR_BUILD_CACHE_DIR,
];

pub type BuildVariableSet = BTreeMap<String, String>;

/// Compose the base variable set for one environment.
///
/// Always contains the environment name and the absolute config path. The
/// test-run name and upload port appear only when known; a CLI-supplied port
/// wins over the env option. Absent optionals are omitted entirely, never
/// set to an empty string.
pub fn compose_build_variables(
    env: &EnvConfig,
    config_path: &Path,
    test_run_name: Option<&str>,
    cli_upload_port: Option<&str>,
) -> BuildVariableSet {
    let mut vars = BuildVariableSet::new();
    vars.insert(VAR_ENV_NAME.to_string(), env.name.clone());
    vars.insert(
        VAR_PROJECT_CONFIG.to_string(),
        config_path.display().to_string(),
    );
    if let Some(name) = test_run_name {
        if !name.is_empty() {
            vars.insert(VAR_TEST_RUN_NAME.to_string(), name.to_string());
        }
    }
    let upload_port = cli_upload_port.or(env.upload_port.as_deref());
    if let Some(port) = upload_port {
        if !port.is_empty() {
            vars.insert(VAR_UPLOAD_PORT.to_string(), port.to_string());
        }
    }
    vars
}

/// Merge CLI `KEY=VALUE` overrides into `vars`, recognized keys only.
pub fn merge_recognized_overrides(vars: &mut BuildVariableSet, overrides: &[(String, String)]) {
    for (key, value) in overrides {
        if RECOGNIZED_VARIABLES.contains(&key.as_str()) {
            vars.insert(key.clone(), value.clone());
        }
    }
}

/// Parse a `KEY=VALUE` override from the command line.
pub fn parse_variable_override(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("invalid build variable '{}' (expected KEY=VALUE)", raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::BuildType;

    fn env(name: &str, upload_port: Option<&str>) -> EnvConfig {
        EnvConfig {
            name: name.to_string(),
            platform: Some("atmelavr".to_string()),
            board: Some("uno".to_string()),
            build_type: BuildType::Release,
            targets: Vec::new(),
            upload_port: upload_port.map(str::to_string),
            upload_protocol: None,
            extra_scripts: Vec::new(),
            build_vars: BTreeMap::new(),
            debug_tool: None,
            debug_port: None,
            debug_load_mode: None,
            debug_load_cmds: None,
            debug_init_break: None,
        }
    }

    #[test]
    fn composition_is_idempotent() {
        let env = env("uno", Some("/dev/ttyACM0"));
        let config = Path::new("/proj/firmware.toml");
        let first = compose_build_variables(&env, config, Some("blink"), None);
        let second = compose_build_variables(&env, config, Some("blink"), None);
        assert_eq!(first, second);
    }

    #[test]
    fn optional_keys_are_omitted_not_emptied() {
        let vars = compose_build_variables(&env("uno", None), Path::new("/p/firmware.toml"), None, None);
        assert_eq!(vars.get(VAR_ENV_NAME).map(String::as_str), Some("uno"));
        assert!(vars.contains_key(VAR_PROJECT_CONFIG));
        assert!(!vars.contains_key(VAR_TEST_RUN_NAME));
        assert!(!vars.contains_key(VAR_UPLOAD_PORT));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn cli_port_wins_over_env_option() {
        let env = env("uno", Some("/dev/ttyACM0"));
        let vars =
            compose_build_variables(&env, Path::new("/p/firmware.toml"), None, Some("/dev/ttyUSB9"));
        assert_eq!(
            vars.get(VAR_UPLOAD_PORT).map(String::as_str),
            Some("/dev/ttyUSB9")
        );
    }

    #[test]
    fn merge_keeps_recognized_and_drops_the_rest() {
        let mut vars = compose_build_variables(&env("uno", None), Path::new("/p/f.toml"), None, None);
        merge_recognized_overrides(
            &mut vars,
            &[
                (VAR_UPLOAD_PORT.to_string(), "/dev/ttyS5".to_string()),
                ("FUTURE_KNOB".to_string(), "on".to_string()),
            ],
        );
        assert_eq!(
            vars.get(VAR_UPLOAD_PORT).map(String::as_str),
            Some("/dev/ttyS5")
        );
        assert!(!vars.contains_key("FUTURE_KNOB"));
    }

    #[test]
    fn override_parsing() {
        assert_eq!(
            parse_variable_override("UPLOAD_PORT=/dev/ttyACM0").unwrap(),
            ("UPLOAD_PORT".to_string(), "/dev/ttyACM0".to_string())
        );
        assert_eq!(
            parse_variable_override("K=a=b").unwrap(),
            ("K".to_string(), "a=b".to_string())
        );
        assert!(parse_variable_override("NOEQUALS").is_err());
        assert!(parse_variable_override("=value").is_err());
    }
}
