//! Orchestrator error kinds.
//!
//! Most of the crate reports failures through `anyhow` with call-site context.
//! The variants here exist because their *kind* matters: the platform resolver
//! retries on [`FwError::UnknownPlatform`], device-rule problems must stay
//! warnings, and the CLI maps config mistakes to clean one-line messages.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FwError {
    /// No platform with this id is installed under the platforms root.
    #[error("unknown platform '{id}'")]
    UnknownPlatform { id: String },

    /// The environment section declares no `platform` option.
    #[error("environment '{env}' does not declare a platform")]
    UndefinedEnvPlatform { env: String },

    /// Requested environments that the project config does not declare.
    #[error("unknown environments: {}", names.join(", "))]
    UnknownEnvironments { names: Vec<String> },

    /// Debugging needs both `platform` and `board`; one or both are missing.
    #[error("environment '{env}' is not debuggable (missing: {})", missing.join(", "))]
    EnvNotDebuggable { env: String, missing: Vec<String> },

    /// The debug flow could not assemble a usable configuration.
    #[error("invalid debug configuration: {0}")]
    InvalidDebugConfig(String),

    /// The program artifact is absent where the debugger expects it.
    #[error("firmware program is missing: {path}")]
    MissingProgram { path: PathBuf },

    /// Device access rules are not installed. Never fatal; callers print a
    /// warning and continue.
    #[error("{0}")]
    DeviceRules(String),
}

impl FwError {
    /// True for errors the debug flow downgrades to a warning.
    pub fn is_warning(&self) -> bool {
        matches!(self, FwError::DeviceRules(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_identifiers() {
        let e = FwError::UnknownPlatform {
            id: "atmelavr".into(),
        };
        assert!(e.to_string().contains("atmelavr"));

        let e = FwError::UnknownEnvironments {
            names: vec!["uno".into(), "mega".into()],
        };
        assert!(e.to_string().contains("uno, mega"));
    }

    #[test]
    fn only_device_rules_is_a_warning() {
        assert!(FwError::DeviceRules("no rules".into()).is_warning());
        assert!(!FwError::UndefinedEnvPlatform { env: "uno".into() }.is_warning());
    }
}
