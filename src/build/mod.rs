//! Build orchestration.
//!
//! This module provides:
//! - [`layout`] - deterministic per-environment directory layout
//! - [`variables`] - the variable set handed to the build engine
//! - [`context`] - once-per-invocation build context and target plans
//! - [`scripts`] - project extension hooks around the engine
//! - [`processor`] - the per-environment engine run

pub mod context;
pub mod layout;
pub mod processor;
pub mod scripts;
pub mod variables;

pub use context::{BuildContext, EnvBuildSetup, RunOptions, TargetPlan};
pub use processor::EnvironmentProcessor;
