//! Compatibility-test harness for compile-time instrumentation.
//!
//! This crate provides:
//! - Case model and registry: General, Muzzle and LatestDepth checks
//! - Version matrix resolution over dependency releases and local toolchains
//! - Ephemeral backing services with guaranteed teardown
//! - Instrumentation driving, artifact execution and static surface checks
//! - A dispatcher that runs every (case, combination) on a bounded pool and
//!   aggregates a markdown + JSON report with a JSONL structured log

#![forbid(unsafe_code)]

pub mod case;
pub mod cases;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod execute;
pub mod instrument;
pub mod muzzle;
pub mod process;
pub mod provision;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod result;
pub mod structured_log;
pub mod version;

pub use case::{CaseKind, CaseVariant, EnvVars, TestCase};
pub use config::HarnessConfig;
pub use context::{CaseContext, Stage};
pub use dispatcher::{Collaborators, Dispatcher};
pub use error::{FailureKind, HarnessError, HarnessResult};
pub use registry::CaseRegistry;
pub use report::CompatReport;
pub use resolver::{Resolver, VersionCombination};
pub use result::{CaseResult, CaseStatus};
