//! Regression harness for kernel test cases.
//!
//! A run reads a TOML profile, expands the case manifests, and drives each
//! case (or one batch filter) through a target: a child process such as QEMU
//! or a libos binary, or a shell on a serial console. Console output is teed
//! to the terminal and a log file, watched for success and failure markers,
//! and finally aggregated into a pass/fail/timeout report that is compared
//! against the baseline lists.

pub mod boot_config;
pub mod classify;
pub mod config;
pub mod errors;
pub mod manifest;
pub mod orchestrator;
pub mod report;
pub mod session;
pub mod tee;
pub mod watcher;

pub use classify::{Classifier, Verdict};
pub use config::Profile;
pub use errors::HarnessError;
pub use manifest::{Manifest, TestCase};
pub use orchestrator::{Orchestrator, RunOptions};
pub use report::{Baseline, Outcome, Report, ResultSet};
