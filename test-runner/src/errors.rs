//! Errors produced by the harness.
//!
//! Two classes are fatal and abort the run before any case executes:
//! [`ManifestReadError`] and [`ConfigFormatError`]. Everything that goes wrong
//! inside a single case is folded into that case's outcome instead.

use std::{io, path::PathBuf};
use thiserror::Error;

/// A case manifest could not be read or parsed.
#[derive(Debug, Error)]
pub enum ManifestReadError {
    /// The manifest file could not be read.
    #[error("failed to read manifest `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },

    /// A JSON suite manifest did not have the expected shape.
    #[error("failed to parse suite manifest `{}`", path.display())]
    Suites {
        path: PathBuf,
        #[source]
        err: serde_json::Error,
    },
}

/// The boot-configuration template does not have the expected structure.
#[derive(Debug, Error)]
pub enum ConfigFormatError {
    #[error("no line starting with `{marker}` in boot config `{}`", path.display())]
    MarkerMissing { path: PathBuf, marker: String },

    #[error(
        "marker `{marker}` appears on {count} lines of boot config `{}` (expected exactly one)",
        path.display()
    )]
    MarkerAmbiguous {
        path: PathBuf,
        marker: String,
        count: usize,
    },

    #[error("failed to read boot config template `{}`", path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to write boot config to `{}`", path.display())]
    Write {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
}

/// The target environment could not be started for a case.
///
/// This is never fatal for the run: the affected case is recorded as failed.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("program `{program}` not found on PATH")]
    ProgramNotFound {
        program: String,
        #[source]
        err: which::Error,
    },

    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        err: io::Error,
    },

    #[error("failed to open serial device `{}`", device.display())]
    SerialOpen {
        device: PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("serial console did not show idle prompt `{prompt}` within {waited_secs}s")]
    Resync { prompt: String, waited_secs: u64 },

    #[error("failed to send invocation to serial console")]
    SerialWrite(#[source] io::Error),

    #[error("serial console closed")]
    SerialClosed,
}

/// An error in the harness profile itself.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile `{}`", path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to parse profile `{}`", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },

    #[error("invalid marker pattern `{pattern}`")]
    Pattern {
        pattern: String,
        #[source]
        err: regex::Error,
    },

    #[error("profile has no case source: set one of `cases.manifest`, `cases.all` or `cases.suites`")]
    NoCases,
}

/// Setup errors that abort the run before any case executes.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Manifest(#[from] ManifestReadError),

    #[error(transparent)]
    ConfigFormat(#[from] ConfigFormatError),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}
