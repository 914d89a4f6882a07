//! Error taxonomy for the watch daemon.
//!
//! Only [`ConfigError`] is fatal. Everything else is scoped to a single
//! application (or to one alert batch) and is logged, never propagated out of
//! the supervision loop.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Startup configuration problems. The daemon refuses to run with any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config section [main] is missing")]
    MissingMain,

    #[error("section [{section}]: {message}")]
    InvalidSection { section: String, message: String },

    #[error("option {option}: {message}")]
    InvalidOption { option: &'static str, message: String },

    #[error("application '{0}' is declared more than once")]
    DuplicateApp(String),

    #[error("application '{0}' has no command")]
    MissingCommand(String),

    #[error("no applications configured")]
    NoApps,
}

/// Why a liveness probe produced no observation.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot run process lister: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("process lister failed: {0}")]
    Output(String),
}

/// A restart attempt that did not produce a child process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable '{command}' not found: {source}")]
    NotFound {
        command: String,
        #[source]
        source: which::Error,
    },

    #[error("cannot spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Alert delivery failure. Logged; the loop keeps going.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("cannot start mail relay {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("writing to mail relay failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("mail relay exited with {0}")]
    Relay(std::process::ExitStatus),

    #[error("mail relay did not finish within {0:?}, killed")]
    Timeout(Duration),
}
