//! Binary error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with help text.

use miette::Diagnostic;
use thiserror::Error;

use doorlock_config::ConfigError;
use doorlock_core::{CoreError, Target};

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum BridgeError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Invalid configuration: {source}")]
    #[diagnostic(
        code(doorlock::config),
        help(
            "Inspect the merged configuration with: doorlock config show\n\
             Config file: {path}"
        )
    )]
    Config {
        #[source]
        source: ConfigError,
        path: String,
    },

    // ── Device ───────────────────────────────────────────────────────

    #[error("Phone unavailable: {reason}")]
    #[diagnostic(
        code(doorlock::device_unavailable),
        help(
            "Check that the phone is on the network and adb over TCP is enabled.\n\
             Try: adb connect <device.serial>"
        )
    )]
    DeviceUnavailable { reason: String },

    #[error("{target} was not confirmed: {outcome}")]
    #[diagnostic(
        code(doorlock::not_confirmed),
        help(
            "The lock did not reach the requested state before the deadline.\n\
             Check the vendor app on the phone and the calibration settings."
        )
    )]
    NotConfirmed { target: Target, outcome: String },

    #[error("{target} failed after {attempts} attempts")]
    #[diagnostic(code(doorlock::command_timeout))]
    CommandTimeout { target: Target, attempts: u32 },

    // ── Broker ───────────────────────────────────────────────────────

    #[error("Broker error: {message}")]
    #[diagnostic(
        code(doorlock::bus),
        help("Check the [mqtt] host, port and credentials.")
    )]
    Bus { message: String },

    // ── Internal ─────────────────────────────────────────────────────

    #[error("{message}")]
    #[diagnostic(code(doorlock::internal))]
    Internal { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not encode output: {0}")]
    #[diagnostic(code(doorlock::json))]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn config(source: ConfigError, path: &std::path::Path) -> Self {
        Self::Config {
            source,
            path: path.display().to_string(),
        }
    }

    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_code::USAGE,
            Self::DeviceUnavailable { .. } | Self::Bus { .. } => exit_code::CONNECTION,
            Self::CommandTimeout { .. } => exit_code::TIMEOUT,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → BridgeError mapping ──────────────────────────────────

impl From<CoreError> for BridgeError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DeviceUnavailable { reason } => Self::DeviceUnavailable { reason },
            CoreError::CommandTimeout { target, attempts } => {
                Self::CommandTimeout { target, attempts }
            }
            CoreError::Bus { message } => Self::Bus { message },
            CoreError::Io(e) => Self::Io(e),
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}
