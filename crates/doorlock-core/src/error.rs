// ── Core error types ──
//
// Domain errors from doorlock-core. Consumers never see adb exit codes
// or rumqttc internals directly: the `From<doorlock_api::Error>` impl
// folds every device-channel failure into `DeviceUnavailable` and every
// broker failure into `Bus`.
//
// Extraction ambiguity is deliberately absent: a low-confidence read is
// an `Observation`, not an error.

use thiserror::Error;

use crate::model::Target;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Device ───────────────────────────────────────────────────────
    #[error("Device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    // ── Commands ─────────────────────────────────────────────────────
    #[error("Command {target} not confirmed after {attempts} attempts")]
    CommandTimeout { target: Target, attempts: u32 },

    // ── Bus ──────────────────────────────────────────────────────────
    #[error("Malformed message on {topic}: {reason}")]
    MalformedMessage { topic: String, reason: String },

    #[error("Broker error: {message}")]
    Bus { message: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Reconciliation engine is not running")]
    EngineStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn device(reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            reason: reason.into(),
        }
    }
}

// ── Conversion from channel-layer errors ─────────────────────────────

impl From<doorlock_api::Error> for CoreError {
    fn from(err: doorlock_api::Error) -> Self {
        if err.is_bus() {
            return CoreError::Bus {
                message: err.to_string(),
            };
        }
        match err {
            doorlock_api::Error::Timeout { timeout_ms } => CoreError::DeviceUnavailable {
                reason: format!("device channel timed out after {timeout_ms}ms"),
            },
            doorlock_api::Error::Spawn(e) => CoreError::DeviceUnavailable {
                reason: format!("cannot run adb: {e}"),
            },
            other => CoreError::DeviceUnavailable {
                reason: other.to_string(),
            },
        }
    }
}
