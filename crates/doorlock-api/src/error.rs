use thiserror::Error;

/// Top-level error type for the `doorlock-api` crate.
///
/// Covers every failure mode of the two channels: spawning and running
/// `adb`, the device going away, and the MQTT client/connection.
/// `doorlock-core` maps these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── ADB ─────────────────────────────────────────────────────────
    /// The `adb` binary could not be started.
    #[error("failed to spawn adb: {0}")]
    Spawn(#[source] std::io::Error),

    /// The command did not finish within the channel ceiling.
    #[error("adb command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// `adb` exited non-zero.
    #[error("adb {command} failed (status {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// `adb connect` did not report a connection.
    #[error("device {serial} is not connected: {detail}")]
    NotConnected { serial: String, detail: String },

    /// `screencap` returned no bytes.
    #[error("screen capture returned no data")]
    EmptyCapture,

    // ── MQTT ────────────────────────────────────────────────────────
    /// The client request queue rejected the request.
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// The broker connection failed.
    #[error("MQTT connection error: {0}")]
    MqttConnection(String),
}

impl Error {
    /// Returns `true` if the device channel itself is the likely culprit
    /// and a reconnect might resolve it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NotConnected { .. } | Self::CommandFailed { .. }
        )
    }

    /// Returns `true` for errors raised by the broker side.
    pub fn is_bus(&self) -> bool {
        matches!(self, Self::Mqtt(_) | Self::MqttConnection(_))
    }
}
