//! Lock-state reconciliation between a door lock's Android app and a
//! message bus.
//!
//! The lock has no API: commands are screen taps and state is read off
//! screen captures. This crate turns those two unreliable channels into a
//! single published source of truth:
//!
//! - **[`Engine`]**: Owns the [`ReconciliationSession`] on one event-loop
//!   task. Accepts commands and observations, runs the [`CommandDriver`],
//!   applies retry/backoff, supersede, debounce and staleness policy, and
//!   publishes every change of [`LockState`].
//!
//! - **[`CommandDriver`]**: Taps the lock/unlock button and reads the
//!   screen until two consecutive confident reads confirm the target or
//!   the deadline passes.
//!
//! - **[`StateExtractor`]**: Classifies the calibrated indicator region of
//!   a capture against reference colours. Never fails; bad input is an
//!   UNKNOWN [`Observation`].
//!
//! - **[`DeviceController`]**: Capture and tap, serialized through
//!   [`SerialDevice`]. [`AdbDevice`] is the real phone.
//!
//! - **[`BusGateway`]**: Parses inbound broker traffic and drops anything
//!   malformed. [`MqttPublisher`] writes the retained state topic.
//!
//! - **[`Maintenance`]**: Start-up initialization and the daily reboot.

pub mod config;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod gateway;
pub mod maintenance;
pub mod model;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{
    BridgeConfig, BusConfig, Calibration, DeviceConfig, MaintenanceConfig, PollWindow,
    ReconcilePolicy, ReferencePattern, Region, Topics,
};
pub use device::{AdbDevice, DeviceController, DeviceMaintenance, Screenshot, SerialDevice};
pub use driver::CommandDriver;
pub use engine::{ControlState, Effect, Engine, ReconciliationSession};
pub use error::CoreError;
pub use extractor::StateExtractor;
pub use gateway::{BusGateway, Inbound, MqttPublisher, StatePublisher};
pub use maintenance::Maintenance;
pub use model::{
    CommandRequest, DriveOutcome, FailureNotice, LockState, Observation, ObservationSource,
    RunId, Signature, Target,
};
pub use stream::StateStream;

pub use doorlock_api::Point;
