// doorlock-api: async clients for the two external channels of the bridge.
//
// `adb` drives the Android phone (taps, swipes, screen captures, activity
// management) by shelling out to the `adb` binary. `mqtt` maintains the
// broker session and forwards inbound publishes. Neither module knows
// anything about locks.

pub mod adb;
pub mod backoff;
pub mod error;
pub mod mqtt;

pub use adb::{AdbClient, AdbConfig, Point};
pub use backoff::ReconnectConfig;
pub use error::Error;
pub use mqtt::{BusClient, BusOptions, InboundMessage, LastWillMessage};
