//! Command handlers.

pub mod config_cmd;
pub mod oneshot;
pub mod run;

use std::sync::Arc;

use doorlock_core::{AdbDevice, BridgeConfig, SerialDevice};

/// The phone, with every adb call serialized.
pub fn phone(config: &BridgeConfig) -> Arc<SerialDevice<AdbDevice>> {
    SerialDevice::new(AdbDevice::new(config.device.clone())).into_shared()
}
