// ── Device controller ──
//
// The two primitives the bridge needs from the phone (capture and
// tap) plus the maintenance operations used around reboots. Callers
// share one `SerialDevice`, which admits a single device operation at
// a time so a background poll can never interleave with a drive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use doorlock_api::{AdbClient, AdbConfig, Point};

use crate::config::DeviceConfig;
use crate::error::CoreError;

/// Wait between starting the vendor app and answering its permission prompt.
const LAUNCH_PROMPT_DELAY: Duration = Duration::from_secs(5);
/// Wait after dismissing the Android lock screen.
const UNLOCK_SETTLE: Duration = Duration::from_secs(3);
const UNLOCK_SWIPE_MS: u32 = 300;

/// A raw PNG capture of the phone screen.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub png: Bytes,
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    pub fn new(png: Bytes) -> Self {
        Self {
            png,
            captured_at: Utc::now(),
        }
    }
}

/// Hot-path operations used by the drive and poll loops.
#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn capture(&self) -> Result<Screenshot, CoreError>;

    async fn tap(&self, at: Point) -> Result<(), CoreError>;

    /// Bring the device into a state where taps land on the lock app.
    async fn prepare(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Operations used by daily maintenance and start-up initialization.
#[async_trait]
pub trait DeviceMaintenance: Send + Sync {
    async fn reboot(&self) -> Result<(), CoreError>;

    /// Reconnect until the device answers, or give up after `max_wait`.
    async fn wait_until_online(&self, max_wait: Duration) -> Result<(), CoreError>;

    /// Dismiss the Android lock screen.
    async fn unlock_screen(&self) -> Result<(), CoreError>;

    /// Start the lock app if it is not the resumed activity.
    async fn ensure_app_running(&self) -> Result<(), CoreError>;

    /// Switch the panel off while leaving the app running.
    async fn screen_off(&self) -> Result<(), CoreError>;
}

// ── SerialDevice ─────────────────────────────────────────────────

/// Admits one device operation at a time.
pub struct SerialDevice<D> {
    inner: D,
    gate: Mutex<()>,
}

impl<D> SerialDevice<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl<D: DeviceController> DeviceController for SerialDevice<D> {
    async fn capture(&self) -> Result<Screenshot, CoreError> {
        let _guard = self.gate.lock().await;
        self.inner.capture().await
    }

    async fn tap(&self, at: Point) -> Result<(), CoreError> {
        let _guard = self.gate.lock().await;
        self.inner.tap(at).await
    }

    async fn prepare(&self) -> Result<(), CoreError> {
        let _guard = self.gate.lock().await;
        self.inner.prepare().await
    }
}

#[async_trait]
impl<D: DeviceMaintenance> DeviceMaintenance for SerialDevice<D> {
    async fn reboot(&self) -> Result<(), CoreError> {
        let _guard = self.gate.lock().await;
        self.inner.reboot().await
    }

    async fn wait_until_online(&self, max_wait: Duration) -> Result<(), CoreError> {
        let _guard = self.gate.lock().await;
        self.inner.wait_until_online(max_wait).await
    }

    async fn unlock_screen(&self) -> Result<(), CoreError> {
        let _guard = self.gate.lock().await;
        self.inner.unlock_screen().await
    }

    async fn ensure_app_running(&self) -> Result<(), CoreError> {
        let _guard = self.gate.lock().await;
        self.inner.ensure_app_running().await
    }

    async fn screen_off(&self) -> Result<(), CoreError> {
        let _guard = self.gate.lock().await;
        self.inner.screen_off().await
    }
}

// ── AdbDevice ────────────────────────────────────────────────────

/// The phone, reached over `adb`.
pub struct AdbDevice {
    client: AdbClient,
    config: DeviceConfig,
}

impl AdbDevice {
    pub fn new(config: DeviceConfig) -> Self {
        let client = AdbClient::new(AdbConfig {
            adb_path: config.adb_path.clone(),
            serial: config.serial.clone(),
            timeout: config.command_timeout,
        });
        Self { client, config }
    }

    pub fn client(&self) -> &AdbClient {
        &self.client
    }

    /// Run `op`; on a transient failure reconnect once and retry.
    async fn with_reconnect<T, F, Fut>(&self, op: F) -> Result<T, CoreError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T, doorlock_api::Error>> + Send,
        T: Send,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_transient() => {
                debug!(error = %e, "device call failed, reconnecting once");
                self.client.connect().await?;
                Ok(op().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn launch_app(&self, component: &str) -> Result<(), CoreError> {
        info!(component, "starting lock app");
        self.client.start_activity(component).await?;
        tokio::time::sleep(LAUNCH_PROMPT_DELAY).await;
        if let Some(ok) = self.config.launch_ok_tap {
            self.client.tap(ok).await?;
        }
        tokio::time::sleep(self.config.launch_settle).await;
        Ok(())
    }

    async fn ensure_foreground(&self) -> Result<(), CoreError> {
        let Some(component) = self.config.app_component.as_deref() else {
            return Ok(());
        };
        let resumed = self.with_reconnect(|| self.client.resumed_activity()).await?;
        if resumed.as_deref() == Some(component) {
            return Ok(());
        }
        debug!(resumed = ?resumed, "lock app is not in the foreground");
        self.launch_app(component).await
    }
}

#[async_trait]
impl DeviceController for AdbDevice {
    async fn capture(&self) -> Result<Screenshot, CoreError> {
        let png = self.with_reconnect(|| self.client.screencap()).await?;
        Ok(Screenshot::new(png))
    }

    async fn tap(&self, at: Point) -> Result<(), CoreError> {
        self.with_reconnect(|| self.client.tap(at)).await
    }

    async fn prepare(&self) -> Result<(), CoreError> {
        self.ensure_foreground().await
    }
}

#[async_trait]
impl DeviceMaintenance for AdbDevice {
    async fn reboot(&self) -> Result<(), CoreError> {
        info!(serial = self.client.serial(), "rebooting device");
        self.client.reboot().await?;
        Ok(())
    }

    async fn wait_until_online(&self, max_wait: Duration) -> Result<(), CoreError> {
        let started = tokio::time::Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.connect().await {
                Ok(()) => match self.client.shell("echo ok").await {
                    Ok(_) => {
                        info!(attempt, "device online");
                        return Ok(());
                    }
                    Err(e) => debug!(attempt, error = %e, "device connected but not responding"),
                },
                Err(e) => debug!(attempt, error = %e, "device connect failed"),
            }
            if attempt >= self.config.reconnect_attempts || started.elapsed() >= max_wait {
                warn!(attempt, "device did not come online");
                return Err(CoreError::device(format!(
                    "{} unreachable after {attempt} attempts",
                    self.client.serial()
                )));
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn unlock_screen(&self) -> Result<(), CoreError> {
        let (from, to) = self.config.unlock_swipe;
        self.client.swipe(from, to, UNLOCK_SWIPE_MS).await?;
        tokio::time::sleep(UNLOCK_SETTLE).await;
        Ok(())
    }

    async fn ensure_app_running(&self) -> Result<(), CoreError> {
        self.ensure_foreground().await
    }

    async fn screen_off(&self) -> Result<(), CoreError> {
        let Some(dex) = self.config.display_toggle_dex.as_deref() else {
            return Ok(());
        };
        let output = self
            .client
            .shell(&format!(
                "CLASSPATH={dex} app_process / DisplayToggle 0"
            ))
            .await?;
        if output.contains("Display mode: 0") {
            debug!("display switched off");
            Ok(())
        } else {
            Err(CoreError::device(format!(
                "display toggle did not confirm: {}",
                output.trim()
            )))
        }
    }
}
