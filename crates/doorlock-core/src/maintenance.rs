// ── Device maintenance ──
//
// Start-up initialization and the daily reboot cycle. The phone's
// Bluetooth stack and the vendor app degrade over days, so once a day
// the device is rebooted and brought back to a known state: screen
// unlocked, lock app in the foreground, panel off. Background polling
// is paused for the duration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MaintenanceConfig;
use crate::device::DeviceMaintenance;
use crate::engine::{ControlState, Engine};
use crate::error::CoreError;

/// Longest wait for an in-flight command before rebooting anyway.
const IDLE_WAIT: Duration = Duration::from_secs(120);

/// Time from `now` until the next occurrence of `at` (tomorrow if `at`
/// is not strictly in the future today).
pub fn until_next(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let today = now.date().and_time(at);
    let next = if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

pub struct Maintenance {
    device: Arc<dyn DeviceMaintenance>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(device: Arc<dyn DeviceMaintenance>, config: MaintenanceConfig) -> Self {
        Self { device, config }
    }

    /// One initialization pass: reconnect, unlock the screen, bring the
    /// lock app up, switch the panel off.
    pub async fn initialize(&self) -> Result<(), CoreError> {
        self.device.wait_until_online(self.config.reboot_wait).await?;
        self.device.unlock_screen().await?;
        self.device.ensure_app_running().await?;
        if let Err(e) = self.device.screen_off().await {
            warn!(error = %e, "could not switch the display off");
        }
        Ok(())
    }

    /// `initialize`, retried up to `init_attempts` times.
    pub async fn initialize_with_retries(&self) -> Result<(), CoreError> {
        let attempts = self.config.init_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.initialize().await {
                Ok(()) => {
                    info!(attempt, "device initialized");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "device initialization failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.init_retry_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CoreError::device("initialization never ran")))
    }

    /// Reboot, wait, and re-initialize. Polling is paused throughout.
    pub async fn reboot_cycle(&self, engine: &Engine) -> Result<(), CoreError> {
        let mut control = engine.subscribe_control();
        let idle = tokio::time::timeout(IDLE_WAIT, control.wait_for(|c| *c == ControlState::Idle))
            .await
            .is_ok_and(|r| r.is_ok());
        if !idle {
            warn!("command still running, rebooting anyway");
        }

        engine.pause_polling(true);
        let result = async {
            self.device.reboot().await?;
            tokio::time::sleep(self.config.reboot_grace).await;
            self.initialize_with_retries().await
        }
        .await;
        engine.pause_polling(false);

        if let Err(e) = engine.check_status().await {
            warn!(error = %e, "could not request a post-maintenance read");
        }
        result
    }

    /// Run the daily reboot at `reboot_at` local time until cancelled.
    pub async fn run_daily(&self, engine: Engine, cancel: CancellationToken) {
        let Some(at) = self.config.reboot_at else {
            return;
        };
        loop {
            let wait = until_next(Local::now().naive_local(), at);
            info!(at = %at, wait_secs = wait.as_secs(), "next device reboot scheduled");
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
            info!("daily maintenance starting");
            match self.reboot_cycle(&engine).await {
                Ok(()) => info!("daily maintenance finished"),
                Err(e) => error!(error = %e, "daily maintenance failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;

    fn at(date: (i32, u32, u32), h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .and_then(|d| d.and_hms_opt(h, m, 0))
            .expect("valid datetime")
    }

    fn three_am() -> NaiveTime {
        NaiveTime::from_hms_opt(3, 0, 0).expect("valid time")
    }

    #[test]
    fn next_reboot_later_today() {
        let now = at((2024, 5, 1), 1, 30);
        assert_eq!(until_next(now, three_am()), Duration::from_secs(90 * 60));
    }

    #[test]
    fn next_reboot_tomorrow() {
        let now = at((2024, 5, 1), 3, 0);
        assert_eq!(until_next(now, three_am()), Duration::from_secs(24 * 3600));

        let now = at((2024, 12, 31), 22, 0);
        assert_eq!(until_next(now, three_am()), Duration::from_secs(5 * 3600));
    }

    /// Records calls; fails `wait_until_online` for the first `flaky` calls.
    struct ScriptedPhone {
        calls: Mutex<Vec<&'static str>>,
        flaky: Mutex<u32>,
    }

    impl ScriptedPhone {
        fn new(flaky: u32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                flaky: Mutex::new(flaky),
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().expect("lock").push(call);
        }
    }

    #[async_trait]
    impl DeviceMaintenance for ScriptedPhone {
        async fn reboot(&self) -> Result<(), CoreError> {
            self.record("reboot");
            Ok(())
        }

        async fn wait_until_online(&self, _max_wait: Duration) -> Result<(), CoreError> {
            self.record("online");
            let mut flaky = self.flaky.lock().expect("lock");
            if *flaky > 0 {
                *flaky -= 1;
                return Err(CoreError::device("offline"));
            }
            Ok(())
        }

        async fn unlock_screen(&self) -> Result<(), CoreError> {
            self.record("unlock_screen");
            Ok(())
        }

        async fn ensure_app_running(&self) -> Result<(), CoreError> {
            self.record("app");
            Ok(())
        }

        async fn screen_off(&self) -> Result<(), CoreError> {
            self.record("screen_off");
            Err(CoreError::device("no dex"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_retries_then_succeeds() {
        let phone = Arc::new(ScriptedPhone::new(2));
        let maintenance = Maintenance::new(phone.clone(), MaintenanceConfig::default());
        maintenance
            .initialize_with_retries()
            .await
            .expect("third attempt succeeds");
        assert_eq!(
            *phone.calls.lock().expect("lock"),
            vec!["online", "online", "online", "unlock_screen", "app", "screen_off"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_gives_up_after_configured_attempts() {
        let phone = Arc::new(ScriptedPhone::new(10));
        let maintenance = Maintenance::new(phone.clone(), MaintenanceConfig::default());
        let result = maintenance.initialize_with_retries().await;
        assert!(matches!(result, Err(CoreError::DeviceUnavailable { .. })));
        assert_eq!(phone.calls.lock().expect("lock").len(), 3);
    }
}
