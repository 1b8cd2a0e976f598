// ── Runtime bridge configuration ──
//
// The immutable record the core consumes at start-up. It carries
// calibration, timing policy, and channel settings, but never touches
// disk; `doorlock-config` builds it and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use secrecy::SecretString;

use doorlock_api::Point;

use crate::model::Signature;

/// Everything the bridge needs, grouped by concern.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub bus: BusConfig,
    pub device: DeviceConfig,
    pub calibration: Calibration,
    pub reconcile: ReconcilePolicy,
    pub maintenance: MaintenanceConfig,
}

// ── Broker ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Topics {
    /// Inbound `LOCK` / `UNLOCK`.
    pub command: String,
    /// Outbound, retained lock state.
    pub state: String,
    /// Inbound "observe now and republish".
    pub check: Option<String>,
    /// Inbound door/window sensor readings.
    pub sensor: Option<String>,
    /// Outbound persistent-failure notices.
    pub alert: Option<String>,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            command: "home/doorlock/set".into(),
            state: "home/doorlock/state".into(),
            check: Some("home/doorlock/check_status".into()),
            sensor: None,
            alert: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub credentials: Option<(String, SecretString)>,
    pub topics: Topics,
    /// Surface TRANSITIONING on the state topic while a command runs.
    pub publish_transitioning: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "192.168.11.5".into(),
            port: 21883,
            client_id: "doorlock-bridge".into(),
            keep_alive: Duration::from_secs(60),
            credentials: None,
            topics: Topics::default(),
            publish_transitioning: true,
        }
    }
}

// ── Device channel ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub adb_path: PathBuf,
    pub serial: String,
    /// Ceiling for a single `adb` invocation.
    pub command_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Vendor activity kept in the foreground, e.g. `com.alpha.lockapp/.MainActivity`.
    pub app_component: Option<String>,
    /// Button dismissing the launch-time Bluetooth permission prompt.
    pub launch_ok_tap: Option<Point>,
    /// Wait after the launch prompt for the app to link with the lock.
    pub launch_settle: Duration,
    /// Swipe that dismisses the Android lock screen after a reboot.
    pub unlock_swipe: (Point, Point),
    /// Path of the DisplayToggle dex used to switch the panel off.
    pub display_toggle_dex: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            serial: "192.168.11.135:5555".into(),
            command_timeout: Duration::from_secs(5),
            reconnect_attempts: 20,
            reconnect_delay: Duration::from_secs(5),
            app_component: Some("com.alpha.lockapp/.MainActivity".into()),
            launch_ok_tap: Some(Point::new(900, 1120)),
            launch_settle: Duration::from_secs(15),
            unlock_swipe: (Point::new(540, 1800), Point::new(540, 800)),
            display_toggle_dex: None,
        }
    }
}

// ── Calibration ──────────────────────────────────────────────────

/// Rectangle (device pixels) holding the app's lock-status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A known-good colour for one indicator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencePattern {
    pub signature: Signature,
    pub rgb: [u8; 3],
}

/// Screen-layout calibration for one phone + app version.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub lock_tap: Point,
    pub unlock_tap: Point,
    /// Dismisses the app's sleep overlay before reading or tapping.
    pub wake_tap: Option<Point>,
    pub region: Region,
    pub patterns: Vec<ReferencePattern>,
    /// Per-channel tolerance when comparing a pixel to a pattern.
    pub tolerance: u8,
    /// Fraction of region pixels that must match for a pattern to win.
    pub match_threshold: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            lock_tap: Point::new(330, 1200),
            unlock_tap: Point::new(750, 1200),
            wake_tap: Some(Point::new(530, 1440)),
            region: Region {
                x: 135,
                y: 375,
                width: 11,
                height: 11,
            },
            patterns: vec![
                ReferencePattern {
                    signature: Signature::Locked,
                    rgb: [0, 168, 135],
                },
                ReferencePattern {
                    signature: Signature::Unlocked,
                    rgb: [194, 23, 45],
                },
                ReferencePattern {
                    signature: Signature::Unlinked,
                    rgb: [130, 130, 130],
                },
            ],
            tolerance: 10,
            match_threshold: 0.6,
        }
    }
}

// ── Reconciliation policy ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Background observation period while idle.
    pub poll_interval: Duration,
    /// Spacing of reads (and extra taps) during a drive.
    pub drive_poll_interval: Duration,
    /// Total budget for one drive after its first tap.
    pub drive_deadline: Duration,
    /// Consecutive matching reads that confirm a drive.
    pub confirm_reads: u32,
    /// Extra taps a single drive may issue for a missed touch.
    pub max_extra_taps: u32,
    /// Consecutive timed-out drives before giving up on a command.
    pub retry_ceiling: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive agreeing background reads needed to adopt a change.
    pub debounce_reads: u32,
    /// Agreeing readings from an external sensor needed to adopt a change.
    pub sensor_reads: u32,
    /// Readings below this are data, not evidence.
    pub min_confidence: f32,
    /// Drop to UNKNOWN when nothing has confirmed the state for this long.
    pub stale_after: Option<Duration>,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            drive_poll_interval: Duration::from_millis(1500),
            drive_deadline: Duration::from_secs(18),
            confirm_reads: 2,
            max_extra_taps: 2,
            retry_ceiling: 3,
            backoff_initial: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
            debounce_reads: 2,
            sensor_reads: 1,
            min_confidence: 0.8,
            stale_after: None,
        }
    }
}

// ── Maintenance ──────────────────────────────────────────────────

/// Local-time hours during which background polls run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollWindow {
    pub start_hour: u32,
    pub stop_hour: u32,
}

impl PollWindow {
    /// Inclusive on both ends (`07:00 ..= 22:00`); wraps past midnight
    /// when `start_hour > stop_hour`.
    pub fn contains(&self, time: NaiveTime) -> bool {
        let start = NaiveTime::from_hms_opt(self.start_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        let stop = NaiveTime::from_hms_opt(self.stop_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        let time = time.with_nanosecond(0).unwrap_or(time);
        if self.start_hour <= self.stop_hour {
            start <= time && time <= stop
        } else {
            time >= start || time <= stop
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Local time of the daily device reboot.
    pub reboot_at: Option<NaiveTime>,
    pub poll_window: Option<PollWindow>,
    /// Where the last capture of a failed drive is written.
    pub failure_shot_dir: Option<PathBuf>,
    /// Grace period after issuing `reboot` before reconnecting.
    pub reboot_grace: Duration,
    /// Upper bound on waiting for the device to come back.
    pub reboot_wait: Duration,
    pub init_attempts: u32,
    pub init_retry_delay: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            reboot_at: NaiveTime::from_hms_opt(3, 0, 0),
            poll_window: Some(PollWindow {
                start_hour: 7,
                stop_hour: 22,
            }),
            failure_shot_dir: None,
            reboot_grace: Duration::from_secs(60),
            reboot_wait: Duration::from_secs(300),
            init_attempts: 3,
            init_retry_delay: Duration::from_secs(60),
        }
    }
}
