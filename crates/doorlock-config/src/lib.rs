//! Configuration for the door-lock bridge.
//!
//! TOML file + `DOORLOCK_*` environment, credential resolution, and
//! translation to `doorlock_core::BridgeConfig`. The binary adds its
//! CLI-flag overrides on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use doorlock_core::{
    BridgeConfig, BusConfig, Calibration, DeviceConfig, MaintenanceConfig, Point, PollWindow,
    ReconcilePolicy, ReferencePattern, Region, Signature, Topics,
};

/// Environment variable consulted for the broker password.
pub const PASSWORD_ENV: &str = "DOORLOCK_MQTT_PASSWORD";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub device: DeviceSection,
    pub calibration: CalibrationSection,
    pub reconcile: ReconcileSection,
    pub maintenance: MaintenanceSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    /// Plaintext password (prefer `password_env` or `DOORLOCK_MQTT_PASSWORD`).
    pub password: Option<String>,
    /// Environment variable name containing the password.
    pub password_env: Option<String>,
    pub topics: TopicsSection,
    /// Surface TRANSITIONING on the state topic while a command runs.
    pub publish_transitioning: bool,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "192.168.11.5".into(),
            port: 21883,
            client_id: "doorlock-bridge".into(),
            keep_alive_secs: 60,
            username: None,
            password: None,
            password_env: None,
            topics: TopicsSection::default(),
            publish_transitioning: true,
        }
    }
}

/// Empty strings disable the optional topics.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TopicsSection {
    pub command: String,
    pub state: String,
    pub check: Option<String>,
    pub sensor: Option<String>,
    pub alert: Option<String>,
}

impl Default for TopicsSection {
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

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceSection {
    /// `host:port` of the phone's adb daemon.
    pub serial: String,
    pub adb_path: PathBuf,
    pub command_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    /// Activity kept in the foreground. Empty disables the check.
    pub app_component: String,
    /// Button on the app's launch-time permission prompt.
    pub launch_ok_tap: Option<[u32; 2]>,
    pub launch_settle_secs: u64,
    pub unlock_swipe_from: [u32; 2],
    pub unlock_swipe_to: [u32; 2],
    /// DisplayToggle dex on the phone, used to switch the panel off.
    pub display_toggle_dex: Option<String>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            serial: "192.168.11.135:5555".into(),
            adb_path: PathBuf::from("adb"),
            command_timeout_secs: 5,
            reconnect_attempts: 20,
            reconnect_delay_secs: 5,
            app_component: "com.alpha.lockapp/.MainActivity".into(),
            launch_ok_tap: Some([900, 1120]),
            launch_settle_secs: 15,
            unlock_swipe_from: [540, 1800],
            unlock_swipe_to: [540, 800],
            display_toggle_dex: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CalibrationSection {
    pub lock_tap: [u32; 2],
    pub unlock_tap: [u32; 2],
    pub wake_tap: Option<[u32; 2]>,
    pub region: RegionSection,
    pub patterns: PatternsSection,
    pub tolerance: u8,
    pub match_threshold: f32,
    pub min_confidence: f32,
}

impl Default for CalibrationSection {
    fn default() -> Self {
        Self {
            lock_tap: [330, 1200],
            unlock_tap: [750, 1200],
            wake_tap: Some([530, 1440]),
            region: RegionSection::default(),
            patterns: PatternsSection::default(),
            tolerance: 10,
            match_threshold: 0.6,
            min_confidence: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegionSection {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for RegionSection {
    fn default() -> Self {
        Self {
            x: 135,
            y: 375,
            width: 11,
            height: 11,
        }
    }
}

/// Reference colours as `[r, g, b]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PatternsSection {
    pub locked: [u8; 3],
    pub unlocked: [u8; 3],
    /// The app's "not connected to the lock" indicator.
    pub unlinked: Option<[u8; 3]>,
    /// The app's in-progress indicator.
    pub loading: Option<[u8; 3]>,
}

impl Default for PatternsSection {
    fn default() -> Self {
        Self {
            locked: [0, 168, 135],
            unlocked: [194, 23, 45],
            unlinked: Some([130, 130, 130]),
            loading: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub poll_interval_secs: u64,
    pub drive_poll_interval_ms: u64,
    pub drive_deadline_secs: u64,
    pub confirm_reads: u32,
    pub max_extra_taps: u32,
    pub retry_ceiling: u32,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    pub debounce_reads: u32,
    /// Readings pushed on the sensor topic that must agree.
    pub sensor_reads: u32,
    /// 0 disables the staleness policy.
    pub stale_after_secs: u64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            drive_poll_interval_ms: 1500,
            drive_deadline_secs: 18,
            confirm_reads: 2,
            max_extra_taps: 2,
            retry_ceiling: 3,
            backoff_initial_secs: 2,
            backoff_max_secs: 30,
            debounce_reads: 2,
            sensor_reads: 1,
            stale_after_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceSection {
    /// Local `HH:MM` of the daily reboot. Empty disables it.
    pub reboot_at: String,
    pub poll_window: PollWindowSection,
    pub failure_shot_dir: Option<PathBuf>,
    pub init_attempts: u32,
    pub init_retry_delay_secs: u64,
    pub reboot_grace_secs: u64,
    pub reboot_wait_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            reboot_at: "03:00".into(),
            poll_window: PollWindowSection::default(),
            failure_shot_dir: None,
            init_attempts: 3,
            init_retry_delay_secs: 60,
            reboot_grace_secs: 60,
            reboot_wait_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollWindowSection {
    pub enabled: bool,
    pub start_hour: u32,
    pub stop_hour: u32,
}

impl Default for PollWindowSection {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 7,
            stop_hour: 22,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when neither `RUST_LOG` nor `-v` is given.
    pub level: String,
    /// Enables a daily-rotated log file in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: None,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "doorlock", "doorlock").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("doorlock");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file, then `DOORLOCK_*` (nested with `__`,
/// e.g. `DOORLOCK_MQTT__HOST`).
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DOORLOCK_").split("__"))
}

/// Load the full Config from `path` (or the platform default) + environment.
/// A missing file is not an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    Ok(config)
}

/// Pretty TOML for display, with the password redacted.
pub fn to_display_toml(config: &Config) -> Result<String, ConfigError> {
    let mut shown = config.clone();
    if shown.mqtt.password.is_some() {
        shown.mqtt.password = Some("********".into());
    }
    Ok(toml::to_string_pretty(&shown)?)
}

// ── Credential resolution ───────────────────────────────────────────

/// Broker password: `password_env` → `DOORLOCK_MQTT_PASSWORD` → plaintext.
pub fn resolve_password(mqtt: &MqttSection) -> Option<SecretString> {
    if let Some(ref env_name) = mqtt.password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Some(SecretString::from(val));
        }
    }
    if let Ok(val) = std::env::var(PASSWORD_ENV) {
        return Some(SecretString::from(val));
    }
    mqtt.password.clone().map(SecretString::from)
}

// ── Translation ─────────────────────────────────────────────────────

/// `"HH:MM"` → `NaiveTime`. Empty means disabled.
pub fn parse_reboot_at(value: &str) -> Result<Option<NaiveTime>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    NaiveTime::parse_from_str(value, "%H:%M")
        .map(Some)
        .map_err(|_| invalid("maintenance.reboot_at", format!("expected HH:MM, got '{value}'")))
}

fn point([x, y]: [u32; 2]) -> Point {
    Point::new(x, y)
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty()).cloned()
}

fn check_fraction(field: &str, value: f32) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must be in (0, 1], got {value}")))
    }
}

impl Config {
    /// Validate and build the runtime record the core consumes.
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        Ok(BridgeConfig {
            bus: self.bus_config()?,
            device: self.device_config(),
            calibration: self.calibration()?,
            reconcile: self.reconcile_policy()?,
            maintenance: self.maintenance_config()?,
        })
    }

    fn bus_config(&self) -> Result<BusConfig, ConfigError> {
        let mqtt = &self.mqtt;
        if mqtt.host.trim().is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if mqtt.topics.command.trim().is_empty() || mqtt.topics.state.trim().is_empty() {
            return Err(invalid("mqtt.topics", "command and state topics are required"));
        }
        let credentials = match (&mqtt.username, resolve_password(mqtt)) {
            (Some(user), Some(password)) => Some((user.clone(), password)),
            (Some(user), None) => Some((user.clone(), SecretString::from(String::new()))),
            (None, _) => None,
        };
        Ok(BusConfig {
            host: mqtt.host.clone(),
            port: mqtt.port,
            client_id: mqtt.client_id.clone(),
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
            credentials,
            topics: Topics {
                command: mqtt.topics.command.clone(),
                state: mqtt.topics.state.clone(),
                check: non_empty(mqtt.topics.check.as_ref()),
                sensor: non_empty(mqtt.topics.sensor.as_ref()),
                alert: non_empty(mqtt.topics.alert.as_ref()),
            },
            publish_transitioning: mqtt.publish_transitioning,
        })
    }

    fn device_config(&self) -> DeviceConfig {
        let device = &self.device;
        DeviceConfig {
            adb_path: device.adb_path.clone(),
            serial: device.serial.clone(),
            command_timeout: Duration::from_secs(device.command_timeout_secs),
            reconnect_attempts: device.reconnect_attempts,
            reconnect_delay: Duration::from_secs(device.reconnect_delay_secs),
            app_component: non_empty(Some(&device.app_component)),
            launch_ok_tap: device.launch_ok_tap.map(point),
            launch_settle: Duration::from_secs(device.launch_settle_secs),
            unlock_swipe: (point(device.unlock_swipe_from), point(device.unlock_swipe_to)),
            display_toggle_dex: non_empty(device.display_toggle_dex.as_ref()),
        }
    }

    fn calibration(&self) -> Result<Calibration, ConfigError> {
        let cal = &self.calibration;
        if cal.region.width == 0 || cal.region.height == 0 {
            return Err(invalid("calibration.region", "width and height must be non-zero"));
        }
        check_fraction("calibration.match_threshold", cal.match_threshold)?;

        let mut patterns = vec![
            ReferencePattern {
                signature: Signature::Locked,
                rgb: cal.patterns.locked,
            },
            ReferencePattern {
                signature: Signature::Unlocked,
                rgb: cal.patterns.unlocked,
            },
        ];
        if let Some(rgb) = cal.patterns.unlinked {
            patterns.push(ReferencePattern {
                signature: Signature::Unlinked,
                rgb,
            });
        }
        if let Some(rgb) = cal.patterns.loading {
            patterns.push(ReferencePattern {
                signature: Signature::Loading,
                rgb,
            });
        }

        Ok(Calibration {
            lock_tap: point(cal.lock_tap),
            unlock_tap: point(cal.unlock_tap),
            wake_tap: cal.wake_tap.map(point),
            region: Region {
                x: cal.region.x,
                y: cal.region.y,
                width: cal.region.width,
                height: cal.region.height,
            },
            patterns,
            tolerance: cal.tolerance,
            match_threshold: cal.match_threshold,
        })
    }

    fn reconcile_policy(&self) -> Result<ReconcilePolicy, ConfigError> {
        let r = &self.reconcile;
        if r.retry_ceiling == 0 {
            return Err(invalid("reconcile.retry_ceiling", "must be at least 1"));
        }
        if r.confirm_reads == 0 {
            return Err(invalid("reconcile.confirm_reads", "must be at least 1"));
        }
        if r.poll_interval_secs == 0 || r.drive_poll_interval_ms == 0 {
            return Err(invalid("reconcile", "poll intervals must be non-zero"));
        }
        if r.drive_deadline_secs == 0 {
            return Err(invalid("reconcile.drive_deadline_secs", "must be non-zero"));
        }
        check_fraction("calibration.min_confidence", self.calibration.min_confidence)?;

        Ok(ReconcilePolicy {
            poll_interval: Duration::from_secs(r.poll_interval_secs),
            drive_poll_interval: Duration::from_millis(r.drive_poll_interval_ms),
            drive_deadline: Duration::from_secs(r.drive_deadline_secs),
            confirm_reads: r.confirm_reads,
            max_extra_taps: r.max_extra_taps,
            retry_ceiling: r.retry_ceiling,
            backoff_initial: Duration::from_secs(r.backoff_initial_secs),
            backoff_max: Duration::from_secs(r.backoff_max_secs),
            debounce_reads: r.debounce_reads.max(1),
            sensor_reads: r.sensor_reads.max(1),
            min_confidence: self.calibration.min_confidence,
            stale_after: (r.stale_after_secs > 0).then(|| Duration::from_secs(r.stale_after_secs)),
        })
    }

    fn maintenance_config(&self) -> Result<MaintenanceConfig, ConfigError> {
        let m = &self.maintenance;
        let window = m.poll_window;
        if window.start_hour > 23 || window.stop_hour > 23 {
            return Err(invalid(
                "maintenance.poll_window",
                format!(
                    "hours must be 0-23, got {}-{}",
                    window.start_hour, window.stop_hour
                ),
            ));
        }
        Ok(MaintenanceConfig {
            reboot_at: parse_reboot_at(&m.reboot_at)?,
            poll_window: window.enabled.then_some(PollWindow {
                start_hour: window.start_hour,
                stop_hour: window.stop_hour,
            }),
            failure_shot_dir: m.failure_shot_dir.clone(),
            reboot_grace: Duration::from_secs(m.reboot_grace_secs),
            reboot_wait: Duration::from_secs(m.reboot_wait_secs),
            init_attempts: m.init_attempts.max(1),
            init_retry_delay: Duration::from_secs(m.init_retry_delay_secs),
        })
    }
}
