//! ADB device channel.
//!
//! Every operation shells out to the `adb` binary against a single
//! network-attached device (`host:port` serial). Each invocation is bounded
//! by [`AdbConfig::timeout`]; a child that overruns is killed when its
//! future is dropped.
//!
//! Delivery is best-effort: a tap that returns `Ok` was handed to the
//! device's input service, not necessarily seen by the app. Callers verify
//! through a fresh capture.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::process::Command;

use crate::error::Error;

/// A screen coordinate in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Connection settings for one device.
#[derive(Debug, Clone)]
pub struct AdbConfig {
    /// Path to (or name of) the `adb` executable.
    pub adb_path: PathBuf,
    /// Device serial, e.g. `192.168.11.135:5555`.
    pub serial: String,
    /// Ceiling applied to every individual `adb` invocation.
    pub timeout: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            serial: "127.0.0.1:5555".into(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Thin async wrapper over the `adb` CLI. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AdbClient {
    config: Arc<AdbConfig>,
}

impl AdbClient {
    pub fn new(config: AdbConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn serial(&self) -> &str {
        &self.config.serial
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Run `adb connect <serial>` and check that the device answered.
    pub async fn connect(&self) -> Result<(), Error> {
        let output = self.run(&["connect", &self.config.serial], false).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if connect_succeeded(&stdout) {
            tracing::debug!(serial = %self.config.serial, "adb connected");
            Ok(())
        } else {
            Err(Error::NotConnected {
                serial: self.config.serial.clone(),
                detail: stdout.trim().to_owned(),
            })
        }
    }

    // ── Input ───────────────────────────────────────────────────────

    pub async fn tap(&self, at: Point) -> Result<(), Error> {
        let (x, y) = (at.x.to_string(), at.y.to_string());
        self.run(&["shell", "input", "tap", &x, &y], true).await?;
        Ok(())
    }

    pub async fn swipe(&self, from: Point, to: Point, duration_ms: u32) -> Result<(), Error> {
        let args = [
            from.x.to_string(),
            from.y.to_string(),
            to.x.to_string(),
            to.y.to_string(),
            duration_ms.to_string(),
        ];
        let mut argv = vec!["shell", "input", "swipe"];
        argv.extend(args.iter().map(String::as_str));
        self.run(&argv, true).await?;
        Ok(())
    }

    // ── Capture ─────────────────────────────────────────────────────

    /// Capture the screen as PNG bytes (`exec-out screencap -p`).
    pub async fn screencap(&self) -> Result<Bytes, Error> {
        let output = self.run(&["exec-out", "screencap", "-p"], true).await?;
        if output.stdout.is_empty() {
            return Err(Error::EmptyCapture);
        }
        Ok(Bytes::from(output.stdout))
    }

    // ── Activity / system ───────────────────────────────────────────

    /// The component of the currently resumed activity, if any.
    pub async fn resumed_activity(&self) -> Result<Option<String>, Error> {
        let dump = self.shell("dumpsys activity activities").await?;
        Ok(parse_resumed_activity(&dump))
    }

    /// `am start -n <component>`.
    pub async fn start_activity(&self, component: &str) -> Result<(), Error> {
        self.run(&["shell", "am", "start", "-n", component], true)
            .await?;
        Ok(())
    }

    pub async fn reboot(&self) -> Result<(), Error> {
        self.run(&["reboot"], true).await?;
        Ok(())
    }

    /// Run an arbitrary shell command line on the device, returning stdout.
    pub async fn shell(&self, command_line: &str) -> Result<String, Error> {
        let mut argv = vec!["shell"];
        argv.extend(command_line.split_whitespace());
        let output = self.run(&argv, true).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    // ── Process plumbing ────────────────────────────────────────────

    async fn run(&self, args: &[&str], targeted: bool) -> Result<Output, Error> {
        let mut cmd = Command::new(&self.config.adb_path);
        if targeted {
            cmd.arg("-s").arg(&self.config.serial);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::trace!(args = ?args, "adb");

        let timeout = self.config.timeout;
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(Error::Spawn)?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: args.join(" "),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(output)
    }
}

// ── Output parsing ──────────────────────────────────────────────────

/// `adb connect` exits 0 even on failure; the verdict is in stdout.
fn connect_succeeded(stdout: &str) -> bool {
    let lower = stdout.to_ascii_lowercase();
    lower.contains("connected to") && !lower.contains("cannot") && !lower.contains("failed")
}

/// Pull the component out of the `mResumedActivity` (or, on newer
/// releases, `topResumedActivity`) line of `dumpsys activity activities`.
fn parse_resumed_activity(dump: &str) -> Option<String> {
    dump.lines()
        .find(|line| line.contains("mResumedActivity") || line.contains("topResumedActivity"))
        .and_then(|line| line.split_whitespace().find(|token| token.contains('/')))
        .map(|token| token.trim_end_matches('}').to_owned())
}
