// ── Command driver ──
//
// Executes one lock/unlock attempt: tap the target button, then read
// the screen until the target is confirmed, the deadline passes, or the
// run is superseded. Also performs the single reads used by background
// polling and check-status requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use doorlock_api::Point;

use crate::config::{Calibration, ReconcilePolicy};
use crate::device::{DeviceController, Screenshot};
use crate::extractor::StateExtractor;
use crate::model::{DriveOutcome, LockState, Observation, Signature, Target};

/// Where the driver taps.
#[derive(Debug, Clone, Copy)]
struct DriveTaps {
    lock: Point,
    unlock: Point,
    wake: Option<Point>,
}

impl DriveTaps {
    fn from_calibration(calibration: &Calibration) -> Self {
        Self {
            lock: calibration.lock_tap,
            unlock: calibration.unlock_tap,
            wake: calibration.wake_tap,
        }
    }

    fn for_target(&self, target: Target) -> Point {
        match target {
            Target::Locked => self.lock,
            Target::Unlocked => self.unlock,
        }
    }
}

pub struct CommandDriver {
    device: Arc<dyn DeviceController>,
    extractor: StateExtractor,
    taps: DriveTaps,
    policy: ReconcilePolicy,
    failure_shot_dir: Option<PathBuf>,
}

impl CommandDriver {
    pub fn new(
        device: Arc<dyn DeviceController>,
        calibration: &Calibration,
        policy: ReconcilePolicy,
        failure_shot_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            device,
            extractor: StateExtractor::new(calibration),
            taps: DriveTaps::from_calibration(calibration),
            policy,
            failure_shot_dir,
        }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// One read of the lock state. Device failures become an UNKNOWN
    /// observation rather than an error.
    pub async fn observe(&self) -> Observation {
        if let Err(e) = self.device.prepare().await {
            warn!(error = %e, "device not ready for observation");
            return Observation::unknown(Signature::Unreachable);
        }
        self.wake().await;
        match self.device.capture().await {
            Ok(shot) => self.extractor.extract(&shot),
            Err(e) => {
                warn!(error = %e, "capture failed");
                Observation::unknown(Signature::Unreachable)
            }
        }
    }

    /// Drive the lock toward `target`. `attempt` is 1-based and only
    /// affects failure screenshot naming.
    pub async fn execute(
        &self,
        target: Target,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> DriveOutcome {
        if cancel.is_cancelled() {
            return DriveOutcome::Aborted;
        }
        if let Err(e) = self.device.prepare().await {
            warn!(error = %e, "device preparation failed, tapping anyway");
        }
        // Preparation can take a full app relaunch.
        if cancel.is_cancelled() {
            debug!(%target, attempt, "superseded while preparing");
            return DriveOutcome::Aborted;
        }
        self.wake().await;

        let button = self.taps.for_target(target);
        info!(%target, attempt, x = button.x, y = button.y, "tapping");
        if !self.tap_unless_cancelled(button, cancel).await {
            return DriveOutcome::Aborted;
        }

        let deadline = Instant::now() + self.policy.drive_deadline;
        let mut confirmations = 0;
        let mut contradictions = 0;
        let mut extra_taps = 0;
        let mut last_observed = LockState::Unknown;
        let mut last_shot: Option<Screenshot> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let pause = self.policy.drive_poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return DriveOutcome::Aborted,
                () = tokio::time::sleep(pause) => {}
            }

            let shot = match self.device.capture().await {
                Ok(shot) => shot,
                Err(e) => {
                    debug!(error = %e, "capture failed during drive");
                    confirmations = 0;
                    contradictions = 0;
                    last_observed = LockState::Unknown;
                    continue;
                }
            };
            if cancel.is_cancelled() {
                return DriveOutcome::Aborted;
            }
            let observation = self.extractor.extract(&shot);
            last_shot = Some(shot);
            last_observed = observation.state;
            debug!(
                state = %observation.state,
                confidence = observation.confidence,
                signature = %observation.signature,
                "drive read"
            );

            if !observation.is_confident(self.policy.min_confidence) {
                confirmations = 0;
                contradictions = 0;
            } else if observation.state == target.state() {
                confirmations += 1;
                contradictions = 0;
                if confirmations >= self.policy.confirm_reads {
                    info!(%target, attempt, "confirmed");
                    return DriveOutcome::Confirmed;
                }
            } else if observation.state == target.opposite().state() {
                confirmations = 0;
                contradictions += 1;
                if contradictions >= self.policy.confirm_reads
                    && extra_taps < self.policy.max_extra_taps
                {
                    extra_taps += 1;
                    contradictions = 0;
                    info!(%target, extra_taps, "tap did not register, tapping again");
                    if !self.tap_unless_cancelled(button, cancel).await {
                        return DriveOutcome::Aborted;
                    }
                }
            } else {
                confirmations = 0;
                contradictions = 0;
            }
        }

        warn!(%target, attempt, %last_observed, "not confirmed before deadline");
        if let (Some(dir), Some(shot)) = (&self.failure_shot_dir, &last_shot) {
            save_failure_shot(dir, target, attempt, shot).await;
        }
        DriveOutcome::TimedOut { last_observed }
    }

    /// Tap `at` unless the run is superseded first, including while the
    /// tap waits for the device. Returns false when superseded.
    async fn tap_unless_cancelled(&self, at: Point, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            result = self.device.tap(at) => {
                if let Err(e) = result {
                    warn!(error = %e, "tap failed");
                }
                true
            }
        }
    }

    async fn wake(&self) {
        if let Some(wake) = self.taps.wake {
            if let Err(e) = self.device.tap(wake).await {
                debug!(error = %e, "wake tap failed");
            }
        }
    }
}

/// `[retry_]{lock|unlock}_{YYYYmmddHHMMSS}.png`
pub fn failure_shot_name(target: Target, attempt: u32, at: chrono::DateTime<Local>) -> String {
    let prefix = if attempt > 1 { "retry_" } else { "" };
    format!(
        "{prefix}{}_{}.png",
        target.action(),
        at.format("%Y%m%d%H%M%S")
    )
}

async fn save_failure_shot(dir: &Path, target: Target, attempt: u32, shot: &Screenshot) {
    let path = dir.join(failure_shot_name(target, attempt, Local::now()));
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, &shot.png).await
    }
    .await;
    match result {
        Ok(()) => info!(path = %path.display(), "saved failure screenshot"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not save failure screenshot"),
    }
}
