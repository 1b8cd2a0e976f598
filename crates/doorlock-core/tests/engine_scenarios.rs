// End-to-end engine behaviour against a simulated phone.
//
// Every test runs on paused tokio time, so drive deadlines, retry
// backoff and the background poll advance instantly and
// deterministically.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use pretty_assertions::assert_eq;

use doorlock_core::{
    Calibration, CommandDriver, CoreError, DeviceController, DriveOutcome, Engine, FailureNotice,
    LockState, Point, ReconcilePolicy, Screenshot, SerialDevice, StatePublisher, Target,
};
use tokio_util::sync::CancellationToken;
use LockState::{Locked, Transitioning, Unknown, Unlocked};

// ── Simulated phone ─────────────────────────────────────────────────

struct PhoneState {
    lock: LockState,
    reachable: bool,
    /// Taps on a lock/unlock button that do not register.
    missed_taps: u32,
    /// The next `prepare` takes this long (an app relaunch).
    slow_prepare: Option<Duration>,
    taps: Vec<Point>,
}

struct FakePhone {
    calibration: Calibration,
    state: Mutex<PhoneState>,
}

impl FakePhone {
    fn new(lock: LockState) -> Arc<Self> {
        Arc::new(Self {
            calibration: Calibration::default(),
            state: Mutex::new(PhoneState {
                lock,
                reachable: true,
                missed_taps: 0,
                slow_prepare: None,
                taps: Vec::new(),
            }),
        })
    }

    fn set_lock(&self, lock: LockState) {
        self.state.lock().expect("phone").lock = lock;
    }

    fn set_reachable(&self, reachable: bool) {
        self.state.lock().expect("phone").reachable = reachable;
    }

    fn miss_taps(&self, count: u32) {
        self.state.lock().expect("phone").missed_taps = count;
    }

    fn slow_next_prepare(&self, delay: Duration) {
        self.state.lock().expect("phone").slow_prepare = Some(delay);
    }

    fn taps_on(&self, point: Point) -> usize {
        self.state
            .lock()
            .expect("phone")
            .taps
            .iter()
            .filter(|p| **p == point)
            .count()
    }

    fn screen(&self, lock: LockState) -> Bytes {
        let fill = match lock {
            LockState::Locked => [0, 168, 135],
            LockState::Unlocked => [194, 23, 45],
            LockState::Unknown => [130, 130, 130],
            LockState::Transitioning => [255, 255, 255],
        };
        let region = self.calibration.region;
        let image = RgbImage::from_fn(300, 600, |x, y| {
            let inside = (region.x..region.x + region.width).contains(&x)
                && (region.y..region.y + region.height).contains(&y);
            if inside { Rgb(fill) } else { Rgb([250, 250, 250]) }
        });
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).expect("encode png");
        Bytes::from(buf.into_inner())
    }
}

#[async_trait]
impl DeviceController for FakePhone {
    async fn capture(&self) -> Result<Screenshot, CoreError> {
        let (reachable, lock) = {
            let state = self.state.lock().expect("phone");
            (state.reachable, state.lock)
        };
        if !reachable {
            return Err(CoreError::device("device offline"));
        }
        Ok(Screenshot::new(self.screen(lock)))
    }

    async fn tap(&self, at: Point) -> Result<(), CoreError> {
        let mut state = self.state.lock().expect("phone");
        if !state.reachable {
            return Err(CoreError::device("device offline"));
        }
        state.taps.push(at);
        let target = if at == self.calibration.lock_tap {
            Some(LockState::Locked)
        } else if at == self.calibration.unlock_tap {
            Some(LockState::Unlocked)
        } else {
            None
        };
        if let Some(target) = target {
            if state.missed_taps > 0 {
                state.missed_taps -= 1;
            } else {
                state.lock = target;
            }
        }
        Ok(())
    }

    async fn prepare(&self) -> Result<(), CoreError> {
        let delay = self.state.lock().expect("phone").slow_prepare.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Lets the shared fake sit behind a `SerialDevice` gate.
struct Gated(Arc<FakePhone>);

#[async_trait]
impl DeviceController for Gated {
    async fn capture(&self) -> Result<Screenshot, CoreError> {
        self.0.capture().await
    }

    async fn tap(&self, at: Point) -> Result<(), CoreError> {
        self.0.tap(at).await
    }

    async fn prepare(&self) -> Result<(), CoreError> {
        self.0.prepare().await
    }
}

// ── Recording publisher ─────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<LockState>>,
    alerts: Mutex<Vec<FailureNotice>>,
}

impl Recorder {
    fn states(&self) -> Vec<LockState> {
        self.states.lock().expect("recorder").clone()
    }

    fn alerts(&self) -> usize {
        self.alerts.lock().expect("recorder").len()
    }
}

#[async_trait]
impl StatePublisher for Recorder {
    async fn publish_state(&self, state: LockState) -> Result<(), CoreError> {
        self.states.lock().expect("recorder").push(state);
        Ok(())
    }

    async fn publish_alert(&self, notice: &FailureNotice) -> Result<(), CoreError> {
        self.alerts.lock().expect("recorder").push(notice.clone());
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    engine: Engine,
    phone: Arc<FakePhone>,
    recorder: Arc<Recorder>,
}

async fn harness(initial: LockState) -> Harness {
    harness_with(initial, ReconcilePolicy::default()).await
}

async fn harness_with(initial: LockState, policy: ReconcilePolicy) -> Harness {
    let phone = FakePhone::new(initial);
    harness_on(phone.clone(), phone, policy).await
}

/// Same phone, but every call goes through the one-at-a-time gate.
async fn gated_harness(initial: LockState) -> Harness {
    let phone = FakePhone::new(initial);
    let device = SerialDevice::new(Gated(phone.clone())).into_shared();
    harness_on(phone, device, ReconcilePolicy::default()).await
}

async fn harness_on(
    phone: Arc<FakePhone>,
    device: Arc<dyn DeviceController>,
    policy: ReconcilePolicy,
) -> Harness {
    let recorder = Arc::new(Recorder::default());
    let driver = Arc::new(CommandDriver::new(
        device,
        &Calibration::default(),
        policy,
        None,
    ));
    let engine = Engine::new(driver, recorder.clone(), None);
    engine.start().await.expect("engine starts");
    Harness {
        engine,
        phone,
        recorder,
    }
}

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

const LOCK_TAP: Point = Point::new(330, 1200);
const UNLOCK_TAP: Point = Point::new(750, 1200);

// ── Start-up ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn startup_publishes_unknown_then_adopts_observed_state() {
    let h = harness(Locked).await;
    settle(5).await;
    assert_eq!(h.recorder.states(), vec![Unknown, Locked]);
    assert_eq!(h.engine.state(), Locked);
}

// ── Scenario A ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn lock_command_publishes_transitioning_then_locked() {
    let h = harness(Unlocked).await;
    settle(5).await;

    h.engine.submit(Target::Locked).await.expect("submit");
    settle(10).await;

    assert_eq!(
        h.recorder.states(),
        vec![Unknown, Unlocked, Transitioning, Locked]
    );
    assert_eq!(h.phone.taps_on(LOCK_TAP), 1);
}

#[tokio::test(start_paused = true)]
async fn state_subscribers_see_the_confirmed_state() {
    let h = harness(Unlocked).await;
    settle(5).await;

    let mut stream = h.engine.subscribe_state();
    assert_eq!(stream.current(), Unlocked);

    h.engine.submit(Target::Locked).await.expect("submit");
    assert_eq!(
        stream.wait_for(|s| *s != Unlocked).await,
        Some(Transitioning)
    );
    let reached = tokio::time::timeout(
        Duration::from_secs(30),
        stream.wait_for(|s| *s == Locked),
    )
    .await
    .expect("locked before the deadline");
    assert_eq!(reached, Some(Locked));
    assert_eq!(stream.latest(), Locked);
}

// ── Scenario B ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn newer_command_supersedes_older_one() {
    let h = harness(Unlocked).await;
    settle(5).await;

    h.engine.submit(Target::Locked).await.expect("submit lock");
    h.engine.submit(Target::Unlocked).await.expect("submit unlock");
    settle(30).await;

    let published = h.recorder.states();
    assert_eq!(published, vec![Unknown, Unlocked, Transitioning, Unlocked]);
    assert_eq!(
        published.iter().filter(|s| **s == Transitioning).count(),
        1
    );
    assert_eq!(h.engine.state(), Unlocked);
}

#[tokio::test(start_paused = true)]
async fn supersede_mid_drive_ends_in_newest_target() {
    let h = harness(Unlocked).await;
    settle(5).await;

    // The first tap is missed, so the LOCK run is still reading when
    // UNLOCK arrives.
    h.phone.miss_taps(1);
    h.engine.submit(Target::Locked).await.expect("submit lock");
    settle(2).await;
    h.engine.submit(Target::Unlocked).await.expect("submit unlock");
    settle(30).await;

    let published = h.recorder.states();
    assert_eq!(published.last(), Some(&Unlocked));
    assert!(!published.contains(&Locked));
    assert_eq!(h.phone.taps_on(UNLOCK_TAP), 1);
}

#[tokio::test(start_paused = true)]
async fn run_superseded_during_slow_preparation_never_taps() {
    let h = gated_harness(Unlocked).await;
    settle(5).await;

    // The LOCK run spends 20s relaunching the app; UNLOCK arrives at 2s.
    h.phone.slow_next_prepare(Duration::from_secs(20));
    h.engine.submit(Target::Locked).await.expect("submit lock");
    settle(2).await;
    h.engine.submit(Target::Unlocked).await.expect("submit unlock");
    settle(30).await;

    assert_eq!(h.phone.taps_on(LOCK_TAP), 0);
    assert_eq!(h.phone.taps_on(UNLOCK_TAP), 1);
    assert_eq!(h.engine.state(), Unlocked);
}

// ── Scenario C ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unreachable_device_ends_unknown_with_one_failure() {
    let h = harness(Unlocked).await;
    h.phone.set_reachable(false);
    let mut failures = h.engine.subscribe_failures();

    h.engine.submit(Target::Locked).await.expect("submit");
    // Three 18s drives plus 2s and 4s of backoff.
    settle(120).await;

    assert_eq!(h.recorder.states(), vec![Unknown, Transitioning, Unknown]);
    assert_eq!(h.recorder.alerts(), 1);

    let notice = failures.try_recv().expect("one failure notice");
    assert_eq!(notice.target, Target::Locked);
    assert_eq!(notice.attempts, 3);
    assert!(failures.try_recv().is_err());
}

// ── Scenario D ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn manual_change_is_adopted_without_a_command() {
    let h = harness(Locked).await;
    settle(5).await;

    // Someone turns the key.
    h.phone.set_lock(Unlocked);
    settle(70).await;

    assert_eq!(h.recorder.states(), vec![Unknown, Locked, Unlocked]);
    assert_eq!(h.phone.taps_on(LOCK_TAP), 0);
    assert_eq!(h.phone.taps_on(UNLOCK_TAP), 0);
}

// ── Properties ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn command_matching_state_does_not_tap() {
    let h = harness(Locked).await;
    settle(5).await;

    h.engine.submit(Target::Locked).await.expect("submit");
    settle(5).await;

    assert_eq!(h.recorder.states(), vec![Unknown, Locked, Locked]);
    assert_eq!(h.phone.taps_on(LOCK_TAP), 0);
}

#[tokio::test(start_paused = true)]
async fn missed_tap_is_retried_within_the_drive() {
    let h = harness(Unlocked).await;
    settle(5).await;

    h.phone.miss_taps(1);
    h.engine.submit(Target::Locked).await.expect("submit");
    settle(15).await;

    assert_eq!(h.phone.taps_on(LOCK_TAP), 2);
    assert_eq!(h.engine.state(), Locked);
    assert_eq!(h.recorder.alerts(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_outage_recovers_on_retry() {
    let h = harness(Unlocked).await;
    settle(5).await;

    h.phone.set_reachable(false);
    h.engine.submit(Target::Locked).await.expect("submit");
    settle(10).await;
    h.phone.set_reachable(true);
    settle(40).await;

    assert_eq!(
        h.recorder.states(),
        vec![Unknown, Unlocked, Transitioning, Locked]
    );
    assert_eq!(h.recorder.alerts(), 0);
}

#[tokio::test(start_paused = true)]
async fn check_status_republishes_current_state() {
    let h = harness(Locked).await;
    settle(5).await;

    h.engine.check_status().await.expect("check");
    settle(1).await;

    assert_eq!(h.recorder.states(), vec![Unknown, Locked, Locked]);
}

#[tokio::test(start_paused = true)]
async fn staleness_policy_drops_to_unknown() {
    let policy = ReconcilePolicy {
        stale_after: Some(Duration::from_secs(30)),
        ..ReconcilePolicy::default()
    };
    let h = harness_with(Locked, policy).await;
    settle(5).await;
    assert_eq!(h.engine.state(), Locked);

    // The phone goes dark; nothing confirms LOCKED any more.
    h.phone.set_reachable(false);
    settle(60).await;

    assert_eq!(h.recorder.states(), vec![Unknown, Locked, Unknown]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_publishes_unknown_and_rejects_commands() {
    let h = harness(Locked).await;
    settle(5).await;

    h.engine.shutdown().await;

    assert_eq!(h.recorder.states().last(), Some(&Unknown));
    assert!(matches!(
        h.engine.submit(Target::Unlocked).await,
        Err(CoreError::EngineStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn timed_out_drive_saves_failure_screenshot() {
    let dir = tempfile::tempdir().expect("temp dir");
    let phone = FakePhone::new(Unlocked);
    phone.miss_taps(u32::MAX);
    let policy = ReconcilePolicy {
        max_extra_taps: 0,
        ..ReconcilePolicy::default()
    };
    let driver = CommandDriver::new(
        phone.clone(),
        &Calibration::default(),
        policy,
        Some(dir.path().to_path_buf()),
    );

    let outcome = driver
        .execute(Target::Locked, 2, &CancellationToken::new())
        .await;
    assert_eq!(
        outcome,
        DriveOutcome::TimedOut {
            last_observed: Unlocked
        }
    );

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("retry_lock_"), "{names:?}");
    assert!(names[0].ends_with(".png"), "{names:?}");
}
