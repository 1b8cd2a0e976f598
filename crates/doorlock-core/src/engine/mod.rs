// ── Reconciliation engine ──
//
// Async runtime around `ReconciliationSession`. A single event-loop
// task owns the session and consumes `EngineEvent`s; every mutation of
// lock state is serialized through it. Drive runs and observations are
// spawned tasks that report back on the same channel.

mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollWindow;
use crate::driver::CommandDriver;
use crate::error::CoreError;
use crate::gateway::StatePublisher;
use crate::model::{
    CommandRequest, DriveOutcome, FailureNotice, LockState, Observation, RunId, Target,
};
use crate::stream::StateStream;

pub use session::{ControlState, Effect, ReconciliationSession};

const EVENT_CHANNEL_SIZE: usize = 64;
const FAILURE_CHANNEL_SIZE: usize = 16;
const TICK_PERIOD: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Inputs to the event loop.
#[derive(Debug)]
enum EngineEvent {
    Command(CommandRequest),
    Observation {
        observation: Observation,
        /// Republish `current` even when nothing changed.
        republish: bool,
        /// Answered with whether a differing reading is awaiting agreement.
        pending_reply: Option<oneshot::Sender<bool>>,
    },
    DriveFinished {
        run: RunId,
        outcome: DriveOutcome,
    },
    CheckStatus,
    Tick,
    Shutdown(oneshot::Sender<()>),
}

// ── Engine ───────────────────────────────────────────────────────

/// Handle to the reconciliation engine.
///
/// Cheaply cloneable via `Arc<EngineInner>`. Call [`start()`](Self::start)
/// to spawn the event loop and the background poll.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    driver: Arc<CommandDriver>,
    publisher: Arc<dyn StatePublisher>,
    poll_window: Option<PollWindow>,
    state: watch::Sender<LockState>,
    control: watch::Sender<ControlState>,
    failures: broadcast::Sender<FailureNotice>,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<EngineEvent>>>,
    started: AtomicBool,
    polling_paused: watch::Sender<bool>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create the engine. Does NOT start it.
    pub fn new(
        driver: Arc<CommandDriver>,
        publisher: Arc<dyn StatePublisher>,
        poll_window: Option<PollWindow>,
    ) -> Self {
        let (state, _) = watch::channel(LockState::Unknown);
        let (control, _) = watch::channel(ControlState::Idle);
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (polling_paused, _) = watch::channel(false);

        Self {
            inner: Arc::new(EngineInner {
                driver,
                publisher,
                poll_window,
                state,
                control,
                failures,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                started: AtomicBool::new(false),
                polling_paused,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Publish the initial UNKNOWN and spawn the event loop, the poll
    /// loop, and (with a staleness policy) the tick loop.
    pub async fn start(&self) -> Result<(), CoreError> {
        let rx = self
            .inner
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| CoreError::Internal("engine already started".into()))?;
        self.inner.started.store(true, Ordering::SeqCst);

        if let Err(e) = self.inner.publisher.publish_state(LockState::Unknown).await {
            warn!(error = %e, "initial state publish failed");
        }

        let cancel = self.inner.cancel.clone();
        let mut handles = self.inner.task_handles.lock().await;
        handles.push(tokio::spawn(reconcile_task(self.clone(), rx)));
        handles.push(tokio::spawn(poll_task(self.clone(), cancel.clone())));
        if self.inner.driver.policy().stale_after.is_some() {
            handles.push(tokio::spawn(tick_task(self.clone(), cancel)));
        }
        info!("reconciliation engine started");
        Ok(())
    }

    // ── Inputs ───────────────────────────────────────────────────

    /// Submit a lock/unlock intent. Returns the request as recorded.
    pub async fn submit(&self, target: Target) -> Result<CommandRequest, CoreError> {
        let request = CommandRequest::new(target);
        self.submit_request(request.clone()).await?;
        Ok(request)
    }

    pub async fn submit_request(&self, request: CommandRequest) -> Result<(), CoreError> {
        self.send(EngineEvent::Command(request)).await
    }

    /// Observe now and republish the current state.
    pub async fn check_status(&self) -> Result<(), CoreError> {
        self.send(EngineEvent::CheckStatus).await
    }

    /// Feed an out-of-band reading (e.g. a door sensor).
    pub async fn report_observation(&self, observation: Observation) -> Result<(), CoreError> {
        self.send(EngineEvent::Observation {
            observation,
            republish: false,
            pending_reply: None,
        })
        .await
    }

    /// Stop or resume background polling (used during maintenance).
    pub fn pause_polling(&self, paused: bool) {
        self.inner.polling_paused.send_replace(paused);
    }

    // ── Outputs ──────────────────────────────────────────────────

    /// The currently published state.
    pub fn state(&self) -> LockState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> StateStream {
        StateStream::new(self.inner.state.subscribe())
    }

    pub fn control_state(&self) -> ControlState {
        *self.inner.control.borrow()
    }

    pub fn subscribe_control(&self) -> watch::Receiver<ControlState> {
        self.inner.control.subscribe()
    }

    /// Persistent-failure notices, one per command that exhausted its retries.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailureNotice> {
        self.inner.failures.subscribe()
    }

    pub fn is_polling_paused(&self) -> bool {
        *self.inner.polling_paused.borrow()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Cancel any running drive, publish UNKNOWN, and stop all tasks.
    pub async fn shutdown(&self) {
        if self.inner.started.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            if self.inner.events_tx.send(EngineEvent::Shutdown(tx)).await.is_ok()
                && tokio::time::timeout(SHUTDOWN_TIMEOUT, rx).await.is_err()
            {
                warn!("engine did not acknowledge shutdown in time");
            }
        } else if let Err(e) = self.inner.publisher.publish_state(LockState::Unknown).await {
            warn!(error = %e, "final state publish failed");
        }

        self.inner.cancel.cancel();
        let handles: Vec<_> = self.inner.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("reconciliation engine stopped");
    }

    // ── Internals ────────────────────────────────────────────────

    async fn send(&self, event: EngineEvent) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::EngineStopped);
        }
        self.inner
            .events_tx
            .send(event)
            .await
            .map_err(|_| CoreError::EngineStopped)
    }

    async fn apply(&self, effects: Vec<Effect>, drives: &mut HashMap<RunId, CancellationToken>) {
        for effect in effects {
            match effect {
                Effect::Publish(state) => {
                    self.inner.state.send_replace(state);
                    if let Err(e) = self.inner.publisher.publish_state(state).await {
                        warn!(%state, error = %e, "state publish failed");
                    }
                }
                Effect::StartDrive {
                    run,
                    target,
                    attempt,
                    delay,
                } => {
                    let token = self.inner.cancel.child_token();
                    drives.insert(run, token.clone());
                    self.spawn_drive(run, target, attempt, delay, token);
                }
                Effect::Supersede { run } => {
                    if let Some(token) = drives.remove(&run) {
                        debug!(%run, "cancelling superseded run");
                        token.cancel();
                    }
                }
                Effect::PersistentFailure(notice) => {
                    let _ = self.inner.failures.send(notice.clone());
                    if let Err(e) = self.inner.publisher.publish_alert(&notice).await {
                        warn!(error = %e, "alert publish failed");
                    }
                }
            }
        }
    }

    fn spawn_drive(
        &self,
        run: RunId,
        target: Target,
        attempt: u32,
        delay: Duration,
        token: CancellationToken,
    ) {
        let driver = Arc::clone(&self.inner.driver);
        let events = self.inner.events_tx.clone();
        tokio::spawn(async move {
            debug!(
                %run,
                %target,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "drive scheduled"
            );
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => DriveOutcome::Aborted,
                () = tokio::time::sleep(delay) => driver.execute(target, attempt, &token).await,
            };
            let _ = events.send(EngineEvent::DriveFinished { run, outcome }).await;
        });
    }

    fn spawn_observation(&self, republish: bool) {
        let driver = Arc::clone(&self.inner.driver);
        let events = self.inner.events_tx.clone();
        tokio::spawn(async move {
            let observation = driver.observe().await;
            let _ = events
                .send(EngineEvent::Observation {
                    observation,
                    republish,
                    pending_reply: None,
                })
                .await;
        });
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Owns the session. All state transitions happen here.
async fn reconcile_task(engine: Engine, mut rx: mpsc::Receiver<EngineEvent>) {
    let inner = &engine.inner;
    let mut session = ReconciliationSession::new(inner.driver.policy().clone());
    let mut drives: HashMap<RunId, CancellationToken> = HashMap::new();

    loop {
        let event = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let effects = match event {
            EngineEvent::Command(request) => {
                info!(
                    command = %request.target,
                    request = %request.request_id,
                    "command received"
                );
                session.on_command(request)
            }
            EngineEvent::Observation {
                observation,
                republish,
                pending_reply,
            } => {
                let mut effects = session.on_observation(&observation, Instant::now());
                if republish && !effects.iter().any(|e| matches!(e, Effect::Publish(_))) {
                    effects.extend(session.republish());
                }
                if let Some(reply) = pending_reply {
                    let _ = reply.send(session.has_pending_change());
                }
                effects
            }
            EngineEvent::DriveFinished { run, outcome } => {
                drives.remove(&run);
                session.on_outcome(run, outcome, Instant::now())
            }
            EngineEvent::CheckStatus => {
                if session.control() == ControlState::Idle {
                    engine.spawn_observation(true);
                    Vec::new()
                } else {
                    session.republish()
                }
            }
            EngineEvent::Tick => session.on_tick(Instant::now()),
            EngineEvent::Shutdown(reply) => {
                let effects = session.on_shutdown();
                inner.control.send_replace(session.control());
                engine.apply(effects, &mut drives).await;
                let _ = reply.send(());
                break;
            }
        };

        inner.control.send_replace(session.control());
        engine.apply(effects, &mut drives).await;
    }

    for token in drives.into_values() {
        token.cancel();
    }
    debug!("reconcile task stopped");
}

/// Periodic background observation. The first read happens immediately.
async fn poll_task(engine: Engine, cancel: CancellationToken) {
    let inner = &engine.inner;
    let policy = inner.driver.policy().clone();

    loop {
        let mut pending = false;
        if should_poll(&engine) {
            let observation = inner.driver.observe().await;
            debug!(
                state = %observation.state,
                confidence = observation.confidence,
                signature = %observation.signature,
                "background read"
            );
            let (reply_tx, reply_rx) = oneshot::channel();
            let event = EngineEvent::Observation {
                observation,
                republish: false,
                pending_reply: Some(reply_tx),
            };
            if inner.events_tx.send(event).await.is_err() {
                break;
            }
            pending = reply_rx.await.unwrap_or(false);
        }

        // A differing reading is re-checked at drive pace.
        let period = if pending {
            policy.drive_poll_interval
        } else {
            policy.poll_interval
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {}
        }
    }
    debug!("poll task stopped");
}

fn should_poll(engine: &Engine) -> bool {
    if engine.is_polling_paused() {
        debug!("poll skipped: maintenance");
        return false;
    }
    if engine.control_state() != ControlState::Idle {
        return false;
    }
    if let Some(window) = engine.inner.poll_window {
        if !window.contains(Local::now().time()) {
            return false;
        }
    }
    true
}

async fn tick_task(engine: Engine, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(TICK_PERIOD);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if engine.inner.events_tx.send(EngineEvent::Tick).await.is_err() {
                    break;
                }
            }
        }
    }
}
