// ── Reconciliation session ──
//
// The synchronous heart of the engine. Every input (command, drive
// outcome, observation, tick, shutdown) goes through one `&mut self`
// method that mutates the session and returns the effects the runtime
// must carry out. No I/O happens here, so every transition is testable
// without a device or a broker.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use doorlock_api::backoff::exponential_delay;

use crate::config::ReconcilePolicy;
use crate::model::{
    CommandRequest, DriveOutcome, FailureNotice, LockState, Observation, ObservationSource, RunId,
    Target,
};

/// Internal control state, distinct from the published `LockState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    Executing { target: Target, run: RunId },
}

/// Work the runtime performs on behalf of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish this state (retained).
    Publish(LockState),
    /// Spawn a Command Driver run after `delay`.
    StartDrive {
        run: RunId,
        target: Target,
        attempt: u32,
        delay: Duration,
    },
    /// Cancel a run that is still executing.
    Supersede { run: RunId },
    /// A command exhausted its retry ceiling.
    PersistentFailure(FailureNotice),
}

#[derive(Debug, Clone)]
struct InFlight {
    request: CommandRequest,
    run: RunId,
    attempt: u32,
}

/// Exclusively owned by the engine's event loop.
#[derive(Debug)]
pub struct ReconciliationSession {
    policy: ReconcilePolicy,
    current: LockState,
    /// Whether `current` came from a confirmed drive or a confident read.
    confident: bool,
    last_confirmed_at: Option<Instant>,
    in_flight: Option<InFlight>,
    consecutive_failures: u32,
    /// A differing idle reading waiting for agreement.
    pending: Option<(LockState, u32)>,
    next_run: u64,
}

impl ReconciliationSession {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self {
            policy,
            current: LockState::Unknown,
            confident: false,
            last_confirmed_at: None,
            in_flight: None,
            consecutive_failures: 0,
            pending: None,
            next_run: 0,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn current(&self) -> LockState {
        self.current
    }

    pub fn control(&self) -> ControlState {
        match &self.in_flight {
            Some(f) => ControlState::Executing {
                target: f.request.target,
                run: f.run,
            },
            None => ControlState::Idle,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_confirmed_at(&self) -> Option<Instant> {
        self.last_confirmed_at
    }

    /// Whether an idle reading disagrees with `current` and is awaiting
    /// confirmation.
    pub fn has_pending_change(&self) -> bool {
        self.pending.is_some()
    }

    // ── Transitions ──────────────────────────────────────────────

    pub fn on_command(&mut self, request: CommandRequest) -> Vec<Effect> {
        let target = request.target;
        let mut effects = Vec::new();

        if let Some(in_flight) = &self.in_flight {
            if in_flight.request.target == target {
                debug!(%target, run = %in_flight.run, "coalesced with in-flight command");
                return effects;
            }
            info!(
                old = %in_flight.request.target,
                new = %target,
                run = %in_flight.run,
                "superseding in-flight command"
            );
            effects.push(Effect::Supersede { run: in_flight.run });
        } else if self.current == target.state() && self.confident {
            debug!(%target, "already in target state");
            effects.push(Effect::Publish(self.current));
            return effects;
        }

        self.consecutive_failures = 0;
        self.pending = None;
        effects.extend(self.set_current(LockState::Transitioning, false));
        let run = self.allocate_run();
        self.in_flight = Some(InFlight {
            request,
            run,
            attempt: 1,
        });
        effects.push(Effect::StartDrive {
            run,
            target,
            attempt: 1,
            delay: Duration::ZERO,
        });
        effects
    }

    pub fn on_outcome(&mut self, run: RunId, outcome: DriveOutcome, now: Instant) -> Vec<Effect> {
        let Some(in_flight) = self.in_flight.clone() else {
            debug!(%run, ?outcome, "outcome with nothing in flight");
            return Vec::new();
        };
        if in_flight.run != run {
            debug!(%run, current = %in_flight.run, ?outcome, "ignoring outcome of superseded run");
            return Vec::new();
        }
        let target = in_flight.request.target;

        match outcome {
            DriveOutcome::Confirmed => {
                self.in_flight = None;
                self.consecutive_failures = 0;
                self.last_confirmed_at = Some(now);
                info!(%target, attempt = in_flight.attempt, "command confirmed");
                self.set_current(target.state(), true).into_iter().collect()
            }
            DriveOutcome::TimedOut { last_observed } => {
                self.consecutive_failures += 1;
                if self.consecutive_failures < self.policy.retry_ceiling {
                    let delay = exponential_delay(
                        self.consecutive_failures - 1,
                        self.policy.backoff_initial,
                        self.policy.backoff_max,
                    );
                    let run = self.allocate_run();
                    let attempt = in_flight.attempt + 1;
                    warn!(
                        %target,
                        attempt,
                        %last_observed,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "command not confirmed, retrying"
                    );
                    self.in_flight = Some(InFlight {
                        request: in_flight.request,
                        run,
                        attempt,
                    });
                    vec![Effect::StartDrive {
                        run,
                        target,
                        attempt,
                        delay,
                    }]
                } else {
                    self.in_flight = None;
                    let notice = FailureNotice {
                        target,
                        attempts: in_flight.attempt,
                        last_observed,
                        request_id: in_flight.request.request_id,
                        at: Utc::now(),
                    };
                    error!(
                        %target,
                        attempts = notice.attempts,
                        %last_observed,
                        "command failed persistently"
                    );
                    let mut effects: Vec<Effect> =
                        self.set_current(LockState::Unknown, false).into_iter().collect();
                    effects.push(Effect::PersistentFailure(notice));
                    effects
                }
            }
            DriveOutcome::Aborted => {
                self.in_flight = None;
                self.set_current(LockState::Unknown, false).into_iter().collect()
            }
        }
    }

    pub fn on_observation(&mut self, observation: &Observation, now: Instant) -> Vec<Effect> {
        if self.in_flight.is_some() {
            self.pending = None;
            return Vec::new();
        }
        if !observation.is_confident(self.policy.min_confidence) {
            debug!(
                state = %observation.state,
                confidence = observation.confidence,
                "low-confidence reading ignored"
            );
            self.pending = None;
            return Vec::new();
        }
        let seen = observation.state;
        // Agreeing reads must be consecutive.
        if seen == LockState::Transitioning {
            self.pending = None;
            return Vec::new();
        }
        if seen == self.current {
            self.pending = None;
            if seen.is_terminal() {
                self.confident = true;
                self.last_confirmed_at = Some(now);
            }
            return Vec::new();
        }

        let required = if observation.source == ObservationSource::Sensor {
            self.policy.sensor_reads.max(1)
        } else {
            self.policy.debounce_reads.max(1)
        };
        let count = match self.pending {
            Some((state, count)) if state == seen => count + 1,
            _ => 1,
        };
        if count < required {
            debug!(%seen, count, required, "differing reading awaiting agreement");
            self.pending = Some((seen, count));
            return Vec::new();
        }

        self.pending = None;
        if seen.is_terminal() {
            self.last_confirmed_at = Some(now);
            info!(from = %self.current, to = %seen, source = %observation.source, "out-of-band change adopted");
        } else {
            warn!(from = %self.current, signature = %observation.signature, "lock app reports no usable state");
        }
        self.set_current(seen, seen.is_terminal()).into_iter().collect()
    }

    /// Apply the staleness policy.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Effect> {
        let Some(stale_after) = self.policy.stale_after else {
            return Vec::new();
        };
        if self.in_flight.is_some() || !self.current.is_terminal() {
            return Vec::new();
        }
        let stale = self
            .last_confirmed_at
            .is_none_or(|at| now.saturating_duration_since(at) >= stale_after);
        if !stale {
            return Vec::new();
        }
        warn!(state = %self.current, "state not confirmed recently, marking unknown");
        self.set_current(LockState::Unknown, false).into_iter().collect()
    }

    /// Republish `current` without changing anything.
    pub fn republish(&self) -> Vec<Effect> {
        vec![Effect::Publish(self.current)]
    }

    /// Cancel any in-flight run and publish UNKNOWN.
    pub fn on_shutdown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(in_flight) = self.in_flight.take() {
            effects.push(Effect::Supersede { run: in_flight.run });
        }
        self.current = LockState::Unknown;
        self.confident = false;
        self.pending = None;
        effects.push(Effect::Publish(LockState::Unknown));
        effects
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn allocate_run(&mut self) -> RunId {
        self.next_run += 1;
        RunId(self.next_run)
    }

    fn set_current(&mut self, state: LockState, confident: bool) -> Option<Effect> {
        self.confident = confident;
        if self.current == state {
            return None;
        }
        info!(from = %self.current, to = %state, "state changed");
        self.current = state;
        Some(Effect::Publish(state))
    }
}
