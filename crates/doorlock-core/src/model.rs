// ── Domain model ──
//
// Lock states, command requests, observations, and drive outcomes.
// Everything here is plain data; behaviour lives in the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

// ── LockState ────────────────────────────────────────────────────

/// The published projection of the lock.
///
/// `Unknown` is the initial value and the fallback whenever extraction
/// confidence is insufficient or the device is unreachable.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum LockState {
    Locked,
    Unlocked,
    Transitioning,
    #[default]
    Unknown,
}

impl LockState {
    /// `Locked` or `Unlocked`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Locked | Self::Unlocked)
    }
}

// ── Target ───────────────────────────────────────────────────────

/// A state a command can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    Locked,
    Unlocked,
}

impl Target {
    pub fn state(self) -> LockState {
        match self {
            Self::Locked => LockState::Locked,
            Self::Unlocked => LockState::Unlocked,
        }
    }

    /// Lower-case verb, used in logs and failure screenshot names.
    pub fn action(self) -> &'static str {
        match self {
            Self::Locked => "lock",
            Self::Unlocked => "unlock",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Locked => Self::Unlocked,
            Self::Unlocked => Self::Locked,
        }
    }
}

impl TryFrom<LockState> for Target {
    type Error = LockState;

    fn try_from(state: LockState) -> Result<Self, Self::Error> {
        match state {
            LockState::Locked => Ok(Self::Locked),
            LockState::Unlocked => Ok(Self::Unlocked),
            other => Err(other),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state().as_ref())
    }
}

// ── CommandRequest ───────────────────────────────────────────────

/// One inbound lock/unlock intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandRequest {
    pub target: Target,
    pub request_id: Uuid,
    pub received_at: DateTime<Utc>,
}

impl CommandRequest {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            request_id: Uuid::new_v4(),
            received_at: Utc::now(),
        }
    }
}

// ── Observation ──────────────────────────────────────────────────

/// Which reference pattern (if any) a reading matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Signature {
    Locked,
    Unlocked,
    /// The app's spinner / in-progress indicator.
    Loading,
    /// The app is running but not linked to the lock (grey indicator).
    Unlinked,
    /// Nothing matched within the similarity threshold.
    Unmatched,
    /// The capture was empty, undecodable, or the region fell off-screen.
    Empty,
    /// The device could not be reached at all.
    Unreachable,
}

impl Signature {
    pub fn state(self) -> LockState {
        match self {
            Self::Locked => LockState::Locked,
            Self::Unlocked => LockState::Unlocked,
            Self::Loading => LockState::Transitioning,
            Self::Unlinked | Self::Unmatched | Self::Empty | Self::Unreachable => {
                LockState::Unknown
            }
        }
    }
}

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObservationSource {
    Screen,
    Sensor,
}

/// A single inferred lock-state reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub state: LockState,
    /// 0.0 ..= 1.0
    pub confidence: f32,
    pub signature: Signature,
    pub source: ObservationSource,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn from_screen(signature: Signature, confidence: f32) -> Self {
        Self {
            state: signature.state(),
            confidence: confidence.clamp(0.0, 1.0),
            signature,
            source: ObservationSource::Screen,
            observed_at: Utc::now(),
        }
    }

    /// A zero-confidence UNKNOWN reading.
    pub fn unknown(signature: Signature) -> Self {
        Self::from_screen(signature, 0.0)
    }

    /// An out-of-band reading (door sensor) taken at face value.
    pub fn from_sensor(state: LockState) -> Self {
        let signature = match state {
            LockState::Locked => Signature::Locked,
            LockState::Unlocked => Signature::Unlocked,
            LockState::Transitioning => Signature::Loading,
            LockState::Unknown => Signature::Unmatched,
        };
        Self {
            state,
            confidence: 1.0,
            signature,
            source: ObservationSource::Sensor,
            observed_at: Utc::now(),
        }
    }

    pub fn is_confident(&self, min_confidence: f32) -> bool {
        self.confidence >= min_confidence
    }
}

// ── Drive runs ───────────────────────────────────────────────────

/// Identifies one Command Driver run. Retries get a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// How a Command Driver run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Two consecutive confident reads matched the target.
    Confirmed,
    /// The deadline passed without confirmation.
    TimedOut { last_observed: LockState },
    /// A newer command superseded the run.
    Aborted,
}

/// Emitted once when a command exhausts its retry ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureNotice {
    pub target: Target,
    pub attempts: u32,
    pub last_observed: LockState,
    pub request_id: Uuid,
    pub at: DateTime<Utc>,
}
