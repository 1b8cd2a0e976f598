// ── Bus gateway ──
//
// Pure adapter between the broker and the engine. Inbound payloads are
// parsed into commands, check requests, or sensor readings; anything
// malformed is logged and dropped here and never reaches the engine.
// Outbound, `MqttPublisher` writes the retained state topic and the
// optional alert topic.

use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use doorlock_api::{BusClient, InboundMessage, LastWillMessage};

use crate::config::Topics;
use crate::engine::Engine;
use crate::error::CoreError;
use crate::model::{FailureNotice, LockState, Observation, Target};

// ── Outbound ─────────────────────────────────────────────────────

/// Where the engine sends state changes and failure notices.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish_state(&self, state: LockState) -> Result<(), CoreError>;

    async fn publish_alert(&self, notice: &FailureNotice) -> Result<(), CoreError>;
}

/// Publishes to the broker.
pub struct MqttPublisher {
    bus: BusClient,
    topics: Topics,
    publish_transitioning: bool,
}

impl MqttPublisher {
    pub fn new(bus: BusClient, topics: Topics, publish_transitioning: bool) -> Self {
        Self {
            bus,
            topics,
            publish_transitioning,
        }
    }
}

#[async_trait]
impl StatePublisher for MqttPublisher {
    async fn publish_state(&self, state: LockState) -> Result<(), CoreError> {
        if state == LockState::Transitioning && !self.publish_transitioning {
            debug!("TRANSITIONING suppressed");
            return Ok(());
        }
        info!(topic = %self.topics.state, %state, "publishing state");
        self.bus
            .publish(&self.topics.state, state.as_ref(), true)
            .await?;
        Ok(())
    }

    async fn publish_alert(&self, notice: &FailureNotice) -> Result<(), CoreError> {
        let Some(topic) = &self.topics.alert else {
            return Ok(());
        };
        let payload =
            serde_json::to_vec(notice).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.bus.publish(topic, payload, false).await?;
        Ok(())
    }
}

/// The retained will registered with the broker: subscribers see
/// UNKNOWN if the bridge disappears without a clean shutdown.
pub fn last_will(topics: &Topics) -> LastWillMessage {
    LastWillMessage {
        topic: topics.state.clone(),
        payload: LockState::Unknown.as_ref().to_owned(),
    }
}

// ── Inbound ──────────────────────────────────────────────────────

/// A parsed inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Command(Target),
    CheckStatus,
    Sensor(LockState),
}

#[derive(Deserialize)]
struct ActionPayload {
    action: String,
}

#[derive(Deserialize)]
struct StatePayload {
    state: String,
}

/// `LOCK` / `UNLOCK` (any case, surrounding whitespace ignored), or
/// `{"action": "lock"}`.
pub fn parse_command(payload: &[u8]) -> Result<Target, String> {
    let text = std::str::from_utf8(payload).map_err(|_| "payload is not UTF-8".to_owned())?;
    let text = text.trim();
    let word = if text.starts_with('{') {
        serde_json::from_str::<ActionPayload>(text)
            .map_err(|e| format!("invalid JSON command: {e}"))?
            .action
    } else {
        text.to_owned()
    };
    match word.trim().to_ascii_uppercase().as_str() {
        "LOCK" => Ok(Target::Locked),
        "UNLOCK" => Ok(Target::Unlocked),
        "" => Err("empty command".into()),
        other => Err(format!("unknown command {other:?}")),
    }
}

/// A sensor reading: a lock state name, or `{"state": "LOCKED"}`.
pub fn parse_sensor(payload: &[u8]) -> Result<LockState, String> {
    let text = std::str::from_utf8(payload).map_err(|_| "payload is not UTF-8".to_owned())?;
    let text = text.trim();
    let word = if text.starts_with('{') {
        serde_json::from_str::<StatePayload>(text)
            .map_err(|e| format!("invalid JSON reading: {e}"))?
            .state
    } else {
        text.to_owned()
    };
    LockState::from_str(word.trim()).map_err(|_| format!("unknown state {word:?}"))
}

/// Routes broker traffic to the engine.
#[derive(Debug, Clone)]
pub struct BusGateway {
    topics: Topics,
}

impl BusGateway {
    pub fn new(topics: Topics) -> Self {
        Self { topics }
    }

    /// Topics the broker session must subscribe to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.topics.command.clone()];
        topics.extend(self.topics.check.iter().cloned());
        topics.extend(self.topics.sensor.iter().cloned());
        topics
    }

    pub fn route(&self, message: &InboundMessage) -> Result<Inbound, CoreError> {
        let malformed = |reason: String| CoreError::MalformedMessage {
            topic: message.topic.clone(),
            reason,
        };
        if message.topic == self.topics.command {
            return parse_command(&message.payload)
                .map(Inbound::Command)
                .map_err(malformed);
        }
        if self.topics.check.as_deref() == Some(message.topic.as_str()) {
            return Ok(Inbound::CheckStatus);
        }
        if self.topics.sensor.as_deref() == Some(message.topic.as_str()) {
            return parse_sensor(&message.payload)
                .map(Inbound::Sensor)
                .map_err(malformed);
        }
        Err(malformed("unexpected topic".into()))
    }

    /// Forward inbound traffic until the channel closes or `cancel` fires.
    pub async fn serve(
        &self,
        engine: Engine,
        mut inbound: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let result = match self.route(&message) {
                Ok(Inbound::Command(target)) => engine.submit(target).await.map(|request| {
                    info!(%target, request = %request.request_id, "command accepted");
                }),
                Ok(Inbound::CheckStatus) => engine.check_status().await,
                Ok(Inbound::Sensor(state)) => {
                    engine
                        .report_observation(Observation::from_sensor(state))
                        .await
                }
                Err(e) => {
                    warn!(error = %e, "dropping inbound message");
                    continue;
                }
            };
            if let Err(e) = result {
                warn!(error = %e, "engine rejected inbound message");
                if matches!(e, CoreError::EngineStopped) {
                    break;
                }
            }
        }
        debug!("bus gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn message(topic: &str, payload: &'static [u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.into(),
            payload: Bytes::from_static(payload),
        }
    }

    fn gateway() -> BusGateway {
        BusGateway::new(Topics {
            sensor: Some("home/door/contact".into()),
            ..Topics::default()
        })
    }

    #[test]
    fn plain_commands() {
        assert_eq!(parse_command(b"LOCK"), Ok(Target::Locked));
        assert_eq!(parse_command(b" unlock\n"), Ok(Target::Unlocked));
        assert_eq!(parse_command(b"Lock"), Ok(Target::Locked));
    }

    #[test]
    fn json_commands() {
        assert_eq!(parse_command(br#"{"action":"unlock"}"#), Ok(Target::Unlocked));
        assert!(parse_command(br#"{"verb":"lock"}"#).is_err());
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(parse_command(b"").is_err());
        assert!(parse_command(b"OPEN").is_err());
        assert!(parse_command(&[0xff, 0xfe]).is_err());
        assert!(parse_command(b"{not json").is_err());
    }

    #[test]
    fn sensor_payloads() {
        assert_eq!(parse_sensor(b"LOCKED"), Ok(LockState::Locked));
        assert_eq!(parse_sensor(br#"{"state":"unlocked"}"#), Ok(LockState::Unlocked));
        assert!(parse_sensor(b"ajar").is_err());
    }

    #[test]
    fn routes_by_topic() {
        let gateway = gateway();
        assert_eq!(
            gateway.route(&message("home/doorlock/set", b"LOCK")).ok(),
            Some(Inbound::Command(Target::Locked))
        );
        assert_eq!(
            gateway.route(&message("home/doorlock/check_status", b"")).ok(),
            Some(Inbound::CheckStatus)
        );
        assert_eq!(
            gateway.route(&message("home/door/contact", b"UNLOCKED")).ok(),
            Some(Inbound::Sensor(LockState::Unlocked))
        );
        assert!(matches!(
            gateway.route(&message("home/doorlock/set", b"JIGGLE")),
            Err(CoreError::MalformedMessage { .. })
        ));
        assert!(gateway.route(&message("elsewhere", b"LOCK")).is_err());
    }

    #[test]
    fn subscriptions_include_optional_topics() {
        assert_eq!(
            gateway().subscriptions(),
            vec![
                "home/doorlock/set".to_owned(),
                "home/doorlock/check_status".to_owned(),
                "home/door/contact".to_owned(),
            ]
        );
    }

    #[test]
    fn last_will_is_unknown_on_state_topic() {
        let will = last_will(&Topics::default());
        assert_eq!(will.topic, "home/doorlock/state");
        assert_eq!(will.payload, "UNKNOWN");
    }
}
