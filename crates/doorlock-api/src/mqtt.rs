//! MQTT broker session with auto-reconnect.
//!
//! Wraps a `rumqttc` client/event-loop pair. The event loop runs on a
//! background task that re-subscribes after every (re)connect, forwards
//! inbound publishes through an `mpsc` channel, and backs off between
//! failed connection attempts.
//!
//! ```rust,ignore
//! let cancel = CancellationToken::new();
//! let (bus, mut inbound) = BusClient::connect(options, cancel.clone());
//! while let Some(msg) = inbound.recv().await {
//!     println!("{}: {:?}", msg.topic, msg.payload);
//! }
//! ```

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::{ReconnectConfig, calculate_backoff};
use crate::error::Error;

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const INBOUND_CHANNEL_CAPACITY: usize = 64;
/// How long `disconnect` lets queued publishes drain.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

// ── Options ─────────────────────────────────────────────────────────

/// Retained message the broker publishes if the session dies uncleanly.
#[derive(Debug, Clone)]
pub struct LastWillMessage {
    pub topic: String,
    pub payload: String,
}

/// Everything needed to open and maintain one broker session.
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub credentials: Option<(String, SecretString)>,
    /// Topics (re)subscribed on every ConnAck.
    pub subscriptions: Vec<String>,
    pub last_will: Option<LastWillMessage>,
    pub reconnect: ReconnectConfig,
}

impl BusOptions {
    fn to_mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username, password.expose_secret());
        }
        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
            ));
        }
        options
    }
}

/// A publish received on one of the subscribed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

// ── BusClient ───────────────────────────────────────────────────────

/// Handle to a running broker session. Cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl BusClient {
    /// Create the session and spawn its event loop.
    ///
    /// Returns immediately; the first connection attempt happens on the
    /// background task. Inbound publishes arrive on the returned receiver.
    pub fn connect(
        options: BusOptions,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (client, eventloop) =
            AsyncClient::new(options.to_mqtt_options(), REQUEST_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);

        tokio::spawn(event_loop(
            eventloop,
            client.clone(),
            options,
            inbound_tx,
            connected_tx,
            cancel.clone(),
        ));

        (
            Self {
                client,
                connected: connected_rx,
                cancel,
            },
            inbound_rx,
        )
    }

    /// Publish at QoS 1. Queued while the broker is unreachable.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), Error> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;
        Ok(())
    }

    /// Whether the last ConnAck has not yet been followed by an error.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Queue DISCONNECT behind any pending publishes, wait for the event
    /// loop to send it, then stop the loop.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let result = self.client.disconnect().await;
        if result.is_ok() {
            let mut connected = self.connected.clone();
            if tokio::time::timeout(DISCONNECT_GRACE, connected.wait_for(|c| !*c))
                .await
                .is_err()
            {
                tracing::debug!("broker did not drain before disconnect");
            }
        }
        self.cancel.cancel();
        result.map_err(Error::from)
    }
}

// ── Background event loop ───────────────────────────────────────────

async fn event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    options: BusOptions,
    inbound_tx: mpsc::Sender<InboundMessage>,
    connected_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::info!(
                        host = %options.host,
                        port = options.port,
                        code = ?ack.code,
                        "connected to broker"
                    );
                    attempt = 0;
                    let _ = connected_tx.send(true);
                    for topic in &options.subscriptions {
                        // try_subscribe: the request queue is drained by this
                        // very loop, so awaiting here could stall it.
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            tracing::warn!(topic = %topic, error = %e, "subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                    };
                    if inbound_tx.send(message).await.is_err() {
                        tracing::debug!("inbound receiver dropped, stopping event loop");
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!("disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = connected_tx.send(false);
                    tracing::warn!(error = %e, attempt, "broker connection error");

                    if let Some(max) = options.reconnect.max_retries {
                        if attempt >= max {
                            tracing::error!(max_retries = max, "broker reconnect limit reached, giving up");
                            break;
                        }
                    }

                    let delay = calculate_backoff(attempt, &options.reconnect);
                    tracing::debug!(delay_ms = delay.as_millis(), attempt, "waiting before reconnect");

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
            },
        }
    }

    let _ = connected_tx.send(false);
    tracing::debug!("broker event loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> BusOptions {
        BusOptions {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "doorlock-test".into(),
            keep_alive: Duration::from_secs(30),
            credentials: Some(("bridge".into(), SecretString::from("hunter2".to_string()))),
            subscriptions: vec!["home/doorlock/set".into()],
            last_will: Some(LastWillMessage {
                topic: "home/doorlock/state".into(),
                payload: "UNKNOWN".into(),
            }),
            reconnect: ReconnectConfig::default(),
        }
    }

    #[test]
    fn mqtt_options_carry_identity_and_will() {
        let mqtt = options().to_mqtt_options();
        assert_eq!(mqtt.client_id(), "doorlock-test");
        assert_eq!(mqtt.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(30));

        let will = mqtt.last_will().expect("last will set");
        assert_eq!(will.topic, "home/doorlock/state");
        assert_eq!(&will.message[..], b"UNKNOWN");
        assert!(will.retain);

        assert_eq!(
            mqtt.credentials(),
            Some(("bridge".to_string(), "hunter2".to_string()))
        );
    }

    #[test]
    fn no_credentials_by_default() {
        let mut opts = options();
        opts.credentials = None;
        opts.last_will = None;
        let mqtt = opts.to_mqtt_options();
        assert!(mqtt.credentials().is_none());
        assert!(mqtt.last_will().is_none());
    }
}
