//! Broker transport seam.
//!
//! The session never talks to rumqttc directly. It opens, publishes and
//! subscribes through [`BrokerTransport`] and learns about connection
//! progress and inbound messages by draining [`TransportEvent`]s, which keeps
//! the session synchronous and testable without a broker.

use rumqttc::{AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::SessionOptions;
use super::message_manager::{InboundMessage, OutboundMessage};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("No open broker session")]
    NotOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the session
    Connected,
    /// The session ended; the transport has to be reopened
    Disconnected(String),
    Message(InboundMessage),
}

pub trait BrokerTransport {
    /// Starts a connection attempt. Success is reported later as
    /// [`TransportEvent::Connected`]. Opening again supersedes any previous
    /// attempt.
    fn open(&mut self, options: &SessionOptions) -> Result<(), BrokerError>;

    fn close(&mut self);

    /// Next pending event, without waiting.
    fn next_event(&mut self) -> Option<TransportEvent>;

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), BrokerError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;
}

/// rumqttc backed transport. The event loop runs in its own tokio task and
/// forwards what the session cares about through a bounded channel.
pub struct RumqttTransport {
    capacity: usize,
    client: Option<AsyncClient>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    cancel: Option<CancellationToken>,
}

impl RumqttTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            client: None,
            events: None,
            cancel: None,
        }
    }

    fn mqtt_options(options: &SessionOptions) -> MqttOptions {
        let creds = &options.credentials;
        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), creds.host.clone(), creds.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                options.will_topic.clone(),
                options.will_payload.clone().into_bytes(),
                QoS::AtMostOnce,
                options.will_retain,
            ));

        if creds.has_username() {
            mqtt_options.set_credentials(creds.username.clone(), creds.password.clone());
        }

        mqtt_options
    }
}

impl BrokerTransport for RumqttTransport {
    fn open(&mut self, options: &SessionOptions) -> Result<(), BrokerError> {
        self.close();

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::Connect(format!("no async runtime: {}", e)))?;

        let (client, mut eventloop) = AsyncClient::new(Self::mqtt_options(options), self.capacity);
        let (tx, rx) = mpsc::channel(self.capacity);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let host = format!("{}:{}", options.credentials.host, options.credentials.port);

        runtime.spawn(async move {
            debug!("Broker event loop started for {}", host);
            loop {
                let polled = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    polled = eventloop.poll() => polled,
                };

                let event = match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            TransportEvent::Connected
                        } else {
                            TransportEvent::Disconnected(format!("connection refused: {:?}", ack.code))
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message(
                        InboundMessage::new(publish.topic, publish.payload.to_vec()),
                    ),
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        TransportEvent::Disconnected("broker closed the session".to_string())
                    }
                    Ok(_) => continue,
                    Err(e) => TransportEvent::Disconnected(e.to_string()),
                };

                let terminal = matches!(event, TransportEvent::Disconnected(_));
                if tx.send(event).await.is_err() {
                    debug!("Session dropped its event receiver, stopping event loop");
                    break;
                }
                if terminal {
                    break;
                }
            }
            debug!("Broker event loop for {} finished", host);
        });

        info!(
            "Opening broker session to {}:{} as {}",
            options.credentials.host, options.credentials.port, options.client_id
        );
        self.client = Some(client);
        self.events = Some(rx);
        self.cancel = Some(token);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }
        self.events = None;
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or(BrokerError::NotOpen)?;
        client
            .try_publish(
                message.topic.clone(),
                QoS::AtMostOnce,
                message.retain,
                message.payload.clone().into_bytes(),
            )
            .map_err(|e| {
                error!("Publish to {} failed: {}", message.topic, e);
                BrokerError::Publish {
                    topic: message.topic.clone(),
                    reason: e.to_string(),
                }
            })
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or(BrokerError::NotOpen)?;
        client
            .try_subscribe(topic.to_string(), QoS::AtMostOnce)
            .map_err(|e| {
                warn!("Subscribe to {} failed: {}", topic, e);
                BrokerError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }
            })
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::BrokerCredentials;
    use std::time::Duration;

    fn options() -> SessionOptions {
        SessionOptions {
            client_id: "test".to_string(),
            credentials: BrokerCredentials {
                host: "127.0.0.1".to_string(),
                port: 1,
                username: String::new(),
                password: String::new(),
            },
            keep_alive: Duration::from_secs(15),
            will_topic: "t/availability".to_string(),
            will_payload: "offline".to_string(),
            will_retain: true,
        }
    }

    #[test]
    fn publishing_before_open_fails() {
        let mut transport = RumqttTransport::new(8);
        let msg = OutboundMessage::retained("t", "ON");
        assert!(matches!(transport.publish(&msg), Err(BrokerError::NotOpen)));
        assert!(transport.next_event().is_none());
    }

    #[test]
    fn open_outside_runtime_is_an_error() {
        let mut transport = RumqttTransport::new(8);
        assert!(matches!(
            transport.open(&options()),
            Err(BrokerError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_reported_as_disconnect() {
        let mut transport = RumqttTransport::new(8);
        transport.open(&options()).unwrap();

        let mut event = None;
        for _ in 0..100 {
            if let Some(e) = transport.next_event() {
                event = Some(e);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(event, Some(TransportEvent::Disconnected(_))));
    }
}
