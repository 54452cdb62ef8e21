//! Pure routing of `rumqttc` events for a publish-only link
//!
//! The network loop feeds every polled event through [`MessageHandler`] and
//! acts on the resulting [`EventRoute`]. Nothing here performs I/O.

use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, PubAckReason};
use rumqttc::v5::{ConnectionError, Event};
use rumqttc::Outgoing;

/// Outcome reported to a publisher waiting for its PUBACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Rejected(String),
    LinkLost(String),
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// Handshake finished successfully
    ConnectionAcknowledged,
    /// Handshake answered with a failure code
    ConnectionRefused(String),
    /// A QoS 1 publish left the client with this packet id
    PublishSent(u16),
    /// Broker answered a publish
    PublishAcknowledged { pkid: u16, outcome: AckOutcome },
    /// Broker closed the link
    Disconnected(String),
    /// Anything else coming from the broker
    InfrastructureEvent(String),
    /// Outgoing traffic that needs no bookkeeping
    OutgoingEvent,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    if connack.code == ConnectReturnCode::Success {
                        EventRoute::ConnectionAcknowledged
                    } else {
                        EventRoute::ConnectionRefused(format!("{:?}", connack.code))
                    }
                }
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    pkid: puback.pkid,
                    outcome: Self::ack_outcome(&puback.reason),
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("Broker disconnected: {disconnect:?}"))
                }
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent(*pkid),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Map a PUBACK reason to a publish outcome (pure function)
    ///
    /// "No matching subscribers" is still a successful delivery to the broker.
    pub fn ack_outcome(reason: &PubAckReason) -> AckOutcome {
        match reason {
            PubAckReason::Success | PubAckReason::NoMatchingSubscribers => AckOutcome::Acked,
            other => AckOutcome::Rejected(format!("{other:?}")),
        }
    }

    /// Classify a network loop error into refused vs. plain network failure
    pub fn classify_connection_error(error: &ConnectionError) -> EventRoute {
        match error {
            ConnectionError::ConnectionRefused(code) => {
                EventRoute::ConnectionRefused(format!("{code:?}"))
            }
            other => EventRoute::Disconnected(other.to_string()),
        }
    }
}
