//! Envelope extraction and confirmed publishing

use super::connect::ConnectOrchestrator;
use super::key::ConnectionKey;
use super::managed::ManagedConnection;
use super::registry::ConnectionRegistry;
use crate::error::BridgeError;
use crate::observability::MetricsCollector;
use crate::publish_span;
use crate::transport::{ConnectError, Credentials};
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn, Instrument};

/// A JSON object arriving with a publish request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboundEnvelope(Map<String, Value>);

impl OutboundEnvelope {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// `None` unless `value` is a JSON object
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The device-bound part of an assistant reply
    ///
    /// Looks at `values`, then `value`. An object becomes the envelope itself;
    /// any other value is carried under `value_field`. `None` when the reply
    /// has nothing for the device.
    pub fn from_reply(reply: &OutboundEnvelope, value_field: &str) -> Option<Self> {
        let content = ["values", "value"]
            .iter()
            .find_map(|field| reply.get(field))
            .filter(|content| !content.is_null())?;

        match content {
            Value::Object(fields) => Some(Self(fields.clone())),
            other => {
                let mut fields = Map::new();
                fields.insert(value_field.to_string(), other.clone());
                Some(Self(fields))
            }
        }
    }

    /// What actually goes on the wire; a null value field counts as absent
    pub fn content(&self, value_field: &str) -> OutboundContent<'_> {
        match self.0.get(value_field) {
            Some(value) if !value.is_null() => OutboundContent::Field(value),
            _ => OutboundContent::Whole(&self.0),
        }
    }
}

impl From<Map<String, Value>> for OutboundEnvelope {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutboundContent<'a> {
    /// Only the designated value field
    Field(&'a Value),
    /// No value field, the whole envelope
    Whole(&'a Map<String, Value>),
}

impl OutboundContent<'_> {
    /// Objects and arrays as JSON text, strings verbatim, other scalars in
    /// their natural form
    pub fn render(&self) -> Vec<u8> {
        match *self {
            OutboundContent::Whole(fields) => to_spaced_json(fields),
            OutboundContent::Field(value) => match value {
                Value::String(text) => text.as_bytes().to_vec(),
                Value::Object(_) | Value::Array(_) => to_spaced_json(value),
                scalar => scalar.to_string().into_bytes(),
            },
        }
    }
}

/// `", "` between items and `": "` after keys, so `{"temp": 21}` renders
/// exactly like that
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

fn to_spaced_json<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, SpacedFormatter);
    // Serializing a serde_json::Value into memory cannot fail
    if value.serialize(&mut serializer).is_err() {
        buffer.clear();
    }
    buffer
}

/// Publishes envelopes over pooled connections
pub struct Publisher {
    registry: Arc<ConnectionRegistry>,
    orchestrator: ConnectOrchestrator,
    value_field: String,
    ack_timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl Publisher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        orchestrator: ConnectOrchestrator,
        value_field: impl Into<String>,
        ack_timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            value_field: value_field.into(),
            ack_timeout,
            metrics,
        }
    }

    /// Pooled connection for `key`, connecting on a miss
    pub async fn connection(
        &self,
        key: &ConnectionKey,
        credentials: Option<Credentials>,
    ) -> Result<Arc<ManagedConnection>, ConnectError> {
        let orchestrator = self.orchestrator.clone();
        let attempt_key = key.clone();
        self.registry
            .get_or_create(key, move || orchestrator.connect(attempt_key, credentials))
            .await
    }

    /// Publish and report why it failed
    ///
    /// A publish that times out or is rejected leaves the connection pooled.
    pub async fn try_publish(
        &self,
        key: &ConnectionKey,
        credentials: Option<Credentials>,
        topic: &str,
        envelope: &OutboundEnvelope,
    ) -> Result<(), BridgeError> {
        let span = publish_span!(topic = %topic, key = %key);
        let result = async {
            let connection = self.connection(key, credentials).await?;
            let payload = envelope.content(&self.value_field).render();
            debug!(client_id = %connection.client_id(), bytes = payload.len(), "Publishing envelope");

            let started = Instant::now();
            connection.publish(topic, payload, self.ack_timeout).await?;
            self.metrics.message_published(started.elapsed());
            Ok::<(), BridgeError>(())
        }
        .instrument(span)
        .await;

        if result.is_err() {
            self.metrics.publish_failed();
        }
        result
    }

    /// `true` once the broker has acknowledged the message
    pub async fn publish(
        &self,
        key: &ConnectionKey,
        credentials: Option<Credentials>,
        topic: &str,
        envelope: &OutboundEnvelope,
    ) -> bool {
        match self.try_publish(key, credentials, topic, envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, topic = %topic, error = %e.user_message(), "Publish failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::connect::ConnectSettings;
    use crate::testing::{AckBehavior, ConnectBehavior, MockBrokerAdapter};
    use serde_json::json;

    fn envelope(value: Value) -> OutboundEnvelope {
        OutboundEnvelope::from_value(value).unwrap()
    }

    fn rendered(value: Value) -> String {
        String::from_utf8(envelope(value).content("MQTT_value").render()).unwrap()
    }

    fn publisher(adapter: &MockBrokerAdapter) -> (Publisher, Arc<ConnectionRegistry>) {
        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(ConnectionRegistry::new(
            Duration::from_millis(50),
            Arc::clone(&metrics),
        ));
        let settings = ConnectSettings {
            poll_ceiling: Duration::from_millis(100),
            deadline: Duration::from_millis(200),
            ..ConnectSettings::default()
        };
        let orchestrator =
            ConnectOrchestrator::new(Arc::new(adapter.clone()), settings, Arc::clone(&metrics));
        let publisher = Publisher::new(
            Arc::clone(&registry),
            orchestrator,
            "MQTT_value",
            Duration::from_millis(100),
            metrics,
        );
        (publisher, registry)
    }

    #[test]
    fn test_value_field_is_extracted() {
        assert_eq!(
            rendered(json!({"MQTT_value": {"x": 1}, "other": "ignored"})),
            r#"{"x": 1}"#
        );
    }

    #[test]
    fn test_whole_envelope_without_value_field() {
        assert_eq!(rendered(json!({"other": "ignored"})), r#"{"other": "ignored"}"#);
    }

    #[test]
    fn test_null_value_field_counts_as_absent() {
        assert_eq!(
            rendered(json!({"MQTT_value": null, "a": 1})),
            r#"{"MQTT_value": null, "a": 1}"#
        );
    }

    #[test]
    fn test_reply_unwraps_values_before_value() {
        let reply = envelope(json!({
            "response": "Lamp is on",
            "values": {"MQTT_value": {"on": true}},
            "value": {"MQTT_value": "ignored"}
        }));
        let extracted = OutboundEnvelope::from_reply(&reply, "MQTT_value").unwrap();
        assert_eq!(extracted.content("MQTT_value").render(), br#"{"on": true}"#.to_vec());

        let reply = envelope(json!({"response": "ok", "value": "dim"}));
        let extracted = OutboundEnvelope::from_reply(&reply, "MQTT_value").unwrap();
        assert_eq!(extracted.content("MQTT_value").render(), b"dim".to_vec());

        let reply = envelope(json!({"response": "Nothing to send", "values": null}));
        assert!(OutboundEnvelope::from_reply(&reply, "MQTT_value").is_none());
        assert!(OutboundEnvelope::from_reply(&envelope(json!({"response": "hi"})), "MQTT_value").is_none());
    }

    #[test]
    fn test_scalar_rendering() {
        assert_eq!(rendered(json!({"MQTT_value": "turn on"})), "turn on");
        assert_eq!(rendered(json!({"MQTT_value": 21})), "21");
        assert_eq!(rendered(json!({"MQTT_value": 1.5})), "1.5");
        assert_eq!(rendered(json!({"MQTT_value": true})), "true");
    }

    #[test]
    fn test_nested_structures_keep_insertion_order() {
        assert_eq!(
            rendered(json!({"MQTT_value": {"zone": "b", "levels": [1, 2, {"a": null}]}})),
            r#"{"zone": "b", "levels": [1, 2, {"a": null}]}"#
        );
        assert_eq!(rendered(json!({"MQTT_value": []})), "[]");
    }

    #[test]
    fn test_custom_value_field() {
        let envelope = envelope(json!({"payload": {"on": false}, "MQTT_value": 1}));
        assert_eq!(envelope.content("payload").render(), br#"{"on": false}"#.to_vec());
    }

    #[tokio::test]
    async fn test_publish_transmits_extracted_value() {
        let adapter = MockBrokerAdapter::new();
        let (publisher, registry) = publisher(&adapter);
        let key = ConnectionKey::resolve("localhost", 1883, None, None);

        let ok = publisher
            .publish(&key, None, "test/topic", &envelope(json!({"MQTT_value": {"temp": 21}})))
            .await;

        assert!(ok);
        assert_eq!(
            adapter.published(),
            vec![("test/topic".to_string(), br#"{"temp": 21}"#.to_vec())]
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_publish_keeps_connection() {
        let adapter = MockBrokerAdapter::new();
        adapter.set_ack_behavior(AckBehavior::Silent);
        let (publisher, registry) = publisher(&adapter);
        let key = ConnectionKey::resolve("localhost", 1883, None, None);

        let result = publisher
            .try_publish(&key, None, "test/topic", &envelope(json!({"a": 1})))
            .await;

        assert!(matches!(result, Err(BridgeError::Publish(_))));
        assert!(registry.contains(&key).await);
        assert_eq!(adapter.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_false() {
        let adapter = MockBrokerAdapter::with_behavior(ConnectBehavior::Hang);
        let (publisher, registry) = publisher(&adapter);
        let key = ConnectionKey::resolve("localhost", 1883, None, None);

        let ok = publisher
            .publish(&key, None, "test/topic", &envelope(json!({"a": 1})))
            .await;

        assert!(!ok);
        assert!(registry.is_empty().await);
        assert!(adapter.published().is_empty());
    }
}
