use crate::error::{CourierError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Stable identifier shared by every delivery of one logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    const MAX_LENGTH: usize = 128;

    /// Wraps an existing key, e.g. one read back from the broker.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || key.len() > Self::MAX_LENGTH {
            return Err(CourierError::InvalidMessage(format!(
                "idempotency key must be 1..={} characters",
                Self::MAX_LENGTH
            )));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CourierError::InvalidMessage(
                "idempotency key contains invalid characters".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Builds a fresh key from a monotonically increasing sequence number and
    /// a random suffix: `<unix-millis>-<sequence>-<suffix>`.
    pub fn generate(sequence: i64) -> Self {
        let suffix: u32 = rand::thread_rng().r#gen();
        Self(format!(
            "{}-{}-{:08x}",
            Utc::now().timestamp_millis(),
            sequence,
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-facing publish options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub persistent: bool,
    pub priority: u8,
    pub expiration: Option<Duration>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: 0,
            expiration: None,
        }
    }
}

impl PublishOptions {
    pub fn transient() -> Self {
        Self {
            persistent: false,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// Broker-level properties that travel next to the JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub message_id: String,
    pub persistent: bool,
    pub priority: u8,
    /// Per-message TTL in milliseconds, as a decimal string.
    pub expiration: Option<String>,
}

impl MessageProperties {
    pub fn expiration_ms(&self) -> Option<u64> {
        self.expiration.as_deref().and_then(|ms| ms.parse().ok())
    }
}

/// The JSON body put on the wire.
///
/// `{ "type", ...domain fields, "timestamp", "idempotencyKey", "retryCount" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
    pub retry_count: u32,
}

/// A domain event in flight between services.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub idempotency_key: IdempotencyKey,
    pub queue: String,
    pub event_type: String,
    pub payload: Map<String, Value>,
    pub retry_count: u32,
    pub persistent: bool,
    pub priority: u8,
    pub expiration: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Builds a message from any value whose JSON form is an object with a string `type`.
    pub fn from_event<E: Serialize + ?Sized>(
        queue: &str,
        event: &E,
        key: IdempotencyKey,
        options: &PublishOptions,
    ) -> Result<Self> {
        let mut payload = match serde_json::to_value(event)? {
            Value::Object(map) => map,
            other => {
                return Err(CourierError::InvalidMessage(format!(
                    "event must serialize to a JSON object, got {other}"
                )));
            }
        };
        let event_type = match payload.remove("type") {
            Some(Value::String(event_type)) if !event_type.is_empty() => event_type,
            _ => {
                return Err(CourierError::InvalidMessage(
                    "event is missing a string \"type\" field".to_string(),
                ));
            }
        };
        for reserved in ["timestamp", "idempotencyKey", "retryCount"] {
            if payload.contains_key(reserved) {
                return Err(CourierError::InvalidMessage(format!(
                    "event field \"{reserved}\" is reserved for the envelope"
                )));
            }
        }

        Ok(Self {
            idempotency_key: key,
            queue: queue.to_string(),
            event_type,
            payload,
            retry_count: 0,
            persistent: options.persistent,
            priority: options.priority,
            expiration: options.expiration,
            created_at: Utc::now(),
        })
    }

    /// Rebuilds a message from a broker delivery.
    pub fn from_wire(queue: &str, body: &[u8], properties: &MessageProperties) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        Ok(Self {
            idempotency_key: envelope.idempotency_key,
            queue: queue.to_string(),
            event_type: envelope.event_type,
            payload: envelope.fields,
            retry_count: envelope.retry_count,
            persistent: properties.persistent,
            priority: properties.priority,
            expiration: properties.expiration_ms().map(Duration::from_millis),
            created_at: envelope.timestamp,
        })
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            event_type: self.event_type.clone(),
            fields: self.payload.clone(),
            timestamp: self.created_at,
            idempotency_key: self.idempotency_key.clone(),
            retry_count: self.retry_count,
        }
    }

    pub fn to_wire(&self) -> Result<(Vec<u8>, MessageProperties)> {
        let body = serde_json::to_vec(&self.envelope())?;
        let properties = MessageProperties {
            message_id: self.idempotency_key.to_string(),
            persistent: self.persistent,
            priority: self.priority,
            expiration: self.expiration.map(|ttl| ttl.as_millis().to_string()),
        };
        Ok((body, properties))
    }

    /// The copy that goes back on the queue after a failed attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Deserializes the payload (with its `type`) into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut object = self.payload.clone();
        object.insert("type".to_string(), Value::String(self.event_type.clone()));
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        Message::from_event(
            "payment.created",
            &json!({"type": "payment.created", "paymentId": "pm_1", "amount": 1000}),
            IdempotencyKey::generate(1),
            &PublishOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_generated_keys_are_valid_and_distinct() {
        let a = IdempotencyKey::generate(1);
        let b = IdempotencyKey::generate(2);
        assert_ne!(a, b);
        assert!(IdempotencyKey::new(a.as_str()).is_ok());
    }

    #[test]
    fn test_key_validation() {
        assert!(IdempotencyKey::new("").is_err());
        assert!(IdempotencyKey::new("has space").is_err());
        assert!(IdempotencyKey::new("x".repeat(129)).is_err());
        assert!(IdempotencyKey::new("evt_1-abc").is_ok());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let message = sample();
        let (body, properties) = message.to_wire().unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["type"], "payment.created");
        assert_eq!(value["paymentId"], "pm_1");
        assert_eq!(value["amount"], 1000);
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["idempotencyKey"], message.idempotency_key.as_str());
        assert!(value["timestamp"].is_string());
        assert!(properties.persistent);
        assert_eq!(properties.message_id, message.idempotency_key.as_str());
    }

    #[test]
    fn test_next_attempt_keeps_key_and_timestamp() {
        let message = sample();
        let retry = message.next_attempt();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.idempotency_key, message.idempotency_key);
        assert_eq!(retry.created_at, message.created_at);

        let (body, properties) = retry.to_wire().unwrap();
        let decoded = Message::from_wire("payment.created", &body, &properties).unwrap();
        assert_eq!(decoded, retry);
    }

    #[test]
    fn test_event_without_type_is_rejected() {
        let result = Message::from_event(
            "payment.created",
            &json!({"paymentId": "pm_1"}),
            IdempotencyKey::generate(1),
            &PublishOptions::default(),
        );
        assert!(matches!(result, Err(CourierError::InvalidMessage(_))));
    }

    #[test]
    fn test_reserved_field_is_rejected() {
        let result = Message::from_event(
            "payment.created",
            &json!({"type": "x", "retryCount": 9}),
            IdempotencyKey::generate(1),
            &PublishOptions::default(),
        );
        assert!(matches!(result, Err(CourierError::InvalidMessage(_))));
    }

    #[test]
    fn test_expiration_travels_as_millisecond_string() {
        let options = PublishOptions::default().with_expiration(Duration::from_secs(60));
        let message = Message::from_event(
            "q",
            &json!({"type": "t"}),
            IdempotencyKey::generate(7),
            &options,
        )
        .unwrap();
        let (_, properties) = message.to_wire().unwrap();
        assert_eq!(properties.expiration.as_deref(), Some("60000"));
        assert_eq!(properties.expiration_ms(), Some(60_000));
    }
}
