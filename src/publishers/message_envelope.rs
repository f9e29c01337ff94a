use amq_protocol_types::{FieldTable, ShortString, Timestamp};
use lapin::BasicProperties;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// Optional metadata attached to a message when calling
/// [`Publisher::publish_with_properties`](super::Publisher::publish_with_properties).
///
/// Missing values are filled in by the publisher:
/// - `app_id` falls back to the publisher's configured app id;
/// - `correlation_id` falls back to a freshly generated UUID v4;
/// - `timestamp` falls back to the current time (seconds since the Unix epoch);
/// - `routing_key` falls back to the publisher's configured routing key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub app_id: Option<String>,
    pub correlation_id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub routing_key: Option<String>,
    pub content_type: Option<String>,
    // AMQP headers attached to the message.
    pub headers: Option<FieldTable>,
}

impl MessageProperties {
    pub fn with_app_id(mut self, value: impl Into<String>) -> Self {
        self.app_id = Some(value.into());
        self
    }

    pub fn with_correlation_id(mut self, value: impl Into<String>) -> Self {
        self.correlation_id = Some(value.into());
        self
    }

    pub fn with_timestamp(mut self, value: Timestamp) -> Self {
        self.timestamp = Some(value);
        self
    }

    pub fn with_routing_key(mut self, value: impl Into<String>) -> Self {
        self.routing_key = Some(value.into());
        self
    }

    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn with_headers(mut self, value: FieldTable) -> Self {
        self.headers = Some(value);
        self
    }
}

/// Publisher-level fallbacks for [`MessageProperties`].
#[derive(Debug, Clone, Default)]
pub(crate) struct EnvelopeDefaults {
    pub(crate) app_id: Option<String>,
    pub(crate) routing_key: String,
}

/// A message ready to be published, with all its defaults resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    // The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub app_id: Option<String>,
    pub correlation_id: String,
    // `None` only if the system clock is set before 1970.
    pub timestamp: Option<Timestamp>,
    pub content_type: Option<String>,
    pub headers: Option<FieldTable>,
}

impl MessageEnvelope {
    pub(crate) fn resolve(
        payload: Vec<u8>,
        properties: MessageProperties,
        defaults: &EnvelopeDefaults,
    ) -> Self {
        let MessageProperties {
            app_id,
            correlation_id,
            timestamp,
            routing_key,
            content_type,
            headers,
        } = properties;

        Self {
            payload,
            routing_key: routing_key.unwrap_or_else(|| defaults.routing_key.clone()),
            app_id: app_id.or_else(|| defaults.app_id.clone()),
            correlation_id: correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: timestamp.or_else(current_timestamp),
            content_type,
            headers,
        }
    }

    /// The AMQP properties sent along with the payload.
    ///
    /// Delivery mode: non-persistent (1) or persistent (2).
    /// If `persistent` is `false` the broker default is used.
    pub fn amqp_properties(&self, persistent: bool) -> BasicProperties {
        let mut properties =
            BasicProperties::default().with_correlation_id(self.correlation_id.clone().into());
        if let Some(app_id) = &self.app_id {
            properties = properties.with_app_id(ShortString::from(app_id.clone()));
        }
        if let Some(timestamp) = self.timestamp {
            properties = properties.with_timestamp(timestamp);
        }
        if let Some(content_type) = &self.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(headers) = &self.headers {
            properties = properties.with_headers(headers.clone());
        }
        if persistent {
            properties = properties.with_delivery_mode(2);
        }
        properties
    }
}

fn current_timestamp() -> Option<Timestamp> {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => Some(elapsed.as_secs()),
        Err(_) => {
            warn!("System time is before 1970");
            None
        }
    }
}
