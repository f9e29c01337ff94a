//! Facilities to publish messages to a RabbitMq exchange. Check out [`Publisher`] as a starting point.
mod error_sink;
mod message_envelope;
mod publisher;
mod serializer;

pub use error_sink::{ErrorSink, LogErrorSink};
pub use message_envelope::{MessageEnvelope, MessageProperties};
pub use publisher::{PublishCallback, PublishError, Publisher, PublisherBuilder};
pub use serializer::Serializer;
