use crate::amqp::configuration::{ExchangeSettings, PublisherSettings};
use crate::amqp::transport::{BrokerChannel, ChannelOf, Transport};
use crate::amqp::ConnectionFactory;
use crate::pool::{ConnectionPool, Lease};
use crate::publishers::message_envelope::EnvelopeDefaults;
use crate::publishers::{ErrorSink, LogErrorSink, MessageEnvelope, MessageProperties, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Invoked with the channel a message was published on, once it has been handed to the broker.
pub type PublishCallback<C> = Box<dyn FnOnce(&C) + Send + 'static>;

/// A high-level interface to publish messages to a single exchange.
///
/// # Ordering
///
/// `publish` returns immediately: the message is queued and published in the background.
/// Messages are handed over to the broker in the same order their `publish` calls were made,
/// and the exchange declaration + publishing of two messages never interleave.
///
/// # Connections
///
/// Connections are opened on demand and reused across publishes. A connection that has not been
/// used for the configured idle timeout is closed.
///
/// # Failures
///
/// There are no retries. If a message cannot be published the error is forwarded to the
/// [`ErrorSink`] and the callback (if any) is never invoked. The publisher stays usable: the
/// next message will try a fresh connection if needed.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`], or [`Publisher::from_settings`] if you are
/// loading your configuration from a file.
///
/// `Publisher` is cheap to clone: clones share the same connections and publishing queue.
pub struct Publisher<T: Transport = ConnectionFactory> {
    shared: Arc<Shared<T>>,
    serializer: Serializer,
}

impl<T: Transport> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            serializer: self.serializer.clone(),
        }
    }
}

struct Shared<T: Transport> {
    pool: ConnectionPool<T>,
    exchange: ExchangeSettings,
    defaults: EnvelopeDefaults,
    silent: bool,
    error_sink: Arc<dyn ErrorSink>,
}

/// Error forwarded to the [`ErrorSink`] when a message could not be published.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("Failed to get a connection to the RabbitMq broker")]
    ConnectionFailure(#[source] anyhow::Error),
    #[error("The RabbitMq broker rejected the exchange declaration")]
    DeclareFailure(#[source] anyhow::Error),
    #[error("Failed to publish the message to RabbitMq")]
    PublishFailure(#[source] anyhow::Error),
    /// Closing an evicted channel or connection failed.
    /// It is only ever logged.
    #[error("Failed to close a RabbitMq channel or connection")]
    CloseFailure(#[source] anyhow::Error),
}

impl Publisher<ConnectionFactory> {
    /// Build a [`Publisher`] connecting to a RabbitMq broker with the given settings.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Example
    ///
    /// ```rust
    /// use carrot_chatter::amqp::configuration::PublisherSettings;
    /// use carrot_chatter::publishers::Publisher;
    ///
    /// async fn get_publisher() -> Result<Publisher, anyhow::Error> {
    ///     let settings = PublisherSettings {
    ///         app_id: Some("my-app".into()),
    ///         ..Default::default()
    ///     };
    ///     Publisher::from_settings(&settings)
    /// }
    /// ```
    pub fn from_settings(settings: &PublisherSettings) -> Result<Self, anyhow::Error> {
        let connection_factory = ConnectionFactory::new_from_config(&settings.broker)?;
        Ok(Publisher::builder(connection_factory)
            .with_settings(settings)
            .build())
    }
}

impl<T: Transport> Publisher<T> {
    /// Start building a [`Publisher`] on top of `transport`.
    pub fn builder(transport: T) -> PublisherBuilder<T> {
        PublisherBuilder::new(transport)
    }

    /// Publish a message using the publisher's defaults.
    pub fn publish(&self, message: impl Into<Vec<u8>>) {
        self.publish_with_properties(message, MessageProperties::default());
    }

    /// Publish a message, overriding some of the publisher's defaults.
    pub fn publish_with_properties(
        &self,
        message: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) {
        self.publish_with_callback(message, properties, |_| {});
    }

    /// Publish a message and invoke `callback` once it has been handed over to the broker.
    ///
    /// `callback` is not invoked if publishing fails: the error goes to the [`ErrorSink`].
    pub fn publish_with_callback<F>(
        &self,
        message: impl Into<Vec<u8>>,
        properties: MessageProperties,
        callback: F,
    ) where
        F: FnOnce(&ChannelOf<T>) + Send + 'static,
    {
        let envelope = MessageEnvelope::resolve(message.into(), properties, &self.shared.defaults);
        let callback: PublishCallback<ChannelOf<T>> = Box::new(callback);
        let shared = Arc::clone(&self.shared);
        self.serializer.enqueue(async move {
            match shared.send(&envelope).await {
                Ok(lease) => callback(lease.channel()),
                Err(e) => shared.error_sink.handle(e),
            }
        });
    }

    /// Wait for every message submitted so far to be processed, successfully or not.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.serializer.enqueue(async move {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Flush the queue, then close all connections.
    ///
    /// The publisher can still be used afterwards: a new connection is opened on demand.
    pub async fn close(&self) {
        self.flush().await;
        self.shared.pool.close_all().await;
    }

    /// Number of messages waiting to be published, including the one in flight.
    pub fn pending(&self) -> usize {
        self.serializer.pending()
    }

    pub fn pool(&self) -> &ConnectionPool<T> {
        &self.shared.pool
    }

    pub fn exchange(&self) -> &ExchangeSettings {
        &self.shared.exchange
    }
}

impl<T: Transport> Shared<T> {
    /// Acquire a channel, assert the exchange, then publish.
    #[tracing::instrument(
        name = "rabbitmq_publish",
        skip_all,
        fields(
            exchange = %self.exchange.name,
            routing_key = %envelope.routing_key,
            correlation_id = %envelope.correlation_id,
        )
    )]
    async fn send(&self, envelope: &MessageEnvelope) -> Result<Lease<T::Connection>, PublishError> {
        let lease = self
            .pool
            .acquire()
            .await
            .map_err(|e| PublishError::ConnectionFailure(e.into_inner()))?;
        let channel = lease.channel();

        channel
            .declare_exchange(&self.exchange)
            .await
            .map_err(PublishError::DeclareFailure)?;
        channel
            .publish(
                &self.exchange.name,
                &envelope.routing_key,
                &envelope.payload,
                envelope.amqp_properties(self.exchange.durable),
            )
            .await
            .map_err(PublishError::PublishFailure)?;

        let message = String::from_utf8_lossy(&envelope.payload);
        if self.silent {
            debug!("Message sent: {}", message);
        } else {
            info!("Message sent: {}", message);
        }

        self.pool.reset_idle(lease.connection()).await;
        Ok(lease)
    }
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<T: Transport> {
    transport: T,
    idle_timeout: Duration,
    exchange: ExchangeSettings,
    defaults: EnvelopeDefaults,
    silent: bool,
    error_sink: Arc<dyn ErrorSink>,
}

impl<T: Transport> PublisherBuilder<T> {
    fn new(transport: T) -> Self {
        let settings = PublisherSettings::default();
        Self {
            transport,
            idle_timeout: settings.idle_timeout(),
            exchange: settings.exchange(),
            defaults: EnvelopeDefaults {
                app_id: settings.app_id,
                routing_key: settings.routing_key,
            },
            silent: settings.silent,
            error_sink: Arc::new(LogErrorSink),
        }
    }

    /// Apply every publishing option in `settings`.
    /// Broker connection details are ignored: they are owned by the transport.
    #[must_use]
    pub fn with_settings(mut self, settings: &PublisherSettings) -> Self {
        self.idle_timeout = settings.idle_timeout();
        self.exchange = settings.exchange();
        self.defaults = EnvelopeDefaults {
            app_id: settings.app_id.clone(),
            routing_key: settings.routing_key.clone(),
        };
        self.silent = settings.silent;
        self
    }

    /// `app_id` attached to messages that do not specify one.
    #[must_use]
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.defaults.app_id = Some(app_id.into());
        self
    }

    /// Routing key used for messages that do not specify one.
    /// Defaults to an empty routing key.
    #[must_use]
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.defaults.routing_key = routing_key.into();
        self
    }

    /// The exchange messages are published to.
    /// Defaults to a transient topic exchange named `rabbit-chat`.
    #[must_use]
    pub fn exchange(mut self, exchange: ExchangeSettings) -> Self {
        self.exchange = exchange;
        self
    }

    /// How long a connection can stay unused before it is closed.
    /// Defaults to 500 milliseconds.
    #[must_use]
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Log successful publishes at `DEBUG` instead of `INFO`.
    #[must_use]
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Where publishing failures are reported. Defaults to [`LogErrorSink`].
    #[must_use]
    pub fn error_sink<E: ErrorSink>(mut self, error_sink: E) -> Self {
        self.error_sink = Arc::new(error_sink);
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    ///
    /// Must be called within a Tokio runtime: the publishing queue runs as a background task.
    pub fn build(self) -> Publisher<T> {
        Publisher {
            shared: Arc::new(Shared {
                pool: ConnectionPool::new(self.transport, self.idle_timeout),
                exchange: self.exchange,
                defaults: self.defaults,
                silent: self.silent,
                error_sink: self.error_sink,
            }),
            serializer: Serializer::new(),
        }
    }
}
