//! The broker operations a [`Publisher`](crate::publishers::Publisher) relies on.
//!
//! `lapin` is the production implementation. The traits exist so that connections and channels
//! can be swapped for something else - e.g. an in-memory broker in tests.
use crate::amqp::configuration::ExchangeSettings;
use crate::amqp::factory::ConnectionFactory;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ChannelState, ConnectionState};

/// The channel type handed out by a [`Transport`]'s connections.
pub type ChannelOf<T> = <<T as Transport>::Connection as BrokerConnection>::Channel;

/// `Transport` establishes new connections to the broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Perform the handshake against the broker.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A live session with the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// `false` once the connection has been closed, by us or by the broker.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A logical session multiplexed over a [`BrokerConnection`].
///
/// Channels are handles: cloning one does not open a new channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// Idempotently declare an exchange.
    async fn declare_exchange(&self, exchange: &ExchangeSettings) -> Result<(), anyhow::Error>;

    /// Hand a message over to the broker. It does not wait for publisher confirms.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = lapin::Connection;

    async fn connect(&self) -> Result<lapin::Connection, anyhow::Error> {
        self.new_connection().await
    }
}

#[async_trait::async_trait]
impl BrokerConnection for lapin::Connection {
    type Channel = lapin::Channel;

    async fn create_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        Ok(lapin::Connection::create_channel(self).await?)
    }

    fn is_open(&self) -> bool {
        matches!(self.status().state(), ConnectionState::Connected)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        // Reply Code 200 - REPLY_SUCCESS
        Ok(lapin::Connection::close(self, 200, "Idle connection").await?)
    }
}

#[async_trait::async_trait]
impl BrokerChannel for lapin::Channel {
    async fn declare_exchange(&self, exchange: &ExchangeSettings) -> Result<(), anyhow::Error> {
        self.exchange_declare(
            &exchange.name,
            exchange.kind.into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: exchange.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        // Publisher confirms are not enabled on our channels: the returned confirmation
        // would always resolve to `NotRequested`, so we do not wait for it.
        let _confirm = self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        matches!(self.status().state(), ChannelState::Connected)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::close(self, 200, "Idle connection").await?)
    }
}
