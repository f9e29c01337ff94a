//! Opens and tracks the channel each pooled connection publishes on.
use super::connection::PooledConnection;
use crate::amqp::transport::{BrokerChannel, BrokerConnection};
use tracing::debug;

/// `ChannelProvider` hands out the active channel of a [`PooledConnection`].
///
/// Each connection has at most one active channel. It is opened lazily and replaced
/// if it has been closed (e.g. by the broker after a failed exchange declaration).
pub struct ChannelProvider;

impl ChannelProvider {
    pub async fn get<C: BrokerConnection>(
        connection: &PooledConnection<C>,
    ) -> Result<C::Channel, anyhow::Error> {
        let mut active_channel = connection.active_channel.lock().await;
        if let Some(channel) = active_channel.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }
        let channel = connection.connection().create_channel().await?;
        debug!(connection_id = %connection.id(), "Opened a new RabbitMq channel");
        *active_channel = Some(channel.clone());
        Ok(channel)
    }
}
