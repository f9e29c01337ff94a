//! Provides pooling for broker connections and their publishing channel.
//!
//! This module provides two key guarantees:
//! - Reusing connection objects across publishes to limit overhead.
//! - Closing connections that have not been used for a while.
//!
//! ```rust
//! use carrot_chatter::amqp::ConnectionFactory;
//! use carrot_chatter::amqp::configuration::RabbitMqSettings;
//! use carrot_chatter::amqp::transport::BrokerChannel;
//! use carrot_chatter::pool::ConnectionPool;
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!
//!     // connections unused for 5 seconds are closed.
//!     let pool = ConnectionPool::new(
//!         ConnectionFactory::new_from_config(&settings)?,
//!         std::time::Duration::from_secs(5),
//!     );
//!
//!     // get a channel from the pool.
//!     let lease = pool.acquire().await?;
//!     assert!(lease.channel().is_open());
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::ChannelProvider;
pub use connection::{ConnectionPool, ConnectionState, Lease, PooledConnection};
pub use error::Error;
