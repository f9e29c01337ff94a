//! `carrot-chatter` is a fire-and-forget publisher, built on top of [`lapin`],
//! to make it easy to send messages to a RabbitMq exchange.
//!
//! [`Publisher`](crate::publishers::Publisher) is the best starting point to learn more about what
//! `carrot-chatter` provides:
//! - messages are published in the order they are submitted, one at a time;
//! - connections are opened on demand, reused, and closed once idle;
//! - failures are reported to a pluggable [`ErrorSink`](crate::publishers::ErrorSink).
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod publishers;

pub mod amqp;
pub mod pool;
