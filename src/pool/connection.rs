//! Pooled broker connections, evicted after a period of inactivity.
use super::channel::ChannelProvider;
use super::Error;
use crate::amqp::transport::{BrokerChannel, BrokerConnection, Transport};
use crate::publishers::PublishError;
use anyhow::Context;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a [`PooledConnection`].
///
/// `Connecting -> Open -> Closing -> Closed`. A connection never goes back once it started closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// The handshake succeeded but no channel has been opened yet.
    Connecting = 0,
    Open = 1,
    /// Evicted from the pool, its channel and transport are being closed.
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// A broker connection owned by a [`ConnectionPool`].
pub struct PooledConnection<C: BrokerConnection> {
    id: Uuid,
    connection: C,
    /// The channel used for publishing, if one has been opened.
    pub(super) active_channel: Mutex<Option<C::Channel>>,
    state: AtomicU8,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    /// Bumped every time the idle timer is re-armed: a timer only fires if it is still current.
    generation: AtomicU64,
    /// Number of outstanding [`Lease`]s.
    leases: AtomicUsize,
    created_at: Instant,
}

impl<C: BrokerConnection> PooledConnection<C> {
    fn new(connection: C) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            active_channel: Mutex::new(None),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            idle_timer: Mutex::new(None),
            generation: AtomicU64::new(0),
            leases: AtomicUsize::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// `true` once the connection has been evicted from the pool.
    pub fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Moves `Connecting -> Open`. Returns `false` if the connection is already closing.
    fn mark_open(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                match ConnectionState::from(state) {
                    ConnectionState::Connecting | ConnectionState::Open => {
                        Some(ConnectionState::Open as u8)
                    }
                    ConnectionState::Closing | ConnectionState::Closed => None,
                }
            })
            .is_ok()
    }

    fn mark_closing(&self) {
        self.state
            .store(ConnectionState::Closing as u8, Ordering::SeqCst);
    }

    async fn cancel_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().await.take() {
            timer.abort();
        }
    }

    /// Close the active channel, then the transport.
    ///
    /// Failures are logged: the connection is unusable either way.
    async fn close(&self) {
        self.mark_closing();
        let channel = self.active_channel.lock().await.take();
        if let Some(channel) = channel {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    let error = PublishError::CloseFailure(e);
                    warn!(connection_id = %self.id, error = ?error, "Failed to close RabbitMq channel");
                }
            }
        }
        if self.connection.is_open() {
            if let Err(e) = self.connection.close().await {
                let error = PublishError::CloseFailure(e);
                warn!(connection_id = %self.id, error = ?error, "Failed to close RabbitMq connection");
            }
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        debug!(connection_id = %self.id, "RabbitMq connection closed");
    }
}

/// Keeps the idle timer from evicting a connection while it is in use.
struct Checkout<C: BrokerConnection>(Arc<PooledConnection<C>>);

impl<C: BrokerConnection> Checkout<C> {
    fn new(connection: Arc<PooledConnection<C>>) -> Self {
        connection.leases.fetch_add(1, Ordering::SeqCst);
        Self(connection)
    }
}

impl<C: BrokerConnection> Drop for Checkout<C> {
    fn drop(&mut self) {
        self.0.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A channel acquired from a [`ConnectionPool`], together with the connection it belongs to.
///
/// The connection will not be evicted for inactivity while the lease is alive.
pub struct Lease<C: BrokerConnection> {
    checkout: Checkout<C>,
    channel: C::Channel,
}

impl<C: BrokerConnection> Lease<C> {
    pub fn channel(&self) -> &C::Channel {
        &self.channel
    }

    pub fn connection(&self) -> &Arc<PooledConnection<C>> {
        &self.checkout.0
    }
}

/// `ConnectionPool` owns the connections used to publish messages.
///
/// # Selection
///
/// [`ConnectionPool::acquire`] returns the first connection that is not closing: it is not a
/// round-robin or least-recently-used pool. Under a steady stream of publishes this boils down to
/// reusing a single connection.
///
/// # Eviction
///
/// Each connection carries an idle timer, re-armed every time it is used. When the timer fires
/// the connection is removed from the pool, then its channel and transport are closed.
pub struct ConnectionPool<T: Transport> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Transport> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

type Pooled<T> = Arc<PooledConnection<<T as Transport>::Connection>>;

struct PoolInner<T: Transport> {
    transport: T,
    idle_timeout: Duration,
    connections: Mutex<Vec<Pooled<T>>>,
}

impl<T: Transport> ConnectionPool<T> {
    /// Must be used within a Tokio runtime: idle timers are spawned as tasks.
    pub fn new(transport: T, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                transport,
                idle_timeout,
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Number of connections currently in the pool.
    pub async fn len(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.connections.lock().await.is_empty()
    }

    /// Get a channel to publish on.
    ///
    /// A pooled connection is reused if there is one, otherwise a new connection is opened.
    /// A pooled connection found to be unusable (e.g. closed by the broker) is evicted and
    /// replaced by a fresh one.
    #[tracing::instrument(name = "rabbitmq_acquire", skip(self))]
    pub async fn acquire(&self) -> Result<Lease<T::Connection>, Error> {
        if let Some(checkout) = self.checkout().await {
            let channel = ChannelProvider::get(&checkout.0).await;
            match channel {
                Ok(channel) if channel.is_open() && checkout.0.connection.is_open() => {
                    return Ok(Lease { checkout, channel });
                }
                Ok(_) => {
                    debug!(connection_id = %checkout.0.id, "Pooled connection went stale");
                }
                Err(e) => {
                    warn!(connection_id = %checkout.0.id, error = ?e, "Failed to open a channel on a pooled connection");
                }
            }
            self.evict(&checkout.0).await;
        }
        self.open().await
    }

    /// Re-arm the idle timer of `connection`.
    ///
    /// A connection that has already been evicted stays evicted.
    pub async fn reset_idle(&self, connection: &Pooled<T>) {
        if connection.mark_open() {
            self.inner.arm_idle_timer(connection).await;
        }
    }

    /// Remove `connection` from the pool, then close it in the background.
    pub async fn evict(&self, connection: &Pooled<T>) {
        {
            let mut connections = self.inner.connections.lock().await;
            detach(&mut connections, connection);
        }
        connection.cancel_idle_timer().await;
        let connection = Arc::clone(connection);
        tokio::spawn(async move { connection.close().await });
    }

    /// Evict every connection, waiting for all of them to be closed.
    pub async fn close_all(&self) {
        let connections = std::mem::take(&mut *self.inner.connections.lock().await);
        for connection in connections {
            connection.mark_closing();
            connection.cancel_idle_timer().await;
            connection.close().await;
        }
    }

    /// The first pooled connection that is not closing, with its idle timer re-armed.
    async fn checkout(&self) -> Option<Checkout<T::Connection>> {
        let mut connections = self.inner.connections.lock().await;
        loop {
            let candidate = connections.iter().find(|c| !c.is_closing()).cloned()?;
            if candidate.connection.is_open() {
                let checkout = Checkout::new(candidate);
                self.inner.arm_idle_timer(&checkout.0).await;
                return Some(checkout);
            }
            debug!(connection_id = %candidate.id, "Dropping a connection closed by the broker");
            detach(&mut connections, &candidate);
            tokio::spawn(async move {
                candidate.cancel_idle_timer().await;
                candidate.close().await;
            });
        }
    }

    async fn open(&self) -> Result<Lease<T::Connection>, Error> {
        let connection = self
            .inner
            .transport
            .connect()
            .await
            .context("Failed to connect to RabbitMq")?;
        let connection = Arc::new(PooledConnection::new(connection));
        let channel = match ChannelProvider::get(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                connection.close().await;
                return Err(e
                    .context("Failed to open a channel on a new RabbitMq connection")
                    .into());
            }
        };
        let checkout = Checkout::new(Arc::clone(&connection));
        connection.mark_open();
        {
            let mut connections = self.inner.connections.lock().await;
            connections.push(Arc::clone(&connection));
            self.inner.arm_idle_timer(&connection).await;
        }
        info!(connection_id = %connection.id, "Opened a new RabbitMq connection");
        Ok(Lease { checkout, channel })
    }
}

impl<T: Transport> PoolInner<T> {
    async fn arm_idle_timer(self: &Arc<Self>, connection: &Pooled<T>) {
        let generation = connection.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = tokio::spawn(idle_timer(
            Arc::downgrade(self),
            Arc::downgrade(connection),
            generation,
            self.idle_timeout,
        ));
        if let Some(previous) = connection.idle_timer.lock().await.replace(timer) {
            previous.abort();
        }
    }
}

fn detach<C: BrokerConnection>(
    connections: &mut Vec<Arc<PooledConnection<C>>>,
    connection: &Arc<PooledConnection<C>>,
) {
    connection.mark_closing();
    connections.retain(|c| !Arc::ptr_eq(c, connection));
}

async fn idle_timer<T: Transport>(
    pool: Weak<PoolInner<T>>,
    connection: Weak<PooledConnection<T::Connection>>,
    generation: u64,
    idle_timeout: Duration,
) {
    loop {
        tokio::time::sleep(idle_timeout).await;
        let (Some(inner), Some(pooled)) = (pool.upgrade(), connection.upgrade()) else {
            return;
        };
        {
            let mut connections = inner.connections.lock().await;
            if pooled.generation.load(Ordering::SeqCst) != generation || pooled.is_closing() {
                return;
            }
            // A publish is still using the connection: check again later.
            if pooled.leases.load(Ordering::SeqCst) > 0 {
                continue;
            }
            detach(&mut connections, &pooled);
        }
        info!(connection_id = %pooled.id, "Closing idle RabbitMq connection");
        // Release our own handle instead of aborting it.
        pooled.idle_timer.lock().await.take();
        pooled.close().await;
        return;
    }
}
