use anyhow::anyhow;
use carrot_chatter::amqp::configuration::ExchangeSettings;
use carrot_chatter::amqp::transport::{BrokerChannel, BrokerConnection, Transport};
use carrot_chatter::amqp::BasicProperties;
use carrot_chatter::publishers::{PublishError, Publisher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything the broker observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect(usize),
    CreateChannel(usize),
    Declare {
        connection: usize,
        exchange: ExchangeSettings,
    },
    Publish {
        connection: usize,
        exchange: String,
        routing_key: String,
        payload: String,
        properties: BasicProperties,
    },
    CloseChannel(usize),
    CloseConnection(usize),
}

/// An in-memory broker recording every operation performed against it.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    events: Mutex<Vec<Event>>,
    next_connection_id: AtomicUsize,
    live_connections: Mutex<Vec<Arc<AtomicBool>>>,
    refuse_connections: AtomicBool,
    refuse_channels: AtomicBool,
    reject_declarations: AtomicBool,
    reject_publishes: AtomicBool,
}

impl FakeBroker {
    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().unwrap().clone()
    }

    pub fn handshakes(&self) -> usize {
        self.count(|e| matches!(e, Event::Connect(_)))
    }

    pub fn channels_opened(&self) -> usize {
        self.count(|e| matches!(e, Event::CreateChannel(_)))
    }

    pub fn count(&self, filter: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| filter(e)).count()
    }

    /// Payload and properties of every published message.
    pub fn published(&self) -> Vec<(String, BasicProperties)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Publish {
                    payload,
                    properties,
                    ..
                } => Some((payload, properties)),
                _ => None,
            })
            .collect()
    }

    pub fn published_payloads(&self) -> Vec<String> {
        self.published().into_iter().map(|(p, _)| p).collect()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Handshakes still succeed, but no channel can be opened on any connection.
    pub fn refuse_channels(&self, refuse: bool) {
        self.state.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    pub fn reject_declarations(&self, reject: bool) {
        self.state.reject_declarations.store(reject, Ordering::SeqCst);
    }

    pub fn reject_publishes(&self, reject: bool) {
        self.state.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Simulate the broker closing every open connection on its side.
    pub fn drop_connections(&self) {
        for connection in self.state.live_connections.lock().unwrap().drain(..) {
            connection.store(false, Ordering::SeqCst);
        }
    }

    fn record(&self, event: Event) {
        self.state.events.lock().unwrap().push(event);
    }
}

#[async_trait::async_trait]
impl Transport for FakeBroker {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, anyhow::Error> {
        tokio::task::yield_now().await;
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(anyhow!("Connection refused"));
        }
        let id = self.state.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        self.state
            .live_connections
            .lock()
            .unwrap()
            .push(Arc::clone(&open));
        self.record(Event::Connect(id));
        Ok(FakeConnection {
            id,
            broker: self.clone(),
            open,
        })
    }
}

pub struct FakeConnection {
    id: usize,
    broker: FakeBroker,
    open: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl BrokerConnection for FakeConnection {
    type Channel = FakeChannel;

    async fn create_channel(&self) -> Result<FakeChannel, anyhow::Error> {
        if !self.is_open() {
            return Err(anyhow!("Connection is closed"));
        }
        if self.broker.state.refuse_channels.load(Ordering::SeqCst) {
            return Err(anyhow!("NOT_ALLOWED - channel_max reached"));
        }
        self.broker.record(Event::CreateChannel(self.id));
        Ok(FakeChannel {
            connection_id: self.id,
            broker: self.broker.clone(),
            open: Arc::new(AtomicBool::new(true)),
            connection_open: Arc::clone(&self.open),
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.open.store(false, Ordering::SeqCst);
        self.broker.record(Event::CloseConnection(self.id));
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeChannel {
    connection_id: usize,
    broker: FakeBroker,
    open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
}

impl FakeChannel {
    pub fn connection_id(&self) -> usize {
        self.connection_id
    }
}

#[async_trait::async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSettings) -> Result<(), anyhow::Error> {
        // Give concurrent publishes a chance to interleave, if they could.
        tokio::task::yield_now().await;
        if !self.is_open() {
            return Err(anyhow!("Channel is closed"));
        }
        if self.broker.state.reject_declarations.load(Ordering::SeqCst) {
            // The broker closes the channel when a declaration fails.
            self.open.store(false, Ordering::SeqCst);
            return Err(anyhow!("PRECONDITION_FAILED - inequivalent arg 'type'"));
        }
        self.broker.record(Event::Declare {
            connection: self.connection_id,
            exchange: exchange.clone(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        tokio::task::yield_now().await;
        if !self.is_open() || self.broker.state.reject_publishes.load(Ordering::SeqCst) {
            return Err(anyhow!("Channel is closing"));
        }
        self.broker.record(Event::Publish {
            connection: self.connection_id,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            properties,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.open.store(false, Ordering::SeqCst);
        self.broker.record(Event::CloseChannel(self.connection_id));
        Ok(())
    }
}

/// Collects the errors forwarded to the publisher's error sink.
#[derive(Clone, Default)]
pub struct ErrorCollector(Arc<Mutex<Vec<PublishError>>>);

impl ErrorCollector {
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<PublishError> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn sink(&self) -> impl Fn(PublishError) + Send + Sync + 'static {
        let errors = Arc::clone(&self.0);
        move |error| errors.lock().unwrap().push(error)
    }
}

pub const IDLE_TIMEOUT: Duration = Duration::from_millis(1000);

pub fn get_publisher(broker: &FakeBroker, errors: &ErrorCollector) -> Publisher<FakeBroker> {
    Publisher::builder(broker.clone())
        .app_id("test-app")
        .idle_timeout(IDLE_TIMEOUT)
        .error_sink(errors.sink())
        .build()
}
