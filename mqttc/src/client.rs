//! MQTT 3.1.1 client handle.

use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ClientConfig;
use crate::connection::{Command, Connection};
use crate::error::{Error, Result};
use crate::event::{ConnectionState, Handler};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, QoS, SubscribeFilter};
use crate::transport::{Connector, TransportConnector};

const COMMAND_CAPACITY: usize = 64;

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    handler: Option<Box<dyn Handler>>,
    connector: Option<Arc<dyn Connector>>,
    callback_runtime: Option<Handle>,
}

impl ClientBuilder {
    /// Receive events through `handler`.
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Open transports with `connector` instead of dialing the configured address.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Run callbacks on another runtime. Defaults to the runtime calling `build`.
    pub fn callback_runtime(mut self, handle: Handle) -> Self {
        self.callback_runtime = Some(handle);
        self
    }

    /// Validate the config and start the connection task.
    ///
    /// Must be called within a tokio runtime. The client starts disconnected.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;

        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let callbacks = self.callback_runtime.unwrap_or_else(|| runtime.clone());
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TransportConnector::from_config(&self.config)) as Arc<dyn Connector>);
        let mut handler = self.handler.unwrap_or_else(|| Box::new(()) as Box<dyn Handler>);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        callbacks.spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handler.handle(event);
            }
        });

        let client_id: Arc<str> = Arc::from(self.config.client_id.as_str());
        let connection = Connection::new(self.config, connector, command_rx, event_tx, state_tx);
        runtime.spawn(connection.run());

        Ok(Client {
            commands: command_tx,
            state: state_rx,
            client_id,
        })
    }
}

/// MQTT 3.1.1 client.
///
/// Cheap to clone; all clones drive the same connection. The connection task
/// stops after a graceful disconnect once every clone is dropped.
///
/// Inbound packets, including SUBACK, PUBACK and broker publishes, arrive
/// through the [`Handler`] given at build time.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    client_id: Arc<str>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            handler: None,
            connector: None,
            callback_runtime: None,
        }
    }

    /// Build a client with the default transport.
    pub fn new(config: ClientConfig, handler: impl Handler) -> Result<Self> {
        Self::builder(config).handler(handler).build()
    }

    /// Connect and wait for the broker to accept.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await
    }

    /// Disconnect. Does nothing if already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Publish a message.
    ///
    /// For QoS 1/2 an identifier is allocated unless one is given; QoS 0
    /// ignores `pkid`. Returns the identifier used.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        retain: bool,
        qos: QoS,
        payload: impl Into<Bytes>,
        pkid: Option<u16>,
    ) -> Result<Option<u16>> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|reply| Command::Publish {
            topic,
            retain,
            qos,
            payload,
            pkid,
            reply,
        })
        .await
    }

    /// Subscribe to one filter. Returns the SUBSCRIBE identifier.
    pub async fn subscribe(&self, filter: impl Into<String>, qos: QoS, pkid: Option<u16>) -> Result<u16> {
        self.subscribe_many(vec![SubscribeFilter::new(filter, qos)], pkid)
            .await
    }

    /// Subscribe to several filters in one packet.
    pub async fn subscribe_many(&self, filters: Vec<SubscribeFilter>, pkid: Option<u16>) -> Result<u16> {
        self.request(|reply| Command::Subscribe {
            filters,
            pkid,
            reply,
        })
        .await
    }

    /// Unsubscribe from one filter. Returns the UNSUBSCRIBE identifier.
    pub async fn unsubscribe(&self, filter: impl Into<String>, pkid: Option<u16>) -> Result<u16> {
        self.unsubscribe_many(vec![filter.into()], pkid).await
    }

    /// Unsubscribe from several filters in one packet.
    pub async fn unsubscribe_many(&self, topics: Vec<String>, pkid: Option<u16>) -> Result<u16> {
        self.request(|reply| Command::Unsubscribe {
            topics,
            pkid,
            reply,
        })
        .await
    }

    /// Acknowledge a QoS 1 publish from the broker.
    pub async fn puback(&self, pkid: u16) -> Result<()> {
        self.ack(Packet::PubAck(PubAck { pkid })).await
    }

    /// First acknowledgment of a QoS 2 publish from the broker.
    pub async fn pubrec(&self, pkid: u16) -> Result<()> {
        self.ack(Packet::PubRec(PubRec { pkid })).await
    }

    /// Complete a QoS 2 flow after the broker's PUBREL.
    pub async fn pubcomp(&self, pkid: u16) -> Result<()> {
        self.ack(Packet::PubComp(PubComp { pkid })).await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn ack(&self, packet: Packet) -> Result<()> {
        self.request(|reply| Command::Ack { packet, reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }
}
