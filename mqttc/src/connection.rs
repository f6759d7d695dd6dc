//! Connection event loop.
//!
//! One task owns the transport, decoder, packet identifiers and timers of a
//! connection. Client commands, inbound bytes, the connect deadline and the
//! keep-alive tick are multiplexed with `select!`, so every state change
//! happens on this task.

use std::future::{Future, pending};
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::event::{ConnectionState, Event};
use crate::pkid::PacketIdAllocator;
use crate::protocol::{
    ConnAck, ConnectReturnCode, Decoder, Packet, PubRel, Publish, QoS, Subscribe, SubscribeFilter,
    Unsubscribe,
};
use crate::transport::{BoxStream, Connector};

const READ_BUFFER_SIZE: usize = 4096;

/// Requests from [`Client`](crate::Client) handles.
pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<Result<()>>),
    Publish {
        topic: String,
        retain: bool,
        qos: QoS,
        payload: Bytes,
        pkid: Option<u16>,
        reply: oneshot::Sender<Result<Option<u16>>>,
    },
    Subscribe {
        filters: Vec<SubscribeFilter>,
        pkid: Option<u16>,
        reply: oneshot::Sender<Result<u16>>,
    },
    Unsubscribe {
        topics: Vec<String>,
        pkid: Option<u16>,
        reply: oneshot::Sender<Result<u16>>,
    },
    Ack {
        packet: Packet,
        reply: oneshot::Sender<Result<()>>,
    },
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxStream>> + Send>>;

/// Private state, carrying what each phase owns.
enum Phase {
    Disconnected,
    ConnectingTransport(ConnectFuture),
    ConnectingBroker(BoxStream),
    Connected(BoxStream),
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::ConnectingTransport(_) => ConnectionState::ConnectingTransport,
            Phase::ConnectingBroker(_) => ConnectionState::ConnectingBroker,
            Phase::Connected(_) => ConnectionState::Connected,
        }
    }

    fn stream_mut(&mut self) -> Option<&mut BoxStream> {
        match self {
            Phase::ConnectingBroker(stream) | Phase::Connected(stream) => Some(stream),
            _ => None,
        }
    }
}

enum Input {
    Command(Option<Command>),
    TransportReady(io::Result<BoxStream>),
    Read(io::Result<usize>),
    ConnectTimeout,
    KeepAlive,
}

pub(crate) struct Connection {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    state_tx: watch::Sender<ConnectionState>,

    phase: Phase,
    /// Last state reported to the application.
    announced: ConnectionState,
    decoder: Decoder,
    pkids: PacketIdAllocator,
    read_buf: Vec<u8>,
    write_buf: BytesMut,

    connect_waiter: Option<oneshot::Sender<Result<()>>>,
    connect_deadline: Option<Instant>,
    keep_alive: Option<Interval>,
}

impl Connection {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<Event>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let decoder = Decoder::new(config.max_packet_size);
        Self {
            config,
            connector,
            commands,
            events,
            state_tx,
            phase: Phase::Disconnected,
            announced: ConnectionState::Disconnected,
            decoder,
            pkids: PacketIdAllocator::new(),
            read_buf: vec![0; READ_BUFFER_SIZE],
            write_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            connect_waiter: None,
            connect_deadline: None,
            keep_alive: None,
        }
    }

    /// Run until every client handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                input = next_io(&mut self.phase, &mut self.read_buf) => input,
                _ = deadline(self.connect_deadline) => Input::ConnectTimeout,
                _ = tick(&mut self.keep_alive) => Input::KeepAlive,
            };

            match input {
                Input::Command(Some(command)) => self.handle_command(command).await,
                Input::Command(None) => {
                    debug!("All client handles dropped, stopping {}", self.config.client_id);
                    self.disconnect().await;
                    break;
                }
                Input::TransportReady(result) => self.on_transport_ready(result).await,
                Input::Read(result) => self.on_read(result).await,
                Input::ConnectTimeout => self.on_connect_timeout(),
                Input::KeepAlive => self.on_keep_alive().await,
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.start_connect(reply),
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            }
            Command::Publish {
                topic,
                retain,
                qos,
                payload,
                pkid,
                reply,
            } => {
                let result = self.publish(topic, retain, qos, payload, pkid).await;
                let _ = reply.send(result);
            }
            Command::Subscribe {
                filters,
                pkid,
                reply,
            } => {
                let result = self.subscribe(filters, pkid).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe {
                topics,
                pkid,
                reply,
            } => {
                let result = self.unsubscribe(topics, pkid).await;
                let _ = reply.send(result);
            }
            Command::Ack { packet, reply } => {
                let result = match self.ensure_connected() {
                    Ok(()) => self.send_or_drop(&packet).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn start_connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        let busy = match self.phase.state() {
            ConnectionState::Disconnected => None,
            ConnectionState::ConnectingTransport => Some(Error::ChannelConnectPending),
            ConnectionState::ConnectingBroker => Some(Error::BrokerConnectPending),
            ConnectionState::Connected => Some(Error::AlreadyConnected),
        };
        if let Some(err) = busy {
            let _ = reply.send(Err(err));
            return;
        }

        debug!(
            "Connecting to {} as {} (MQTT 3.1.1)",
            self.config.address, self.config.client_id
        );

        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout();
        let connect: ConnectFuture = Box::pin(async move {
            time::timeout(timeout, connector.connect())
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "transport connect timed out"))
                })
        });

        self.connect_waiter = Some(reply);
        self.transition(Phase::ConnectingTransport(connect));
    }

    async fn disconnect(&mut self) {
        match self.phase.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::ConnectingTransport => {
                debug!("Abandoning transport connect to {}", self.config.address);
                self.teardown(None);
            }
            state @ (ConnectionState::ConnectingBroker | ConnectionState::Connected) => {
                if state == ConnectionState::Connected {
                    trace!("Sending Disconnect");
                    if let Err(e) = self.send(&Packet::Disconnect).await {
                        debug!("Disconnect not delivered: {}", e);
                    }
                }
                if let Some(mut stream) = self.take_stream() {
                    let _ = stream.shutdown().await;
                }
                debug!("Disconnected from {}", self.config.address);
                self.teardown(None);
            }
        }
    }

    async fn publish(
        &mut self,
        topic: String,
        retain: bool,
        qos: QoS,
        payload: Bytes,
        pkid: Option<u16>,
    ) -> Result<Option<u16>> {
        self.ensure_connected()?;

        let pkid = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                Some(pkid.unwrap_or_else(|| self.pkids.next_id()))
            }
        };
        let publish = Publish::new(topic, qos, payload, retain, pkid)?;

        trace!("Publishing to {} ({:?}, pkid {:?})", publish.topic(), qos, pkid);
        self.send_or_drop(&Packet::Publish(publish)).await?;
        Ok(pkid)
    }

    async fn subscribe(&mut self, filters: Vec<SubscribeFilter>, pkid: Option<u16>) -> Result<u16> {
        self.ensure_connected()?;

        let pkid = pkid.unwrap_or_else(|| self.pkids.next_id());
        let subscribe = Subscribe::new(pkid, filters)?;

        debug!("Subscribing to {} filter(s), pkid {}", subscribe.filters().len(), pkid);
        self.send_or_drop(&Packet::Subscribe(subscribe)).await?;
        Ok(pkid)
    }

    async fn unsubscribe(&mut self, topics: Vec<String>, pkid: Option<u16>) -> Result<u16> {
        self.ensure_connected()?;

        let pkid = pkid.unwrap_or_else(|| self.pkids.next_id());
        let unsubscribe = Unsubscribe::new(pkid, topics)?;

        debug!("Unsubscribing from {} filter(s), pkid {}", unsubscribe.topics().len(), pkid);
        self.send_or_drop(&Packet::Unsubscribe(unsubscribe)).await?;
        Ok(pkid)
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.phase {
            Phase::Connected(_) => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    // ========================================================================
    // Transport and timers
    // ========================================================================

    async fn on_transport_ready(&mut self, result: io::Result<BoxStream>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Transport connect to {} failed: {}", self.config.address, e);
                let err = if e.kind() == io::ErrorKind::TimedOut {
                    Error::ConnectTimeout
                } else {
                    Error::Io(e)
                };
                self.teardown(Some(err));
                return;
            }
        };

        self.pkids.reset();
        self.decoder.reset();
        self.transition(Phase::ConnectingBroker(stream));

        trace!("Sending Connect");
        let connect = Packet::Connect(self.config.connect_packet());
        if let Err(e) = self.send(&connect).await {
            warn!("Failed to send Connect: {}", e);
            self.teardown(Some(e));
            return;
        }
        self.connect_deadline = Instant::now().checked_add(self.config.connect_timeout());
        if self.connect_deadline.is_none() {
            debug!("connect_timeout {}s out of range, not arming", self.config.connect_timeout);
        }
    }

    async fn on_read(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => {
                debug!("Connection to {} closed by peer", self.config.address);
                self.teardown(Some(Error::ConnectionClosed));
            }
            Ok(n) => {
                self.decoder.feed(&self.read_buf[..n]);
                self.drain_decoder().await;
            }
            Err(e) => {
                warn!("Read from {} failed: {}", self.config.address, e);
                self.teardown(Some(Error::Io(e)));
            }
        }
    }

    fn on_connect_timeout(&mut self) {
        self.connect_deadline = None;
        if self.phase.state() == ConnectionState::ConnectingBroker {
            warn!(
                "No CONNACK from {} within {}s",
                self.config.address, self.config.connect_timeout
            );
            self.teardown(Some(Error::ConnectTimeout));
        }
    }

    async fn on_keep_alive(&mut self) {
        trace!("Sending PingReq");
        if let Err(e) = self.send(&Packet::PingReq).await {
            warn!("Keepalive ping failed: {}", e);
            self.teardown(Some(e));
        }
    }

    // ========================================================================
    // Inbound packets
    // ========================================================================

    async fn drain_decoder(&mut self) {
        loop {
            match self.decoder.try_decode() {
                Ok(Some(packet)) => {
                    self.handle_packet(packet).await;
                    if matches!(self.phase, Phase::Disconnected) {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) if e.is_fatal() => {
                    warn!("Lost framing, dropping connection: {}", e);
                    self.emit(Event::DecodeError(e));
                    let cause = self.connect_waiter.is_some().then_some(Error::Decode(e));
                    self.teardown(cause);
                    return;
                }
                Err(e) => {
                    warn!("Dropping malformed packet: {}", e);
                    self.emit(Event::DecodeError(e));
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        trace!("Received {:?}", packet.packet_type());

        match packet {
            Packet::ConnAck(connack) => {
                self.on_connack(connack);
                self.emit(Event::Received(packet));
            }
            Packet::PubRec(pubrec) if self.phase.state() == ConnectionState::Connected => {
                // delivered ahead of the PUBREL so a failed write is reported after it
                self.emit(Event::Received(packet));

                trace!("Sending PubRel for pkid {}", pubrec.pkid);
                let pubrel = Packet::PubRel(PubRel { pkid: pubrec.pkid });
                if let Err(e) = self.send(&pubrel).await {
                    warn!("Failed to send PubRel: {}", e);
                    self.teardown(Some(e));
                }
            }
            packet => self.emit(Event::Received(packet)),
        }
    }

    fn on_connack(&mut self, connack: ConnAck) {
        match self.phase.state() {
            ConnectionState::ConnectingBroker if connack.code == ConnectReturnCode::Accepted => {
                let Some(stream) = self.take_stream() else {
                    return;
                };
                self.transition(Phase::Connected(stream));
                debug!(
                    "Connected to {} (session present: {})",
                    self.config.address, connack.session_present
                );

                if let Some(period) = self.config.keep_alive_interval() {
                    let mut interval = time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keep_alive = Some(interval);
                }

                if let Some(waiter) = self.connect_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            ConnectionState::ConnectingBroker => {
                warn!("Connection to {} refused: {}", self.config.address, connack.code);
                self.teardown(Some(Error::ConnectionRefused(connack.code)));
            }
            state => {
                warn!("Unexpected ConnAck while {}", state);
                self.teardown(Some(Error::Protocol(format!("unexpected CONNACK while {state}"))));
            }
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Replace the phase, cancel timers that do not belong to the new state,
    /// and report the change once.
    fn transition(&mut self, next: Phase) {
        self.phase = next;
        let state = self.phase.state();

        if state != ConnectionState::ConnectingBroker {
            self.connect_deadline = None;
        }
        if state != ConnectionState::Connected {
            self.keep_alive = None;
        }

        if state != self.announced {
            info!("MQTT {} -> {} ({})", self.announced, state, self.config.client_id);
            self.announced = state;
            self.state_tx.send_replace(state);
            self.emit(Event::StateChanged(state));
        }
    }

    /// Go to Disconnected. The cause goes to a waiting `connect()` caller if
    /// there is one, otherwise to the error callback.
    fn teardown(&mut self, cause: Option<Error>) {
        self.transition(Phase::Disconnected);
        self.decoder.reset();

        match (self.connect_waiter.take(), cause) {
            (Some(waiter), cause) => {
                let _ = waiter.send(Err(cause.unwrap_or(Error::ConnectionClosed)));
            }
            (None, Some(err)) => self.emit(Event::Error(err)),
            (None, None) => {}
        }
    }

    fn take_stream(&mut self) -> Option<BoxStream> {
        match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::ConnectingBroker(stream) | Phase::Connected(stream) => Some(stream),
            other => {
                self.phase = other;
                None
            }
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        let Some(stream) = self.phase.stream_mut() else {
            return Err(Error::NotConnected);
        };

        self.write_buf.clear();
        packet.write(&mut self.write_buf);
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Send on behalf of a caller; a failed write drops the connection.
    async fn send_or_drop(&mut self, packet: &Packet) -> Result<()> {
        if let Err(e) = self.send(packet).await {
            warn!("Write to {} failed: {}", self.config.address, e);
            self.teardown(None);
            return Err(e);
        }
        Ok(())
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

async fn next_io(phase: &mut Phase, buf: &mut [u8]) -> Input {
    match phase {
        Phase::ConnectingTransport(connect) => Input::TransportReady(connect.as_mut().await),
        Phase::ConnectingBroker(stream) | Phase::Connected(stream) => {
            Input::Read(stream.read(buf).await)
        }
        Phase::Disconnected => pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => pending::<()>().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}
