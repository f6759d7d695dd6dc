//! Connection state machine tests.
//!
//! The client runs against in-memory transports: each connect attempt opens
//! a `tokio::io::duplex` pipe and hands the far end to the test, which plays
//! the broker byte by byte.

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::codec::read_remaining_length;
use crate::protocol::{ConnAck, ConnectReturnCode, Packet, PubRec, QoS};
use crate::transport::{BoxStream, Connector};
use crate::{Address, Client, ClientConfig, ConnectionState, DecodeError, Error, Event, Handler};

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const WAIT: Duration = Duration::from_secs(60);

// ============================================================================
// Test transports
// ============================================================================

/// Opens a duplex pipe per connect and sends the broker end to the test.
struct PipeConnector {
    brokers: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self) -> io::Result<BoxStream> {
        let (client, broker) = tokio::io::duplex(4096);
        self.brokers
            .send(broker)
            .map_err(|_| io::Error::other("test finished"))?;
        Ok(Box::new(client))
    }
}

/// Never finishes connecting.
struct PendingConnector;

#[async_trait]
impl Connector for PendingConnector {
    async fn connect(&self) -> io::Result<BoxStream> {
        std::future::pending().await
    }
}

/// Hands out one scripted stream.
struct ScriptedConnector(Mutex<Option<tokio_test::io::Mock>>);

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> io::Result<BoxStream> {
        let mock = self.0.lock().unwrap().take();
        match mock {
            Some(mock) => Ok(Box::new(mock)),
            None => Err(io::Error::other("script already used")),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config() -> ClientConfig {
    ClientConfig::new(Address::tcp("broker.test", 1883), "test-client").with_keep_alive(0)
}

struct Harness {
    client: Client,
    events: mpsc::UnboundedReceiver<Event>,
    brokers: mpsc::UnboundedReceiver<DuplexStream>,
}

fn harness(config: ClientConfig) -> Harness {
    init_tracing();
    let (event_tx, events) = mpsc::unbounded_channel();
    let (broker_tx, brokers) = mpsc::unbounded_channel();
    let client = Client::builder(config)
        .handler(event_tx)
        .connector(PipeConnector { brokers: broker_tx })
        .build()
        .unwrap();
    Harness {
        client,
        events,
        brokers,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn expect_state(events: &mut mpsc::UnboundedReceiver<Event>, expected: ConnectionState) {
    match next_event(events).await {
        Event::StateChanged(state) => assert_eq!(state, expected),
        other => panic!("expected state {expected}, got {other:?}"),
    }
}

async fn expect_received(events: &mut mpsc::UnboundedReceiver<Event>) -> Packet {
    match next_event(events).await {
        Event::Received(packet) => packet,
        other => panic!("expected packet, got {other:?}"),
    }
}

/// Read one whole MQTT frame written by the client.
async fn read_frame(broker: &mut DuplexStream) -> Vec<u8> {
    let mut frame = vec![broker.read_u8().await.unwrap()];
    loop {
        let byte = broker.read_u8().await.unwrap();
        frame.push(byte);
        if byte & 0x80 == 0 {
            break;
        }
    }
    let (remaining, _) = read_remaining_length(&frame[1..]).unwrap().unwrap();
    let start = frame.len();
    frame.resize(start + remaining, 0);
    broker.read_exact(&mut frame[start..]).await.unwrap();
    frame
}

fn spawn_connect(client: &Client) -> JoinHandle<crate::Result<()>> {
    let client = client.clone();
    tokio::spawn(async move { client.connect().await })
}

/// Drive a full handshake and return the broker end of the pipe.
async fn connect(h: &mut Harness) -> DuplexStream {
    let pending = spawn_connect(&h.client);

    expect_state(&mut h.events, ConnectionState::ConnectingTransport).await;
    let mut broker = h.brokers.recv().await.unwrap();
    expect_state(&mut h.events, ConnectionState::ConnectingBroker).await;

    let frame = read_frame(&mut broker).await;
    assert_eq!(frame[0], 0x10, "first frame must be CONNECT");

    broker.write_all(&CONNACK_ACCEPTED).await.unwrap();
    expect_state(&mut h.events, ConnectionState::Connected).await;
    assert!(matches!(expect_received(&mut h.events).await, Packet::ConnAck(_)));

    pending.await.unwrap().unwrap();
    broker
}

// ============================================================================
// Tests: connect
// ============================================================================

#[tokio::test]
async fn test_connect_handshake() {
    let mut h = harness(test_config());
    assert_eq!(h.client.state(), ConnectionState::Disconnected);

    let pending = spawn_connect(&h.client);
    expect_state(&mut h.events, ConnectionState::ConnectingTransport).await;
    let mut broker = h.brokers.recv().await.unwrap();
    expect_state(&mut h.events, ConnectionState::ConnectingBroker).await;

    let mut expected = vec![0x10, 23, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x00];
    expected.extend_from_slice(&[0x00, 11]);
    expected.extend_from_slice(b"test-client");
    assert_eq!(read_frame(&mut broker).await, expected);

    broker
        .write_all(&[0x20, 0x02, 0x01, 0x00])
        .await
        .unwrap();
    expect_state(&mut h.events, ConnectionState::Connected).await;
    assert_eq!(
        expect_received(&mut h.events).await,
        Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Accepted,
        })
    );

    tokio_test::assert_ok!(pending.await.unwrap());
    assert!(h.client.is_connected());
    assert_eq!(h.client.client_id(), "test-client");
}

#[tokio::test]
async fn test_connack_refused() {
    let mut h = harness(test_config());
    let pending = spawn_connect(&h.client);

    expect_state(&mut h.events, ConnectionState::ConnectingTransport).await;
    let mut broker = h.brokers.recv().await.unwrap();
    expect_state(&mut h.events, ConnectionState::ConnectingBroker).await;
    read_frame(&mut broker).await;

    broker.write_all(&[0x20, 0x02, 0x00, 0x02]).await.unwrap();
    expect_state(&mut h.events, ConnectionState::Disconnected).await;
    assert!(matches!(
        expect_received(&mut h.events).await,
        Packet::ConnAck(ConnAck {
            code: ConnectReturnCode::IdentifierRejected,
            ..
        })
    ));

    assert!(matches!(
        pending.await.unwrap(),
        Err(Error::ConnectionRefused(ConnectReturnCode::IdentifierRejected))
    ));
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_while_transport_pending() {
    init_tracing();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let client = Client::builder(test_config())
        .handler(event_tx)
        .connector(PendingConnector)
        .build()
        .unwrap();

    let pending = spawn_connect(&client);
    expect_state(&mut events, ConnectionState::ConnectingTransport).await;

    assert!(matches!(client.connect().await, Err(Error::ChannelConnectPending)));

    client.disconnect().await.unwrap();
    expect_state(&mut events, ConnectionState::Disconnected).await;
    assert!(matches!(pending.await.unwrap(), Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_connect_while_broker_pending() {
    let mut h = harness(test_config());
    let pending = spawn_connect(&h.client);

    expect_state(&mut h.events, ConnectionState::ConnectingTransport).await;
    let mut broker = h.brokers.recv().await.unwrap();
    expect_state(&mut h.events, ConnectionState::ConnectingBroker).await;

    assert!(matches!(h.client.connect().await, Err(Error::BrokerConnectPending)));

    read_frame(&mut broker).await;
    broker.write_all(&CONNACK_ACCEPTED).await.unwrap();
    pending.await.unwrap().unwrap();

    assert!(matches!(h.client.connect().await, Err(Error::AlreadyConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let config = test_config().with_connect_timeout(Duration::from_secs(2));
    let mut h = harness(config);
    let pending = spawn_connect(&h.client);

    expect_state(&mut h.events, ConnectionState::ConnectingTransport).await;
    let mut broker = h.brokers.recv().await.unwrap();
    expect_state(&mut h.events, ConnectionState::ConnectingBroker).await;
    read_frame(&mut broker).await;

    // no CONNACK
    expect_state(&mut h.events, ConnectionState::Disconnected).await;
    assert!(matches!(pending.await.unwrap(), Err(Error::ConnectTimeout)));
}

#[tokio::test(start_paused = true)]
async fn test_connack_cancels_connect_timeout() {
    let config = test_config().with_connect_timeout(Duration::from_secs(2));
    let mut h = harness(config);
    let _broker = connect(&mut h).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(h.client.is_connected());
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_connect_timeout_out_of_range() {
    let config = ClientConfig {
        connect_timeout: u64::MAX,
        ..test_config()
    };
    let mut h = harness(config);
    let mut broker = connect(&mut h).await;

    // the event loop is still running
    h.client
        .publish("t", false, QoS::AtMostOnce, "x", None)
        .await
        .unwrap();
    assert_eq!(
        read_frame(&mut broker).await,
        vec![0x30, 0x04, 0x00, 0x01, b't', b'x']
    );
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn test_transport_connect_failure() {
    init_tracing();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let client = Client::builder(test_config())
        .handler(event_tx)
        .connector(ScriptedConnector(Mutex::new(None)))
        .build()
        .unwrap();

    assert!(matches!(client.connect().await, Err(Error::Io(_))));
    expect_state(&mut events, ConnectionState::ConnectingTransport).await;
    expect_state(&mut events, ConnectionState::Disconnected).await;
}

// ============================================================================
// Tests: connected
// ============================================================================

#[tokio::test]
async fn test_pubrec_sends_one_pubrel() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    broker.write_all(&[0x50, 0x02, 0x00, 0x07]).await.unwrap();
    assert_eq!(read_frame(&mut broker).await, vec![0x62, 0x02, 0x00, 0x07]);
    assert_eq!(
        expect_received(&mut h.events).await,
        Packet::PubRec(PubRec { pkid: 7 })
    );

    // the next frame is this publish, not a second PUBREL
    let pkid = h
        .client
        .publish("t", false, QoS::AtMostOnce, "x", Some(3))
        .await
        .unwrap();
    assert_eq!(pkid, None);
    assert_eq!(
        read_frame(&mut broker).await,
        vec![0x30, 0x04, 0x00, 0x01, b't', b'x']
    );
}

#[tokio::test]
async fn test_pubrec_delivered_before_failed_pubrel() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    // the broker goes away right after PUBREC, so the PUBREL write fails
    broker.write_all(&[0x50, 0x02, 0x00, 0x07]).await.unwrap();
    drop(broker);

    assert_eq!(
        expect_received(&mut h.events).await,
        Packet::PubRec(PubRec { pkid: 7 })
    );
    expect_state(&mut h.events, ConnectionState::Disconnected).await;
    assert!(matches!(next_event(&mut h.events).await, Event::Error(Error::Io(_))));
}

#[tokio::test]
async fn test_pubrec_scripted_exchange() {
    init_tracing();
    let connect = Packet::Connect(test_config().connect_packet()).encode();
    let mock = tokio_test::io::Builder::new()
        .write(&connect)
        .read(&CONNACK_ACCEPTED)
        .read(&[0x50, 0x02, 0x00, 0x07])
        .write(&[0x62, 0x02, 0x00, 0x07])
        .build();

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let client = Client::builder(test_config())
        .handler(event_tx)
        .connector(ScriptedConnector(Mutex::new(Some(mock))))
        .build()
        .unwrap();

    tokio_test::assert_ok!(client.connect().await);

    expect_state(&mut events, ConnectionState::ConnectingTransport).await;
    expect_state(&mut events, ConnectionState::ConnectingBroker).await;
    expect_state(&mut events, ConnectionState::Connected).await;
    assert!(matches!(expect_received(&mut events).await, Packet::ConnAck(_)));
    assert_eq!(
        expect_received(&mut events).await,
        Packet::PubRec(PubRec { pkid: 7 })
    );

    // script exhausted: the stream reports EOF
    expect_state(&mut events, ConnectionState::Disconnected).await;
    assert!(matches!(
        next_event(&mut events).await,
        Event::Error(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_identifier_allocation() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    let pkid = h
        .client
        .publish("a/b", false, QoS::AtLeastOnce, "1", None)
        .await
        .unwrap();
    assert_eq!(pkid, Some(1));
    assert_eq!(
        read_frame(&mut broker).await,
        vec![0x32, 0x08, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, b'1']
    );

    let pkid = h.client.subscribe("a/#", QoS::ExactlyOnce, None).await.unwrap();
    assert_eq!(pkid, 2);
    assert_eq!(
        read_frame(&mut broker).await,
        vec![0x82, 0x08, 0x00, 0x02, 0x00, 0x03, b'a', b'/', b'#', 0x02]
    );

    let pkid = h
        .client
        .publish("a/b", true, QoS::ExactlyOnce, "", Some(100))
        .await
        .unwrap();
    assert_eq!(pkid, Some(100));
    assert_eq!(read_frame(&mut broker).await[0], 0x35);

    let pkid = h.client.unsubscribe("a/#", None).await.unwrap();
    assert_eq!(pkid, 3);
    assert_eq!(read_frame(&mut broker).await[0], 0xA2);

    // SUBACK arrives through the handler
    broker
        .write_all(&[0x90, 0x03, 0x00, 0x02, 0x02])
        .await
        .unwrap();
    assert_eq!(expect_received(&mut h.events).await.pkid(), Some(2));
}

#[tokio::test]
async fn test_application_acks() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    // QoS 2 publish from the broker, acknowledged by the application
    broker
        .write_all(&[0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x09, b'!'])
        .await
        .unwrap();
    let packet = expect_received(&mut h.events).await;
    let Packet::Publish(publish) = packet else {
        panic!("expected publish, got {packet:?}");
    };
    assert_eq!(publish.pkid(), Some(9));

    h.client.pubrec(9).await.unwrap();
    assert_eq!(read_frame(&mut broker).await, vec![0x50, 0x02, 0x00, 0x09]);

    broker.write_all(&[0x62, 0x02, 0x00, 0x09]).await.unwrap();
    assert!(matches!(expect_received(&mut h.events).await, Packet::PubRel(_)));

    h.client.pubcomp(9).await.unwrap();
    assert_eq!(read_frame(&mut broker).await, vec![0x70, 0x02, 0x00, 0x09]);

    h.client.puback(4).await.unwrap();
    assert_eq!(read_frame(&mut broker).await, vec![0x40, 0x02, 0x00, 0x04]);
}

#[tokio::test]
async fn test_publish_preconditions() {
    let mut h = harness(test_config());
    let _broker = connect(&mut h).await;

    assert!(matches!(
        h.client.publish("a/+", false, QoS::AtMostOnce, "", None).await,
        Err(Error::InvalidTopic(_))
    ));
    assert!(matches!(
        h.client.publish("a", false, QoS::AtLeastOnce, "", Some(0)).await,
        Err(Error::InvalidPacketIdentifier(_))
    ));
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn test_not_connected() {
    let mut h = harness(test_config());

    assert!(matches!(
        h.client.publish("t", false, QoS::AtLeastOnce, "x", None).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        h.client.subscribe("t", QoS::AtMostOnce, None).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(h.client.unsubscribe("t", None).await, Err(Error::NotConnected)));
    assert!(matches!(h.client.puback(1).await, Err(Error::NotConnected)));

    // disconnecting while disconnected is a no-op
    tokio_test::assert_ok!(h.client.disconnect().await);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_ping() {
    let mut h = harness(test_config().with_keep_alive(5));
    let mut broker = connect(&mut h).await;

    assert_eq!(read_frame(&mut broker).await, vec![0xC0, 0x00]);

    broker.write_all(&[0xD0, 0x00]).await.unwrap();
    assert_eq!(expect_received(&mut h.events).await, Packet::PingResp);

    assert_eq!(read_frame(&mut broker).await, vec![0xC0, 0x00]);
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn test_decode_error_recovers() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    // QoS 3 publish, then a valid PINGRESP
    broker
        .write_all(&[0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01, 0xD0, 0x00])
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut h.events).await,
        Event::DecodeError(DecodeError::MalformedQoS(3))
    ));
    assert_eq!(expect_received(&mut h.events).await, Packet::PingResp);
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn test_fatal_decode_error_disconnects() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    broker
        .write_all(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF])
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut h.events).await,
        Event::DecodeError(DecodeError::MalformedRemainingLength)
    ));
    expect_state(&mut h.events, ConnectionState::Disconnected).await;
    assert!(!h.client.is_connected());
}

#[tokio::test]
async fn test_unexpected_connack() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    broker.write_all(&CONNACK_ACCEPTED).await.unwrap();
    expect_state(&mut h.events, ConnectionState::Disconnected).await;
    assert!(matches!(next_event(&mut h.events).await, Event::Error(Error::Protocol(_))));
    assert!(matches!(expect_received(&mut h.events).await, Packet::ConnAck(_)));
}

// ============================================================================
// Tests: disconnect
// ============================================================================

#[tokio::test]
async fn test_disconnect() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    h.client.disconnect().await.unwrap();
    expect_state(&mut h.events, ConnectionState::Disconnected).await;

    assert_eq!(read_frame(&mut broker).await, vec![0xE0, 0x00]);
    let mut rest = Vec::new();
    broker.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    // exactly one Disconnected
    h.client.disconnect().await.unwrap();
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_broker_closes_connection() {
    let mut h = harness(test_config());
    let broker = connect(&mut h).await;

    drop(broker);
    expect_state(&mut h.events, ConnectionState::Disconnected).await;
    assert!(matches!(
        next_event(&mut h.events).await,
        Event::Error(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_reconnect_resets_identifiers() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    let pkid = h.client.subscribe("a", QoS::AtMostOnce, None).await.unwrap();
    assert_eq!(pkid, 1);
    read_frame(&mut broker).await;

    h.client.disconnect().await.unwrap();
    expect_state(&mut h.events, ConnectionState::Disconnected).await;

    let _broker = connect(&mut h).await;
    let pkid = h.client.subscribe("a", QoS::AtMostOnce, None).await.unwrap();
    assert_eq!(pkid, 1);
}

#[tokio::test]
async fn test_dropping_client_disconnects() {
    let mut h = harness(test_config());
    let mut broker = connect(&mut h).await;

    let Harness {
        client, mut events, ..
    } = h;
    drop(client);

    assert_eq!(read_frame(&mut broker).await, vec![0xE0, 0x00]);
    expect_state(&mut events, ConnectionState::Disconnected).await;
    // the event loop is gone
    assert!(tokio::time::timeout(WAIT, events.recv()).await.unwrap().is_none());
}

// ============================================================================
// Tests: builder
// ============================================================================

#[tokio::test]
async fn test_build_rejects_invalid_config() {
    let config = test_config().with_clean_session(false);
    let config = ClientConfig {
        client_id: String::new(),
        ..config
    };
    assert!(matches!(Client::new(config, ()), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_build_requires_runtime() {
    assert!(matches!(Client::new(test_config(), ()), Err(Error::Runtime(_))));
}

#[tokio::test]
async fn test_callback_runtime() {
    struct ThreadRecorder(std::sync::mpsc::Sender<Option<String>>);

    impl Handler for ThreadRecorder {
        fn on_state_change(&mut self, _state: ConnectionState) {
            let name = std::thread::current().name().map(str::to_string);
            let _ = self.0.send(name);
        }
    }

    let callbacks = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("mqttc-callbacks")
        .enable_all()
        .build()
        .unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let client = Client::builder(test_config())
        .handler(ThreadRecorder(tx))
        .connector(PendingConnector)
        .callback_runtime(callbacks.handle().clone())
        .build()
        .unwrap();

    let pending = spawn_connect(&client);
    let name = tokio::task::spawn_blocking(move || rx.recv_timeout(WAIT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name.as_deref(), Some("mqttc-callbacks"));

    client.disconnect().await.unwrap();
    assert!(pending.await.unwrap().is_err());
    callbacks.shutdown_background();
}
