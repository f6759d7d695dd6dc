//! MQTT 3.1.1 client.
//!
//! This crate implements the client side of MQTT 3.1.1 over any ordered byte
//! stream:
//!
//! - **Codec**: bit-exact encoding of all 14 control packets and a streaming
//!   decoder that tolerates arbitrary fragmentation
//! - **Connection**: transport and CONNECT handshake supervision, connect
//!   timeout, keep-alive pings and the outbound QoS 2 PUBREL step
//! - **Client**: a cloneable async handle; inbound packets and state changes
//!   are delivered to a [`Handler`]
//!
//! ## Example
//!
//! ```no_run
//! use giztoy_mqttc::{Client, ClientConfig, Event, QoS};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> giztoy_mqttc::Result<()> {
//!     let config = ClientConfig::from_url("mqtt://127.0.0.1:1883?client_id=sensor-1")?;
//!     let (events, mut rx) = mpsc::unbounded_channel();
//!     let client = Client::new(config, events)?;
//!
//!     client.connect().await?;
//!     client.subscribe("sensors/#", QoS::AtLeastOnce, None).await?;
//!     client.publish("sensors/1", false, QoS::AtLeastOnce, "21.5", None).await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         if let Event::Received(packet) = event {
//!             println!("Received: {:?}", packet);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod client;
pub mod config;
mod connection;
mod error;
mod event;
pub mod pkid;
pub mod protocol;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use config::{Address, ClientConfig};
pub use error::{DecodeError, Error, Result};
pub use event::{ConnectionState, Event, Handler};
pub use protocol::{ConnAck, ConnectReturnCode, Packet, Publish, QoS, SubscribeFilter, SubscribeReasonCode, Will};
pub use transport::{BoxStream, Connector, TransportConnector};

#[cfg(feature = "tls")]
pub use transport::tls::TlsConfig;

#[cfg(test)]
mod tests;
