//! Connection states, events and the application callback trait.

use std::fmt;

use tokio::sync::mpsc;

use crate::error::{DecodeError, Error};
use crate::protocol::Packet;

/// Public connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Waiting for the transport to come up.
    ConnectingTransport,
    /// CONNECT sent, waiting for CONNACK.
    ConnectingBroker,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::ConnectingTransport => "connecting transport",
            ConnectionState::ConnectingBroker => "connecting broker",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Something the application is told about, in the order it happened.
#[derive(Debug)]
pub enum Event {
    /// State transition; never repeats the previous state.
    StateChanged(ConnectionState),
    /// Every decoded inbound packet, after the client has acted on it.
    Received(Packet),
    /// An inbound frame could not be decoded.
    DecodeError(DecodeError),
    /// A failure with no caller waiting on it.
    Error(Error),
}

/// Application callbacks.
///
/// All methods have default implementations that do nothing. Callbacks run
/// on the client's callback runtime, one at a time, in event order.
pub trait Handler: Send + 'static {
    /// Route an event to the matching callback.
    fn handle(&mut self, event: Event) {
        match event {
            Event::StateChanged(state) => self.on_state_change(state),
            Event::Received(packet) => self.on_receive(&packet),
            Event::DecodeError(err) => self.on_decode_error(&err),
            Event::Error(err) => self.on_error(&err),
        }
    }

    #[allow(unused_variables)]
    fn on_state_change(&mut self, state: ConnectionState) {}

    #[allow(unused_variables)]
    fn on_receive(&mut self, packet: &Packet) {}

    #[allow(unused_variables)]
    fn on_decode_error(&mut self, error: &DecodeError) {}

    #[allow(unused_variables)]
    fn on_error(&mut self, error: &Error) {}
}

/// Ignores every event.
impl Handler for () {}

/// Forwards events into a channel for `recv().await` style consumption.
impl Handler for mpsc::UnboundedSender<Event> {
    fn handle(&mut self, event: Event) {
        let _ = self.send(event);
    }
}
