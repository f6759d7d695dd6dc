//! Streaming decoder for inbound MQTT frames.

use bytes::{Buf, BytesMut};

use crate::error::DecodeError;

use super::codec::read_remaining_length;
use super::v4::{FixedHeader, Packet};
use super::MAX_PACKET_SIZE;

/// Accumulates bytes from the transport and yields whole packets.
///
/// Arbitrary fragmentation is tolerated: a frame is parsed only once every
/// byte of it has been fed. A malformed frame is dropped as a unit, so each
/// bad packet produces exactly one error and decoding resumes at the next
/// frame. Fatal errors (see [`DecodeError::is_fatal`]) clear the buffer.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_packet_size,
        }
    }

    /// Append bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered, e.g. when a connection ends.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Decode the next complete packet.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn try_decode(&mut self) -> Result<Option<Packet>, DecodeError> {
        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };

        let (remaining, len_bytes) = match read_remaining_length(&self.buf[1..]) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.buf.clear();
                return Err(e);
            }
        };

        let header_len = 1 + len_bytes;
        let frame_len = header_len + remaining;
        if frame_len > self.max_packet_size {
            self.buf.clear();
            return Err(DecodeError::PacketTooLarge {
                size: frame_len,
                max: self.max_packet_size,
            });
        }

        if self.buf.len() < frame_len {
            self.buf.reserve(frame_len - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(frame_len).freeze();
        frame.advance(header_len);

        let header = FixedHeader::from_byte(first)?;
        Packet::read(header, frame).map(Some)
    }
}
