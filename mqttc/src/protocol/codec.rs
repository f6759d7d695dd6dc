//! MQTT packet encoding/decoding utilities.
//!
//! Writers append to a [`BytesMut`] and never fail. Readers consume from the
//! front of a [`Bytes`] body; callers check [`has_size`] before reading fixed
//! width fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

/// Read the remaining length field.
///
/// Returns `Ok(Some((value, bytes_consumed)))`, or `Ok(None)` if more bytes
/// are needed. A fourth byte that still has the continuation bit set is
/// malformed.
pub fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().take(4).enumerate() {
        value += (byte & 0x7F) as usize * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        Err(DecodeError::MalformedRemainingLength)
    } else {
        Ok(None)
    }
}

/// Write the remaining length field, 7 bits per byte, least significant first.
///
/// Packet constructors keep `value` within [`MAX_REMAINING_LENGTH`](super::MAX_REMAINING_LENGTH).
pub fn write_remaining_length(buf: &mut BytesMut, mut value: usize) {
    debug_assert!(value <= super::MAX_REMAINING_LENGTH);
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Number of bytes the remaining length field takes for `value`.
pub const fn remaining_length_len(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Write a single byte.
pub fn write_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

/// Write a 2-byte big-endian u16.
pub fn write_u16(buf: &mut BytesMut, value: u16) {
    buf.put_u16(value);
}

/// Write a UTF-8 string (2-byte length prefix + data).
///
/// Strings longer than 65535 bytes are rejected before they reach the encoder.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_binary(buf, s.as_bytes());
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

/// Whether at least `n` unconsumed bytes remain.
pub fn has_size(buf: &Bytes, n: usize) -> bool {
    buf.remaining() >= n
}

/// Read a single byte. Check [`has_size`] first.
pub fn read_u8(buf: &mut Bytes) -> u8 {
    buf.get_u8()
}

/// Read a 2-byte big-endian u16. Check [`has_size`] first.
pub fn read_u16(buf: &mut Bytes) -> u16 {
    buf.get_u16()
}

/// Read up to `n` bytes. Asking for more than remains returns what is left.
pub fn read_bytes(buf: &mut Bytes, n: usize) -> Bytes {
    buf.split_to(n.min(buf.len()))
}

/// Read a 2-byte packet identifier.
pub fn read_pkid(buf: &mut Bytes) -> Result<u16, DecodeError> {
    if !has_size(buf, 2) {
        return Err(DecodeError::MalformedData);
    }
    Ok(read_u16(buf))
}

/// Read a UTF-8 string (2-byte length prefix + data).
pub fn read_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    if !has_size(buf, 2) {
        return Err(DecodeError::MalformedData);
    }
    let len = read_u16(buf) as usize;

    if !has_size(buf, len) {
        return Err(DecodeError::MalformedData);
    }

    let data = read_bytes(buf, len);
    String::from_utf8(data.to_vec()).map_err(|_| DecodeError::MalformedData)
}
