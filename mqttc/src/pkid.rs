//! Packet identifier allocation.

/// Hands out packet identifiers for one connection.
///
/// Identifiers run 1..=65535 and wrap back to 1; 0 is never produced.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Take the next identifier.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    /// Start over from 1 for a new connection.
    pub fn reset(&mut self) {
        self.next = 1;
    }
}
