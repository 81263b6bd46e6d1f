//! Buffer types shared by the transport layer, the security layer and the
//! runtime surfaces. Everything is stack allocated; capacities are fixed at
//! compile time so the stack never touches a heap.

/// Longest payload the J1939 transport protocol can carry (255 packets × 7 bytes).
pub const MAX_MESSAGE_LENGTH: usize = 1785;

/// Fixed-capacity byte buffer with an explicit fill level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadBuffer<const N: usize> {
    pub len: usize,
    pub data: [u8; N],
}

impl<const N: usize> Default for PayloadBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PayloadBuffer<N> {
    /// Create an empty buffer.
    pub const fn new() -> Self {
        Self { len: 0, data: [0; N] }
    }

    /// Build a buffer from a slice, clamped to the capacity.
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.copy_from_slice(slice);
        buffer
    }

    /// Number of valid bytes stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reset the buffer.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Copy bytes into the buffer and update `len`.
    #[inline]
    pub fn copy_from_slice(&mut self, slice: &[u8]) {
        let clamped = slice.len().min(N);
        self.data[..clamped].copy_from_slice(&slice[..clamped]);
        self.len = clamped;
    }

    /// Append bytes; returns `false` when they do not fit.
    #[inline]
    pub fn extend_from_slice(&mut self, slice: &[u8]) -> bool {
        let end = self.len + slice.len();
        if end > N {
            return false;
        }
        self.data[self.len..end].copy_from_slice(slice);
        self.len = end;
        true
    }

    /// Immutable view over the populated bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// A complete J1939 message: either a single frame or a payload rebuilt by
/// the transport protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct J1939Message {
    /// Parameter Group Number of the payload (target PGN for transport transfers).
    pub pgn: u32,
    /// Sender address.
    pub source_address: u8,
    /// Destination address (255 for broadcasts and PDU2 PGNs).
    pub destination_address: u8,
    /// Message body.
    pub payload: PayloadBuffer<MAX_MESSAGE_LENGTH>,
}

impl J1939Message {
    pub fn new(pgn: u32, source_address: u8, destination_address: u8, payload: &[u8]) -> Self {
        Self {
            pgn,
            source_address,
            destination_address,
            payload: PayloadBuffer::from_slice(payload),
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        self.payload.as_slice()
    }
}
