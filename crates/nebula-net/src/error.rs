//! Session and framing error types.

/// Violations of the byte-stream contract detected on the receive path.
///
/// Every variant is fatal to the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The receive handler reported consuming more bytes than were buffered.
    #[error("handler consumed {consumed} bytes but only {available} were available")]
    OverConsumed {
        /// Bytes the handler claimed to consume.
        consumed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A length prefix smaller than the header itself.
    #[error("malformed packet header: length {length} is shorter than the header")]
    MalformedHeader {
        /// The length value read from the wire.
        length: u16,
    },

    /// The receive buffer reached its ceiling without yielding a message.
    #[error("receive buffer exhausted at {capacity} bytes without a complete message")]
    BufferExhausted {
        /// Capacity of the full buffer.
        capacity: usize,
    },
}

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The underlying connection failed or was closed by the peer.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The inbound byte stream could not be framed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session has already been torn down.
    #[error("session is disconnected")]
    Disconnected,

    /// The bounded send queue is at capacity.
    #[error("send queue full ({limit} chunks)")]
    SendQueueFull {
        /// The configured queue bound.
        limit: usize,
    },

    /// A packet payload does not fit the 16-bit length prefix.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The largest payload the header can describe.
        max: usize,
    },
}
