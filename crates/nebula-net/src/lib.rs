//! Session transport: turns a byte stream into ordered, framed messages and
//! batches outgoing messages into vectored writes.

pub mod connector;
pub mod error;
pub mod framing;
pub mod listener;
pub mod recv_buffer;
pub mod session;

pub use connector::connect;
pub use error::{ProtocolError, SessionError};
pub use framing::{
    Framed, HEADER_SIZE, MAX_PAYLOAD_SIZE, PacketHandler, encode_packet, read_packet,
    split_packet, write_packet,
};
pub use listener::{Listener, ListenerConfig, SessionMap};
pub use recv_buffer::{MIN_RECV_CEILING, RecvBuffer};
pub use session::{Connection, Session, SessionConfig, SessionId, SessionState, StreamHandler};
