//! Length-prefixed packet framing on top of a raw [`Session`].
//!
//! Every packet on the wire carries a 2-byte header:
//!
//! ```text
//! +-------------------+--------------------------+
//! | length (2 bytes)  |   payload                |
//! | u16 little-endian |   (length - 2 bytes)     |
//! +-------------------+--------------------------+
//! ```
//!
//! The length **includes** the 2 header bytes, so the largest payload is
//! 65533 bytes and a length below 2 is malformed.
//!
//! [`Framed`] is the only [`StreamHandler`] that parses headers. Packet
//! handlers implement [`PacketHandler`] and only ever see whole payloads.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ProtocolError, SessionError};
use crate::session::{Session, StreamHandler};

/// Size of the length prefix in bytes.
pub const HEADER_SIZE: usize = 2;

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize - HEADER_SIZE;

/// Message-level callbacks for a framed session.
pub trait PacketHandler: Send + Sync + 'static {
    /// Fired once, right after the session starts.
    fn on_connected(&self, _session: &Session, _peer_addr: SocketAddr) {}

    /// Fired once per complete inbound packet, in arrival order.
    ///
    /// `payload` excludes the header and borrows the receive buffer, so it is
    /// only valid for the duration of the call.
    fn on_packet(&self, session: &Session, payload: &[u8]);

    /// Fired once per completed physical write.
    fn on_sent(&self, _session: &Session, _bytes: usize) {}

    /// Fired exactly once when the session ends.
    fn on_disconnected(&self, _session: &Session, _peer_addr: SocketAddr) {}
}

impl<T: PacketHandler> PacketHandler for Arc<T> {
    fn on_connected(&self, session: &Session, peer_addr: SocketAddr) {
        (**self).on_connected(session, peer_addr);
    }

    fn on_packet(&self, session: &Session, payload: &[u8]) {
        (**self).on_packet(session, payload);
    }

    fn on_sent(&self, session: &Session, bytes: usize) {
        (**self).on_sent(session, bytes);
    }

    fn on_disconnected(&self, session: &Session, peer_addr: SocketAddr) {
        (**self).on_disconnected(session, peer_addr);
    }
}

/// Adapts a [`PacketHandler`] to the raw [`StreamHandler`] contract.
pub struct Framed<P> {
    inner: P,
}

impl<P: PacketHandler> Framed<P> {
    /// Wrap a packet handler.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    /// Borrow the wrapped packet handler.
    pub fn get_ref(&self) -> &P {
        &self.inner
    }
}

impl<P: PacketHandler> StreamHandler for Framed<P> {
    fn on_connected(&self, session: &Session, peer_addr: SocketAddr) {
        self.inner.on_connected(session, peer_addr);
    }

    fn on_receive(&self, session: &Session, data: &[u8]) -> Result<usize, ProtocolError> {
        let mut consumed = 0;
        // A packet handler may hang up mid-read; nothing is delivered after that.
        while session.is_active()
            && let Some((payload, packet_len)) = split_packet(&data[consumed..])?
        {
            self.inner.on_packet(session, payload);
            consumed += packet_len;
        }
        Ok(consumed)
    }

    fn on_sent(&self, session: &Session, bytes: usize) {
        self.inner.on_sent(session, bytes);
    }

    fn on_disconnected(&self, session: &Session, peer_addr: SocketAddr) {
        self.inner.on_disconnected(session, peer_addr);
    }
}

/// Peek one packet at the front of `data`.
///
/// Returns the payload and the full packet length (header included), or
/// `None` while the header or the payload is still incomplete.
pub fn split_packet(data: &[u8]) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = u16::from_le_bytes([data[0], data[1]]);
    let packet_len = length as usize;
    if packet_len < HEADER_SIZE {
        return Err(ProtocolError::MalformedHeader { length });
    }
    if data.len() < packet_len {
        return Ok(None);
    }

    Ok(Some((&data[HEADER_SIZE..packet_len], packet_len)))
}

/// Prepend the length header to `payload`.
pub fn encode_packet(payload: &[u8]) -> Result<Bytes, SessionError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(SessionError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u16_le((HEADER_SIZE + payload.len()) as u16);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

impl Session {
    /// Frame `payload` and queue it for transmission.
    pub fn send_packet(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.send(encode_packet(payload)?)
    }
}

/// Read a single packet from a plain async stream, returning its payload.
///
/// Intended for clients and tools that talk to a session without running
/// one themselves. Returns [`SessionError::Disconnected`] if the stream ends
/// mid-packet or before one starts.
pub async fn read_packet<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, SessionError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(eof_to_disconnected)?;

    let length = u16::from_le_bytes(header);
    let packet_len = length as usize;
    if packet_len < HEADER_SIZE {
        return Err(ProtocolError::MalformedHeader { length }.into());
    }

    let mut payload = vec![0u8; packet_len - HEADER_SIZE];
    if !payload.is_empty() {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(eof_to_disconnected)?;
    }

    Ok(payload)
}

/// Write a single framed packet to a plain async stream.
pub async fn write_packet<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), SessionError> {
    let packet = encode_packet(payload)?;
    writer.write_all(&packet).await?;
    writer.flush().await?;
    Ok(())
}

fn eof_to_disconnected(e: std::io::Error) -> SessionError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SessionError::Disconnected
    } else {
        SessionError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_ping_wire_bytes() {
        let packet = encode_packet(b"PING").unwrap();
        assert_eq!(&packet[..], &[0x06, 0x00, b'P', b'I', b'N', b'G']);
    }

    #[test]
    fn test_split_exact_packet() {
        let data = [0x06, 0x00, b'P', b'I', b'N', b'G'];
        let (payload, len) = split_packet(&data).unwrap().unwrap();
        assert_eq!(payload, b"PING");
        assert_eq!(len, 6);
    }

    #[test]
    fn test_split_needs_full_header() {
        assert_eq!(split_packet(&[]).unwrap(), None);
        assert_eq!(split_packet(&[0x06]).unwrap(), None);
    }

    #[test]
    fn test_split_torn_payload() {
        let data = [0x06, 0x00, b'P', b'I'];
        assert_eq!(split_packet(&data).unwrap(), None);
    }

    #[test]
    fn test_split_ignores_trailing_bytes() {
        let data = [0x03, 0x00, b'x', 0x05, 0x00];
        let (payload, len) = split_packet(&data).unwrap().unwrap();
        assert_eq!(payload, b"x");
        assert_eq!(len, 3);
    }

    #[test]
    fn test_header_only_packet_has_empty_payload() {
        let (payload, len) = split_packet(&[0x02, 0x00]).unwrap().unwrap();
        assert!(payload.is_empty());
        assert_eq!(len, HEADER_SIZE);
    }

    #[test]
    fn test_length_below_header_is_malformed() {
        assert_eq!(
            split_packet(&[0x00, 0x00, 0xAA]),
            Err(ProtocolError::MalformedHeader { length: 0 })
        );
        assert_eq!(
            split_packet(&[0x01, 0x00]),
            Err(ProtocolError::MalformedHeader { length: 1 })
        );
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let payload = vec![0xABu8; 300];
        let packet = encode_packet(&payload).unwrap();
        // 302 = 0x012E
        assert_eq!(&packet[..2], &[0x2E, 0x01]);
    }

    #[test]
    fn test_max_payload_accepted() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE];
        let packet = encode_packet(&payload).unwrap();
        assert_eq!(&packet[..2], &[0xFF, 0xFF]);
        assert_eq!(packet.len(), u16::MAX as usize);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result = encode_packet(&payload);
        assert!(
            matches!(result, Err(SessionError::PayloadTooLarge { size, max })
                if size == MAX_PAYLOAD_SIZE + 1 && max == MAX_PAYLOAD_SIZE),
            "Should reject oversized payload"
        );
    }

    #[tokio::test]
    async fn test_stream_helpers_roundtrip() {
        let (mut client, mut server) = duplex(8192);
        let messages: Vec<&[u8]> = vec![b"first", b"", b"third"];
        for msg in &messages {
            write_packet(&mut client, msg).await.unwrap();
        }
        for expected in &messages {
            let received = read_packet(&mut server).await.unwrap();
            assert_eq!(received, *expected);
        }
    }

    #[tokio::test]
    async fn test_read_packet_reports_closed_stream() {
        let (client, mut server) = duplex(64);
        drop(client);
        let result = read_packet(&mut server).await;
        assert!(matches!(result, Err(SessionError::Disconnected)));
    }

    #[tokio::test]
    async fn test_read_packet_rejects_malformed_header() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x01, 0x00]).await.unwrap();
        let result = read_packet(&mut server).await;
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::MalformedHeader { length: 1 }))
        ));
    }
}
