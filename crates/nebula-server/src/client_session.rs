//! Per-client packet handler: echoes every packet back to its sender.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nebula_net::{PacketHandler, Session};

/// Server-wide counters shared by every client session.
#[derive(Debug, Default)]
pub struct EchoStats {
    /// Sessions that have connected.
    pub connected: AtomicU64,
    /// Sessions that have disconnected.
    pub disconnected: AtomicU64,
    /// Packets received and echoed.
    pub packets: AtomicU64,
    /// Bytes written across all sessions.
    pub bytes_sent: AtomicU64,
}

/// Handler for one connected client.
pub struct ClientSession {
    peer_addr: SocketAddr,
    stats: Arc<EchoStats>,
}

impl ClientSession {
    pub fn new(peer_addr: SocketAddr, stats: Arc<EchoStats>) -> Self {
        Self { peer_addr, stats }
    }
}

impl PacketHandler for ClientSession {
    fn on_connected(&self, session: &Session, peer_addr: SocketAddr) {
        self.stats.connected.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Client {:?} connected from {peer_addr}", session.id());
    }

    fn on_packet(&self, session: &Session, payload: &[u8]) {
        self.stats.packets.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = session.send_packet(payload) {
            tracing::warn!("Echo to {} failed: {e}", self.peer_addr);
        }
    }

    fn on_sent(&self, session: &Session, bytes: usize) {
        self.stats
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        tracing::debug!("Client {:?} transferred {bytes} bytes", session.id());
    }

    fn on_disconnected(&self, session: &Session, peer_addr: SocketAddr) {
        self.stats.disconnected.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Client {:?} disconnected from {peer_addr}", session.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_net::{Framed, Listener, ListenerConfig, read_packet, write_packet};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_echo_server_roundtrip() {
        let stats = Arc::new(EchoStats::default());
        let factory_stats = Arc::clone(&stats);
        let listener = Arc::new(Listener::new(ListenerConfig::default(), move |peer| {
            Framed::new(ClientSession::new(peer, Arc::clone(&factory_stats)))
        }));

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let runner = Arc::clone(&listener);
        tokio::spawn(async move {
            runner.run_with_listener(tcp).await.unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for msg in [&b"one"[..], b"two", b"three"] {
            write_packet(&mut stream, msg).await.unwrap();
            assert_eq!(read_packet(&mut stream).await.unwrap(), msg);
        }

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(stats.connected.load(Ordering::Relaxed), 1);
        assert_eq!(stats.packets.load(Ordering::Relaxed), 3);
        // 2-byte header per packet plus 3 + 3 + 5 payload bytes.
        assert_eq!(stats.bytes_sent.load(Ordering::Relaxed), 17);
        assert_eq!(stats.disconnected.load(Ordering::Relaxed), 1);
        assert!(listener.sessions.is_empty());

        listener.shutdown();
    }
}
