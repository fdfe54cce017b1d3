//! TCP listener that accepts connections and starts a session for each.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::ProtocolError;
use crate::session::{Session, SessionConfig, SessionId, StreamHandler};

/// Pause after a failed accept so resource exhaustion does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Thread-safe registry of live sessions keyed by [`SessionId`].
#[derive(Default)]
pub struct SessionMap {
    inner: DashMap<SessionId, Arc<Session>>,
}

impl SessionMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session: Arc<Session>) {
        self.inner.insert(session.id(), session);
    }

    fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.remove(id).map(|(_, session)| session)
    }

    /// Look up a live session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Configuration for [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions. Default: 256.
    pub max_connections: usize,
    /// Disable Nagle's algorithm on accepted sockets. Default: true.
    pub nodelay: bool,
    /// Settings applied to every accepted session.
    pub session: SessionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_connections: 256,
            nodelay: true,
            session: SessionConfig::default(),
        }
    }
}

/// Removes its session from the map when the session ends.
struct Tracked<H> {
    inner: H,
    sessions: Arc<SessionMap>,
}

impl<H: StreamHandler> StreamHandler for Tracked<H> {
    fn on_connected(&self, session: &Session, peer_addr: SocketAddr) {
        self.inner.on_connected(session, peer_addr);
    }

    fn on_receive(&self, session: &Session, data: &[u8]) -> Result<usize, ProtocolError> {
        self.inner.on_receive(session, data)
    }

    fn on_sent(&self, session: &Session, bytes: usize) {
        self.inner.on_sent(session, bytes);
    }

    fn on_disconnected(&self, session: &Session, peer_addr: SocketAddr) {
        self.sessions.remove(&session.id());
        self.inner.on_disconnected(session, peer_addr);
    }
}

/// Accepts TCP connections and hands each one to a fresh session.
///
/// `factory` builds the handler for every accepted peer.
pub struct Listener<F> {
    config: ListenerConfig,
    factory: F,
    /// Live sessions (public for owner and test inspection).
    pub sessions: Arc<SessionMap>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<F, H> Listener<F>
where
    F: Fn(SocketAddr) -> H,
    H: StreamHandler,
{
    /// Create a listener with the given configuration and handler factory.
    pub fn new(config: ListenerConfig, factory: F) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            factory,
            sessions: Arc::new(SessionMap::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    ///
    /// Returns after [`shutdown`](Self::shutdown), once every live session has
    /// been disconnected.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        self.admit(stream, peer_addr);
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Listener shutting down");
                        break;
                    }
                }
            }
        }

        for session in self.sessions.sessions() {
            session.disconnect();
        }

        Ok(())
    }

    /// Start a session for one accepted stream. Failures only affect that
    /// connection.
    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) -> Option<Arc<Session>> {
        if self.sessions.len() >= self.config.max_connections {
            tracing::warn!("Connection limit reached, rejecting {peer_addr}");
            return None;
        }
        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            tracing::warn!("Dropping {peer_addr}: {e}");
            return None;
        }

        let handler = Tracked {
            inner: (self.factory)(peer_addr),
            sessions: Arc::clone(&self.sessions),
        };
        let session = Session::start(stream, peer_addr, handler, &self.config.session);
        self.sessions.insert(Arc::clone(&session));
        // A session that ended before registration must not linger.
        if !session.is_active() {
            self.sessions.remove(&session.id());
        }
        Some(session)
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Framed, PacketHandler, read_packet, write_packet};
    use tokio::io::AsyncReadExt;

    struct Echo;

    impl PacketHandler for Echo {
        fn on_packet(&self, session: &Session, payload: &[u8]) {
            let _ = session.send_packet(payload);
        }
    }

    type EchoFactory = fn(SocketAddr) -> Framed<Echo>;

    fn echo_factory(_peer: SocketAddr) -> Framed<Echo> {
        Framed::new(Echo)
    }

    /// Helper: start a listener on an ephemeral port and return the bound address.
    async fn start_test_listener(
        max_connections: usize,
    ) -> (SocketAddr, Arc<Listener<EchoFactory>>) {
        let config = ListenerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections,
            ..ListenerConfig::default()
        };
        let listener = Arc::new(Listener::new(config, echo_factory as EchoFactory));
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let srv = Arc::clone(&listener);
        tokio::spawn(async move {
            srv.run_with_listener(tcp).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        (addr, listener)
    }

    #[tokio::test]
    async fn test_listener_echoes_packets() {
        let (addr, _listener) = start_test_listener(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        write_packet(&mut stream, b"PING").await.unwrap();
        let reply = read_packet(&mut stream).await.unwrap();
        assert_eq!(reply, b"PING");
    }

    #[tokio::test]
    async fn test_multiple_clients_tracked() {
        let (addr, listener) = start_test_listener(16).await;
        let mut streams = Vec::new();
        for _ in 0..5 {
            streams.push(TcpStream::connect(addr).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.sessions.len(), 5);
    }

    #[tokio::test]
    async fn test_closed_client_is_untracked() {
        let (addr, listener) = start_test_listener(16).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.sessions.len(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(listener.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let max = 2;
        let (addr, listener) = start_test_listener(max).await;

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.sessions.len(), 2);

        let mut c3 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(listener.sessions.len() <= max);

        let mut buf = [0u8; 8];
        let n = c3.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "Rejected client should see EOF");
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_sessions() {
        let (addr, listener) = start_test_listener(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "Client should receive EOF after listener shutdown");
        assert!(listener.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_dead_connection_does_not_stop_accepting() {
        let listener = Arc::new(Listener::new(
            ListenerConfig::default(),
            echo_factory as EchoFactory,
        ));
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();

        // Queued in the backlog and already closed by the time it is accepted.
        drop(TcpStream::connect(addr).await.unwrap());

        let srv = Arc::clone(&listener);
        let accept_loop = tokio::spawn(async move { srv.run_with_listener(tcp).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_packet(&mut stream, b"still here").await.unwrap();
        assert_eq!(read_packet(&mut stream).await.unwrap(), b"still here");
        assert!(!accept_loop.is_finished());

        listener.shutdown();
        accept_loop.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_admit_rejects_over_limit_and_keeps_running() {
        let config = ListenerConfig {
            max_connections: 1,
            ..ListenerConfig::default()
        };
        let listener = Listener::new(config, echo_factory as EchoFactory);
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = tcp.accept().await.unwrap();
        let session = listener.admit(stream, peer).unwrap();
        assert_eq!(listener.sessions.len(), 1);

        let _second = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = tcp.accept().await.unwrap();
        assert!(listener.admit(stream, peer).is_none());
        assert_eq!(listener.sessions.len(), 1);

        session.disconnect();
        assert!(listener.sessions.is_empty());
    }
}
