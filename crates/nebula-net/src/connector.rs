//! Outbound connections: dial a server and run a session over the stream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::session::{Session, SessionConfig, StreamHandler};

/// Connect to `addr` and start a session driven by `handler`.
///
/// Sets `TCP_NODELAY` and returns once the TCP handshake completes and
/// [`StreamHandler::on_connected`] has fired.
pub async fn connect<H: StreamHandler>(
    addr: SocketAddr,
    handler: H,
    config: &SessionConfig,
) -> std::io::Result<Arc<Session>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer_addr = stream.peer_addr()?;

    Ok(Session::start(stream, peer_addr, handler, config))
}
