//! TCP transport for mesh sessions.
//!
//! Listener setup, outbound dialing, and discovery of the address this node
//! advertises to its peers.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream as StdTcpStream};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

/// Backlog passed to `listen(2)`
pub const LISTEN_BACKLOG: u32 = 1024;

/// Host part used when the node cannot learn its own address
pub const UNKNOWN_HOST: &str = "unknown";

/// Create a TCP listener bound to the given address.
///
/// Must run inside a tokio runtime context; the listener is registered with
/// that runtime's reactor.
pub fn listen_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Connect to a `host:port` address
pub async fn connect_tcp(address: &str) -> io::Result<TcpStream> {
    TcpStream::connect(address).await
}

/// Learn the local IP the OS picks for outbound traffic.
///
/// Opens a throwaway TCP connection to `probe` and reads the local end of it.
pub fn probe_local_ip(probe: SocketAddr, timeout: Duration) -> io::Result<IpAddr> {
    let stream = StdTcpStream::connect_timeout(&probe, timeout)?;
    let local = stream.local_addr()?;
    debug!("Address probe via {} resolved local IP {}", probe, local.ip());
    Ok(local.ip())
}

/// Address this node announces to peers: `ip:port`, or `unknown:port` when
/// neither an explicit IP nor the probe is available.
pub fn advertised_address(
    advertise_ip: Option<IpAddr>,
    probe: SocketAddr,
    probe_timeout: Duration,
    port: u16,
) -> String {
    if let Some(ip) = advertise_ip {
        return SocketAddr::new(ip, port).to_string();
    }

    match probe_local_ip(probe, probe_timeout) {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(e) => {
            warn!("Address probe via {} failed: {}; advertising as unknown", probe, e);
            format!("{}:{}", UNKNOWN_HOST, port)
        }
    }
}
