//! Listening socket setup.

use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::debug;

/// Resolve `host:port` and bind the first address that accepts a listener.
///
/// Hostnames may resolve to several addresses (e.g. IPv6 and IPv4 for
/// `localhost`); each is tried in order and the last error is returned if
/// none can be bound.
pub async fn bind(host: &str, port: u16, backlog: u32) -> io::Result<TcpListener> {
    let mut last_err = None;

    for addr in tokio::net::lookup_host((host, port)).await? {
        match create_listener(addr, backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Bind attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host}:{port} did not resolve to any address"),
        )
    }))
}

fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    TcpListener::from_std(socket.into())
}
