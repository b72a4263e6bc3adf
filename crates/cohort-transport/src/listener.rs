//! The listening socket shared by every worker.
//!
//! Each worker process binds the same address with `SO_REUSEPORT`; the
//! kernel spreads incoming connections across them. A process that binds
//! the port *without* that option (or runs as another user) still makes
//! our bind fail with `EADDRINUSE`, which is exactly the fatal case the
//! worker has to report.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket};

use crate::TransportError;

/// Pending-connection queue length passed to `listen(2)`.
const BACKLOG: u32 = 1024;

/// Binds a listener on `addr` that other workers may bind too.
///
/// Must be called from inside a Tokio runtime.
pub fn bind_shared(addr: SocketAddr) -> Result<TcpListener, TransportError> {
    let bind_err = |source| TransportError::Bind { addr, source };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    socket.set_reuseaddr(true).map_err(bind_err)?;
    #[cfg(unix)]
    socket.set_reuseport(true).map_err(bind_err)?;

    socket.bind(addr).map_err(bind_err)?;
    let listener = socket.listen(BACKLOG).map_err(bind_err)?;

    tracing::debug!(%addr, "shared listener bound");
    Ok(listener)
}
