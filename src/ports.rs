//! Ephemeral port allocation for backend processes

use std::net::{Ipv4Addr, TcpListener};

/// Ask the OS for an unused local TCP port.
///
/// The listening socket is released before returning, so another process may
/// grab the port before the backend binds it. Callers treat the resulting
/// startup failure as fatal for that attempt.
pub fn allocate() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
