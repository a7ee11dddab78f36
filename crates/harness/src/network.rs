//! Port discovery and connect probes

use std::io::ErrorKind;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use crate::cache::PortCache;
use crate::error::Result;

/// Claim ports from the shared counter until one can be bound on `host`.
///
/// Busy or forbidden ports advance the counter; any other bind error is fatal.
/// The probe listener is closed before returning.
pub async fn find_port(cache: &mut PortCache, host: &str, base: u16) -> Result<u16> {
    loop {
        let port = cache.claim_port(base);
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                drop(listener);
                debug!(port, "selected port");
                return Ok(port);
            }
            Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => {
                trace!(port, "port unavailable: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Whether something accepts TCP connections on `host:port`
pub async fn is_listening(host: &str, port: u16) -> bool {
    TcpStream::connect((host, port)).await.is_ok()
}
