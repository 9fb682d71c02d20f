//! TCP reachability probe.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Outcome of a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Success,
    Failure,
}

/// Attempt a TCP connect to `addr`, bounded by `timeout`.
///
/// The guest contract is reachability only: a completed handshake is
/// success, anything else (refusal, unreachable, timeout) is failure.
pub async fn tcp_probe(addr: SocketAddr, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ProbeResult::Success,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "probe connect failed");
            ProbeResult::Failure
        }
        Err(_) => {
            debug!(%addr, timeout_ms = timeout.as_millis() as u64, "probe timed out");
            ProbeResult::Failure
        }
    }
}
