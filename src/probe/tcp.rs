//! TCP connect probe.

use std::io;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::ProbeError;

/// Connect to `host:port` and return the connect time in milliseconds.
pub async fn run_tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<u64, ProbeError> {
    let start = Instant::now();

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProbeError::TcpTimeout(timeout))?
        .map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => ProbeError::TcpTimeout(timeout),
            _ => ProbeError::Network(io_error_code(&e)),
        })?;

    let elapsed = start.elapsed().as_millis() as u64;
    let _ = stream.shutdown().await;

    Ok(elapsed)
}

/// Map an I/O error to a short errno-style code, falling back to its message.
pub(crate) fn io_error_code(err: &io::Error) -> String {
    let code = match err.kind() {
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionAborted => "ECONNABORTED",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::PermissionDenied => "EACCES",
        _ => return err.to_string(),
    };
    code.to_string()
}
