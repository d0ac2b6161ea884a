use std::time::Duration;

/// Whether something accepts TCP connections on `host:port`.
///
/// Any connect error (refused, unreachable, timed out) counts as free.
pub async fn is_port_in_use(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// First port in `start..end` nothing listens on, or 0 when all are taken.
pub async fn find_free_port(host: &str, start: u16, end: u16, timeout: Duration) -> u16 {
    for port in start..end {
        if !is_port_in_use(host, port, timeout).await {
            return port;
        }
    }
    0
}
