use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Probe cadence and per-attempt connect timeout
const PROBE_INTERVAL: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Readiness gate for a freshly started instance.
///
/// TCP-connects to `(address, port)` every two seconds until the first
/// success or until `overall` elapses. Returns whether the instance ever
/// accepted a connection.
pub async fn wait_until_ready(address: &str, port: u16, overall: Duration) -> bool {
    let target = if address.contains(':') && !address.starts_with('[') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    };

    let deadline = tokio::time::Instant::now() + overall;
    loop {
        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(_)) => {
                debug!("Readiness probe succeeded for {}", target);
                return true;
            }
            Ok(Err(e)) => debug!("Readiness probe refused for {}: {}", target, e),
            Err(_) => debug!("Readiness probe timed out for {}", target),
        }

        if tokio::time::Instant::now() + PROBE_INTERVAL > deadline {
            return false;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_succeeds_against_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Keep accepting so connects succeed.
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        assert!(wait_until_ready("127.0.0.1", port, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_probe_gives_up_when_nothing_listens() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let start = std::time::Instant::now();
        let ready = wait_until_ready("127.0.0.1", port, Duration::from_millis(100)).await;
        assert!(!ready);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ipv6_addresses_are_bracketed() {
        // No listener on ::1 port; just exercise the address formatting path.
        let ready = wait_until_ready("::1", 1, Duration::from_millis(50)).await;
        assert!(!ready);
    }
}
