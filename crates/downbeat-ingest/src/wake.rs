//! Best-effort UDP wake signal to the scheduler.
//!
//! Any datagram on the scheduler's loopback signal port wakes its loop
//! immediately and switches it to fast polling. Failures are logged and
//! otherwise ignored - the scheduler's poll timeout covers for lost
//! signals.

use tokio::net::UdpSocket;

/// Payload is arbitrary by contract; this one names the intent.
const WAKE_PAYLOAD: &[u8] = b"check_queue";

/// Send one wake datagram to `127.0.0.1:port`.
pub async fn send_wake(port: u16) {
    match UdpSocket::bind("127.0.0.1:0").await {
        Ok(socket) => match socket.send_to(WAKE_PAYLOAD, ("127.0.0.1", port)).await {
            Ok(_) => tracing::info!(port, "sent scheduler wake signal"),
            Err(e) => tracing::warn!(port, error = %e, "wake signal send failed"),
        },
        Err(e) => tracing::warn!(error = %e, "cannot bind UDP socket for wake signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wake_reaches_a_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        send_wake(port).await;

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            listener.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..len], WAKE_PAYLOAD);
    }

    #[tokio::test]
    async fn wake_to_closed_port_does_not_panic() {
        // nothing listening on this port; send must be best-effort
        send_wake(1);
    }
}
