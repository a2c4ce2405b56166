//! Data Receiver (C4 receive half).
//!
//! A single tokio task bound to a UDP socket, forwarding each datagram
//! straight into the adaptive buffer. Mirrors the teacher's client-side UDP
//! receive loop in `client.rs`, minus the heap-based reorder logic that
//! module hand-rolled — that responsibility now lives entirely in
//! [`crate::buffer::AdaptiveBuffer`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::buffer::AdaptiveBuffer;
use crate::wire::RECV_BUFFER_SIZE;

/// Reads datagrams from `socket` until `running` is cleared, pushing each
/// into `buffer`. Receive errors are logged and the loop continues; only
/// cancellation (via `running`) ends it.
pub async fn run_receive_loop(
    socket: Arc<UdpSocket>,
    buffer: Arc<Mutex<AdaptiveBuffer>>,
    running: Arc<AtomicBool>,
    total_bytes_received: Arc<AtomicU64>,
) {
    let mut scratch = vec![0u8; RECV_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        let recv = tokio::time::timeout(std::time::Duration::from_millis(200), socket.recv(&mut scratch)).await;

        let n = match recv {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                tracing::warn!(%err, "udp receive error");
                continue;
            }
            Err(_elapsed) => continue,
        };

        total_bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        let packet = scratch[..n].to_vec();
        let outcome = buffer.lock().push(packet);
        if !outcome.is_accepted() {
            tracing::trace!(?outcome, "dropped incoming packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HEADER_SIZE;
    use std::time::Duration;

    #[tokio::test]
    async fn receive_loop_forwards_datagrams_into_buffer() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server.local_addr().unwrap();
        client.connect(server_addr).await.unwrap();

        let buffer = Arc::new(Mutex::new(AdaptiveBuffer::new()));
        let running = Arc::new(AtomicBool::new(true));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run_receive_loop(
            client.clone(),
            buffer.clone(),
            running.clone(),
            bytes_received.clone(),
        ));

        let mut packet = vec![0u8; HEADER_SIZE + 4];
        crate::wire::PacketHeader { sequence_number: 7, timestamp_ms: 0 }.encode_into(&mut packet);
        server.send_to(&packet, client.local_addr().unwrap()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(buffer.lock().len(), 1);
        assert!(bytes_received.load(Ordering::Relaxed) > 0);

        running.store(false, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
    }
}
