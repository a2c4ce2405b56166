//! Packetizer & Fan-Out Sender (C3).
//!
//! `SendQueue` is a bounded, head-drop FIFO behind `parking_lot::Mutex`,
//! grounded in the teacher's `buffers.rs` use of `parking_lot::Mutex` to
//! guard its audio buffer pool. `Packetizer` carries the teacher's
//! `server.rs::audio_multicast_loop` pattern of anchoring `timestamp_ms` to
//! an `Instant` captured at stream start rather than wall-clock time.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::session::SessionRegistry;
use crate::wire::{AudioFormat, PacketHeader, HEADER_SIZE, MAX_SEND_QUEUE};

const IDLE_SLEEP: Duration = Duration::from_micros(500);

/// Bounded FIFO of encoded packets awaiting transmission.
///
/// Overflow drops the oldest entry (head) rather than rejecting the new one,
/// favoring freshness over completeness for a live audio stream.
pub struct SendQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(MAX_SEND_QUEUE)) }
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `packet`. Returns `true` if an older packet was dropped to
    /// make room.
    pub fn push(&self, packet: Vec<u8>) -> bool {
        let mut q = self.inner.lock();
        let dropped = if q.len() >= MAX_SEND_QUEUE {
            q.pop_front();
            true
        } else {
            false
        };
        q.push_back(packet);
        dropped
    }

    /// Dequeues up to `max` packets in FIFO order.
    pub fn pop_batch(&self, max: usize) -> Vec<Vec<u8>> {
        let mut q = self.inner.lock();
        let n = max.min(q.len());
        q.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits raw PCM byte spans into header-prefixed datagrams no larger than
/// the MTU budget, assigning a wrapping sequence number to each.
pub struct Packetizer {
    sequence: std::num::Wrapping<u32>,
    start: Instant,
    format: AudioFormat,
    frame_size: usize,
    payload_budget: usize,
}

impl Packetizer {
    pub fn new(format: AudioFormat) -> Self {
        let frame_size = format.sample_size_bytes() * format.channels as usize;
        let payload_budget = format.samples_per_packet() * format.sample_size_bytes();
        Self {
            sequence: std::num::Wrapping(0),
            start: Instant::now(),
            format,
            frame_size: frame_size.max(1),
            payload_budget: payload_budget.max(frame_size),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Packetizes `pcm` into one or more header-prefixed datagrams, each
    /// holding at most `payload_budget` bytes of `pcm`, aligned to whole
    /// sample frames.
    pub fn packetize(&mut self, pcm: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let chunk_bytes = (self.payload_budget / self.frame_size).max(1) * self.frame_size;

        for chunk in pcm.chunks(chunk_bytes) {
            let header = PacketHeader {
                sequence_number: self.sequence.0,
                timestamp_ms: self.start.elapsed().as_millis() as u64,
            };
            self.sequence += std::num::Wrapping(1);

            let mut packet = vec![0u8; HEADER_SIZE + chunk.len()];
            header.encode_into(&mut packet);
            packet[HEADER_SIZE..].copy_from_slice(chunk);
            out.push(packet);
        }
        out
    }
}

/// Pulls packets from the queue and fans each one out to every live session
/// endpoint over a shared UDP socket.
pub async fn run_fan_out(
    queue: Arc<SendQueue>,
    registry: SessionRegistry,
    socket: Arc<UdpSocket>,
    running: Arc<std::sync::atomic::AtomicBool>,
    total_bytes_sent: Arc<AtomicU64>,
) {
    const BATCH: usize = crate::wire::BATCH;

    while running.load(Ordering::Relaxed) {
        let endpoints = registry.live_endpoints().await;
        if endpoints.is_empty() || queue.is_empty() {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }

        let batch = queue.pop_batch(BATCH);
        for packet in &batch {
            send_to_all(&socket, packet, &endpoints, &total_bytes_sent).await;
        }
    }
}

async fn send_to_all(
    socket: &UdpSocket,
    packet: &[u8],
    endpoints: &[SocketAddr],
    total_bytes_sent: &AtomicU64,
) {
    for ep in endpoints {
        match socket.send_to(packet, ep).await {
            Ok(n) => {
                total_bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::warn!(%err, endpoint = %ep, "udp send failed, dropping for this endpoint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Encoding;

    const F32: AudioFormat = AudioFormat { encoding: Encoding::PcmF32Le, channels: 2, sample_rate: 48_000, bit_depth: 32 };

    #[test]
    fn send_queue_drops_oldest_on_overflow() {
        let q = SendQueue::new();
        for i in 0..MAX_SEND_QUEUE {
            assert!(!q.push(vec![i as u8]));
        }
        assert!(q.push(vec![0xFF]));
        assert_eq!(q.len(), MAX_SEND_QUEUE);

        let batch = q.pop_batch(1);
        assert_eq!(batch[0], vec![1u8]);
    }

    #[test]
    fn pop_batch_respects_fifo_order_and_cap() {
        let q = SendQueue::new();
        q.push(vec![1]);
        q.push(vec![2]);
        q.push(vec![3]);
        let batch = q.pop_batch(2);
        assert_eq!(batch, vec![vec![1], vec![2]]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn p7_packetizer_conserves_payload_bytes() {
        let mut p = Packetizer::new(F32);
        let pcm: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let packets = p.packetize(&pcm);

        let total_payload: usize = packets.iter().map(|pkt| pkt.len() - HEADER_SIZE).sum();
        assert_eq!(total_payload, pcm.len());

        let mut reassembled = Vec::with_capacity(pcm.len());
        for pkt in &packets {
            reassembled.extend_from_slice(&pkt[HEADER_SIZE..]);
        }
        assert_eq!(reassembled, pcm);
    }

    #[test]
    fn packetizer_assigns_increasing_wrapping_sequence_numbers() {
        let mut p = Packetizer::new(F32);
        let pcm = vec![0u8; 64];
        let first = p.packetize(&pcm);
        let second = p.packetize(&pcm);
        let seq = |pkt: &[u8]| PacketHeader::decode(pkt).unwrap().sequence_number;
        assert_eq!(seq(&first[0]) + 1, seq(&second[0]));
    }

    #[test]
    fn packetizer_never_exceeds_mtu_payload_budget() {
        let mut p = Packetizer::new(F32);
        let pcm = vec![0u8; 100_000];
        for pkt in p.packetize(&pcm) {
            assert!(pkt.len() <= crate::wire::MTU_SIZE);
        }
    }
}
