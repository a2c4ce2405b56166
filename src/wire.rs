//! Wire format constants, the audio format descriptor, and the 12-byte
//! big-endian packet header codec.

use std::fmt;

/// Network MTU budget for one audio datagram.
pub const MTU_SIZE: usize = 1400;
/// Size of the fixed packet header (sequence number + timestamp).
pub const HEADER_SIZE: usize = 12;
/// Maximum payload bytes that fit in one datagram after the header.
pub const MAX_AUDIO_PAYLOAD: usize = MTU_SIZE - HEADER_SIZE;
/// Upper bound on entries retained in the adaptive playout buffer.
pub const MAX_MAP_SIZE: usize = 500;
/// Upper bound on packets queued for fan-out before the oldest is dropped.
pub const MAX_SEND_QUEUE: usize = 300;
/// Largest forward gap the playout buffer will wait out before jumping ahead.
pub const MAX_ALLOWED_GAP: u32 = 10;
/// How long a session may go without a keepalive before it is stale.
pub const SESSION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);
/// Scratch buffer size for one UDP `recv`.
pub const RECV_BUFFER_SIZE: usize = 1500;
/// Packets drained from the send queue per sender tick.
pub const BATCH: usize = 5;

/// Sample encodings understood by the wire protocol.
///
/// Discriminants are part of the wire contract and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Encoding {
    Invalid = 0,
    PcmS16Le = 1,
    PcmS32Le = 2,
    PcmF32Le = 3,
    PcmS24Le = 4,
    PcmU8 = 5,
}

impl Encoding {
    /// Canonical bit depth for this encoding, or `None` for `Invalid`.
    pub const fn canonical_bit_depth(self) -> Option<u8> {
        match self {
            Encoding::Invalid => None,
            Encoding::PcmU8 => Some(8),
            Encoding::PcmS16Le => Some(16),
            Encoding::PcmS24Le => Some(24),
            Encoding::PcmS32Le | Encoding::PcmF32Le => Some(32),
        }
    }

    /// Bytes occupied by a single (mono) sample of this encoding on the wire.
    ///
    /// This is what the adaptive buffer's pull path uses to convert a sample
    /// count into a byte count — parameterized per the negotiated encoding
    /// rather than hardcoded to `sizeof(f32)`.
    pub const fn sample_size_bytes(self) -> usize {
        match self {
            Encoding::Invalid => 0,
            Encoding::PcmU8 => 1,
            Encoding::PcmS16Le => 2,
            Encoding::PcmS24Le => 3,
            Encoding::PcmS32Le | Encoding::PcmF32Le => 4,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Encoding::Invalid => "invalid",
            Encoding::PcmU8 => "u8",
            Encoding::PcmS16Le => "s16le",
            Encoding::PcmS24Le => "s24le",
            Encoding::PcmS32Le => "s32le",
            Encoding::PcmF32Le => "f32le",
        };
        f.write_str(s)
    }
}

/// Describes the negotiated audio format for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub channels: u8,
    pub sample_rate: u32,
    pub bit_depth: u8,
}

impl AudioFormat {
    /// Builds a format, deriving `bit_depth` from `encoding`.
    pub fn new(encoding: Encoding, channels: u8, sample_rate: u32) -> Option<Self> {
        let bit_depth = encoding.canonical_bit_depth()?;
        let fmt = Self { encoding, channels, sample_rate, bit_depth };
        fmt.is_valid().then_some(fmt)
    }

    /// True when the encoding is known, channels/rate are in range, and the
    /// bit depth matches the encoding's canonical value.
    pub fn is_valid(&self) -> bool {
        if self.encoding == Encoding::Invalid {
            return false;
        }
        if !(1..=8).contains(&self.channels) {
            return false;
        }
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return false;
        }
        self.encoding.canonical_bit_depth() == Some(self.bit_depth)
    }

    /// Per-sample byte width for the negotiated encoding.
    pub fn sample_size_bytes(&self) -> usize {
        self.encoding.sample_size_bytes()
    }

    /// How many per-channel sample frames fit in one datagram's payload
    /// budget, given this format's frame size (`channels * sample_size`).
    pub fn samples_per_packet(&self) -> usize {
        let frame_size = self.sample_size_bytes() * self.channels as usize;
        if frame_size == 0 {
            0
        } else {
            MAX_AUDIO_PAYLOAD / frame_size
        }
    }
}

/// Errors raised while decoding a wire packet header or payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet shorter than the {HEADER_SIZE}-byte header")]
    TooShort,
    #[error("payload length is not a whole multiple of the sample size")]
    PayloadMisaligned,
}

/// The fixed 12-byte big-endian header prefixed to every audio datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence_number: u32,
    pub timestamp_ms: u64,
}

impl PacketHeader {
    /// Writes this header, big-endian, into the first [`HEADER_SIZE`] bytes
    /// of `buf`. Panics if `buf` is too short — callers always size their
    /// output buffer before calling this.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_ms.to_be_bytes());
    }

    /// Decodes a header from the start of `buf`, or `None` if too short.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TooShort);
        }
        let sequence_number = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let timestamp_ms = u64::from_be_bytes(buf[4..12].try_into().unwrap());
        Ok(Self { sequence_number, timestamp_ms })
    }
}

/// Modular sequence comparison: `true` iff `a` is strictly older than `b`.
///
/// Matches `(int32_t)(a - b) < 0` from the reference implementation; valid
/// as long as `a` and `b` are within `i32::MAX` of one another, which holds
/// for any two sequence numbers that both live in a bounded reorder window.
#[inline]
pub fn seq_precedes(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Modular distance from `from` forward to `to` (always non-negative, the
/// number of wrapping increments needed to walk from `from` to `to`).
#[inline]
pub fn seq_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_byte_for_byte() {
        let h = PacketHeader { sequence_number: 0xDEAD_BEEF, timestamp_ms: 0x0102_0304_0506 };
        let mut buf = [0u8; HEADER_SIZE];
        h.encode_into(&mut buf);
        assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(PacketHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn header_decode_rejects_short_buffers() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert_eq!(PacketHeader::decode(&buf), Err(WireError::TooShort));
    }

    #[test]
    fn modular_comparator_handles_wraparound() {
        assert!(seq_precedes(0xFFFF_FFFE, 0xFFFF_FFFF));
        assert!(seq_precedes(0xFFFF_FFFF, 0x0000_0000));
        assert!(!seq_precedes(0x0000_0000, 0xFFFF_FFFF));
        assert!(seq_precedes(1000, 1001));
        assert!(!seq_precedes(1001, 1000));
        assert!(!seq_precedes(42, 42));
    }

    #[test]
    fn audio_format_validity() {
        let ok = AudioFormat::new(Encoding::PcmF32Le, 2, 48_000).unwrap();
        assert!(ok.is_valid());
        assert_eq!(ok.bit_depth, 32);

        assert!(AudioFormat::new(Encoding::Invalid, 2, 48_000).is_none());
        assert!(AudioFormat::new(Encoding::PcmS16Le, 0, 48_000).is_none());
        assert!(AudioFormat::new(Encoding::PcmS16Le, 2, 1).is_none());

        let mut mismatched = ok;
        mismatched.bit_depth = 8;
        assert!(!mismatched.is_valid());
    }

    #[test]
    fn samples_per_packet_matches_payload_budget() {
        let fmt = AudioFormat::new(Encoding::PcmF32Le, 2, 48_000).unwrap();
        // frame size = 4 bytes/sample * 2 channels = 8 bytes/frame
        assert_eq!(fmt.samples_per_packet(), MAX_AUDIO_PAYLOAD / 8);
    }
}
