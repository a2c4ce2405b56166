//! Error kinds from spec §7, expressed as a single `thiserror` enum.
//!
//! Local-recovery kinds (`MalformedPacket`, `BufferOverflow`, `NetworkTransient`)
//! are logged and swallowed at the call site; they exist here mainly so log
//! lines and tests can refer to them by name. `ControlPlaneFatal` and
//! `FormatInvalid` propagate up to the process entry point.

use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum AudiocastError {
    #[error("invalid client address")]
    BadAddress,

    #[error("a live session already uses this endpoint")]
    DuplicateEndpoint,

    #[error("unknown or expired session")]
    UnknownSession,

    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] WireError),

    #[error("send queue overflow, dropped oldest packet")]
    BufferOverflow,

    #[error("transient network error: {0}")]
    NetworkTransient(#[from] std::io::Error),

    #[error("control plane unreachable after exhausting retries")]
    ControlPlaneFatal,

    #[error("requested audio format is invalid: {0:?}")]
    FormatInvalid(crate::wire::AudioFormat),
}

pub type Result<T> = std::result::Result<T, AudiocastError>;
