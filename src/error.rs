//! Typed error enums, one per component family.
//!
//! Library modules return these instead of `anyhow::Error` so callers can
//! match on the specific failure mode (spec.md §7's error taxonomy). `main`
//! and the state manager (`state.rs`) collapse everything into `anyhow`
//! at the boundary via the blanket `From` impls `thiserror` derives.

use thiserror::Error;

/// Framing/decode failures on either the TCP or UDP wire (C1).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("unknown root code: {0}")]
    UnknownRootCode(u8),
    #[error("body decode failed: {0}")]
    BodyDecode(#[from] postcard::Error),
    #[error("frame of {got} bytes exceeds max {max}")]
    FrameTooLarge { got: u32, max: u32 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Requests-endpoint / connection-dispatcher failures (C3, C7).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for header {0:?}")]
    NoHandler(String),
    #[error("reply for msg_id {0} was already resolved")]
    ReplyAlreadyResolved(u64),
    #[error("msg_id required to await a reply but was unset")]
    MissingMsgId,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connector / pool failures (C8).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("per-peer connection cap reached")]
    Busy,
    #[error("peer not found in registry")]
    PeerNotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Persistent messaging-connection failures (C10).
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("message queue is closed")]
    Closed,
    #[error("peer is offline")]
    PeerOffline,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// File/directory/big-file transfer failures (C11, C12).
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer interrupted at offset {seeked}")]
    Incomplete { seeked: u64 },
    #[error("peer rejected the transfer")]
    Rejected,
    #[error("transfer cancelled by user")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// DHT integration failures (C4).
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("dht query timed out")]
    Timeout,
    #[error("no providers found for this key")]
    NoProviders,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
