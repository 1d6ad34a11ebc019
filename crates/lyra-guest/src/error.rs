//! Error taxonomy.
//!
//! Four kinds, handled differently:
//! - capacity conditions (encoder/table full) are resolved internally by
//!   flush-and-retry and never reach the caller; only the non-retryable
//!   misuse cases ([`SubmitError::PacketTooLarge`],
//!   [`SubmitError::TooManyResources`]) surface,
//! - protocol errors (malformed shared structures) are fatal for that
//!   structure's use,
//! - transport errors are surfaced as-is and are never converted into a
//!   fabricated completion,
//! - timeouts are not errors at all: a bounded wait that expires reports
//!   [`crate::fence::FenceWaitResult::NotReady`].

use thiserror::Error;

use lyra_protocol::ring::WireError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("doorbell write failed")]
    Doorbell,
    #[error("submit callback failed (status {status})")]
    Callback { status: i32 },
    #[error("fence query failed")]
    Query,
    #[error("device made no progress within {waited_ms} ms")]
    DeviceBusy { waited_ms: u64 },
    #[error("no submit path accepted the submission")]
    NoSubmitPath,
    #[error("operation not supported by this transport")]
    Unsupported,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The packet can never fit, even in an empty stream buffer. This is a
    /// sizing bug in the caller or the configuration, not a transient
    /// capacity condition.
    #[error("command packet of {packet_bytes} bytes cannot fit the {capacity_bytes}-byte stream buffer")]
    PacketTooLarge {
        packet_bytes: usize,
        capacity_bytes: usize,
    },
    /// One logical operation references more distinct allocations than an
    /// empty table can hold; no amount of flushing makes it fit.
    #[error("operation references {distinct} distinct allocations but the table holds {capacity}")]
    TooManyResources { distinct: u32, capacity: u32 },
    #[error("allocation id 0 is reserved")]
    ReservedAllocId,
    #[error("allocation has zero size")]
    ZeroSizeAllocation,
    #[error("ring counters are corrupt (head {head}, tail {tail})")]
    RingCorrupt { head: u32, tail: u32 },
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Protocol(#[from] WireError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
