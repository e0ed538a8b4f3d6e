//! Session-level error taxonomy.
//!
//! Producer-side conditions (ring full, payload copy faults) are never
//! surfaced as errors; they are absorbed into overflow accounting and
//! `Error`-tagged records. Everything here is returned synchronously to the
//! consumer-side caller, which owns any retry policy.

use thiserror::Error;

/// Errors reported by the consumer-facing surface.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DamageError {
    /// Another reader session is already open.
    #[error("another damage reader session is already active")]
    Busy,

    /// The producer handle has already been claimed.
    #[error("the damage producer handle is already claimed")]
    ProducerBusy,

    /// Non-blocking read on an empty ring; try again later.
    #[error("no damage update available")]
    WouldBlock,

    /// A blocking wait was interrupted by a signal; the call may be retried.
    #[error("damage wait interrupted")]
    Interrupted,

    /// The destination buffer cannot hold one full record.
    #[error("destination buffer too small: {len} bytes, need {need}")]
    BufferTooSmall { len: usize, need: usize },
}
