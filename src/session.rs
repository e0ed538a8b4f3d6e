//! Reader session
//!
//! At most one reader session may be open at a time: the ring's tail has a
//! single owner by protocol, so exclusivity is enforced here with an atomic
//! gate rather than assumed. Closing (dropping) a session always succeeds
//! and releases the gate unconditionally.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::error::DamageError;
use crate::record::{DAMAGE_UPDATE_SIZE, DamageUpdate};
use crate::tracker::DamageTracker;

/// Single-reader exclusivity flag.
pub(crate) struct ReaderGate(AtomicBool);

impl ReaderGate {
    pub(crate) fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// True iff the gate was free and is now held.
    pub(crate) fn try_acquire(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An open reader session. Obtained from [`DamageTracker::open`].
pub struct DamageReader {
    tracker: Arc<DamageTracker>,
}

impl DamageReader {
    pub(crate) fn new(tracker: Arc<DamageTracker>) -> Self {
        info!("damage reader session opened");
        Self { tracker }
    }

    /// Read the next damage record.
    ///
    /// On success the record carries `queue_size` (ring occupancy at
    /// dequeue, including this record) and `overflow_notify` (events
    /// dropped since the previous successful read).
    ///
    /// With `blocking` false an empty ring reports
    /// [`DamageError::WouldBlock`] immediately. With `blocking` true the
    /// call suspends until the producer publishes a record; a signal during
    /// the wait reports [`DamageError::Interrupted`] without consuming
    /// anything.
    pub fn read(&mut self, blocking: bool) -> Result<DamageUpdate, DamageError> {
        loop {
            if let Some(mut update) = self.tracker.ring.dequeue_ready() {
                update.overflow_notify = self.tracker.overflows.take_and_reset();
                return Ok(update);
            }
            if !blocking {
                return Err(DamageError::WouldBlock);
            }
            // Snapshot the epoch, then re-check occupancy: a record
            // published after the snapshot moves the epoch, so the wait
            // below returns immediately instead of missing the wakeup.
            let epoch = self.tracker.notifier.epoch();
            if self.tracker.ring.peek_nonempty() {
                continue;
            }
            self.tracker
                .notifier
                .wait(epoch)
                .map_err(|_| DamageError::Interrupted)?;
        }
    }

    /// Non-blocking [`read`](Self::read).
    pub fn try_read(&mut self) -> Result<DamageUpdate, DamageError> {
        self.read(false)
    }

    /// Byte-stream read: writes exactly one record into `buf`.
    ///
    /// Fails with [`DamageError::BufferTooSmall`] before touching any
    /// state if `buf` cannot hold a full record.
    pub fn read_into(&mut self, buf: &mut [u8], blocking: bool) -> Result<usize, DamageError> {
        if buf.len() < DAMAGE_UPDATE_SIZE {
            return Err(DamageError::BufferTooSmall {
                len: buf.len(),
                need: DAMAGE_UPDATE_SIZE,
            });
        }
        let update = self.read(blocking)?;
        buf[..DAMAGE_UPDATE_SIZE].copy_from_slice(update.as_bytes());
        Ok(DAMAGE_UPDATE_SIZE)
    }

    /// Level-triggered readiness: true whenever the ring is non-empty.
    /// Never consumes a record.
    pub fn poll_ready(&self) -> bool {
        self.tracker.ring.peek_nonempty()
    }
}

impl Drop for DamageReader {
    fn drop(&mut self) {
        self.tracker.gate.release();
        info!("damage reader session closed");
    }
}
