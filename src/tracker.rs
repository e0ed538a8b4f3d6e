//! Damage tracker
//!
//! The explicitly constructed subsystem instance: one ring, one overflow
//! counter, one notifier, one reader gate, one normalizer. Producer-side
//! and consumer-side entry points both hang off a shared handle to this
//! instance; nothing lives in module-level state. Storage is allocated at
//! construction and released when the last handle drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use crate::error::DamageError;
use crate::normalize::Normalizer;
use crate::notify::ReadinessNotifier;
use crate::raw::{self, RequestMemory};
use crate::ring::{DamageRing, OverflowCounter};
use crate::session::{DamageReader, ReaderGate};

/// Default ring capacity, sized to the display controller's maximum number
/// of in-flight updates.
pub const DEFAULT_RING_CAPACITY: usize = 64;

pub struct DamageTracker {
    pub(crate) ring: DamageRing,
    pub(crate) overflows: OverflowCounter,
    pub(crate) notifier: ReadinessNotifier,
    pub(crate) gate: ReaderGate,
    producer_claimed: AtomicBool,
    normalizer: Normalizer,
}

impl DamageTracker {
    /// Tracker with the default ring capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    /// Tracker with an explicit ring capacity (must be a power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: DamageRing::with_capacity(capacity),
            overflows: OverflowCounter::new(),
            notifier: ReadinessNotifier::new(),
            gate: ReaderGate::new(),
            producer_claimed: AtomicBool::new(false),
            normalizer: Normalizer::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Claim the producer handle.
    ///
    /// There is exactly one logical producer; requiring `&mut
    /// DamageProducer` for capture makes the serialized-producer assumption
    /// part of the API instead of a comment. A second claim while one
    /// handle is live fails with [`DamageError::ProducerBusy`].
    pub fn producer(self: &Arc<Self>) -> Result<DamageProducer, DamageError> {
        if self.producer_claimed.swap(true, Ordering::AcqRel) {
            return Err(DamageError::ProducerBusy);
        }
        Ok(DamageProducer {
            tracker: Arc::clone(self),
        })
    }

    /// Open the reader session. Fails with [`DamageError::Busy`] while
    /// another session is open.
    pub fn open(self: &Arc<Self>) -> Result<DamageReader, DamageError> {
        if !self.gate.try_acquire() {
            return Err(DamageError::Busy);
        }
        Ok(DamageReader::new(Arc::clone(self)))
    }

    /// Most recently observed display rotation (platform variant updates),
    /// independent of ring contents.
    pub fn last_rotation(&self) -> u32 {
        self.normalizer.last_rotation()
    }
}

impl Default for DamageTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The unique producer-side handle.
///
/// `capture` is meant to be called from the interception point wrapped
/// around the display driver's update path: it never blocks, never
/// allocates, and never reports failure to its caller.
pub struct DamageProducer {
    tracker: Arc<DamageTracker>,
}

impl DamageProducer {
    /// Record one intercepted request.
    ///
    /// Requests that are not update requests are ignored entirely. For
    /// update requests the record is normalized and enqueued; on a full
    /// ring the event is dropped and counted instead. Waiting readers are
    /// woken either way, after the publish.
    pub fn capture(&mut self, request: u32, arg: u64, mem: &dyn RequestMemory) {
        if !raw::is_update_request(request) {
            return;
        }
        let timestamp = monotonic_ns();
        let update = self.tracker.normalizer.normalize(request, arg, mem, timestamp);
        if self.tracker.ring.try_enqueue(update) {
            trace!(format = update.format.label(), "damage update queued");
        } else {
            self.tracker.overflows.record_drop();
            debug!("damage ring full, update dropped");
        }
        self.tracker.notifier.notify();
    }
}

impl Drop for DamageProducer {
    fn drop(&mut self) {
        self.tracker.producer_claimed.store(false, Ordering::Release);
    }
}

/// CLOCK_MONOTONIC in nanoseconds.
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: the timespec pointer is valid; CLOCK_MONOTONIC is always
    // available on the kernels this crate targets.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{LocalMemory, RawRect, RawUpdateV2};
    use crate::record::{DamageFormat, DAMAGE_UPDATE_SIZE};
    use std::time::Duration;

    const ARG: u64 = 0x4000;

    fn tracker() -> Arc<DamageTracker> {
        Arc::new(DamageTracker::with_capacity(8))
    }

    fn stage_v2(mem: &mut LocalMemory, marker: u32) {
        mem.stage(
            ARG,
            &RawUpdateV2 {
                update_region: RawRect {
                    top: 0,
                    left: 0,
                    width: 100,
                    height: 100,
                },
                waveform_mode: 2,
                update_mode: 0,
                update_marker: marker,
                ..Default::default()
            },
        );
    }

    #[test]
    fn test_capture_and_read() {
        let tracker = tracker();
        let mut producer = tracker.producer().unwrap();
        let mut reader = tracker.open().unwrap();
        let mut mem = LocalMemory::new();

        stage_v2(&mut mem, 7);
        producer.capture(raw::REQ_SEND_UPDATE_V2, ARG, &mem);

        let update = reader.try_read().unwrap();
        assert_eq!(update.format, DamageFormat::V2);
        assert_eq!(update.data.update_marker, 7);
        assert_eq!(update.queue_size, 1);
        assert_eq!(update.overflow_notify, 0);
        assert!(update.timestamp > 0);
    }

    #[test]
    fn test_non_update_requests_are_ignored() {
        let tracker = tracker();
        let mut producer = tracker.producer().unwrap();
        let mut reader = tracker.open().unwrap();
        let mem = LocalMemory::new();

        producer.capture(0x1234, ARG, &mem);
        assert!(!reader.poll_ready());
        assert_eq!(reader.try_read(), Err(DamageError::WouldBlock));
    }

    #[test]
    fn test_overflow_accounting_rides_next_read() {
        let tracker = tracker();
        let mut producer = tracker.producer().unwrap();
        let mut reader = tracker.open().unwrap();
        let mut mem = LocalMemory::new();

        for marker in 0..8 {
            stage_v2(&mut mem, marker);
            producer.capture(raw::REQ_SEND_UPDATE_V2, ARG, &mem);
        }
        // Ring full: the next three captures are dropped and counted.
        for marker in 8..11 {
            stage_v2(&mut mem, marker);
            producer.capture(raw::REQ_SEND_UPDATE_V2, ARG, &mem);
        }

        let first = reader.try_read().unwrap();
        assert_eq!(first.overflow_notify, 3);
        assert_eq!(first.queue_size, 8);
        assert_eq!(first.data.update_marker, 0);

        let second = reader.try_read().unwrap();
        assert_eq!(second.overflow_notify, 0);
        assert_eq!(second.queue_size, 7);
    }

    #[test]
    fn test_empty_nonblocking_read_mutates_nothing() {
        let tracker = tracker();
        let mut producer = tracker.producer().unwrap();
        let mut reader = tracker.open().unwrap();
        let mut mem = LocalMemory::new();

        assert_eq!(reader.try_read(), Err(DamageError::WouldBlock));

        // A drop recorded earlier must still be intact afterwards.
        for marker in 0..9 {
            stage_v2(&mut mem, marker);
            producer.capture(raw::REQ_SEND_UPDATE_V2, ARG, &mem);
        }
        let update = reader.try_read().unwrap();
        assert_eq!(update.overflow_notify, 1);
    }

    #[test]
    fn test_reader_exclusivity() {
        let tracker = tracker();
        let reader = tracker.open().unwrap();
        assert_eq!(tracker.open().err(), Some(DamageError::Busy));
        drop(reader);
        assert!(tracker.open().is_ok());
    }

    #[test]
    fn test_producer_handle_uniqueness() {
        let tracker = tracker();
        let producer = tracker.producer().unwrap();
        assert_eq!(tracker.producer().err(), Some(DamageError::ProducerBusy));
        drop(producer);
        assert!(tracker.producer().is_ok());
    }

    #[test]
    fn test_poll_ready_level_triggered() {
        let tracker = tracker();
        let mut producer = tracker.producer().unwrap();
        let mut reader = tracker.open().unwrap();
        let mut mem = LocalMemory::new();

        assert!(!reader.poll_ready());
        stage_v2(&mut mem, 1);
        producer.capture(raw::REQ_SEND_UPDATE_V2, ARG, &mem);
        assert!(reader.poll_ready());
        assert!(reader.poll_ready()); // polling never consumes
        stage_v2(&mut mem, 2);
        producer.capture(raw::REQ_SEND_UPDATE_V2, ARG, &mem);
        reader.try_read().unwrap();
        assert!(reader.poll_ready());
        reader.try_read().unwrap();
        assert!(!reader.poll_ready());
    }

    #[test]
    fn test_read_into_short_buffer() {
        let tracker = tracker();
        let mut reader = tracker.open().unwrap();
        let mut short = [0u8; 16];
        assert_eq!(
            reader.read_into(&mut short, false),
            Err(DamageError::BufferTooSmall {
                len: 16,
                need: DAMAGE_UPDATE_SIZE
            })
        );
    }

    #[test]
    fn test_read_into_exactly_one_record() {
        let tracker = tracker();
        let mut producer = tracker.producer().unwrap();
        let mut reader = tracker.open().unwrap();
        let mut mem = LocalMemory::new();

        stage_v2(&mut mem, 55);
        producer.capture(raw::REQ_SEND_UPDATE_V2, ARG, &mem);

        let mut buf = [0u8; 256];
        assert_eq!(reader.read_into(&mut buf, false), Ok(DAMAGE_UPDATE_SIZE));
        assert_eq!(reader.read_into(&mut buf, false), Err(DamageError::WouldBlock));
    }

    #[test]
    fn test_blocking_read_woken_by_producer() {
        let tracker = tracker();
        let mut producer = tracker.producer().unwrap();
        let mut reader = tracker.open().unwrap();

        let waiter = std::thread::spawn(move || reader.read(true));

        std::thread::sleep(Duration::from_millis(50));
        let mut mem = LocalMemory::new();
        stage_v2(&mut mem, 33);
        producer.capture(raw::REQ_SEND_UPDATE_V2, ARG, &mem);

        let update = waiter.join().unwrap().unwrap();
        assert_eq!(update.data.update_marker, 33);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
