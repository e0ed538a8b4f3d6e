//! Lock-free SPSC ring for damage records
//!
//! Fixed-capacity circular store shared between the never-blocking producer
//! context and the single draining reader. Head and tail are free-running
//! indices; the power-of-two mask applies at slot access only, so all
//! `capacity` slots are usable and empty (`head == tail`) can never be
//! confused with full (`head - tail == capacity`).
//!
//! # Memory ordering
//! The producer writes the slot at `head`, then publishes `head` with
//! release ordering; a consumer that acquire-loads `head` therefore sees
//! fully written contents for every index below it. Symmetrically the
//! consumer publishes `tail` with release ordering after copying a slot
//! out, so the producer never reuses a slot still being read. Each index
//! has exactly one writer; no compare-and-swap loop is needed anywhere.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::record::DamageUpdate;

/// SPSC ring of preallocated `DamageUpdate` slots.
///
/// Callers must uphold the SPSC discipline: at most one thread enqueues and
/// at most one thread dequeues at any time. The crate enforces this through
/// the unique producer handle and the reader gate.
pub(crate) struct DamageRing {
    slots: Box<[UnsafeCell<DamageUpdate>]>,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
}

// SAFETY: slot contents are only written by the producer side before the
// release-store of `head` and only read by the consumer side after the
// matching acquire-load, so no slot is ever accessed concurrently from both
// sides. The indices themselves are atomics.
unsafe impl Sync for DamageRing {}
unsafe impl Send for DamageRing {}

impl DamageRing {
    /// Allocate the slot storage once. `capacity` must be a power of two.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two, got {capacity}"
        );
        let slots: Vec<UnsafeCell<DamageUpdate>> = (0..capacity)
            .map(|_| UnsafeCell::new(DamageUpdate::default()))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Producer side. Writes the record into the head slot and publishes
    /// it, or reports a full ring. Never blocks, never allocates.
    pub(crate) fn try_enqueue(&self, update: DamageUpdate) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head - tail >= self.slots.len() as u64 {
            return false;
        }
        let slot = &self.slots[(head & self.mask) as usize];
        // SAFETY: `head` has not been published yet, so the consumer cannot
        // read this slot; the producer handle is unique, so nobody else
        // writes it.
        unsafe { *slot.get() = update };
        self.head.store(head + 1, Ordering::Release);
        true
    }

    /// Consumer side. Copies out the tail slot with its occupancy stamped
    /// into `queue_size`, then releases the slot.
    pub(crate) fn dequeue_ready(&self) -> Option<DamageUpdate> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if head == tail {
            return None;
        }
        let slot = &self.slots[(tail & self.mask) as usize];
        // SAFETY: occupancy >= 1, so this slot was published by the
        // acquire-observed `head` store; the producer will not touch it
        // again until `tail` moves past it below.
        let mut update = unsafe { *slot.get() };
        update.queue_size = (head - tail) as u32;
        self.tail.store(tail + 1, Ordering::Release);
        Some(update)
    }

    /// Read-only occupancy check for poll-style readiness.
    pub(crate) fn peek_nonempty(&self) -> bool {
        self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Relaxed)
    }
}

/// Count of events dropped on a full ring since the last successful read.
///
/// The producer only ever increments; the consumer drains the accumulated
/// total onto the next delivered record with a single exchange.
pub(crate) struct OverflowCounter(AtomicU32);

impl OverflowCounter {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn record_drop(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take_and_reset(&self) -> u32 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DamageFormat;

    fn update_with_marker(marker: u32) -> DamageUpdate {
        let mut update = DamageUpdate::default();
        update.format = DamageFormat::V2;
        update.data.update_marker = marker;
        update
    }

    #[test]
    fn test_empty_ring() {
        let ring = DamageRing::with_capacity(8);
        assert!(!ring.peek_nonempty());
        assert!(ring.dequeue_ready().is_none());
    }

    #[test]
    fn test_fifo_order_and_content() {
        let ring = DamageRing::with_capacity(8);
        for marker in 0..5 {
            assert!(ring.try_enqueue(update_with_marker(marker)));
        }
        for marker in 0..5 {
            let update = ring.dequeue_ready().unwrap();
            assert_eq!(update.data.update_marker, marker);
            assert_eq!(update.format, DamageFormat::V2);
        }
        assert!(ring.dequeue_ready().is_none());
    }

    #[test]
    fn test_capacity_bound_uses_every_slot() {
        let ring = DamageRing::with_capacity(8);
        for marker in 0..8 {
            assert!(ring.try_enqueue(update_with_marker(marker)));
        }
        // Ring full: further enqueues fail without disturbing contents.
        assert!(!ring.try_enqueue(update_with_marker(99)));
        assert!(!ring.try_enqueue(update_with_marker(100)));

        assert_eq!(ring.dequeue_ready().unwrap().data.update_marker, 0);
        assert!(ring.try_enqueue(update_with_marker(8)));
        assert!(!ring.try_enqueue(update_with_marker(101)));
    }

    #[test]
    fn test_queue_size_counts_returned_record() {
        let ring = DamageRing::with_capacity(8);
        for marker in 0..5 {
            ring.try_enqueue(update_with_marker(marker));
        }
        assert_eq!(ring.dequeue_ready().unwrap().queue_size, 5);
        assert_eq!(ring.dequeue_ready().unwrap().queue_size, 4);
        ring.try_enqueue(update_with_marker(5));
        assert_eq!(ring.dequeue_ready().unwrap().queue_size, 4);
    }

    #[test]
    fn test_wraparound() {
        let ring = DamageRing::with_capacity(4);
        for round in 0..5 {
            let base = round * 10;
            for marker in base..base + 3 {
                assert!(ring.try_enqueue(update_with_marker(marker)));
            }
            for marker in base..base + 3 {
                assert_eq!(ring.dequeue_ready().unwrap().data.update_marker, marker);
            }
        }
    }

    #[test]
    fn test_peek_tracks_occupancy() {
        let ring = DamageRing::with_capacity(4);
        assert!(!ring.peek_nonempty());
        ring.try_enqueue(update_with_marker(1));
        assert!(ring.peek_nonempty());
        ring.try_enqueue(update_with_marker(2));
        ring.dequeue_ready();
        assert!(ring.peek_nonempty());
        ring.dequeue_ready();
        assert!(!ring.peek_nonempty());
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two() {
        let _ = DamageRing::with_capacity(48);
    }

    #[test]
    fn test_overflow_counter_accumulates_and_resets() {
        let counter = OverflowCounter::new();
        assert_eq!(counter.take_and_reset(), 0);
        counter.record_drop();
        counter.record_drop();
        counter.record_drop();
        assert_eq!(counter.take_and_reset(), 3);
        assert_eq!(counter.take_and_reset(), 0);
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        use std::sync::Arc;

        let ring = Arc::new(DamageRing::with_capacity(64));
        let producer_ring = Arc::clone(&ring);
        let producer = std::thread::spawn(move || {
            let mut sent = 0u32;
            while sent < 10_000 {
                if producer_ring.try_enqueue(update_with_marker(sent)) {
                    sent += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0u32;
        while expected < 10_000 {
            if let Some(update) = ring.dequeue_ready() {
                assert_eq!(update.data.update_marker, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }
}
