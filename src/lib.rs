//! fbdamage
//!
//! Userspace transport for framebuffer damage events: a driver-hook
//! interception point feeds display update requests into a fixed-capacity,
//! lock-free SPSC ring, and a single reader session drains them in order.
//!
//! The producer side never blocks, never allocates per event, and never
//! fails under buffer pressure: a full ring drops the event and counts it,
//! and the accumulated drop count rides on the next record the reader
//! receives, together with the ring occupancy at that moment. Payloads
//! arrive in several historical request shapes; all of them normalize into
//! one canonical [`DamageUpdate`] record with documented zero defaults for
//! fields a shape does not carry.
//!
//! ```
//! use fbdamage::{DamageTracker, raw};
//! use std::sync::Arc;
//!
//! let tracker = Arc::new(DamageTracker::new());
//! let mut producer = tracker.producer().unwrap();
//! let mut reader = tracker.open().unwrap();
//!
//! let mut mem = raw::LocalMemory::new();
//! mem.stage(0x1000, &raw::RawUpdateV2::default());
//! producer.capture(raw::REQ_SEND_UPDATE_V2, 0x1000, &mem);
//!
//! let update = reader.try_read().unwrap();
//! assert_eq!(update.queue_size, 1);
//! ```

mod error;
mod normalize;
mod notify;
pub mod raw;
pub mod record;
mod ring;
mod session;
mod tracker;

pub use error::DamageError;
pub use record::{
    AltBufferData, DAMAGE_UPDATE_SIZE, DamageFormat, DamageUpdate, Rect, UpdateFlags, UpdateMode,
    UpdatePayload,
};
pub use session::DamageReader;
pub use tracker::{DEFAULT_RING_CAPACITY, DamageProducer, DamageTracker};
