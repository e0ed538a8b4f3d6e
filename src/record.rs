//! Canonical damage record
//!
//! Every producer-side request shape normalizes into one `DamageUpdate`.
//! The layout is `#[repr(C)]` with explicit reserved fields instead of
//! implicit padding, so a record can be handed to byte-oriented consumers
//! bit-exactly: 128 bytes, two cache lines, const-asserted below.
//!
//! Fields a given shape does not supply are zero. Consumers can therefore
//! read every field of every record regardless of `format`.

use bitflags::bitflags;
use bytemuck::NoUninit;

/// Size of one record on the wire.
pub const DAMAGE_UPDATE_SIZE: usize = std::mem::size_of::<DamageUpdate>();

/// Which producer-side shape a record was normalized from.
///
/// `Unknown` doubles as the zero value so a zeroed record reads as a
/// sentinel rather than as a valid shape tag.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, NoUninit)]
pub enum DamageFormat {
    /// Request code passed the update gate but matched no decoder.
    #[default]
    Unknown = 0,
    /// V1 update carrying a virtual alt-buffer address.
    V1Ntx = 1,
    /// V1 update without the virtual alt-buffer address.
    V1 = 2,
    /// V2 update (adds dither mode and quantization bits).
    V2 = 3,
    /// Platform display-controller variant (adds rotation and pen mode).
    Disp2 = 4,
    /// The request was recognized but its payload could not be copied in.
    Error = 5,
}

impl DamageFormat {
    /// Human-readable request label, for report tooling.
    pub fn label(self) -> &'static str {
        match self {
            DamageFormat::Unknown => "UNKNOWN",
            DamageFormat::V1Ntx => "SEND_UPDATE_V1_NTX",
            DamageFormat::V1 => "SEND_UPDATE_V1",
            DamageFormat::V2 => "SEND_UPDATE_V2",
            DamageFormat::Disp2 => "EINK_UPDATE2",
            DamageFormat::Error => "ERROR",
        }
    }
}

/// Refresh scope requested by the client.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, NoUninit)]
pub enum UpdateMode {
    #[default]
    Partial = 0,
    Full = 1,
}

impl UpdateMode {
    /// Raw value 1 is a full refresh; the controller treats every other
    /// value as partial.
    pub fn from_raw(raw: u32) -> Self {
        if raw == 1 { UpdateMode::Full } else { UpdateMode::Partial }
    }
}

bitflags! {
    /// Update flags as passed by the client.
    ///
    /// Unknown bits are retained bit-exactly (`from_bits_retain`), never
    /// truncated, so the record mirrors the request even for flags this
    /// crate predates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateFlags: u32 {
        const ENABLE_INVERSION  = 0x0001;
        const FORCE_MONOCHROME  = 0x0002;
        const USE_CMAP          = 0x0004;
        const USE_ALT_BUFFER    = 0x0100;
        const TEST_COLLISION    = 0x0200;
        const GROUP_UPDATE      = 0x0400;
        const USE_DITHERING_Y1  = 0x2000;
        const USE_DITHERING_Y4  = 0x4000;
        const USE_REGAL         = 0x8000;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// SAFETY: generated by bitflags! over u32; repr(transparent) wrapper with
// no padding and no uninitialized bytes.
unsafe impl NoUninit for UpdateFlags {}

/// Damage rectangle, in framebuffer pixel coordinates.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, NoUninit)]
pub struct Rect {
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

/// Secondary buffer descriptor (V1-family updates only).
///
/// `virt_addr` is supplied only by the V1_NTX shape; all fields are zero for
/// shapes without an alternate buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, NoUninit)]
pub struct AltBufferData {
    pub virt_addr: u64,
    pub phys_addr: u32,
    pub width: u32,
    pub height: u32,
    pub alt_update_region: Rect,
    _reserved: u32,
}

/// Normalized update fields shared by all shapes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, NoUninit)]
pub struct UpdatePayload {
    pub update_region: Rect,
    pub waveform_mode: u32,
    pub update_mode: UpdateMode,
    pub update_marker: u32,
    pub temp: i32,
    pub flags: UpdateFlags,
    /// V2 only.
    pub dither_mode: i32,
    /// V2 only.
    pub quant_bit: i32,
    /// Disp2 only.
    pub rotation: u32,
    /// Disp2 only.
    pub pen_mode: u32,
    _reserved: u32,
    pub alt_buffer: AltBufferData,
}

/// One decoded damage event.
///
/// `overflow_notify` and `queue_size` are zero while the record sits in the
/// ring; the read path stamps them at dequeue time.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, NoUninit)]
pub struct DamageUpdate {
    /// Events dropped between the previously delivered record and this one.
    pub overflow_notify: u32,
    /// Ring occupancy at dequeue, including this record.
    pub queue_size: u32,
    /// Which shape this record was normalized from.
    pub format: DamageFormat,
    _reserved: u32,
    /// CLOCK_MONOTONIC nanoseconds at the moment the producer observed the
    /// request, before normalization. Set even when decoding failed.
    pub timestamp: u64,
    pub data: UpdatePayload,
    _reserved2: [u32; 2],
}

impl DamageUpdate {
    /// Byte view of the record, for the fixed-size record stream.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

// Wire contract: 128 bytes, timestamp at offset 16, payload at offset 24.
const _: () = assert!(std::mem::size_of::<DamageUpdate>() == 128);
const _: () = assert!(std::mem::offset_of!(DamageUpdate, timestamp) == 16);
const _: () = assert!(std::mem::offset_of!(DamageUpdate, data) == 24);
const _: () = assert!(std::mem::size_of::<UpdatePayload>() == 96);
const _: () = assert!(std::mem::size_of::<AltBufferData>() == 40);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_record_is_all_zero() {
        let update = DamageUpdate::default();
        assert_eq!(update.format, DamageFormat::Unknown);
        assert_eq!(update.overflow_notify, 0);
        assert_eq!(update.queue_size, 0);
        assert_eq!(update.timestamp, 0);
        assert_eq!(update.data.update_mode, UpdateMode::Partial);
        assert_eq!(update.data.flags, UpdateFlags::empty());
        assert_eq!(update.data.alt_buffer.virt_addr, 0);
        assert!(update.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_record_size_matches_wire_contract() {
        assert_eq!(DAMAGE_UPDATE_SIZE, 128);
        let update = DamageUpdate::default();
        assert_eq!(update.as_bytes().len(), DAMAGE_UPDATE_SIZE);
    }

    #[test]
    fn test_update_mode_from_raw() {
        assert_eq!(UpdateMode::from_raw(0), UpdateMode::Partial);
        assert_eq!(UpdateMode::from_raw(1), UpdateMode::Full);
        assert_eq!(UpdateMode::from_raw(7), UpdateMode::Partial);
    }

    #[test]
    fn test_flags_retain_unknown_bits() {
        let flags = UpdateFlags::from_bits_retain(0x8000_0001);
        assert!(flags.contains(UpdateFlags::ENABLE_INVERSION));
        assert_eq!(flags.bits(), 0x8000_0001);
    }
}
