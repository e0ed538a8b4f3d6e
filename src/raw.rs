//! Raw producer-side request shapes
//!
//! The interception point hands this crate a request code plus the address
//! of a variant-shaped payload in the requester's memory. The shapes below
//! mirror the historical update-request layouts; each is `#[repr(C)]` and
//! `Pod` (explicit reserved fields where the C layouts had tail padding) so
//! copy-in is plain byte filling.
//!
//! Reading the requester's memory goes through [`RequestMemory`], the
//! userspace seam for what a driver hook would do with `copy_from_user`.
//! Faults are a normal, recoverable condition: the normalizer turns them
//! into `Error`-tagged records, never into producer-visible failures.

use std::collections::BTreeMap;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// `_IOW`-style request-code encoding: direction, payload size, type, number.
const fn iow(ty: u32, nr: u32, size: usize) -> u32 {
    (1 << 30) | ((size as u32) << 16) | (ty << 8) | nr
}

/// V1 update carrying a virtual alt-buffer address.
pub const REQ_SEND_UPDATE_V1_NTX: u32 = iow(0x46, 0x2E, std::mem::size_of::<RawUpdateV1Ntx>());
/// V1 update without the virtual alt-buffer address.
pub const REQ_SEND_UPDATE_V1: u32 = iow(0x46, 0x2E, std::mem::size_of::<RawUpdateV1>());
/// V2 update.
pub const REQ_SEND_UPDATE_V2: u32 = iow(0x46, 0x2E, std::mem::size_of::<RawUpdateV2>());
/// Platform display-controller update (argument-block calling convention).
pub const REQ_EINK_UPDATE2: u32 = 0x0406;

/// Whether a request code is one of the recognized update requests.
///
/// Only these reach the ring; every other intercepted request is passed
/// through untouched.
pub fn is_update_request(request: u32) -> bool {
    matches!(
        request,
        REQ_SEND_UPDATE_V1_NTX | REQ_SEND_UPDATE_V1 | REQ_SEND_UPDATE_V2 | REQ_EINK_UPDATE2
    )
}

/// Rectangle as it appears in the raw request layouts.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawRect {
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

/// Alt-buffer descriptor with a virtual address (V1_NTX only).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawAltBufferNtx {
    pub virt_addr: u64,
    pub phys_addr: u32,
    pub width: u32,
    pub height: u32,
    pub alt_update_region: RawRect,
    pub _reserved: u32,
}

/// Alt-buffer descriptor without the virtual address (V1/V2).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawAltBuffer {
    pub phys_addr: u32,
    pub width: u32,
    pub height: u32,
    pub alt_update_region: RawRect,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawUpdateV1Ntx {
    pub update_region: RawRect,
    pub waveform_mode: u32,
    pub update_mode: u32,
    pub update_marker: u32,
    pub temp: i32,
    pub flags: u32,
    pub _reserved: u32,
    pub alt_buffer_data: RawAltBufferNtx,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawUpdateV1 {
    pub update_region: RawRect,
    pub waveform_mode: u32,
    pub update_mode: u32,
    pub update_marker: u32,
    pub temp: i32,
    pub flags: u32,
    pub alt_buffer_data: RawAltBuffer,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawUpdateV2 {
    pub update_region: RawRect,
    pub waveform_mode: u32,
    pub update_mode: u32,
    pub update_marker: u32,
    pub temp: i32,
    pub flags: u32,
    pub dither_mode: i32,
    pub quant_bit: i32,
    pub alt_buffer_data: RawAltBuffer,
}

/// Update descriptor for the platform display-controller variant.
///
/// Reached indirectly: the request argument points at a block of four u64
/// slots, slot 0 holds the address of this descriptor and slot 1 the
/// address of the current rotation scalar.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct RawDisp2Update {
    pub area: RawRect,
    pub layer_num: u32,
    pub update_mode: u32,
    pub waveform_mode: u32,
    pub update_marker: u32,
    pub temp: i32,
    pub flags: u32,
    pub pen_mode: u32,
}

/// Number of u64 slots in the platform variant's argument block.
pub const DISP2_ARG_SLOTS: usize = 4;

// The request codes rely on the layouts staying distinct.
const _: () = assert!(std::mem::size_of::<RawUpdateV1Ntx>() == 80);
const _: () = assert!(std::mem::size_of::<RawUpdateV1>() == 64);
const _: () = assert!(std::mem::size_of::<RawUpdateV2>() == 72);
const _: () = assert!(std::mem::size_of::<RawDisp2Update>() == 44);

/// The requester's memory was not accessible.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("request memory not accessible")]
pub struct CopyFault;

/// Access to the requester's memory.
///
/// A real interception hook implements this over the address space the
/// request came from; [`LocalMemory`] serves in-process producers.
pub trait RequestMemory {
    /// Copy `out.len()` bytes starting at `addr`.
    fn copy_in(&self, addr: u64, out: &mut [u8]) -> Result<(), CopyFault>;
}

/// Copy one raw shape out of the requester's memory.
pub fn read_struct<T: Pod>(mem: &dyn RequestMemory, addr: u64) -> Result<T, CopyFault> {
    let mut value = T::zeroed();
    mem.copy_in(addr, bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

#[derive(Debug)]
struct Region {
    bytes: Vec<u8>,
    poisoned: bool,
}

/// Request payloads staged in local memory, addressed by caller-chosen
/// base addresses. Regions can be poisoned to exercise the fault path.
#[derive(Debug, Default)]
pub struct LocalMemory {
    regions: BTreeMap<u64, Region>,
}

impl LocalMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a raw shape at `addr`, replacing any previous region there.
    pub fn stage<T: bytemuck::NoUninit>(&mut self, addr: u64, value: &T) {
        self.stage_bytes(addr, bytemuck::bytes_of(value));
    }

    /// Stage raw bytes at `addr`.
    pub fn stage_bytes(&mut self, addr: u64, bytes: &[u8]) {
        self.regions.insert(
            addr,
            Region {
                bytes: bytes.to_vec(),
                poisoned: false,
            },
        );
    }

    /// Mark the region at `addr` as faulting on any access.
    pub fn poison(&mut self, addr: u64) {
        if let Some(region) = self.regions.get_mut(&addr) {
            region.poisoned = true;
        } else {
            self.regions.insert(
                addr,
                Region {
                    bytes: Vec::new(),
                    poisoned: true,
                },
            );
        }
    }
}

impl RequestMemory for LocalMemory {
    fn copy_in(&self, addr: u64, out: &mut [u8]) -> Result<(), CopyFault> {
        let (base, region) = self.regions.range(..=addr).next_back().ok_or(CopyFault)?;
        if region.poisoned {
            return Err(CopyFault);
        }
        let offset = (addr - base) as usize;
        let end = offset.checked_add(out.len()).ok_or(CopyFault)?;
        if end > region.bytes.len() {
            return Err(CopyFault);
        }
        out.copy_from_slice(&region.bytes[offset..end]);
        Ok(())
    }
}
