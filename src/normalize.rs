//! Payload normalization
//!
//! Maps the four raw update-request shapes onto the canonical record: a
//! closed tagged decode, one function per shape. Decode anomalies never
//! propagate upward: a copy fault yields an `Error`-tagged record with
//! default payload fields (the event itself, and its timestamp, are still
//! recorded) and an unrecognized code yields `Unknown`.
//!
//! The platform variant (`Disp2`) reaches its payload indirectly: the
//! request argument points at a block of u64 slots, which in turn point at
//! the update descriptor and the current rotation scalar. The rotation is
//! published to shared state as soon as its own copy succeeds, independent
//! of whether the descriptor copy fails afterwards.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::raw::{
    self, RawAltBuffer, RawAltBufferNtx, RawDisp2Update, RawRect, RawUpdateV1, RawUpdateV1Ntx,
    RawUpdateV2, RequestMemory, read_struct,
};
use crate::record::{DamageFormat, DamageUpdate, Rect, UpdateFlags, UpdateMode};

pub(crate) struct Normalizer {
    /// Most recently observed display rotation (platform variant only).
    rotation: AtomicU32,
}

impl Normalizer {
    pub(crate) fn new() -> Self {
        Self {
            rotation: AtomicU32::new(0),
        }
    }

    pub(crate) fn last_rotation(&self) -> u32 {
        self.rotation.load(Ordering::Relaxed)
    }

    /// Decode one intercepted request into a canonical record.
    ///
    /// Infallible: every anomaly is encoded in the record's `format` tag.
    pub(crate) fn normalize(
        &self,
        request: u32,
        arg: u64,
        mem: &dyn RequestMemory,
        timestamp: u64,
    ) -> DamageUpdate {
        let mut update = DamageUpdate::default();
        update.timestamp = timestamp;

        match request {
            raw::REQ_SEND_UPDATE_V1_NTX => match read_struct::<RawUpdateV1Ntx>(mem, arg) {
                Ok(v1_ntx) => fill_v1_ntx(&mut update, &v1_ntx),
                Err(_) => update.format = DamageFormat::Error,
            },
            raw::REQ_SEND_UPDATE_V1 => match read_struct::<RawUpdateV1>(mem, arg) {
                Ok(v1) => fill_v1(&mut update, &v1),
                Err(_) => update.format = DamageFormat::Error,
            },
            raw::REQ_SEND_UPDATE_V2 => match read_struct::<RawUpdateV2>(mem, arg) {
                Ok(v2) => fill_v2(&mut update, &v2),
                Err(_) => update.format = DamageFormat::Error,
            },
            raw::REQ_EINK_UPDATE2 => self.fill_disp2(&mut update, arg, mem),
            _ => update.format = DamageFormat::Unknown,
        }

        trace!(format = update.format.label(), timestamp, "normalized update request");
        update
    }

    /// Platform variant: argument block, then rotation scalar, then update
    /// descriptor. Any failed copy marks the record `Error`, but a rotation
    /// obtained before the failure is published regardless.
    fn fill_disp2(&self, update: &mut DamageUpdate, arg: u64, mem: &dyn RequestMemory) {
        let block = match read_struct::<[u64; raw::DISP2_ARG_SLOTS]>(mem, arg) {
            Ok(block) => block,
            Err(_) => {
                update.format = DamageFormat::Error;
                return;
            }
        };

        let rotation = read_struct::<u32>(mem, block[1]);
        if let Ok(rotation) = rotation {
            self.rotation.store(rotation, Ordering::Relaxed);
        }

        let descriptor = match read_struct::<RawDisp2Update>(mem, block[0]) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                update.format = DamageFormat::Error;
                return;
            }
        };
        let Ok(rotation) = rotation else {
            update.format = DamageFormat::Error;
            return;
        };

        update.format = DamageFormat::Disp2;
        update.data.update_region = rect(&descriptor.area);
        update.data.waveform_mode = descriptor.waveform_mode;
        update.data.update_mode = UpdateMode::from_raw(descriptor.update_mode);
        update.data.update_marker = descriptor.update_marker;
        update.data.temp = descriptor.temp;
        update.data.flags = UpdateFlags::from_bits_retain(descriptor.flags);
        update.data.rotation = rotation;
        update.data.pen_mode = descriptor.pen_mode;
    }
}

fn rect(raw: &RawRect) -> Rect {
    Rect {
        top: raw.top,
        left: raw.left,
        width: raw.width,
        height: raw.height,
    }
}

fn fill_shared(
    update: &mut DamageUpdate,
    region: &RawRect,
    waveform_mode: u32,
    update_mode: u32,
    update_marker: u32,
    temp: i32,
    flags: u32,
) {
    update.data.update_region = rect(region);
    update.data.waveform_mode = waveform_mode;
    update.data.update_mode = UpdateMode::from_raw(update_mode);
    update.data.update_marker = update_marker;
    update.data.temp = temp;
    update.data.flags = UpdateFlags::from_bits_retain(flags);
}

fn fill_alt_buffer_ntx(update: &mut DamageUpdate, alt: &RawAltBufferNtx) {
    update.data.alt_buffer.virt_addr = alt.virt_addr;
    update.data.alt_buffer.phys_addr = alt.phys_addr;
    update.data.alt_buffer.width = alt.width;
    update.data.alt_buffer.height = alt.height;
    update.data.alt_buffer.alt_update_region = rect(&alt.alt_update_region);
}

fn fill_alt_buffer(update: &mut DamageUpdate, alt: &RawAltBuffer) {
    update.data.alt_buffer.phys_addr = alt.phys_addr;
    update.data.alt_buffer.width = alt.width;
    update.data.alt_buffer.height = alt.height;
    update.data.alt_buffer.alt_update_region = rect(&alt.alt_update_region);
}

fn fill_v1_ntx(update: &mut DamageUpdate, v1_ntx: &RawUpdateV1Ntx) {
    update.format = DamageFormat::V1Ntx;
    fill_shared(
        update,
        &v1_ntx.update_region,
        v1_ntx.waveform_mode,
        v1_ntx.update_mode,
        v1_ntx.update_marker,
        v1_ntx.temp,
        v1_ntx.flags,
    );
    fill_alt_buffer_ntx(update, &v1_ntx.alt_buffer_data);
}

fn fill_v1(update: &mut DamageUpdate, v1: &RawUpdateV1) {
    update.format = DamageFormat::V1;
    fill_shared(
        update,
        &v1.update_region,
        v1.waveform_mode,
        v1.update_mode,
        v1.update_marker,
        v1.temp,
        v1.flags,
    );
    // No virtual address in this shape's alt buffer.
    fill_alt_buffer(update, &v1.alt_buffer_data);
}

fn fill_v2(update: &mut DamageUpdate, v2: &RawUpdateV2) {
    update.format = DamageFormat::V2;
    fill_shared(
        update,
        &v2.update_region,
        v2.waveform_mode,
        v2.update_mode,
        v2.update_marker,
        v2.temp,
        v2.flags,
    );
    update.data.dither_mode = v2.dither_mode;
    update.data.quant_bit = v2.quant_bit;
    fill_alt_buffer(update, &v2.alt_buffer_data);
}
