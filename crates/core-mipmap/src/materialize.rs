//! Materializers: how an allocated-but-empty mipmap entry becomes pixels.
//!
//! All three run under the entry's write lease, so concurrent requests
//! for the same buffer wait on the one producer. Lease ordering is strict:
//! a materializer holds at most one lock chain at a time, the record lease
//! is dropped before any long decode, and the float tier acquires the full
//! buffer only after its own write lease is already held.
//!
//! Failure never propagates: a materializer leaves zero dimensions behind
//! and the read path renders the dead-image sentinel.

use crate::buffer::MipSlot;
use crate::io::{FullBufferAlloc, LoadStatus};
use crate::key::MipSize;
use crate::{scale, MipmapCache, ReadMode};
use core_record::record::orientation_to_flip_bits;
use core_record::{ImageRecord, WriteMode};

/// Camera makers whose embedded previews carry wrong orientation; their
/// thumbnails always go through the pipeline path.
const BUGGY_EMBEDDED_MAKERS: &[&str] = &["Phase One"];

pub(crate) fn materialize(cache: &MipmapCache, image_id: i32, size: MipSize, slot: &mut MipSlot) {
    match size {
        MipSize::MipFull => init_full(cache, image_id, slot),
        MipSize::MipF => init_float(cache, image_id, slot),
        _ => init_presized(cache, image_id, size, slot),
    }
}

fn mark_dead(slot: &mut MipSlot) {
    slot.header.width = 0;
    slot.header.height = 0;
}

/// Copy of the record for `image_id`, lease dropped before returning.
/// `None` when the image is unknown.
fn record_snapshot(cache: &MipmapCache, image_id: i32) -> Option<ImageRecord> {
    let lease = cache.records.read_get(image_id)?;
    if lease.id == 0 {
        return None;
    }
    Some((*lease).clone())
}

/// Full-resolution materialization: decode the source file into the slot,
/// growing it through the allocator handle, then store the decoder's
/// dimensions back into the record cache.
fn init_full(cache: &MipmapCache, image_id: i32, slot: &mut MipSlot) {
    let Some(record) = record_snapshot(cache, image_id) else {
        mark_dead(slot);
        return;
    };
    let Some(path) = cache.records.store().image_path(image_id) else {
        tracing::debug!(target: "mipmap", image = image_id, "no source path for image");
        mark_dead(slot);
        return;
    };

    // The record lease is already dropped: the decoder can take as long
    // as it wants without holding up record readers, and the write-back
    // below can take its own lease without self-deadlock.
    let mut updated = record;
    let status = {
        let mut alloc = FullBufferAlloc::new(slot);
        cache.raw_loader.open_image(&mut updated, &path, &mut alloc)
    };
    match status {
        LoadStatus::Ok => {
            // Publish the decoder's dimensions. The record write-back is
            // the last action under the lease, so record readers observe
            // consistent width/height once the buffer appears.
            if let Some(read) = cache.records.read_get(image_id) {
                let mut write = read.upgrade();
                *write = updated;
                drop(write.release(WriteMode::Relaxed));
            }
        }
        status => {
            tracing::debug!(target: "mipmap", image = image_id, ?status, "full image load failed");
            mark_dead(slot);
        }
    }
}

/// Float-tier materialization: reduce the full buffer to fit the float
/// tier, demosaicing on the way down when the source is mosaic data.
fn init_float(cache: &MipmapCache, image_id: i32, slot: &mut MipSlot) {
    let (max_w, max_h) = cache.tier_dims(MipSize::MipF);

    // Our own write lease is held; the full tier comes second in the
    // chain. Missing source file surfaces here as a missing full buffer.
    let Some(full) = cache.read_get(image_id, MipSize::MipFull, ReadMode::Blocking) else {
        mark_dead(slot);
        return;
    };
    debug_assert!(full.is_consistent());

    let Some(record) = cache.records.read_get(image_id) else {
        mark_dead(slot);
        return;
    };
    let src_w = full.width();
    let src_h = full.height();
    if record.id == 0 || src_w == 0 || src_h == 0 {
        mark_dead(slot);
        return;
    }

    let factor = f32::min(max_w as f32 / src_w as f32, max_h as f32 / src_h as f32);
    let out_w = ((src_w as f32 * factor) as u32).clamp(1, max_w);
    let out_h = ((src_h as f32 * factor) as u32).clamp(1, max_h);

    if record.filters.is_mosaic() {
        let pattern = record.flipped_filters();
        match record.bpp {
            2 => scale::demosaic_half_size_u16(
                &full.pixels_u16()[..(src_w * src_h) as usize],
                src_w,
                src_h,
                pattern,
                slot.pixels_f32_mut(),
                out_w,
                out_h,
            ),
            4 => scale::demosaic_half_size_f32(
                &full.pixels_f32()[..(src_w * src_h) as usize],
                src_w,
                src_h,
                pattern,
                slot.pixels_f32_mut(),
                out_w,
                out_h,
            ),
            _ => scale::clip_and_zoom_rgba(
                &full.pixels_f32()[..(src_w * src_h * 4) as usize],
                src_w,
                src_h,
                slot.pixels_f32_mut(),
                out_w,
                out_h,
            ),
        }
    } else {
        scale::clip_and_zoom_rgba(
            &full.pixels_f32()[..(src_w * src_h * 4) as usize],
            src_w,
            src_h,
            slot.pixels_f32_mut(),
            out_w,
            out_h,
        );
    }
    slot.header.width = out_w;
    slot.header.height = out_h;
}

/// Pre-sized tier materialization: embedded preview when the image is
/// pristine and the camera trustworthy, otherwise a draft pipeline render.
fn init_presized(cache: &MipmapCache, image_id: i32, size: MipSize, slot: &mut MipSlot) {
    let (max_w, max_h) = cache.tier_dims(size);
    let Some(record) = record_snapshot(cache, image_id) else {
        mark_dead(slot);
        return;
    };
    let store = cache.records.store();
    let Some(path) = store.image_path(image_id) else {
        tracing::debug!(target: "mipmap", image = image_id, "no source path for thumbnail");
        mark_dead(slot);
        return;
    };

    let altered = store.image_altered(image_id);
    let incompatible = BUGGY_EMBEDDED_MAKERS
        .iter()
        .any(|m| record.maker.starts_with(m));

    let mut produced: Option<(u32, u32)> = None;

    if !altered && !cache.never_use_embedded && !incompatible {
        if let Some((thumb, exif_orientation)) = cache.embedded.embedded_thumb(&path) {
            let flip = if exif_orientation > 0 {
                orientation_to_flip_bits(exif_orientation)
            } else {
                record.orientation()
            };
            let (w, h) = scale::flip_and_zoom_8(&thumb, flip, max_w, max_h, slot.pixels_mut());
            if w > 0 && h > 0 {
                produced = Some((w, h));
            }
        }
    }

    if produced.is_none() {
        if let Some(rendered) = cache.pipeline.export_thumb(image_id, max_w, max_h) {
            if rendered.width > 0
                && rendered.height > 0
                && rendered.width <= max_w
                && rendered.height <= max_h
            {
                let bytes = (rendered.width * rendered.height * 4) as usize;
                slot.pixels_mut()[..bytes].copy_from_slice(&rendered.pixels[..bytes]);
                produced = Some((rendered.width, rendered.height));
            } else {
                tracing::warn!(
                    target: "mipmap",
                    image = image_id,
                    width = rendered.width,
                    height = rendered.height,
                    "pipeline render exceeds tier bounds, dropped"
                );
            }
        }
    }

    match produced {
        Some((w, h)) => {
            // Aspect can make this smaller than the tier maximum.
            slot.header.width = w;
            slot.header.height = h;
        }
        None => {
            tracing::debug!(target: "mipmap", image = image_id, tier = size.index(), "thumbnail generation failed");
            mark_dead(slot);
        }
    }
}
