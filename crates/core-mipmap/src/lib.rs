//! The mipmap pyramid cache: every decoded pixel buffer the application
//! shows or processes comes out of here. One concurrent cache instance per
//! pre-sized tier plus one for full-resolution buffers, each backed by a
//! fixed arena of aligned slots; missing thumbnails are materialized
//! lazily under the entry's write lease so concurrent requests for the
//! same image serialize onto one producer while other keys stay
//! available.
//!
//! Reads come in four modes: `TestLock` (non-blocking), `Prefetch` (queue
//! a background job and return), `Blocking` (materialize on miss), and
//! `BestEffort` (walk down the pyramid for anything usable, prefetching
//! the requested tier). Generation failure is not an error: the entry
//! becomes a dead image rendered as a small sentinel glyph, and the cache
//! contract stays total.
//!
//! The smallest tiers are persisted across restarts as JPEG payloads; see
//! `snapshot`.

pub mod buffer;
pub mod io;
pub mod key;
mod materialize;
pub mod scale;
pub mod snapshot;

pub use buffer::{dead_image_8, dead_image_f, BufferFlags, BufferHeader, MipSlot};
pub use io::{
    CodecError, EmbeddedThumbSource, FullBufferAlloc, JpegCodec, LoadStatus, PipelineExport,
    RawLoader, Rgba8Image,
};
pub use key::{encode_key, key_image_id, key_size, MipSize, MAX_IMAGE_ID};

use buffer::DEAD_FALLBACK_BYTES;
use core_cache::{Cache, CacheHit, CacheParams, CacheStats, ReadLease, SlotInit, SlotPolicy};
use core_jobs::{JobScheduler, PrefetchJob};
use core_record::ImageCache;
use std::path::PathBuf;
use std::sync::Arc;

/// How a read should behave on a missing or unfinished entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Return the buffer only if present, populated, and not write-held.
    TestLock,
    /// Queue a background generation job; never returns a buffer.
    Prefetch,
    /// Materialize on miss, blocking until the buffer is usable.
    Blocking,
    /// Scan this tier and below for anything populated; on a full miss,
    /// prefetch the requested tier.
    BestEffort,
}

/// Slot policy shared by all tiers. Pre-sized tiers stamp the fixed-size
/// header and ask for a write lease so the caller materializes; the full
/// tier starts at the dead-image fallback allocation with unknown
/// dimensions and a flat cost of one slot.
enum MipPolicy {
    Presized {
        max_width: u32,
        max_height: u32,
        entry_bytes: usize,
    },
    Full,
}

impl SlotPolicy<MipSlot> for MipPolicy {
    fn fill(&self, _key: u32, slot: &mut MipSlot) -> SlotInit {
        match self {
            MipPolicy::Presized {
                max_width,
                max_height,
                entry_bytes,
            } => {
                slot.header = BufferHeader {
                    width: *max_width,
                    height: *max_height,
                    size: *entry_bytes as u32,
                    flags: BufferFlags::GENERATE,
                };
                SlotInit {
                    cost: *entry_bytes as i64,
                    hold_write: true,
                }
            }
            MipPolicy::Full => {
                slot.header = BufferHeader {
                    width: 0,
                    height: 0,
                    size: slot.capacity() as u32,
                    flags: BufferFlags::GENERATE,
                };
                // Flat cost: payload sizes vary per image, so the quota
                // counts buffers, not bytes.
                SlotInit {
                    cost: 1,
                    hold_write: true,
                }
            }
        }
    }
}

pub(crate) struct Tier {
    pub cache: Cache<MipSlot, MipPolicy>,
    pub size: MipSize,
    pub max_width: u32,
    pub max_height: u32,
    pub entry_bytes: usize,
}

/// Sizing and policy knobs, typically derived from the configuration.
#[derive(Debug, Clone)]
pub struct MipmapParams {
    /// Byte budget for each pre-sized tier's slab.
    pub memory_per_tier: usize,
    /// Worker-pool width; every tier keeps at least twice this many slots.
    pub parallelism: usize,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    /// JPEG quality of the on-disk thumbnail snapshot, clamped to 10..=100.
    pub snapshot_quality: u8,
    /// Never read embedded previews, even for unaltered images.
    pub never_use_embedded: bool,
    /// Directory the thumbnail snapshot file lives in.
    pub cache_dir: PathBuf,
}

/// The external collaborators the cache drives.
pub struct Collaborators {
    pub records: Arc<ImageCache>,
    pub raw_loader: Arc<dyn RawLoader>,
    pub embedded: Arc<dyn EmbeddedThumbSource>,
    pub pipeline: Arc<dyn PipelineExport>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub codec: Arc<dyn JpegCodec>,
}

pub struct MipmapCache {
    tiers: Vec<Tier>,
    pub(crate) records: Arc<ImageCache>,
    pub(crate) raw_loader: Arc<dyn RawLoader>,
    pub(crate) embedded: Arc<dyn EmbeddedThumbSource>,
    pub(crate) pipeline: Arc<dyn PipelineExport>,
    scheduler: Arc<dyn JobScheduler>,
    pub(crate) codec: Arc<dyn JpegCodec>,
    pub(crate) snapshot_quality: u8,
    pub(crate) never_use_embedded: bool,
    snapshot_path: Option<PathBuf>,
}

/// Round up to a multiple of 16 so tier dimensions stay divisible by two
/// three times down the pyramid.
fn round_to_16(v: u32) -> u32 {
    if v & 0xf != 0 { (v & !0xf) + 0x10 } else { v }
}

impl MipmapCache {
    /// Build all tiers, then restore the persisted thumbnails if the
    /// record store has a backing file.
    pub fn new(params: MipmapParams, collaborators: Collaborators) -> Self {
        let wd = round_to_16(params.thumbnail_width.clamp(32, 2048));
        let ht = round_to_16(params.thumbnail_height.clamp(32, 2048));
        let parallel = params.parallelism.clamp(1, 8) as u32;

        let mut dims = [(0u32, 0u32); MipSize::COUNT];
        dims[MipSize::Mip3.index()] = (wd, ht);
        dims[MipSize::MipF.index()] = (wd, ht);
        for k in (0..MipSize::Mip3.index()).rev() {
            let (w, h) = dims[k + 1];
            dims[k] = (w / 2, h / 2);
        }

        let mut tiers = Vec::with_capacity(MipSize::COUNT);
        for size in key::ALL {
            let tier = if size == MipSize::MipFull {
                let min_buffers = (2 * parallel).next_power_of_two();
                Tier {
                    cache: Cache::new(
                        CacheParams {
                            capacity: min_buffers.max(16),
                            neighborhood: 64,
                            cost_quota: ((0.9 * f64::from(min_buffers)) as i64).max(1),
                        },
                        MipPolicy::Full,
                        |_| MipSlot::with_capacity(DEAD_FALLBACK_BYTES),
                    ),
                    size,
                    max_width: 0,
                    max_height: 0,
                    entry_bytes: 0,
                }
            } else {
                let (w, h) = dims[size.index()];
                let bytes_per_pixel: usize = if size == MipSize::MipF { 16 } else { 4 };
                let entry_bytes = w as usize * h as usize * bytes_per_pixel;
                let mut entries = ((params.memory_per_tier / entry_bytes).max(1) as u32)
                    .next_power_of_two()
                    .max(2 * parallel);
                // Shrink toward the budget, but never below the worker floor.
                while entries > 2 * parallel
                    && entries as usize * entry_bytes > params.memory_per_tier
                {
                    entries /= 2;
                }
                // 90% byte quota; the slack absorbs displacement churn.
                let quota = (0.9 * entries as f64 * entry_bytes as f64) as i64;
                let cache = Cache::new(
                    CacheParams {
                        capacity: entries,
                        neighborhood: 64,
                        cost_quota: quota,
                    },
                    MipPolicy::Presized {
                        max_width: w,
                        max_height: h,
                        entry_bytes,
                    },
                    |_| MipSlot::with_capacity(entry_bytes),
                );
                tracing::debug!(
                    target: "mipmap",
                    tier = size.index(),
                    entries = cache.capacity(),
                    entry_bytes,
                    "tier initialized"
                );
                Tier {
                    cache,
                    size,
                    max_width: w,
                    max_height: h,
                    entry_bytes,
                }
            };
            tiers.push(tier);
        }

        let snapshot_path =
            snapshot::snapshot_filename(&params.cache_dir, &collaborators.records.store().path());
        let cache = MipmapCache {
            tiers,
            records: collaborators.records,
            raw_loader: collaborators.raw_loader,
            embedded: collaborators.embedded,
            pipeline: collaborators.pipeline,
            scheduler: collaborators.scheduler,
            codec: collaborators.codec,
            snapshot_quality: params.snapshot_quality.clamp(10, 100),
            never_use_embedded: params.never_use_embedded,
            snapshot_path,
        };
        cache.restore();
        cache
    }

    pub(crate) fn tier(&self, size: MipSize) -> &Tier {
        &self.tiers[size.index()]
    }

    /// Configured maximum dimensions of a tier (zero for the full tier).
    pub fn tier_dims(&self, size: MipSize) -> (u32, u32) {
        let t = self.tier(size);
        (t.max_width, t.max_height)
    }

    /// The pre-sized tier whose maximum dimensions best match a target,
    /// by `|Δ(w + h)|` with ties going to the larger tier.
    pub fn closest_size(&self, width: i32, height: i32) -> MipSize {
        let mut best = MipSize::Mip0;
        let mut best_error = i64::MAX;
        for size in key::PRESIZED {
            let t = self.tier(size);
            let error =
                (i64::from(t.max_width + t.max_height) - i64::from(width) - i64::from(height)).abs();
            if error <= best_error {
                best = size;
                best_error = error;
            }
        }
        best
    }

    /// Fetch the buffer for `(image_id, size)` per `mode`. `None` means no
    /// buffer is available under that mode's rules; `Blocking` returns
    /// `None` only for out-of-range ids and missing full-resolution
    /// images.
    pub fn read_get(&self, image_id: i32, size: MipSize, mode: ReadMode) -> Option<MipmapBuf<'_>> {
        if image_id <= 0 || image_id > MAX_IMAGE_ID {
            return None;
        }
        match mode {
            ReadMode::TestLock => {
                let lease = self.tier(size).cache.read_testget(encode_key(image_id, size))?;
                if lease.header.needs_generation() {
                    // Allocated but never filled (failed restore decode).
                    return None;
                }
                Some(MipmapBuf::new(lease, image_id, size))
            }
            ReadMode::Prefetch => {
                let job = PrefetchJob {
                    image_id,
                    tier: size.index() as u8,
                };
                if !self.scheduler.revive(&job) {
                    self.scheduler.enqueue(job);
                }
                None
            }
            ReadMode::Blocking => {
                let lease = match self.tier(size).cache.read_get(encode_key(image_id, size)) {
                    CacheHit::Write(mut write) => {
                        materialize::materialize(self, image_id, size, &mut write);
                        self.finish_generation(size, &mut write);
                        write.downgrade()
                    }
                    CacheHit::Read(read) => {
                        if read.header.needs_generation() {
                            // Leftover needs-generation entry; take the
                            // writer role and fill it now, unless a racer
                            // beat us to it while we upgraded.
                            let mut write = read.upgrade();
                            if write.header.needs_generation() {
                                materialize::materialize(self, image_id, size, &mut write);
                                self.finish_generation(size, &mut write);
                            }
                            write.downgrade()
                        } else {
                            read
                        }
                    }
                };
                if size == MipSize::MipFull && lease.header.is_dead() {
                    // Missing image: full buffers have no sentinel glyph.
                    return None;
                }
                Some(MipmapBuf::new(lease, image_id, size))
            }
            ReadMode::BestEffort => {
                // Never degrade below the requested tier for float or full
                // buffers; thumbnails may fall all the way down.
                let min_index = if size >= MipSize::MipF { size.index() } else { 0 };
                for k in (min_index..=size.index()).rev() {
                    let probe = key::ALL[k];
                    if let Some(buf) = self.read_get(image_id, probe, ReadMode::TestLock) {
                        if buf.width() > 0 && buf.height() > 0 {
                            return Some(buf);
                        }
                    }
                    if k == size.index() {
                        self.read_get(image_id, size, ReadMode::Prefetch);
                    }
                }
                None
            }
        }
    }

    /// Drop every pre-sized thumbnail of `image_id` (after edits that
    /// invalidate them). Float and full buffers regenerate from source
    /// data and are left alone.
    pub fn remove(&self, image_id: i32) {
        if image_id <= 0 || image_id > MAX_IMAGE_ID {
            return;
        }
        for size in key::PRESIZED {
            self.tier(size).cache.remove(encode_key(image_id, size));
        }
    }

    /// Write the persisted tiers to disk. Called once at shutdown, before
    /// teardown; all failures are logged, none propagate.
    pub fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            tracing::debug!(target: "mipmap.snapshot", "record store has no file, snapshot skipped");
            return;
        };
        if let Err(error) = snapshot::snapshot(self, path) {
            tracing::warn!(
                target: "mipmap.snapshot",
                path = %path.display(),
                error = %error,
                "thumbnail snapshot failed"
            );
        }
    }

    fn restore(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(error) = snapshot::restore(self, path) {
            tracing::warn!(
                target: "mipmap.snapshot",
                path = %path.display(),
                error = %error,
                "thumbnail restore failed"
            );
        }
    }

    pub fn stats(&self) -> Vec<(MipSize, CacheStats)> {
        self.tiers
            .iter()
            .map(|t| (t.size, t.cache.stats()))
            .collect()
    }

    /// Post-materialization fixup under the still-held write lease: dead
    /// pre-sized and float entries get the sentinel glyph, and the entry
    /// is marked clean so it is never materialized again.
    fn finish_generation(&self, size: MipSize, slot: &mut MipSlot) {
        if slot.header.is_dead() {
            match size {
                MipSize::MipFull => {}
                MipSize::MipF => dead_image_f(slot),
                _ => dead_image_8(slot),
            }
        }
        slot.header.mark_clean();
    }
}

/// A read-leased pixel buffer. Dimensions are captured at acquisition;
/// the pixel slices stay valid exactly as long as the buffer is held.
pub struct MipmapBuf<'c> {
    lease: ReadLease<'c, MipSlot, MipPolicy>,
    image_id: i32,
    size: MipSize,
    width: u32,
    height: u32,
}

impl<'c> MipmapBuf<'c> {
    fn new(lease: ReadLease<'c, MipSlot, MipPolicy>, image_id: i32, size: MipSize) -> Self {
        let width = lease.header.width;
        let height = lease.header.height;
        MipmapBuf {
            lease,
            image_id,
            size,
            width,
            height,
        }
    }

    pub fn image_id(&self) -> i32 {
        self.image_id
    }

    pub fn size(&self) -> MipSize {
        self.size
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Generation failed for this entry; the pixels hold the sentinel
    /// glyph (pre-sized and float tiers).
    pub fn is_dead(&self) -> bool {
        self.lease.header.is_dead()
    }

    pub fn pixels(&self) -> &[u8] {
        self.lease.pixels()
    }

    pub fn pixels_f32(&self) -> &[f32] {
        self.lease.pixels_f32()
    }

    pub fn pixels_u16(&self) -> &[u16] {
        self.lease.pixels_u16()
    }

    /// Header/payload consistency for this tier's pixel format; callers
    /// assert this in debug builds before touching the pixels.
    pub fn is_consistent(&self) -> bool {
        let bytes_per_pixel = match self.size {
            MipSize::MipF => 16,
            MipSize::MipFull => 1, // variable; the header size already counts bytes
            _ => 4,
        };
        self.lease.is_consistent(bytes_per_pixel)
    }

    /// Explicit release; identical to dropping the buffer.
    pub fn release(self) {}
}
