#![allow(dead_code)] // Shared across test binaries; each uses a subset.

use core_jobs::QueueScheduler;
use core_mipmap::{
    CodecError, Collaborators, EmbeddedThumbSource, FullBufferAlloc, JpegCodec, LoadStatus,
    MipmapCache, MipmapParams, PipelineExport, RawLoader, Rgba8Image,
};
use core_record::{FilterPattern, ImageCache, ImageFlags, ImageRecord, MemoryRecordStore};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Raw "decoder" producing a deterministic 16-bit mosaic gradient at the
/// dimensions it is configured with. Honors the missing-file contract.
pub struct FakeRawLoader {
    pub width: i32,
    pub height: i32,
    pub opens: AtomicU32,
}

impl FakeRawLoader {
    pub fn new(width: i32, height: i32) -> Self {
        FakeRawLoader {
            width,
            height,
            opens: AtomicU32::new(0),
        }
    }
}

impl RawLoader for FakeRawLoader {
    fn open_image(
        &self,
        record: &mut ImageRecord,
        path: &Path,
        alloc: &mut FullBufferAlloc<'_>,
    ) -> LoadStatus {
        if !path.exists() {
            return LoadStatus::NotFound;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        record.width = self.width;
        record.height = self.height;
        record.derive_bpp();
        let Some(buf) = alloc.grow(record) else {
            return LoadStatus::CacheFull;
        };
        for (i, chunk) in buf.chunks_exact_mut(2).enumerate() {
            chunk.copy_from_slice(&((i % 65536) as u16).to_le_bytes());
        }
        LoadStatus::Ok
    }
}

/// Develop-pipeline stand-in: renders a per-image byte pattern at the
/// source size scaled to fit (never upscaled), unless told to fail.
pub struct FakePipeline {
    pub src_width: u32,
    pub src_height: u32,
    pub renders: AtomicU32,
    pub fail_ids: Mutex<HashSet<i32>>,
}

impl FakePipeline {
    pub fn new(src_width: u32, src_height: u32) -> Self {
        FakePipeline {
            src_width,
            src_height,
            renders: AtomicU32::new(0),
            fail_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, id: i32) {
        self.fail_ids.lock().insert(id);
    }
}

impl PipelineExport for FakePipeline {
    fn export_thumb(&self, image_id: i32, max_w: u32, max_h: u32) -> Option<Rgba8Image> {
        if self.fail_ids.lock().contains(&image_id) {
            return None;
        }
        self.renders.fetch_add(1, Ordering::SeqCst);
        let scale = f32::min(
            1.0,
            f32::min(
                max_w as f32 / self.src_width as f32,
                max_h as f32 / self.src_height as f32,
            ),
        );
        let w = ((self.src_width as f32 * scale) as u32).clamp(1, max_w);
        let h = ((self.src_height as f32 * scale) as u32).clamp(1, max_h);
        let mut pixels = vec![0u8; (w * h * 4) as usize];
        for (i, px) in pixels.iter_mut().enumerate() {
            *px = (image_id as usize * 31 + i) as u8;
        }
        Some(Rgba8Image {
            width: w,
            height: h,
            pixels,
        })
    }
}

/// No embedded previews at all.
pub struct NoEmbedded;

impl EmbeddedThumbSource for NoEmbedded {
    fn embedded_thumb(&self, _path: &Path) -> Option<(Rgba8Image, i32)> {
        None
    }
}

/// Fixed embedded preview with a configurable orientation.
pub struct FakeEmbedded {
    pub width: u32,
    pub height: u32,
    pub orientation: i32,
    pub reads: AtomicU32,
}

impl EmbeddedThumbSource for FakeEmbedded {
    fn embedded_thumb(&self, _path: &Path) -> Option<(Rgba8Image, i32)> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut pixels = vec![0u8; (self.width * self.height * 4) as usize];
        for (i, px) in pixels.iter_mut().enumerate() {
            *px = (i % 251) as u8;
        }
        Some((
            Rgba8Image {
                width: self.width,
                height: self.height,
                pixels,
            },
            self.orientation,
        ))
    }
}

/// Codec that stores dimensions plus raw RGBA bytes; exact roundtrip.
pub struct PassthroughCodec;

impl JpegCodec for PassthroughCodec {
    fn compress(
        &self,
        rgba: &[u8],
        width: u32,
        height: u32,
        _quality: u8,
    ) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(8 + rgba.len());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(rgba);
        Ok(out)
    }

    fn decompress_header(&self, data: &[u8]) -> Result<(u32, u32), CodecError> {
        if data.len() < 8 {
            return Err(CodecError::Corrupted);
        }
        let w = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let h = u32::from_le_bytes(data[4..8].try_into().unwrap());
        Ok((w, h))
    }

    fn decompress(&self, data: &[u8], out: &mut [u8]) -> Result<(), CodecError> {
        let body = &data[8..];
        if out.len() > body.len() {
            return Err(CodecError::Corrupted);
        }
        out.copy_from_slice(&body[..out.len()]);
        Ok(())
    }
}

/// A wired-up cache over temp storage, with handles to every fake.
pub struct Rig {
    pub dir: PathBuf,
    pub store: Arc<MemoryRecordStore>,
    pub records: Arc<ImageCache>,
    pub scheduler: Arc<QueueScheduler>,
    pub loader: Arc<FakeRawLoader>,
    pub pipeline: Arc<FakePipeline>,
    pub cache: MipmapCache,
}

pub struct RigConfig {
    pub thumb_width: u32,
    pub thumb_height: u32,
    /// Source dimensions the loader and pipeline pretend to decode.
    pub src_width: u32,
    pub src_height: u32,
    pub embedded: Option<Arc<dyn EmbeddedThumbSource>>,
    /// Store path; `None` keeps the store in memory (no persistence).
    pub store_file: Option<PathBuf>,
}

impl Default for RigConfig {
    fn default() -> Self {
        RigConfig {
            thumb_width: 640,
            thumb_height: 480,
            src_width: 4096,
            src_height: 3072,
            embedded: None,
            store_file: None,
        }
    }
}

pub fn rig(dir: &Path, config: RigConfig) -> Rig {
    let store = Arc::new(match &config.store_file {
        Some(file) => MemoryRecordStore::with_path(file.clone()),
        None => MemoryRecordStore::new(),
    });
    let records = Arc::new(ImageCache::new(
        Arc::clone(&store) as Arc<dyn core_record::RecordStore>,
        1 << 20,
    ));
    let scheduler = Arc::new(QueueScheduler::new());
    let loader = Arc::new(FakeRawLoader::new(
        config.src_width as i32,
        config.src_height as i32,
    ));
    let pipeline = Arc::new(FakePipeline::new(config.src_width, config.src_height));
    let embedded = config
        .embedded
        .unwrap_or_else(|| Arc::new(NoEmbedded) as Arc<dyn EmbeddedThumbSource>);
    let cache = MipmapCache::new(
        MipmapParams {
            memory_per_tier: 1 << 20,
            parallelism: 4,
            thumbnail_width: config.thumb_width,
            thumbnail_height: config.thumb_height,
            snapshot_quality: 90,
            never_use_embedded: false,
            cache_dir: dir.join("cache"),
        },
        Collaborators {
            records: Arc::clone(&records),
            raw_loader: Arc::clone(&loader) as Arc<dyn RawLoader>,
            embedded,
            pipeline: Arc::clone(&pipeline) as Arc<dyn PipelineExport>,
            scheduler: Arc::clone(&scheduler) as Arc<dyn core_jobs::JobScheduler>,
            codec: Arc::new(PassthroughCodec),
        },
    );
    Rig {
        dir: dir.to_path_buf(),
        store,
        records,
        scheduler,
        loader,
        pipeline,
        cache,
    }
}

impl Rig {
    /// Register an image; `present` controls whether the source file
    /// exists on disk.
    pub fn add_image(&self, id: i32, present: bool) {
        let path = self.dir.join(format!("IMG_{id:04}.raw"));
        if present {
            std::fs::write(&path, b"raw").unwrap();
        }
        let record = ImageRecord {
            id,
            filename: format!("IMG_{id:04}.raw"),
            flags: ImageFlags::RAW,
            filters: FilterPattern::Bggr,
            ..ImageRecord::default()
        };
        self.store.insert(record, Some(path));
    }
}
