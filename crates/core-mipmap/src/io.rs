//! Collaborator seams of the mipmap cache: the raw decoder, the embedded
//! preview reader, the develop-pipeline exporter, and the JPEG codec used
//! by the thumbnail snapshot. The cache core never performs the decoding
//! itself; it owns the buffers and the locking around these calls.

use crate::buffer::MipSlot;
use core_record::ImageRecord;
use std::path::Path;
use thiserror::Error;

/// Outcome of a full-image decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Ok,
    /// The file is gone; the image is shown dead until it reappears.
    NotFound,
    /// The file exists but the decoder rejected its content.
    Corrupted,
    /// The pixel buffer could not be allocated at the required size.
    CacheFull,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupted compressed stream")]
    Corrupted,
    #[error("unsupported content: {0}")]
    Unsupported(String),
}

/// Grow handle passed to the raw loader: the only way the decoder sizes
/// the write-leased full-image slot it decodes into.
pub struct FullBufferAlloc<'a> {
    slot: &'a mut MipSlot,
}

impl<'a> FullBufferAlloc<'a> {
    pub(crate) fn new(slot: &'a mut MipSlot) -> Self {
        FullBufferAlloc { slot }
    }

    /// Make room for `record`'s full image (`width * height * bpp` bytes)
    /// and return the pixel buffer. `None` when the dimensions are not yet
    /// known or the allocation fails; the caller then reports
    /// [`LoadStatus::CacheFull`].
    pub fn grow(&mut self, record: &ImageRecord) -> Option<&mut [u8]> {
        if record.width <= 0 || record.height <= 0 || record.bpp <= 0 {
            return None;
        }
        let bytes = record.width as usize * record.height as usize * record.bpp as usize;
        if !self.slot.ensure_capacity(bytes) {
            tracing::warn!(
                target: "mipmap",
                image = record.id,
                bytes,
                "full buffer allocation failed"
            );
            return None;
        }
        self.slot.header.width = record.width as u32;
        self.slot.header.height = record.height as u32;
        Some(&mut self.slot.pixels_mut()[..bytes])
    }
}

/// The raw decoder. On [`LoadStatus::Ok`] the implementation has filled
/// the buffer obtained from [`FullBufferAlloc::grow`] and updated the
/// record's width, height, bytes-per-pixel and filter pattern.
pub trait RawLoader: Send + Sync {
    fn open_image(
        &self,
        record: &mut ImageRecord,
        path: &Path,
        alloc: &mut FullBufferAlloc<'_>,
    ) -> LoadStatus;
}

/// A decoded RGBA8 bitmap.
pub struct Rgba8Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Reader of the preview embedded in a camera file. Returns the decoded
/// bitmap plus the EXIF orientation it should be shown with (0 when the
/// source carries none; the caller falls back to the record's).
pub trait EmbeddedThumbSource: Send + Sync {
    fn embedded_thumb(&self, path: &Path) -> Option<(Rgba8Image, i32)>;
}

/// The develop pipeline rendering a thumbnail at draft quality: EXIF
/// handling off, native byte order, bounded by `max_w` x `max_h`.
pub trait PipelineExport: Send + Sync {
    fn export_thumb(&self, image_id: i32, max_w: u32, max_h: u32) -> Option<Rgba8Image>;
}

/// JPEG codec used only by the thumbnail snapshot file.
pub trait JpegCodec: Send + Sync {
    fn compress(
        &self,
        rgba: &[u8],
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Vec<u8>, CodecError>;

    fn decompress_header(&self, data: &[u8]) -> Result<(u32, u32), CodecError>;

    /// Decode into `out`, which holds at least `width * height * 4` bytes
    /// per the header dimensions.
    fn decompress(&self, data: &[u8], out: &mut [u8]) -> Result<(), CodecError>;
}
