//! Mipmap payload storage: a descriptor header plus 16-byte aligned pixel
//! bytes, the dead-image sentinel glyph, and the consistency check debug
//! builds run before touching a buffer.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        /// The payload has been allocated but not yet filled; the holder
        /// of the write lease is expected to materialize it.
        const GENERATE = 1 << 0;
    }
}

/// Descriptor of one mipmap payload. `width`/`height` are the actual image
/// dimensions (zero for a dead image), `size` the allocated pixel bytes,
/// which can exceed `width * height * bpp` for pre-sized tiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferHeader {
    pub width: u32,
    pub height: u32,
    pub size: u32,
    pub flags: BufferFlags,
}

impl BufferHeader {
    pub fn needs_generation(&self) -> bool {
        self.flags.contains(BufferFlags::GENERATE)
    }

    pub fn mark_clean(&mut self) {
        self.flags.remove(BufferFlags::GENERATE);
    }

    pub fn is_dead(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[repr(align(16))]
#[derive(Clone, Copy)]
struct Align16([u8; 16]);

/// Heap pixel storage aligned for 16-byte SIMD loads. The buffer address
/// is stable for its lifetime; growth replaces the allocation.
pub struct AlignedPixels {
    chunks: Box<[Align16]>,
    len: usize,
}

impl AlignedPixels {
    pub fn zeroed(len: usize) -> Self {
        let chunk_count = len.div_ceil(16);
        AlignedPixels {
            chunks: vec![Align16([0; 16]); chunk_count].into_boxed_slice(),
            len,
        }
    }

    /// Fallible variant for full-image buffers, whose size is dictated by
    /// the file being decoded.
    pub fn try_zeroed(len: usize) -> Option<Self> {
        let chunk_count = len.div_ceil(16);
        let mut chunks: Vec<Align16> = Vec::new();
        chunks.try_reserve_exact(chunk_count).ok()?;
        chunks.resize(chunk_count, Align16([0; 16]));
        Some(AlignedPixels {
            chunks: chunks.into_boxed_slice(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // Align16 is a plain initialized byte array; len never exceeds
        // chunks * 16.
        unsafe { std::slice::from_raw_parts(self.chunks.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.chunks.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

/// One cache slot: header plus pixels. Pre-sized tiers build every slot at
/// the tier's fixed byte size up front; the full tier starts each slot at
/// the dead-image fallback size and grows on demand.
pub struct MipSlot {
    pub header: BufferHeader,
    pixels: AlignedPixels,
}

/// Fallback payload size for a slot that has never held a real image:
/// room for the 8x8 float glyph.
pub const DEAD_FALLBACK_BYTES: usize = 64 * 16;

impl MipSlot {
    pub fn with_capacity(bytes: usize) -> Self {
        MipSlot {
            header: BufferHeader {
                width: 0,
                height: 0,
                size: bytes as u32,
                flags: BufferFlags::GENERATE,
            },
            pixels: AlignedPixels::zeroed(bytes),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.pixels.as_mut_slice()
    }

    pub fn pixels_f32(&self) -> &[f32] {
        let bytes = self.pixels.as_slice();
        // 16-byte allocation alignment covers f32; length truncates to
        // whole elements.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<f32>(), bytes.len() / 4) }
    }

    pub fn pixels_f32_mut(&mut self) -> &mut [f32] {
        let bytes = self.pixels.as_mut_slice();
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<f32>(), bytes.len() / 4) }
    }

    pub fn pixels_u16(&self) -> &[u16] {
        let bytes = self.pixels.as_slice();
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<u16>(), bytes.len() / 2) }
    }

    /// Grow the pixel buffer to at least `bytes` without preserving
    /// contents. Returns false when the allocation cannot be satisfied,
    /// leaving the slot unchanged.
    pub fn ensure_capacity(&mut self, bytes: usize) -> bool {
        if self.pixels.len() >= bytes {
            return true;
        }
        match AlignedPixels::try_zeroed(bytes) {
            Some(fresh) => {
                self.pixels = fresh;
                self.header.size = bytes as u32;
                true
            }
            None => false,
        }
    }

    /// Header/payload consistency: the declared image must fit the declared
    /// size, and the size must fit the allocation.
    pub fn is_consistent(&self, bytes_per_pixel: u32) -> bool {
        let needed = u64::from(self.header.width)
            * u64::from(self.header.height)
            * u64::from(bytes_per_pixel);
        needed <= u64::from(self.header.size) && self.header.size as usize <= self.capacity()
    }
}

/// The 8x8 sentinel shown for images that cannot be loaded; 1 = lit.
const DEAD_GLYPH: [u8; 64] = [
    0, 0, 0, 0, 0, 0, 0, 0, //
    0, 0, 1, 1, 1, 1, 0, 0, //
    0, 1, 0, 1, 1, 0, 1, 0, //
    0, 1, 1, 1, 1, 1, 1, 0, //
    0, 0, 1, 0, 0, 1, 0, 0, //
    0, 0, 0, 0, 0, 0, 0, 0, //
    0, 0, 1, 1, 1, 1, 0, 0, //
    0, 0, 0, 0, 0, 0, 0, 0,
];

/// Paint the sentinel into an RGBA8 slot and stamp its dimensions.
pub fn dead_image_8(slot: &mut MipSlot) {
    debug_assert!(slot.capacity() >= 64 * 4);
    slot.header.width = 8;
    slot.header.height = 8;
    for (i, lit) in DEAD_GLYPH.iter().enumerate() {
        let value = if *lit != 0 { 0xff } else { 0x00 };
        slot.pixels_mut()[i * 4..i * 4 + 4].fill(value);
    }
}

/// Paint the sentinel into an RGBA-float slot; same pattern as the 8-bit
/// painter.
pub fn dead_image_f(slot: &mut MipSlot) {
    debug_assert!(slot.capacity() >= 64 * 16);
    slot.header.width = 8;
    slot.header.height = 8;
    for (i, lit) in DEAD_GLYPH.iter().enumerate() {
        let value = if *lit != 0 { 1.0f32 } else { 0.0f32 };
        slot.pixels_f32_mut()[i * 4..i * 4 + 4].fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_storage_is_simd_aligned() {
        for len in [1usize, 15, 16, 17, 1024] {
            let p = AlignedPixels::zeroed(len);
            assert_eq!(p.len(), len);
            assert_eq!(p.as_slice().as_ptr() as usize % 16, 0);
        }
    }

    #[test]
    fn dead_image_8_marks_and_paints() {
        let mut slot = MipSlot::with_capacity(1024);
        dead_image_8(&mut slot);
        assert_eq!(slot.header.width, 8);
        assert_eq!(slot.header.height, 8);
        // Row 1, columns 2..=5 are lit white.
        assert_eq!(&slot.pixels()[(8 + 2) * 4..(8 + 3) * 4], &[0xff; 4]);
        assert_eq!(&slot.pixels()[0..4], &[0x00; 4]);
    }

    #[test]
    fn dead_image_variants_share_the_pattern() {
        let mut slot8 = MipSlot::with_capacity(64 * 4);
        let mut slotf = MipSlot::with_capacity(64 * 16);
        dead_image_8(&mut slot8);
        dead_image_f(&mut slotf);
        for i in 0..64 {
            let lit8 = slot8.pixels()[i * 4] == 0xff;
            let litf = slotf.pixels_f32()[i * 4] == 1.0;
            assert_eq!(lit8, litf, "glyph mismatch at {i}");
        }
    }

    #[test]
    fn ensure_capacity_grows_and_keeps_smaller() {
        let mut slot = MipSlot::with_capacity(64);
        assert!(slot.ensure_capacity(32));
        assert_eq!(slot.capacity(), 64);
        assert!(slot.ensure_capacity(256));
        assert_eq!(slot.capacity(), 256);
        assert_eq!(slot.header.size, 256);
    }

    #[test]
    fn consistency_check_spots_undersized_payload() {
        let mut slot = MipSlot::with_capacity(64 * 4);
        slot.header.width = 8;
        slot.header.height = 8;
        assert!(slot.is_consistent(4));
        slot.header.width = 100;
        assert!(!slot.is_consistent(4));
    }
}
