//! The image record: the fixed set of per-image metadata the rest of the
//! application reads and edits. Records are cached as one opaque value per
//! image; only the store layer cares about individual columns.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Bounded lengths for the string fields, enforced when a record is
/// loaded or edited so a slab of records stays a predictable size class.
pub const MAX_FILENAME_LEN: usize = 256;
pub const MAX_MAKER_LEN: usize = 32;
pub const MAX_MODEL_LEN: usize = 32;
pub const MAX_LENS_LEN: usize = 52;
pub const MAX_DATETIME_LEN: usize = 20;

/// Star rating occupies the three low flag bits; 6 is the reject mark.
pub const RATING_MASK: u32 = 0x7;
pub const RATING_REJECT: u32 = 6;

bitflags! {
    /// Image state bits. The low three bits hold the star rating and are
    /// accessed through [`ImageFlags::rating`]; unknown bits round-trip.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ImageFlags: u32 {
        /// The small thumbnail came from an embedded preview, not the pipeline.
        const THUMBNAIL = 1 << 4;
        /// Low-dynamic-range data, no demosaic/highlight handling needed.
        const LDR = 1 << 5;
        /// Mosaic sensor data, needs demosaicing.
        const RAW = 1 << 6;
        /// High-dynamic-range float data.
        const HDR = 1 << 7;
        /// Marked for removal from the library.
        const REMOVE = 1 << 8;
        const _ = !0;
    }
}

impl ImageFlags {
    pub fn rating(&self) -> u32 {
        self.bits() & RATING_MASK
    }

    pub fn is_rejected(&self) -> bool {
        self.rating() == RATING_REJECT
    }

    /// Store a star rating (0..=5) or [`RATING_REJECT`]; other values clamp.
    pub fn set_rating(&mut self, stars: u32) {
        let stars = if stars == RATING_REJECT { stars } else { stars.min(5) };
        *self = Self::from_bits_retain((self.bits() & !RATING_MASK) | stars);
    }
}

/// Demosaic filter layout of the sensor, or `None` for non-mosaic images.
/// The four mosaic variants name the 2x2 cell reading order row by row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterPattern {
    #[default]
    None,
    /// `B G / G R`
    Bggr,
    /// `G R / B G`
    Grbg,
    /// `G B / R G`
    Gbrg,
    /// `R G / G B`
    Rggb,
}

impl FilterPattern {
    /// Decode the dcraw-style packed pattern word.
    pub fn from_raw(value: u32) -> Self {
        match value {
            0x1616_1616 => FilterPattern::Bggr,
            0x6161_6161 => FilterPattern::Grbg,
            0x4949_4949 => FilterPattern::Gbrg,
            0x9494_9494 => FilterPattern::Rggb,
            _ => FilterPattern::None,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            FilterPattern::None => 0,
            FilterPattern::Bggr => 0x1616_1616,
            FilterPattern::Grbg => 0x6161_6161,
            FilterPattern::Gbrg => 0x4949_4949,
            FilterPattern::Rggb => 0x9494_9494,
        }
    }

    pub fn is_mosaic(self) -> bool {
        self != FilterPattern::None
    }

    /// Color channel (0 = R, 1 = G, 2 = B) of the sensor site at parity
    /// position `(row & 1, col & 1)`.
    pub fn color_at(self, row: usize, col: usize) -> usize {
        let cell = match self {
            FilterPattern::None => return 1,
            FilterPattern::Bggr => [[2, 1], [1, 0]],
            FilterPattern::Grbg => [[1, 0], [2, 1]],
            FilterPattern::Gbrg => [[1, 2], [0, 1]],
            FilterPattern::Rggb => [[0, 1], [1, 2]],
        };
        cell[row & 1][col & 1]
    }

    fn swap_rows(self) -> Self {
        match self {
            FilterPattern::Bggr => FilterPattern::Gbrg,
            FilterPattern::Gbrg => FilterPattern::Bggr,
            FilterPattern::Grbg => FilterPattern::Rggb,
            FilterPattern::Rggb => FilterPattern::Grbg,
            FilterPattern::None => FilterPattern::None,
        }
    }

    fn swap_cols(self) -> Self {
        match self {
            FilterPattern::Bggr => FilterPattern::Grbg,
            FilterPattern::Grbg => FilterPattern::Bggr,
            FilterPattern::Gbrg => FilterPattern::Rggb,
            FilterPattern::Rggb => FilterPattern::Gbrg,
            FilterPattern::None => FilterPattern::None,
        }
    }

    /// The pattern as seen after applying `orientation` to an image of the
    /// given dimensions. Odd dimensions shift the cell parity when the
    /// matching axis is flipped.
    ///
    /// Orientation bits: `&1` flip y, `&2` flip x, `&4` swap x/y.
    pub fn flipped(self, orientation: i32, width: i32, height: i32) -> Self {
        if self == FilterPattern::None {
            return self;
        }
        let orient = orientation.max(0);
        let mut f = self;
        if orient & 1 != 0 && height & 1 != 0 {
            f = f.swap_rows();
        }
        if orient & 2 != 0 && width & 1 != 0 {
            f = f.swap_cols();
        }
        use FilterPattern::*;
        match orient {
            5 => match f {
                Bggr => Grbg,
                Grbg => Rggb,
                Gbrg => Bggr,
                Rggb => Gbrg,
                None => None,
            },
            6 => match f {
                Bggr => Gbrg,
                Grbg => Bggr,
                Gbrg => Rggb,
                Rggb => Grbg,
                None => None,
            },
            3 => match f {
                Bggr => Rggb,
                Grbg => Gbrg,
                Gbrg => Grbg,
                Rggb => Bggr,
                None => None,
            },
            _ => f,
        }
    }
}

/// Legacy flip parameters carried through from old libraries: 24 bits of
/// historical state plus the user's flip override, packed into one word in
/// the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LegacyFlip {
    pub legacy: u32,
    pub user_flip: u8,
}

impl LegacyFlip {
    pub fn from_raw(value: u32) -> Self {
        LegacyFlip {
            legacy: value & 0x00ff_ffff,
            user_flip: (value >> 24) as u8,
        }
    }

    pub fn to_raw(self) -> u32 {
        (self.legacy & 0x00ff_ffff) | (u32::from(self.user_flip) << 24)
    }
}

/// EXIF orientation (1..=8) to flip bits: `&1` flip y, `&2` flip x,
/// `&4` swap x/y. Anything else maps to "no transform".
pub fn orientation_to_flip_bits(orient: i32) -> i32 {
    match orient {
        1 => 0,
        2 => 2,
        3 => 2 | 1,
        4 => 1,
        5 => 4,
        6 => 4 | 2,
        7 => 4 | 2 | 1,
        8 => 4 | 1,
        _ => 0,
    }
}

/// One image's metadata. `id == 0` means "no image": lookups that find
/// nothing in the store serve a default record and callers test the id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i32,
    pub film_id: i32,
    pub filename: String,
    pub maker: String,
    pub model: String,
    pub lens: String,
    pub datetime_taken: String,
    pub exposure: f32,
    pub aperture: f32,
    pub iso: f32,
    pub focal_length: f32,
    pub focus_distance: f32,
    pub crop: f32,
    pub width: i32,
    pub height: i32,
    pub bpp: i32,
    pub flags: ImageFlags,
    pub filters: FilterPattern,
    pub orientation: i32,
    pub legacy_flip: LegacyFlip,
}

fn bounded(s: &mut String, max: usize) {
    if s.chars().count() > max {
        *s = s.chars().take(max).collect();
    }
}

impl ImageRecord {
    /// Reset to the "no image" state.
    pub fn wipe(&mut self) {
        *self = ImageRecord::default();
    }

    pub fn is_ldr(&self) -> bool {
        self.flags.contains(ImageFlags::LDR)
    }

    pub fn is_raw(&self) -> bool {
        self.flags.contains(ImageFlags::RAW)
    }

    pub fn is_hdr(&self) -> bool {
        self.flags.contains(ImageFlags::HDR)
    }

    /// Orientation bits with negative (unknown) clamped to none.
    pub fn orientation(&self) -> i32 {
        self.orientation.max(0)
    }

    /// The filter pattern as the pipeline sees it after orientation.
    pub fn flipped_filters(&self) -> FilterPattern {
        self.filters
            .flipped(self.orientation(), self.width, self.height)
    }

    /// Bytes per pixel of the full-resolution buffer, from the flag bits:
    /// LDR and non-raw HDR develop as 4-channel float, raw HDR as single
    /// float, everything else as 16-bit mosaic.
    pub fn derive_bpp(&mut self) {
        self.bpp = if self.is_ldr() {
            16
        } else if self.is_hdr() {
            if self.is_raw() { 4 } else { 16 }
        } else {
            2
        };
    }

    /// Clamp all string fields to their column widths.
    pub fn clamp_strings(&mut self) {
        bounded(&mut self.filename, MAX_FILENAME_LEN);
        bounded(&mut self.maker, MAX_MAKER_LEN);
        bounded(&mut self.model, MAX_MODEL_LEN);
        bounded(&mut self.lens, MAX_LENS_LEN);
        bounded(&mut self.datetime_taken, MAX_DATETIME_LEN);
    }
}
