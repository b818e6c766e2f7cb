//! Downsamplers used by the materializers: nearest-sample scaling with
//! orientation flips for 8-bit thumbnails, box reduction for RGBA float,
//! and the demosaic-aware half-size reducers that turn mosaic data into
//! RGBA float while shrinking it.

use crate::io::Rgba8Image;
use core_record::FilterPattern;

/// Scale `src` to fit `max_w` x `max_h` (aspect preserved) while applying
/// flip bits (`&1` flip y, `&2` flip x, `&4` swap x/y), writing packed
/// RGBA8 rows into `dst`. Returns the produced dimensions.
pub fn flip_and_zoom_8(
    src: &Rgba8Image,
    flip_bits: i32,
    max_w: u32,
    max_h: u32,
    dst: &mut [u8],
) -> (u32, u32) {
    let swap = flip_bits & 4 != 0;
    let (sw, sh) = if swap {
        (src.height, src.width)
    } else {
        (src.width, src.height)
    };
    if sw == 0 || sh == 0 || max_w == 0 || max_h == 0 {
        return (0, 0);
    }
    let scale = f32::min(max_w as f32 / sw as f32, max_h as f32 / sh as f32);
    let out_w = ((sw as f32 * scale).round() as u32).clamp(1, max_w);
    let out_h = ((sh as f32 * scale).round() as u32).clamp(1, max_h);
    for y in 0..out_h {
        for x in 0..out_w {
            // Sample at the pixel center of the scaled grid.
            let mut sx = (((x as f32 + 0.5) / scale) as u32).min(sw - 1);
            let mut sy = (((y as f32 + 0.5) / scale) as u32).min(sh - 1);
            if flip_bits & 2 != 0 {
                sx = sw - 1 - sx;
            }
            if flip_bits & 1 != 0 {
                sy = sh - 1 - sy;
            }
            let (ux, uy) = if swap { (sy, sx) } else { (sx, sy) };
            let si = ((uy * src.width + ux) * 4) as usize;
            let di = ((y * out_w + x) * 4) as usize;
            dst[di..di + 4].copy_from_slice(&src.pixels[si..si + 4]);
        }
    }
    (out_w, out_h)
}

/// Box-average an RGBA float image down to `out_w` x `out_h`.
pub fn clip_and_zoom_rgba(
    src: &[f32],
    src_w: u32,
    src_h: u32,
    dst: &mut [f32],
    out_w: u32,
    out_h: u32,
) {
    if src_w == 0 || src_h == 0 || out_w == 0 || out_h == 0 {
        return;
    }
    for y in 0..out_h {
        let y0 = y * src_h / out_h;
        let y1 = (((y + 1) * src_h).div_ceil(out_h)).clamp(y0 + 1, src_h);
        for x in 0..out_w {
            let x0 = x * src_w / out_w;
            let x1 = (((x + 1) * src_w).div_ceil(out_w)).clamp(x0 + 1, src_w);
            let mut acc = [0.0f32; 4];
            for sy in y0..y1 {
                for sx in x0..x1 {
                    let si = ((sy * src_w + sx) * 4) as usize;
                    for c in 0..4 {
                        acc[c] += src[si + c];
                    }
                }
            }
            let count = ((y1 - y0) * (x1 - x0)) as f32;
            let di = ((y * out_w + x) * 4) as usize;
            for c in 0..4 {
                dst[di + c] = acc[c] / count;
            }
        }
    }
}

/// Shared half-size demosaic: each output pixel reads one even-aligned 2x2
/// sensor cell, taking R and B from their sites and averaging the two
/// greens. `sample` reads one site as linear float.
fn demosaic_half_size(
    sample: impl Fn(u32, u32) -> f32,
    src_w: u32,
    src_h: u32,
    pattern: FilterPattern,
    dst: &mut [f32],
    out_w: u32,
    out_h: u32,
) {
    if src_w < 2 || src_h < 2 || out_w == 0 || out_h == 0 {
        return;
    }
    for y in 0..out_h {
        let cy = ((y * src_h / out_h) & !1).min(src_h - 2);
        for x in 0..out_w {
            let cx = ((x * src_w / out_w) & !1).min(src_w - 2);
            let mut rgb = [0.0f32; 3];
            let mut greens = 0u32;
            for dy in 0..2 {
                for dx in 0..2 {
                    let channel = pattern.color_at((cy + dy) as usize, (cx + dx) as usize);
                    let value = sample(cx + dx, cy + dy);
                    if channel == 1 {
                        rgb[1] += value;
                        greens += 1;
                    } else {
                        rgb[channel] = value;
                    }
                }
            }
            rgb[1] /= greens.max(1) as f32;
            let di = ((y * out_w + x) * 4) as usize;
            dst[di] = rgb[0];
            dst[di + 1] = rgb[1];
            dst[di + 2] = rgb[2];
            dst[di + 3] = 0.0;
        }
    }
}

/// Half-size demosaic of 16-bit mosaic data, normalized to [0, 1].
pub fn demosaic_half_size_u16(
    src: &[u16],
    src_w: u32,
    src_h: u32,
    pattern: FilterPattern,
    dst: &mut [f32],
    out_w: u32,
    out_h: u32,
) {
    demosaic_half_size(
        |x, y| f32::from(src[(y * src_w + x) as usize]) / 65535.0,
        src_w,
        src_h,
        pattern,
        dst,
        out_w,
        out_h,
    );
}

/// Half-size demosaic of float mosaic data.
pub fn demosaic_half_size_f32(
    src: &[f32],
    src_w: u32,
    src_h: u32,
    pattern: FilterPattern,
    dst: &mut [f32],
    out_w: u32,
    out_h: u32,
) {
    demosaic_half_size(
        |x, y| src[(y * src_w + x) as usize],
        src_w,
        src_h,
        pattern,
        dst,
        out_w,
        out_h,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_rgba8(w: u32, h: u32) -> Rgba8Image {
        let mut pixels = vec![0u8; (w * h * 4) as usize];
        for y in 0..h {
            for x in 0..w {
                let i = ((y * w + x) * 4) as usize;
                pixels[i] = x as u8;
                pixels[i + 1] = y as u8;
                pixels[i + 2] = 0;
                pixels[i + 3] = 0xff;
            }
        }
        Rgba8Image {
            width: w,
            height: h,
            pixels,
        }
    }

    #[test]
    fn zoom_identity_copies_through() {
        let src = gradient_rgba8(4, 4);
        let mut dst = vec![0u8; 64];
        let (w, h) = flip_and_zoom_8(&src, 0, 4, 4, &mut dst);
        assert_eq!((w, h), (4, 4));
        assert_eq!(dst, src.pixels);
    }

    #[test]
    fn zoom_preserves_aspect_within_bounds() {
        let src = gradient_rgba8(8, 4);
        let mut dst = vec![0u8; 4 * 4 * 4];
        let (w, h) = flip_and_zoom_8(&src, 0, 4, 4, &mut dst);
        assert_eq!((w, h), (4, 2));
    }

    #[test]
    fn flip_y_reverses_rows() {
        let src = gradient_rgba8(2, 2);
        let mut dst = vec![0u8; 16];
        flip_and_zoom_8(&src, 1, 2, 2, &mut dst);
        // Row 0 of the output is source row 1 (green channel carries y).
        assert_eq!(dst[1], 1);
        assert_eq!(dst[9], 0);
    }

    #[test]
    fn swap_transposes_dimensions() {
        let src = gradient_rgba8(8, 4);
        let mut dst = vec![0u8; 8 * 8 * 4];
        let (w, h) = flip_and_zoom_8(&src, 4, 8, 8, &mut dst);
        assert_eq!((w, h), (4, 8));
    }

    #[test]
    fn box_reduce_averages_blocks() {
        // 4x4 constant blocks reduce to their values.
        let mut src = vec![0.0f32; 4 * 4 * 4];
        for y in 0..4u32 {
            for x in 0..4u32 {
                let v = if x < 2 { 1.0 } else { 3.0 };
                let i = ((y * 4 + x) * 4) as usize;
                src[i..i + 4].copy_from_slice(&[v, v, v, v]);
            }
        }
        let mut dst = vec![0.0f32; 2 * 2 * 4];
        clip_and_zoom_rgba(&src, 4, 4, &mut dst, 2, 2);
        assert_eq!(dst[0], 1.0);
        assert_eq!(dst[4], 3.0);
    }

    #[test]
    fn demosaic_reads_sites_per_pattern() {
        // One 2x2 Rggb cell: R G / G B.
        let src: Vec<u16> = vec![65535, 32768, 16384, 0];
        let mut dst = vec![0.0f32; 4];
        demosaic_half_size_u16(&src, 2, 2, FilterPattern::Rggb, &mut dst, 1, 1);
        assert!((dst[0] - 1.0).abs() < 1e-4, "red from site (0,0)");
        let expected_green = (32768.0 + 16384.0) / 2.0 / 65535.0;
        assert!((dst[1] - expected_green).abs() < 1e-4, "green averaged");
        assert_eq!(dst[2], 0.0, "blue from site (1,1)");
    }
}
