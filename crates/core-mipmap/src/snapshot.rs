//! On-disk thumbnail snapshot: the smallest pre-sized tiers are written at
//! shutdown and restored at startup so a fresh session has thumbnails
//! before any file is re-decoded. Larger tiers regenerate quickly from the
//! full buffer and are deliberately not persisted.
//!
//! File layout, little-endian:
//!
//! ```text
//! u32 magic + version (single word)
//! for tier in 0..=persisted: i32 max_width, i32 max_height
//! entries until EOF: i32 tier, i32 key, i32 length, length JPEG bytes
//! ```
//!
//! Any mismatch (version, tier dimensions, truncated content) discards the
//! whole file; a cache rebuilt from nothing is always preferable to one
//! decoded from a stale layout.

use crate::key::{self, MipSize};
use crate::MipmapCache;
use anyhow::Context;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_MAGIC: u32 = 0x4d50_4300;
pub const SNAPSHOT_VERSION: u32 = 2;

/// Highest tier written to disk; everything at or below goes in the file.
pub const PERSISTED_TIER: MipSize = MipSize::Mip2;

/// Snapshot file for a given record store: cache dir + digest of the
/// store's canonical path, so each library gets its own thumbnails.
/// `None` for an in-memory store, which never persists.
pub fn snapshot_filename(cache_dir: &Path, store_path: &str) -> Option<PathBuf> {
    if store_path == core_record::MEMORY_STORE_PATH {
        return None;
    }
    let canonical = fs::canonicalize(store_path).unwrap_or_else(|_| PathBuf::from(store_path));
    let digest = Sha256::digest(canonical.as_os_str().as_encoded_bytes());
    Some(cache_dir.join(format!("mipmaps-{}", hex::encode(digest))))
}

fn write_i32(out: &mut impl Write, value: i32) -> std::io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn read_u32(input: &mut impl Read) -> std::io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32(input: &mut impl Read) -> std::io::Result<i32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

/// Write all populated entries of the persisted tiers. Entries still
/// needing generation, and anything 8x8 or smaller (dead sentinels
/// included), are skipped as not worth the bytes.
pub(crate) fn snapshot(cache: &MipmapCache, path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create cache dir {}", dir.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create snapshot {}", path.display()))?;
    let mut out = BufWriter::new(file);

    out.write_all(&(SNAPSHOT_MAGIC + SNAPSHOT_VERSION).to_le_bytes())?;
    for k in 0..=PERSISTED_TIER.index() {
        let tier = cache.tier(key::ALL[k]);
        write_i32(&mut out, tier.max_width as i32)?;
        write_i32(&mut out, tier.max_height as i32)?;
    }

    let quality = cache.snapshot_quality;
    let mut written = 0u32;
    for k in 0..=PERSISTED_TIER.index() {
        let tier = cache.tier(key::ALL[k]);
        tier.cache.for_all(|entry_key, slot| -> anyhow::Result<()> {
            let header = &slot.header;
            if header.needs_generation() {
                return Ok(());
            }
            if header.width <= 8 && header.height <= 8 {
                return Ok(());
            }
            let bytes = (header.width * header.height * 4) as usize;
            let data = cache
                .codec
                .compress(&slot.pixels()[..bytes], header.width, header.height, quality)
                .context("compress thumbnail")?;
            write_i32(&mut out, k as i32)?;
            write_i32(&mut out, entry_key as i32)?;
            write_i32(&mut out, data.len() as i32)?;
            out.write_all(&data)?;
            written += 1;
            Ok(())
        })?;
    }
    out.flush()?;
    tracing::debug!(
        target: "mipmap.snapshot",
        entries = written,
        path = %path.display(),
        "thumbnail snapshot written"
    );
    Ok(())
}

enum RestoreOutcome {
    Done(u32),
    Discard(&'static str),
}

/// Read the snapshot back into a freshly built cache. A missing file is a
/// clean cold start; any structural mismatch deletes the file and leaves
/// the cache empty. Individual thumbnails that fail to decode keep their
/// needs-generation state and are re-rendered lazily.
pub(crate) fn restore(cache: &MipmapCache, path: &Path) -> anyhow::Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(target: "mipmap.snapshot", "no snapshot on disk, starting cold");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("open snapshot {}", path.display())),
    };
    let mut input = BufReader::new(file);
    match restore_entries(cache, &mut input) {
        Ok(RestoreOutcome::Done(restored)) => {
            tracing::debug!(target: "mipmap.snapshot", restored, "thumbnail snapshot restored");
            Ok(())
        }
        Ok(RestoreOutcome::Discard(reason)) => {
            tracing::info!(target: "mipmap.snapshot", reason, path = %path.display(), "discarding snapshot");
            let _ = fs::remove_file(path);
            Ok(())
        }
        Err(error) => {
            tracing::warn!(
                target: "mipmap.snapshot",
                error = %error,
                path = %path.display(),
                "snapshot unreadable, discarding"
            );
            let _ = fs::remove_file(path);
            Ok(())
        }
    }
}

fn restore_entries(
    cache: &MipmapCache,
    input: &mut impl Read,
) -> anyhow::Result<RestoreOutcome> {
    let magic = read_u32(input).context("read magic")?;
    if magic != SNAPSHOT_MAGIC + SNAPSHOT_VERSION {
        return Ok(RestoreOutcome::Discard("magic or version mismatch"));
    }
    for k in 0..=PERSISTED_TIER.index() {
        let width = read_i32(input).context("read tier width")?;
        let height = read_i32(input).context("read tier height")?;
        let tier = cache.tier(key::ALL[k]);
        if width != tier.max_width as i32 || height != tier.max_height as i32 {
            return Ok(RestoreOutcome::Discard("tier dimensions changed"));
        }
    }

    let mut restored = 0u32;
    loop {
        let tier_id = match read_i32(input) {
            Ok(v) => v,
            // Clean end of file.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("read entry tier"),
        };
        if tier_id < 0 || tier_id as usize > PERSISTED_TIER.index() {
            break;
        }
        let tier = cache.tier(key::ALL[tier_id as usize]);
        let entry_key = read_i32(input).context("read entry key")?;
        let length = read_i32(input).context("read entry length")?;
        let max_bytes = (tier.max_width * tier.max_height * 4) as i32;
        if length <= 0 || length > max_bytes {
            return Ok(RestoreOutcome::Discard("entry length out of range"));
        }
        let mut data = vec![0u8; length as usize];
        input.read_exact(&mut data).context("read entry payload")?;

        match tier.cache.read_get(entry_key as u32) {
            core_cache::CacheHit::Write(mut slot) => {
                match cache.codec.decompress_header(&data) {
                    Ok((w, h)) if w > 0 && h > 0 && w <= tier.max_width && h <= tier.max_height => {
                        let bytes = (w * h * 4) as usize;
                        match cache.codec.decompress(&data, &mut slot.pixels_mut()[..bytes]) {
                            Ok(()) => {
                                slot.header.width = w;
                                slot.header.height = h;
                                slot.header.mark_clean();
                                restored += 1;
                            }
                            Err(error) => {
                                tracing::warn!(
                                    target: "mipmap.snapshot",
                                    key = entry_key,
                                    error = %error,
                                    "thumbnail decode failed, will regenerate"
                                );
                            }
                        }
                    }
                    Ok((w, h)) => {
                        tracing::warn!(
                            target: "mipmap.snapshot",
                            key = entry_key,
                            width = w,
                            height = h,
                            "thumbnail exceeds tier bounds, will regenerate"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(
                            target: "mipmap.snapshot",
                            key = entry_key,
                            error = %error,
                            "thumbnail header unreadable, will regenerate"
                        );
                    }
                }
                drop(slot);
            }
            // Duplicate key in the file; the first occurrence won.
            core_cache::CacheHit::Read(lease) => drop(lease),
        }
    }
    Ok(RestoreOutcome::Done(restored))
}
