//! Sidecar files: a TOML rendition of the image record written next to the
//! image, so edits survive a lost or corrupted library database. Written
//! immediately in safe mode, deferred to shutdown in relaxed mode.

use crate::record::ImageRecord;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const SIDECAR_SUFFIX: &str = ".sidecar.toml";

/// Document wrapper so the file reads `[image]` at the top.
#[derive(Debug, Serialize, Deserialize)]
struct SidecarDoc {
    image: ImageRecord,
}

/// `IMG_0042.raw` -> `IMG_0042.raw.sidecar.toml`, keeping the original
/// extension so duplicates with different extensions stay distinct.
pub fn sidecar_path(image_path: &Path) -> PathBuf {
    let mut name = OsString::from(image_path.as_os_str());
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

pub fn write_sidecar(image_path: &Path, record: &ImageRecord) -> std::io::Result<()> {
    let doc = SidecarDoc {
        image: record.clone(),
    };
    let body = toml::to_string(&doc).map_err(std::io::Error::other)?;
    std::fs::write(sidecar_path(image_path), body)
}

pub fn read_sidecar(image_path: &Path) -> std::io::Result<ImageRecord> {
    let body = std::fs::read_to_string(sidecar_path(image_path))?;
    let doc: SidecarDoc = toml::from_str(&body).map_err(std::io::Error::other)?;
    Ok(doc.image)
}
