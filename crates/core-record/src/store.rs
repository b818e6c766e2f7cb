//! The record store collaborator: the prepared-statement boundary behind
//! which the relational library lives. The cache only needs single-row
//! fetch and update by image id, the store's own file path (to name the
//! on-disk thumbnail snapshot), and full image paths for the loaders.

use crate::record::ImageRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Sentinel path of a store that has no backing file; nothing derived
/// from the store path (thumbnail snapshots, sidecar discovery) persists.
pub const MEMORY_STORE_PATH: &str = ":memory:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record query failed: {0}")]
    Query(String),
    #[error("record update failed: {0}")]
    Update(String),
}

pub trait RecordStore: Send + Sync {
    /// Fetch the record row for `id`, `None` when no such image exists.
    fn fetch_record(&self, id: i32) -> Result<Option<ImageRecord>, StoreError>;

    /// Update every semantic field of `record` keyed by its id.
    fn update_record(&self, record: &ImageRecord) -> Result<(), StoreError>;

    /// Absolute path of the store's backing file, or [`MEMORY_STORE_PATH`].
    fn path(&self) -> String;

    /// Absolute path of the image file behind `id`, if the store knows it.
    fn image_path(&self, id: i32) -> Option<PathBuf>;

    /// Whether `id` carries any develop history. Altered images must not
    /// use their embedded preview as a thumbnail, since the preview shows
    /// the unedited picture.
    fn image_altered(&self, _id: i32) -> bool {
        false
    }
}

/// Hash-map store used by tests and by library-less sessions. Counts
/// updates so write-through behavior is observable.
#[derive(Default)]
pub struct MemoryRecordStore {
    rows: Mutex<HashMap<i32, (ImageRecord, Option<PathBuf>)>>,
    path: Option<PathBuf>,
    updates: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A memory store that still reports a backing path, for exercising
    /// path-derived behavior (snapshot file naming) without a database.
    pub fn with_path(path: PathBuf) -> Self {
        MemoryRecordStore {
            path: Some(path),
            ..Self::default()
        }
    }

    pub fn insert(&self, record: ImageRecord, image_path: Option<PathBuf>) {
        self.rows.lock().insert(record.id, (record, image_path));
    }

    pub fn get(&self, id: i32) -> Option<ImageRecord> {
        self.rows.lock().get(&id).map(|(r, _)| r.clone())
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl RecordStore for MemoryRecordStore {
    fn fetch_record(&self, id: i32) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.rows.lock().get(&id).map(|(r, _)| r.clone()))
    }

    fn update_record(&self, record: &ImageRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&record.id) {
            Some((row, _)) => {
                *row = record.clone();
                self.updates.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(StoreError::Update(format!("no row for image {}", record.id))),
        }
    }

    fn path(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| MEMORY_STORE_PATH.to_string())
    }

    fn image_path(&self, id: i32) -> Option<PathBuf> {
        self.rows.lock().get(&id).and_then(|(_, p)| p.clone())
    }
}
