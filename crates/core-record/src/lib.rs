//! Image-record cache: every read and edit of image metadata in the
//! application goes through here. A concurrent cache instance holds a slab
//! of records keyed by image id, loading rows from the record store on
//! miss and writing them back on write release (write-through), with an
//! optional sidecar file sync for disaster recovery.
//!
//! The contract is total: a store miss or store error yields a wiped
//! record with `id == 0` rather than an error, so callers always get a
//! record and test the id. Identifier zero is reserved and rejected at
//! this boundary.

pub mod record;
pub mod sidecar;
pub mod store;

pub use record::{FilterPattern, ImageFlags, ImageRecord, LegacyFlip};
pub use store::{MemoryRecordStore, RecordStore, StoreError, MEMORY_STORE_PATH};

use core_cache::{Cache, CacheParams, CacheStats, ReadLease, SlotInit, SlotPolicy, WriteLease};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// What to do with the sidecar when a written record is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write through to the store and sync the sidecar file now.
    Safe,
    /// Write through to the store; the sidecar waits for shutdown.
    Relaxed,
}

/// Slot policy for the record slab: a miss queries the store and populates
/// the slot in place, a reclaim wipes it so ratings cannot bleed into the
/// next tenant.
pub struct RecordPolicy {
    store: Arc<dyn RecordStore>,
}

impl SlotPolicy<ImageRecord> for RecordPolicy {
    fn fill(&self, key: u32, slot: &mut ImageRecord) -> SlotInit {
        slot.wipe();
        match self.store.fetch_record(key as i32) {
            Ok(Some(row)) => {
                *slot = row;
                slot.clamp_strings();
                slot.derive_bpp();
            }
            Ok(None) => {
                tracing::debug!(target: "record", image = key, "no row in store, serving empty record");
            }
            Err(error) => {
                tracing::warn!(
                    target: "record",
                    image = key,
                    error = %error,
                    "record fetch failed, serving empty record"
                );
            }
        }
        SlotInit {
            cost: std::mem::size_of::<ImageRecord>() as i64,
            hold_write: false,
        }
    }

    fn evict(&self, _key: u32, slot: &mut ImageRecord) {
        slot.wipe();
    }
}

/// The process-wide image-record cache.
pub struct ImageCache {
    cache: Cache<ImageRecord, RecordPolicy>,
    store: Arc<dyn RecordStore>,
    /// Ids whose sidecar write was deferred by a relaxed release.
    dirty_sidecars: Mutex<HashSet<i32>>,
}

impl ImageCache {
    /// Size the cache from a memory budget. The slot count leaves headroom
    /// over the byte quota so the quota, not the table, is the limiting
    /// factor.
    pub fn new(store: Arc<dyn RecordStore>, max_mem_bytes: usize) -> Self {
        let record_size = std::mem::size_of::<ImageRecord>().max(1);
        let capacity = ((max_mem_bytes as f64 * 1.5) / record_size as f64).max(2.0) as u32;
        let cache = Cache::with_default_slots(
            CacheParams {
                capacity,
                neighborhood: 64,
                cost_quota: max_mem_bytes as i64,
            },
            RecordPolicy {
                store: Arc::clone(&store),
            },
        );
        tracing::debug!(
            target: "record",
            entries = cache.capacity(),
            quota_bytes = max_mem_bytes,
            "image record cache initialized"
        );
        ImageCache {
            cache,
            store,
            dirty_sidecars: Mutex::new(HashSet::new()),
        }
    }

    /// Blocking read of the record for `id`. `None` only for `id <= 0`;
    /// an unknown id comes back as a record with `id == 0`.
    pub fn read_get(&self, id: i32) -> Option<RecordReadLease<'_>> {
        if id <= 0 {
            return None;
        }
        Some(RecordReadLease {
            inner: self.cache.read_get(id as u32).into_read(),
            cache: self,
        })
    }

    /// Non-blocking read; `None` when absent, being written, or `id <= 0`.
    pub fn read_testget(&self, id: i32) -> Option<RecordReadLease<'_>> {
        if id <= 0 {
            return None;
        }
        Some(RecordReadLease {
            inner: self.cache.read_testget(id as u32)?,
            cache: self,
        })
    }

    /// Drop `id` from the cache without touching the store.
    pub fn remove(&self, id: i32) {
        if id > 0 {
            self.cache.remove(id as u32);
        }
    }

    /// Write the sidecars deferred by relaxed releases. Called once at
    /// shutdown; failures are logged and skipped.
    pub fn flush_sidecars(&self) {
        let ids: Vec<i32> = self.dirty_sidecars.lock().drain().collect();
        for id in ids {
            let Some(lease) = self.read_get(id) else {
                continue;
            };
            if lease.id == 0 {
                continue;
            }
            let Some(path) = self.store.image_path(id) else {
                tracing::warn!(target: "record", image = id, "no image path, sidecar skipped");
                continue;
            };
            if let Err(error) = sidecar::write_sidecar(&path, &lease) {
                tracing::warn!(target: "record", image = id, error = %error, "deferred sidecar write failed");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The record store this cache writes through to.
    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    fn write_through(&self, record: &ImageRecord, mode: WriteMode) {
        if record.id <= 0 {
            return;
        }
        if let Err(error) = self.store.update_record(record) {
            tracing::warn!(
                target: "record",
                image = record.id,
                error = %error,
                "record write-through failed; sidecar remains the recovery path"
            );
        }
        match mode {
            WriteMode::Safe => match self.store.image_path(record.id) {
                Some(path) => {
                    if let Err(error) = sidecar::write_sidecar(&path, record) {
                        tracing::warn!(target: "record", image = record.id, error = %error, "sidecar write failed");
                    }
                }
                None => {
                    tracing::warn!(target: "record", image = record.id, "no image path, sidecar skipped");
                }
            },
            WriteMode::Relaxed => {
                self.dirty_sidecars.lock().insert(record.id);
            }
        }
    }
}

/// Read access to one cached record. Dropping releases the read lock.
pub struct RecordReadLease<'c> {
    inner: ReadLease<'c, ImageRecord, RecordPolicy>,
    cache: &'c ImageCache,
}

impl<'c> RecordReadLease<'c> {
    /// Exchange the read lock for the exclusive write lock, blocking until
    /// every other reader of this record has released.
    pub fn upgrade(self) -> RecordWriteLease<'c> {
        RecordWriteLease {
            inner: self.inner.upgrade(),
            cache: self.cache,
        }
    }

    /// Explicit release; identical to dropping the lease.
    pub fn release(self) {}
}

impl Deref for RecordReadLease<'_> {
    type Target = ImageRecord;

    fn deref(&self) -> &ImageRecord {
        &self.inner
    }
}

/// Exclusive write access to one cached record. [`RecordWriteLease::release`]
/// commits the edit (write-through plus sidecar policy) and downgrades back
/// to a read lease; dropping instead abandons the write-through.
pub struct RecordWriteLease<'c> {
    inner: WriteLease<'c, ImageRecord, RecordPolicy>,
    cache: &'c ImageCache,
}

impl<'c> RecordWriteLease<'c> {
    /// Commit: update the store, apply the sidecar policy, keep reading.
    pub fn release(self, mode: WriteMode) -> RecordReadLease<'c> {
        let cache = self.cache;
        cache.write_through(&self.inner, mode);
        RecordReadLease {
            inner: self.inner.downgrade(),
            cache,
        }
    }
}

impl Deref for RecordWriteLease<'_> {
    type Target = ImageRecord;

    fn deref(&self) -> &ImageRecord {
        &self.inner
    }
}

impl DerefMut for RecordWriteLease<'_> {
    fn deref_mut(&mut self) -> &mut ImageRecord {
        &mut self.inner
    }
}
