//! Concurrent keyed cache with per-entry reader/writer leases.
//!
//! The cache serves a fixed arena of payload slots through a hopscotch
//! bucket table. Three guarantees hold for every entry: at most one writer
//! and any number of readers at a time, a bounded total cost enforced by
//! evicting unreferenced entries oldest-first, and a slot-policy callback
//! that distinguishes "present and populated" from "newly created, fill
//! me" on every lookup.
//!
//! Locking is two-level. One table mutex guards the bucket array (key
//! mapping, cost accounting, displacement, eviction selection) and is only
//! ever held for constant-time work. Each entry owns a small mutex +
//! condvar for its reader/writer state; all blocking (waiting out a
//! writer, draining readers for an upgrade) parks on the entry condvar
//! with the table mutex released. Lock order is table before entry,
//! never the reverse.
//!
//! Lease discipline is enforced by types: [`ReadLease`] derefs to `&P`,
//! [`WriteLease`] to `&mut P`; a write lease is only minted by consuming a
//! read lease ([`ReadLease::upgrade`]) or by the slot policy requesting it
//! for a freshly created entry, and [`WriteLease::downgrade`] returns to a
//! read lease. Dropping a lease releases it.

mod sync;
mod table;

use crate::sync::EntrySync;
use crate::table::CacheTable;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

/// Outcome of [`SlotPolicy::fill`] for a newly created entry.
#[derive(Debug, Clone, Copy)]
pub struct SlotInit {
    /// Charged against the cache's cost quota.
    pub cost: i64,
    /// When set, the entry is handed back under a write lease so the
    /// caller can populate it before anyone else reads.
    pub hold_write: bool,
}

/// Per-cache hooks invoked around a slot's lifetime.
///
/// `fill` runs with exclusive access to the slot, outside the table lock,
/// so it may perform I/O; concurrent lookups of the same key block until
/// it finishes. `evict` runs when a slot is reclaimed (eviction or
/// removal), before the storage is reused.
pub trait SlotPolicy<P>: Send + Sync {
    fn fill(&self, key: u32, slot: &mut P) -> SlotInit;

    fn evict(&self, _key: u32, _slot: &mut P) {}
}

/// Construction parameters. `capacity` is rounded up to the next power of
/// two; `neighborhood` is the hopscotch window (typical 16–64) and is
/// clamped to the capacity.
#[derive(Debug, Clone, Copy)]
pub struct CacheParams {
    pub capacity: u32,
    pub neighborhood: u32,
    pub cost_quota: i64,
}

/// Point-in-time counters, mostly for shutdown logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: u32,
    pub size: u32,
    pub cost: i64,
    pub cost_quota: i64,
}

pub struct Cache<P, A: SlotPolicy<P>> {
    table: Mutex<CacheTable>,
    /// Signalled whenever a bucket frees up or an entry becomes evictable,
    /// so a reservation that found every neighbor pinned can retry.
    space: Condvar,
    sync: Box<[EntrySync]>,
    slots: Box<[UnsafeCell<P>]>,
    policy: A,
    cost_quota: i64,
}

// The UnsafeCell slots are shared across threads, but access is gated by
// the per-entry lock state: `&P` is only handed out while `readers > 0`
// and no writer is marked, `&mut P` only while `writer` is set with zero
// readers, and reclamation paths (fill, evict, displacement swap) touch a
// slot only when its state is idle under the table lock. That is exactly
// the RwLock contract, so sharing the cache is sound.
unsafe impl<P: Send + Sync, A: SlotPolicy<P>> Sync for Cache<P, A> {}

/// Result of [`Cache::read_get`]: an existing entry comes back read-leased,
/// a freshly created one comes back write-leased when the slot policy asked
/// for it (the caller is expected to populate and then downgrade).
pub enum CacheHit<'c, P, A: SlotPolicy<P>> {
    Read(ReadLease<'c, P, A>),
    Write(WriteLease<'c, P, A>),
}

impl<'c, P, A: SlotPolicy<P>> CacheHit<'c, P, A> {
    /// Collapse to a read lease, downgrading if the entry came back
    /// write-leased. For policies that never request a write lease this is
    /// the whole story.
    pub fn into_read(self) -> ReadLease<'c, P, A> {
        match self {
            CacheHit::Read(lease) => lease,
            CacheHit::Write(lease) => lease.downgrade(),
        }
    }
}

impl<P, A: SlotPolicy<P>> Cache<P, A> {
    /// Build a cache whose slot arena is populated by `init_slot`, one call
    /// per slot index. The arena never moves or resizes afterwards, so slot
    /// payloads keep stable addresses for the cache's lifetime.
    pub fn new(params: CacheParams, policy: A, mut init_slot: impl FnMut(usize) -> P) -> Self {
        let table = CacheTable::new(params.capacity, params.neighborhood);
        let capacity = table.capacity() as usize;
        let sync = (0..capacity).map(|_| EntrySync::default()).collect();
        let slots = (0..capacity)
            .map(|i| UnsafeCell::new(init_slot(i)))
            .collect();
        tracing::debug!(
            target: "cache",
            capacity,
            neighborhood = table.neighborhood,
            cost_quota = params.cost_quota,
            "cache initialized"
        );
        Cache {
            table: Mutex::new(table),
            space: Condvar::new(),
            sync,
            slots,
            policy,
            cost_quota: params.cost_quota,
        }
    }

    pub fn with_default_slots(params: CacheParams, policy: A) -> Self
    where
        P: Default,
    {
        Self::new(params, policy, |_| P::default())
    }

    pub fn capacity(&self) -> u32 {
        self.table.lock().capacity()
    }

    pub fn size(&self) -> u32 {
        self.table.lock().size
    }

    pub fn cost(&self) -> i64 {
        self.table.lock().cost
    }

    pub fn cost_quota(&self) -> i64 {
        self.cost_quota
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.table.lock();
        CacheStats {
            capacity: table.capacity(),
            size: table.size,
            cost: table.cost,
            cost_quota: self.cost_quota,
        }
    }

    /// Blocking lookup. An existing entry is returned under a read lease,
    /// waiting out a pending writer if necessary. On a miss a slot is
    /// reserved, the policy fills it, and it comes back per the policy's
    /// [`SlotInit`]. The call itself never fails; it can only block.
    pub fn read_get(&self, key: u32) -> CacheHit<'_, P, A> {
        loop {
            let mut table = self.table.lock();

            // Hit path. More than one bucket can match while a removed
            // tenant drains; skip doomed ones.
            let hits: Vec<u32> = table.matches(key).collect();
            let mut busy: Option<u32> = None;
            for idx in hits {
                let mut st = self.sync[idx as usize].state.lock();
                if st.doomed {
                    continue;
                }
                if !st.writer {
                    st.readers += 1;
                    return CacheHit::Read(ReadLease::new(self, idx, key));
                }
                busy = Some(idx);
                break;
            }
            if let Some(idx) = busy {
                // Wait for the writer on the entry condvar, table unlocked.
                // Registering as a waiter pins the bucket.
                let sync = &self.sync[idx as usize];
                let mut st = sync.state.lock();
                if st.doomed {
                    continue;
                }
                st.waiters += 1;
                drop(table);
                while st.writer && !st.doomed {
                    sync.cond.wait(&mut st);
                }
                st.waiters -= 1;
                if st.doomed {
                    sync.cond.notify_all();
                    continue;
                }
                st.readers += 1;
                return CacheHit::Read(ReadLease::new(self, idx, key));
            }

            // Miss path: reserve a bucket (vacancy, displacement, or
            // in-window eviction), then fill outside the table lock while
            // the entry is write-held.
            match self.reserve_slot(&mut table, key) {
                Some(idx) => {
                    drop(table);
                    let init = {
                        // Exclusive: the entry is write-held and nobody
                        // else can reach the slot until that clears.
                        let slot = unsafe { &mut *self.slots[idx as usize].get() };
                        self.policy.fill(key, slot)
                    };
                    let mut table = self.table.lock();
                    table.buckets[idx as usize].cost = init.cost;
                    table.cost += init.cost;
                    self.evict_to_quota(&mut table, idx);
                    drop(table);
                    if init.hold_write {
                        return CacheHit::Write(WriteLease::new(self, idx, key));
                    }
                    let sync = &self.sync[idx as usize];
                    let mut st = sync.state.lock();
                    st.writer = false;
                    st.readers = 1;
                    sync.cond.notify_all();
                    drop(st);
                    return CacheHit::Read(ReadLease::new(self, idx, key));
                }
                None => {
                    // Every neighbor is referenced. Rare with sane sizing
                    // (entries >= 2x parallelism); wait for a release.
                    tracing::trace!(target: "cache", key, "neighborhood saturated, waiting for a slot");
                    self.space.wait(&mut table);
                }
            }
        }
    }

    /// Non-blocking lookup: a read lease if the entry is present and not
    /// write-held, otherwise `None`. Never creates an entry.
    pub fn read_testget(&self, key: u32) -> Option<ReadLease<'_, P, A>> {
        let table = self.table.lock();
        let hits: Vec<u32> = table.matches(key).collect();
        for idx in hits {
            let mut st = self.sync[idx as usize].state.lock();
            if st.doomed || st.writer {
                continue;
            }
            st.readers += 1;
            return Some(ReadLease::new(self, idx, key));
        }
        None
    }

    /// Make `key` ineligible for future lookups. Storage is reclaimed now
    /// if the entry is unreferenced, otherwise when the last lease drops.
    pub fn remove(&self, key: u32) {
        let mut table = self.table.lock();
        let hits: Vec<u32> = table.matches(key).collect();
        for idx in hits {
            let mut st = self.sync[idx as usize].state.lock();
            if st.doomed {
                continue;
            }
            if st.idle() {
                drop(st);
                self.evict_slot(&mut table, idx);
                self.space.notify_all();
            } else {
                st.doomed = true;
            }
        }
    }

    /// Visit every live entry under a read lease. The visited set is a
    /// snapshot: entries inserted after the call starts may be skipped,
    /// entries removed concurrently are skipped. Visitor errors stop the
    /// iteration and propagate.
    pub fn for_all<E>(&self, mut visitor: impl FnMut(u32, &P) -> Result<(), E>) -> Result<(), E> {
        let snapshot: Vec<(u32, u32, u64)> = {
            let table = self.table.lock();
            table
                .live_oldest_first()
                .into_iter()
                .map(|idx| {
                    let b = &table.buckets[idx as usize];
                    (idx, b.key, b.stamp)
                })
                .collect()
        };
        for (idx, key, stamp) in snapshot {
            if let Some(lease) = self.acquire_read_at(idx, key, stamp) {
                let result = visitor(key, &lease);
                drop(lease);
                result?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Internal: slot reservation, displacement, eviction
    // ---------------------------------------------------------------------

    fn entry_idle(&self, idx: u32) -> bool {
        self.sync[idx as usize].state.lock().idle()
    }

    /// Claim a bucket for `key` and mark it write-held for the fill. All
    /// under the table lock.
    fn reserve_slot(&self, table: &mut CacheTable, key: u32) -> Option<u32> {
        let idx = self
            .vacant_slot(table, key)
            .or_else(|| self.evict_in_window(table, key))?;
        table.claim(idx, key);
        let mut st = self.sync[idx as usize].state.lock();
        debug_assert!(st.idle(), "claimed bucket had live lock state");
        st.writer = true;
        Some(idx)
    }

    /// A vacant bucket inside `key`'s window, bubbling a distant vacancy
    /// back through idle tenants when the window itself is full.
    fn vacant_slot(&self, table: &mut CacheTable, key: u32) -> Option<u32> {
        if let Some(idx) = table.vacant_in_window(key) {
            return Some(idx);
        }
        let mut free = table.vacant_anywhere(key)?;
        let home = table.home(key);
        while table.distance(home, free) >= table.neighborhood {
            let mut moved = false;
            // Farthest-back candidate first: it makes the most progress.
            for d in (1..table.neighborhood).rev() {
                let cand = free.wrapping_sub(d) & table.mask;
                let b = table.buckets[cand as usize];
                if !b.occupied {
                    continue;
                }
                // The tenant must stay inside its own window after the move
                // and must not be referenced or awaited.
                if table.distance(table.home(b.key), free) >= table.neighborhood {
                    continue;
                }
                if !self.entry_idle(cand) {
                    continue;
                }
                table.relocate(cand, free);
                // Idle tenant under the table lock: no lease can reach
                // either slot while we hold it.
                unsafe {
                    std::ptr::swap(
                        self.slots[cand as usize].get(),
                        self.slots[free as usize].get(),
                    );
                }
                free = cand;
                moved = true;
                break;
            }
            if !moved {
                return None;
            }
        }
        Some(free)
    }

    /// Oldest idle tenant in `key`'s window, evicted to make room.
    fn evict_in_window(&self, table: &mut CacheTable, key: u32) -> Option<u32> {
        let victim = table
            .window(key)
            .filter(|&i| table.buckets[i as usize].occupied && self.entry_idle(i))
            .min_by_key(|&i| table.buckets[i as usize].stamp)?;
        self.evict_slot(table, victim);
        Some(victim)
    }

    fn evict_slot(&self, table: &mut CacheTable, idx: u32) {
        let key = table.buckets[idx as usize].key;
        // Idle under the table lock: exclusive access.
        unsafe {
            self.policy.evict(key, &mut *self.slots[idx as usize].get());
        }
        let cost = table.vacate(idx);
        tracing::trace!(target: "cache", key, cost, "evicted entry");
    }

    /// Evict unreferenced entries oldest-first until cost fits the quota.
    /// If the scan runs dry the overshoot stands until releases catch up.
    fn evict_to_quota(&self, table: &mut CacheTable, protect: u32) {
        if table.cost <= self.cost_quota {
            return;
        }
        for idx in table.live_oldest_first() {
            if table.cost <= self.cost_quota {
                return;
            }
            if idx == protect || !table.buckets[idx as usize].occupied {
                continue;
            }
            if self.entry_idle(idx) {
                self.evict_slot(table, idx);
            }
        }
        if table.cost > self.cost_quota {
            tracing::debug!(
                target: "cache",
                cost = table.cost,
                quota = self.cost_quota,
                "cost quota exceeded with no evictable entry"
            );
        }
    }

    /// Pin a snapshot entry for reading, validating that the bucket still
    /// holds the same tenant (stamp check). Waits out a writer; returns
    /// `None` if the tenant is gone or doomed.
    fn acquire_read_at(&self, idx: u32, key: u32, stamp: u64) -> Option<ReadLease<'_, P, A>> {
        let table = self.table.lock();
        {
            let b = &table.buckets[idx as usize];
            if !b.occupied || b.key != key || b.stamp != stamp {
                return None;
            }
        }
        let sync = &self.sync[idx as usize];
        let mut st = sync.state.lock();
        if st.doomed {
            return None;
        }
        if !st.writer {
            st.readers += 1;
            return Some(ReadLease::new(self, idx, key));
        }
        st.waiters += 1;
        drop(table);
        while st.writer && !st.doomed {
            sync.cond.wait(&mut st);
        }
        st.waiters -= 1;
        if st.doomed {
            sync.cond.notify_all();
            return None;
        }
        st.readers += 1;
        Some(ReadLease::new(self, idx, key))
    }

    // ---------------------------------------------------------------------
    // Internal: lease transitions
    // ---------------------------------------------------------------------

    fn release_read(&self, idx: u32) {
        let sync = &self.sync[idx as usize];
        let mut st = sync.state.lock();
        debug_assert!(st.readers >= 1 && !st.writer);
        st.readers -= 1;
        let drained = st.readers == 0;
        let doomed = st.doomed;
        // Upgraders wait for the reader count, so notify on every drop.
        sync.cond.notify_all();
        drop(st);
        if drained {
            if doomed {
                self.try_free(idx);
            }
            self.signal_space();
        }
    }

    fn release_write(&self, idx: u32) {
        let sync = &self.sync[idx as usize];
        let mut st = sync.state.lock();
        debug_assert!(st.writer && st.readers == 0);
        st.writer = false;
        let doomed = st.doomed;
        sync.cond.notify_all();
        drop(st);
        if doomed {
            self.try_free(idx);
        }
        self.signal_space();
    }

    /// Wake reservation waiters. The table lock is taken first so the
    /// notify cannot slip between a waiter's failed scan and its wait
    /// (which releases the lock atomically).
    fn signal_space(&self) {
        let _table = self.table.lock();
        self.space.notify_all();
    }

    /// Trade this thread's read lease for the writer mark, blocking until
    /// every other reader has released and no writer is present. The read
    /// lease is given up before waiting so that two threads upgrading the
    /// same entry resolve sequentially instead of deadlocking; the waiter
    /// registration keeps the entry pinned across the trade.
    fn upgrade_read(&self, idx: u32) {
        let sync = &self.sync[idx as usize];
        let mut st = sync.state.lock();
        debug_assert!(st.readers >= 1 && !st.writer);
        st.waiters += 1;
        st.readers -= 1;
        // Other upgraders watch the reader count.
        sync.cond.notify_all();
        while st.readers > 0 || st.writer {
            sync.cond.wait(&mut st);
        }
        st.waiters -= 1;
        st.writer = true;
    }

    fn downgrade_write(&self, idx: u32) {
        let sync = &self.sync[idx as usize];
        let mut st = sync.state.lock();
        debug_assert!(st.writer && st.readers == 0);
        st.writer = false;
        st.readers = 1;
        sync.cond.notify_all();
    }

    /// Reclaim a doomed bucket once it is fully unreferenced.
    fn try_free(&self, idx: u32) {
        let mut table = self.table.lock();
        let freed = {
            let mut st = self.sync[idx as usize].state.lock();
            if st.doomed && st.readers == 0 && !st.writer && st.waiters == 0 {
                st.doomed = false;
                true
            } else {
                false
            }
        };
        if freed {
            self.evict_slot(&mut table, idx);
            self.space.notify_all();
        }
    }
}

/// Proof of a read lock on one entry. Derefs to the payload; dropping it
/// releases the lock. Must not outlive the access it proves: the payload
/// reference cannot escape the lease by construction.
pub struct ReadLease<'c, P, A: SlotPolicy<P>> {
    cache: &'c Cache<P, A>,
    idx: u32,
    key: u32,
}

impl<'c, P, A: SlotPolicy<P>> ReadLease<'c, P, A> {
    fn new(cache: &'c Cache<P, A>, idx: u32, key: u32) -> Self {
        ReadLease { cache, idx, key }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    /// Upgrade to an exclusive write lease, blocking until every other
    /// reader of this entry has released. Consumes the read lease.
    pub fn upgrade(self) -> WriteLease<'c, P, A> {
        let (cache, idx, key) = (self.cache, self.idx, self.key);
        std::mem::forget(self);
        cache.upgrade_read(idx);
        WriteLease { cache, idx, key }
    }

    /// Explicit release; identical to dropping the lease.
    pub fn release(self) {}
}

impl<P, A: SlotPolicy<P>> Deref for ReadLease<'_, P, A> {
    type Target = P;

    fn deref(&self) -> &P {
        // readers > 0 excludes any writer for the lease's lifetime.
        unsafe { &*self.cache.slots[self.idx as usize].get() }
    }
}

impl<P, A: SlotPolicy<P>> Drop for ReadLease<'_, P, A> {
    fn drop(&mut self) {
        self.cache.release_read(self.idx);
    }
}

/// Proof of the exclusive write lock on one entry. Derefs mutably to the
/// payload. Dropping releases the entry entirely; [`WriteLease::downgrade`]
/// keeps it held for reading.
pub struct WriteLease<'c, P, A: SlotPolicy<P>> {
    cache: &'c Cache<P, A>,
    idx: u32,
    key: u32,
}

impl<'c, P, A: SlotPolicy<P>> WriteLease<'c, P, A> {
    fn new(cache: &'c Cache<P, A>, idx: u32, key: u32) -> Self {
        WriteLease { cache, idx, key }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    /// Swap in a replacement payload, returning the previous one. This is
    /// how growable payloads are re-allocated mid-write.
    pub fn replace(&mut self, new: P) -> P {
        std::mem::replace(&mut **self, new)
    }

    /// Drop the writer mark but keep a read lease on the entry.
    pub fn downgrade(self) -> ReadLease<'c, P, A> {
        let (cache, idx, key) = (self.cache, self.idx, self.key);
        std::mem::forget(self);
        cache.downgrade_write(idx);
        ReadLease::new(cache, idx, key)
    }

    /// Explicit full release; identical to dropping the lease.
    pub fn release(self) {}
}

impl<P, A: SlotPolicy<P>> Deref for WriteLease<'_, P, A> {
    type Target = P;

    fn deref(&self) -> &P {
        unsafe { &*self.cache.slots[self.idx as usize].get() }
    }
}

impl<P, A: SlotPolicy<P>> DerefMut for WriteLease<'_, P, A> {
    fn deref_mut(&mut self) -> &mut P {
        // The writer mark with zero readers is exclusive ownership.
        unsafe { &mut *self.cache.slots[self.idx as usize].get() }
    }
}

impl<P, A: SlotPolicy<P>> Drop for WriteLease<'_, P, A> {
    fn drop(&mut self) {
        self.cache.release_write(self.idx);
    }
}
