//! Per-entry lock state.
//!
//! Every bucket owns one `EntrySync`. The mutex protects only the small
//! `LockState`; payload bytes are reached through the leases in `lib.rs`
//! once the state grants access. Threads park on `cond` when they need a
//! writer to finish (`read_get` on a generating entry) or other readers to
//! drain (lease upgrade). The bucket-table mutex is never held while
//! parking here.

use parking_lot::{Condvar, Mutex};

/// Reader/writer accounting for one cache entry.
///
/// State space: either `writer` is set and `readers == 0`, or `writer` is
/// clear and `readers` counts granted read leases. `waiters` counts threads
/// parked on the condvar; a bucket with waiters is pinned (it may not be
/// displaced, evicted, or freed). `doomed` marks an entry removed from
/// lookup whose storage is reclaimed when the last holder lets go.
#[derive(Debug, Default)]
pub(crate) struct LockState {
    pub readers: u32,
    pub writer: bool,
    pub waiters: u32,
    pub doomed: bool,
}

impl LockState {
    /// An idle entry can be displaced, evicted, or have its bucket reused.
    pub fn idle(&self) -> bool {
        self.readers == 0 && !self.writer && self.waiters == 0 && !self.doomed
    }
}

#[derive(Debug, Default)]
pub(crate) struct EntrySync {
    pub state: Mutex<LockState>,
    pub cond: Condvar,
}
