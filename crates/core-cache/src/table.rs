//! Hopscotch bucket table.
//!
//! Plain data guarded by the cache's table mutex: key-to-bucket mapping,
//! per-bucket cost and insertion stamp, aggregate size/cost counters. Any
//! live key resides within `neighborhood` positions of its home bucket
//! `key & mask`, so lookups touch a constant-bounded window. Displacement
//! (bubbling a distant free bucket back into the window) and eviction
//! victim selection need lock-state knowledge and therefore live in
//! `lib.rs`; this module only exposes the raw scans.

/// One bucket. `occupied == false` means `key`, `cost` and `stamp` are
/// meaningless. Key values are opaque to the table, including zero.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bucket {
    pub key: u32,
    pub occupied: bool,
    pub cost: i64,
    pub stamp: u64,
}

impl Bucket {
    const fn vacant() -> Self {
        Bucket {
            key: 0,
            occupied: false,
            cost: 0,
            stamp: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CacheTable {
    pub buckets: Box<[Bucket]>,
    pub mask: u32,
    pub neighborhood: u32,
    pub size: u32,
    pub cost: i64,
    next_stamp: u64,
}

/// Smallest power of two >= `n`, with a floor of 2 so the neighborhood
/// window always has room to wrap.
pub(crate) fn next_power_of_two(n: u32) -> u32 {
    n.max(2).next_power_of_two()
}

impl CacheTable {
    pub fn new(capacity_request: u32, neighborhood: u32) -> Self {
        let capacity = next_power_of_two(capacity_request);
        let neighborhood = neighborhood.clamp(1, capacity);
        CacheTable {
            buckets: vec![Bucket::vacant(); capacity as usize].into_boxed_slice(),
            mask: capacity - 1,
            neighborhood,
            size: 0,
            cost: 0,
            next_stamp: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    pub fn home(&self, key: u32) -> u32 {
        key & self.mask
    }

    /// Wrapped distance from `from` forward to `to`.
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        to.wrapping_sub(from) & self.mask
    }

    /// All bucket indices in the neighborhood window of `key`, in probe order.
    pub fn window(&self, key: u32) -> impl Iterator<Item = u32> + '_ {
        let home = self.home(key);
        (0..self.neighborhood).map(move |i| (home + i) & self.mask)
    }

    /// Occupied buckets in `key`'s window whose key matches. More than one
    /// can match transiently while an old tenant drains after `remove`, so
    /// this yields all of them and the caller filters by lock state.
    pub fn matches(&self, key: u32) -> impl Iterator<Item = u32> + '_ {
        self.window(key)
            .filter(move |&idx| self.buckets[idx as usize].occupied && self.buckets[idx as usize].key == key)
    }

    /// First vacant bucket in `key`'s window.
    pub fn vacant_in_window(&self, key: u32) -> Option<u32> {
        self.window(key)
            .find(|&idx| !self.buckets[idx as usize].occupied)
    }

    /// First vacant bucket probing forward from `key`'s home across the
    /// whole table. Used as the bubble seed when the window is full.
    pub fn vacant_anywhere(&self, key: u32) -> Option<u32> {
        let home = self.home(key);
        (0..self.capacity())
            .map(|i| (home + i) & self.mask)
            .find(|&idx| !self.buckets[idx as usize].occupied)
    }

    /// Claim `idx` for `key`. The caller has already established that the
    /// bucket is vacant and that `idx` lies in `key`'s window.
    pub fn claim(&mut self, idx: u32, key: u32) {
        let b = &mut self.buckets[idx as usize];
        debug_assert!(!b.occupied);
        b.key = key;
        b.occupied = true;
        b.cost = 0;
        b.stamp = self.next_stamp;
        self.next_stamp += 1;
        self.size += 1;
    }

    /// Release `idx` back to vacant, returning the cost it carried.
    pub fn vacate(&mut self, idx: u32) -> i64 {
        let b = &mut self.buckets[idx as usize];
        debug_assert!(b.occupied);
        let cost = b.cost;
        *b = Bucket::vacant();
        self.size -= 1;
        self.cost -= cost;
        cost
    }

    /// Move tenant metadata from `src` to vacant `dst` during displacement.
    pub fn relocate(&mut self, src: u32, dst: u32) {
        debug_assert!(self.buckets[src as usize].occupied);
        debug_assert!(!self.buckets[dst as usize].occupied);
        self.buckets[dst as usize] = self.buckets[src as usize];
        self.buckets[src as usize] = Bucket::vacant();
    }

    /// Indices of all live buckets, oldest insertion first. Used by the
    /// eviction scan and by `for_all` snapshots.
    pub fn live_oldest_first(&self) -> Vec<u32> {
        let mut live: Vec<u32> = (0..self.capacity())
            .filter(|&i| self.buckets[i as usize].occupied)
            .collect();
        live.sort_by_key(|&i| self.buckets[i as usize].stamp);
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        for (req, want) in [(1, 2), (2, 2), (3, 4), (9, 16), (1024, 1024), (1025, 2048)] {
            assert_eq!(CacheTable::new(req, 8).capacity(), want);
        }
    }

    #[test]
    fn window_wraps_around_the_table_end() {
        let t = CacheTable::new(8, 4);
        let key = 7; // home == 7 in an 8-bucket table
        let w: Vec<u32> = t.window(key).collect();
        assert_eq!(w, vec![7, 0, 1, 2]);
    }

    #[test]
    fn claim_and_vacate_track_size_and_stamps() {
        let mut t = CacheTable::new(8, 8);
        t.claim(3, 11);
        t.claim(4, 12);
        assert_eq!(t.size, 2);
        assert!(t.buckets[3].stamp < t.buckets[4].stamp);
        t.vacate(3);
        assert_eq!(t.size, 1);
        assert!(!t.buckets[3].occupied);
    }

    #[test]
    fn oldest_first_ordering_follows_insertion() {
        let mut t = CacheTable::new(8, 8);
        t.claim(5, 1);
        t.claim(2, 2);
        t.claim(7, 3);
        assert_eq!(t.live_oldest_first(), vec![5, 2, 7]);
    }

    proptest::proptest! {
        #[test]
        fn capacity_is_smallest_power_of_two_geq(req in 1u32..1_000_000) {
            let cap = CacheTable::new(req, 16).capacity();
            proptest::prop_assert!(cap.is_power_of_two());
            proptest::prop_assert!(cap >= req);
            // Nothing smaller would fit (modulo the floor of 2).
            proptest::prop_assert!(cap == 2 || cap / 2 < req);
        }
    }
}
