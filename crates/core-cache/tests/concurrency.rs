//! Threaded behavior of the cache: writer exclusivity, reader draining on
//! upgrade, and single-producer filling of a fresh entry.

use core_cache::{Cache, CacheHit, CacheParams, SlotInit, SlotPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

struct SlowFillPolicy {
    fills: Arc<AtomicU32>,
    hold_write: bool,
}

impl SlotPolicy<u64> for SlowFillPolicy {
    fn fill(&self, key: u32, slot: &mut u64) -> SlotInit {
        self.fills.fetch_add(1, Ordering::SeqCst);
        // Give racing threads time to pile onto the same key.
        thread::sleep(Duration::from_millis(20));
        *slot = u64::from(key) + 1000;
        SlotInit {
            cost: 1,
            hold_write: self.hold_write,
        }
    }
}

fn cache(hold_write: bool) -> (Arc<Cache<u64, SlowFillPolicy>>, Arc<AtomicU32>) {
    let fills = Arc::new(AtomicU32::new(0));
    let cache = Arc::new(Cache::with_default_slots(
        CacheParams {
            capacity: 32,
            neighborhood: 8,
            cost_quota: 32,
        },
        SlowFillPolicy {
            fills: Arc::clone(&fills),
            hold_write,
        },
    ));
    (cache, fills)
}

#[test]
fn concurrent_misses_fill_exactly_once() {
    let (cache, fills) = cache(false);
    let barrier = Arc::new(Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let lease = cache.read_get(42).into_read();
            assert_eq!(*lease, 1042);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(fills.load(Ordering::SeqCst), 1);
    assert_eq!(cache.size(), 1);
}

#[test]
fn write_lease_blocks_other_readers_until_released() {
    let (cache, _fills) = cache(true);
    // First get creates the entry write-held; keep it held while another
    // thread tries to read.
    let writer = match cache.read_get(7) {
        CacheHit::Write(lease) => lease,
        CacheHit::Read(_) => panic!("fresh entry must be write-leased"),
    };
    let started = Arc::new(Barrier::new(2));
    let reader = {
        let cache = Arc::clone(&cache);
        let started = Arc::clone(&started);
        thread::spawn(move || {
            started.wait();
            // Blocks until the writer downgrades or drops.
            let lease = cache.read_get(7).into_read();
            *lease
        })
    };
    started.wait();
    thread::sleep(Duration::from_millis(50));
    // Reader must still be parked; finish the write and let it through.
    let mut writer = writer;
    *writer = 777;
    drop(writer.downgrade());
    assert_eq!(reader.join().unwrap(), 777);
}

#[test]
fn testget_never_blocks_on_a_writer() {
    let (cache, _fills) = cache(true);
    let writer = match cache.read_get(9) {
        CacheHit::Write(lease) => lease,
        CacheHit::Read(_) => panic!("fresh entry must be write-leased"),
    };
    assert!(cache.read_testget(9).is_none());
    drop(writer.downgrade());
    assert!(cache.read_testget(9).is_some());
}

#[test]
fn upgrade_waits_for_other_readers_to_drain() {
    let (cache, _fills) = cache(false);
    let r1 = cache.read_get(3).into_read();
    let r2 = cache.read_get(3).into_read();

    let upgraded = AtomicU32::new(0);
    thread::scope(|s| {
        s.spawn(|| {
            let mut w = r1.upgrade();
            upgraded.store(1, Ordering::SeqCst);
            *w = 555;
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(upgraded.load(Ordering::SeqCst), 0, "upgrade must wait for r2");
        drop(r2);
    });
    assert_eq!(*cache.read_get(3).into_read(), 555);
}

#[test]
fn dueling_upgraders_serialize_writes() {
    let (cache, _fills) = cache(false);
    drop(cache.read_get(5).into_read());
    let mut handles = Vec::new();
    for _ in 0..2 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            let read = cache.read_get(5).into_read();
            let mut write = read.upgrade();
            let seen = *write;
            thread::sleep(Duration::from_millis(20));
            *write = seen + 1;
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    // Both increments landed exactly once: the writes were serialized.
    assert_eq!(*cache.read_get(5).into_read(), 1005 + 2);
}

#[test]
fn many_threads_many_keys_settle_consistently() {
    let (cache, _fills) = cache(false);
    let mut handles = Vec::new();
    for t in 0..4 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..50u32 {
                let key = 1 + ((t * 13 + i) % 20);
                let lease = cache.read_get(key).into_read();
                assert_eq!(*lease, u64::from(key) + 1000);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(cache.size() <= 20);
    assert!(cache.cost() <= cache.cost_quota());
}
