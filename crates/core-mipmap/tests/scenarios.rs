//! End-to-end behavior of the pyramid: cold reads, dead images, the
//! best-effort ladder, and the materializer lease choreography.

mod common;

use common::{rig, FakeEmbedded, RigConfig};
use core_mipmap::EmbeddedThumbSource;
use core_jobs::PrefetchJob;
use core_mipmap::{MipSize, ReadMode};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[test]
fn cold_blocking_read_runs_the_pipeline_once() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(
        dir.path(),
        RigConfig {
            thumb_width: 1024,
            thumb_height: 768,
            ..RigConfig::default()
        },
    );
    rig.add_image(1, true);

    let first_ptr = {
        let buf = rig
            .cache
            .read_get(1, MipSize::Mip3, ReadMode::Blocking)
            .expect("blocking read always yields a pre-sized buffer");
        assert_eq!(buf.width(), 1024);
        assert_eq!(buf.height(), 768);
        assert!(!buf.is_dead());
        assert!(buf.is_consistent());
        buf.pixels().as_ptr() as usize
    };
    assert_eq!(rig.pipeline.renders.load(Ordering::SeqCst), 1);

    // The second read hits the same slot and never re-materializes.
    let buf = rig
        .cache
        .read_get(1, MipSize::Mip3, ReadMode::Blocking)
        .unwrap();
    assert_eq!(buf.pixels().as_ptr() as usize, first_ptr);
    assert_eq!(rig.pipeline.renders.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_file_yields_the_dead_image_glyph() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), RigConfig::default());
    rig.add_image(2, false);
    rig.pipeline.fail_for(2);

    let buf = rig
        .cache
        .read_get(2, MipSize::Mip3, ReadMode::Blocking)
        .unwrap();
    assert_eq!(buf.width(), 8);
    assert_eq!(buf.height(), 8);
    assert!(buf.is_dead());

    // The first 256 bytes are the fixed sentinel: row-major 8x8 cells of
    // all-0xff (lit) or all-0x00.
    const GLYPH: [u8; 64] = [
        0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 1, 1, 1, 1, 0, 0, //
        0, 1, 0, 1, 1, 0, 1, 0, //
        0, 1, 1, 1, 1, 1, 1, 0, //
        0, 0, 1, 0, 0, 1, 0, 0, //
        0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 1, 1, 1, 1, 0, 0, //
        0, 0, 0, 0, 0, 0, 0, 0,
    ];
    for (i, lit) in GLYPH.iter().enumerate() {
        let expected = if *lit != 0 { [0xff; 4] } else { [0x00; 4] };
        assert_eq!(
            &buf.pixels()[i * 4..i * 4 + 4],
            &expected,
            "glyph cell {i}"
        );
    }
}

#[test]
fn testlock_never_materializes() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), RigConfig::default());
    rig.add_image(3, true);

    assert!(rig
        .cache
        .read_get(3, MipSize::Mip2, ReadMode::TestLock)
        .is_none());
    assert_eq!(rig.pipeline.renders.load(Ordering::SeqCst), 0);
}

#[test]
fn prefetch_enqueues_exactly_one_job() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), RigConfig::default());
    rig.add_image(4, true);

    assert!(rig
        .cache
        .read_get(4, MipSize::Mip3, ReadMode::Prefetch)
        .is_none());
    assert!(rig
        .cache
        .read_get(4, MipSize::Mip3, ReadMode::Prefetch)
        .is_none());
    // The second request revived the queued job instead of duplicating it.
    assert_eq!(rig.scheduler.pending(), 1);
    assert_eq!(
        rig.scheduler.try_pop(),
        Some(PrefetchJob {
            image_id: 4,
            tier: MipSize::Mip3.index() as u8
        })
    );
}

#[test]
fn best_effort_falls_back_to_a_lower_tier() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), RigConfig::default());
    rig.add_image(7, true);

    // Cold: nothing anywhere, one prefetch job for the requested tier.
    assert!(rig
        .cache
        .read_get(7, MipSize::Mip3, ReadMode::BestEffort)
        .is_none());
    assert_eq!(rig.scheduler.pending(), 1);

    // Populate a lower tier, then ask again at Mip3.
    rig.cache
        .read_get(7, MipSize::Mip1, ReadMode::Blocking)
        .unwrap();
    let buf = rig
        .cache
        .read_get(7, MipSize::Mip3, ReadMode::BestEffort)
        .expect("lower tier must satisfy best effort");
    assert_eq!(buf.size(), MipSize::Mip1);
    assert!(buf.width() > 0);
    // Still just the one queued job for Mip3.
    assert_eq!(rig.scheduler.pending(), 1);
}

#[test]
fn full_materialization_writes_dimensions_back_to_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(
        dir.path(),
        RigConfig {
            src_width: 640,
            src_height: 480,
            ..RigConfig::default()
        },
    );
    rig.add_image(5, true);
    assert_eq!(rig.store.get(5).unwrap().width, 0);

    let buf = rig
        .cache
        .read_get(5, MipSize::MipFull, ReadMode::Blocking)
        .expect("full buffer for an existing file");
    assert_eq!(buf.width(), 640);
    assert_eq!(buf.height(), 480);
    drop(buf);

    let stored = rig.store.get(5).unwrap();
    assert_eq!(stored.width, 640);
    assert_eq!(stored.height, 480);
    assert_eq!(rig.loader.opens.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_full_image_returns_none_not_a_glyph() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), RigConfig::default());
    rig.add_image(6, false);

    assert!(rig
        .cache
        .read_get(6, MipSize::MipFull, ReadMode::Blocking)
        .is_none());
    // Cached as dead: the retry also misses without re-decoding.
    assert!(rig
        .cache
        .read_get(6, MipSize::MipFull, ReadMode::Blocking)
        .is_none());
    assert_eq!(rig.loader.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn float_tier_demosaics_the_full_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(
        dir.path(),
        RigConfig {
            thumb_width: 320,
            thumb_height: 240,
            src_width: 640,
            src_height: 480,
            ..RigConfig::default()
        },
    );
    rig.add_image(8, true);

    let buf = rig
        .cache
        .read_get(8, MipSize::MipF, ReadMode::Blocking)
        .expect("float buffer");
    // 640x480 reduced to fit the 320x240 float tier.
    assert_eq!(buf.size(), MipSize::MipF);
    assert_eq!(buf.width(), 320);
    assert_eq!(buf.height(), 240);
    assert!(buf.is_consistent());
    // The gradient source is non-trivial, so some channel value must be
    // nonzero after demosaic.
    assert!(buf.pixels_f32().iter().any(|v| *v > 0.0));
}

#[test]
fn embedded_preview_bypasses_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let embedded = Arc::new(FakeEmbedded {
        width: 64,
        height: 48,
        orientation: 1,
        reads: AtomicU32::new(0),
    });
    let rig = rig(
        dir.path(),
        RigConfig {
            embedded: Some(Arc::clone(&embedded) as Arc<dyn EmbeddedThumbSource>),
            ..RigConfig::default()
        },
    );
    rig.add_image(9, true);

    let buf = rig
        .cache
        .read_get(9, MipSize::Mip0, ReadMode::Blocking)
        .unwrap();
    assert!(buf.width() > 0);
    assert_eq!(embedded.reads.load(Ordering::SeqCst), 1);
    assert_eq!(rig.pipeline.renders.load(Ordering::SeqCst), 0);
}

#[test]
fn altered_images_skip_the_embedded_preview() {
    // The memory store reports no history, so emulate the gate by marking
    // the maker as one with broken previews.
    let dir = tempfile::tempdir().unwrap();
    let embedded = Arc::new(FakeEmbedded {
        width: 64,
        height: 48,
        orientation: 1,
        reads: AtomicU32::new(0),
    });
    let rig = rig(
        dir.path(),
        RigConfig {
            embedded: Some(Arc::clone(&embedded) as Arc<dyn EmbeddedThumbSource>),
            ..RigConfig::default()
        },
    );
    let path = rig.dir.join("IMG_0010.raw");
    std::fs::write(&path, b"raw").unwrap();
    let record = core_record::ImageRecord {
        id: 10,
        filename: "IMG_0010.raw".into(),
        maker: "Phase One".into(),
        flags: core_record::ImageFlags::RAW,
        ..core_record::ImageRecord::default()
    };
    rig.store.insert(record, Some(path));

    rig.cache
        .read_get(10, MipSize::Mip0, ReadMode::Blocking)
        .unwrap();
    assert_eq!(embedded.reads.load(Ordering::SeqCst), 0);
    assert_eq!(rig.pipeline.renders.load(Ordering::SeqCst), 1);
}

#[test]
fn remove_sweeps_the_presized_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), RigConfig::default());
    rig.add_image(11, true);

    rig.cache
        .read_get(11, MipSize::Mip1, ReadMode::Blocking)
        .unwrap();
    assert!(rig
        .cache
        .read_get(11, MipSize::Mip1, ReadMode::TestLock)
        .is_some());

    rig.cache.remove(11);
    assert!(rig
        .cache
        .read_get(11, MipSize::Mip1, ReadMode::TestLock)
        .is_none());
}

#[test]
fn closest_size_prefers_the_larger_tier_on_ties() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), RigConfig::default());
    // Tiers: 80x60, 160x120, 320x240, 640x480.
    assert_eq!(rig.cache.closest_size(80, 60), MipSize::Mip0);
    assert_eq!(rig.cache.closest_size(600, 450), MipSize::Mip3);
    // Exactly between Mip1 (280) and Mip2 (560): the larger wins.
    assert_eq!(rig.cache.closest_size(220, 200), MipSize::Mip2);
    assert_eq!(rig.cache.closest_size(10_000, 10_000), MipSize::Mip3);
}

#[test]
fn invalid_ids_never_touch_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), RigConfig::default());
    for mode in [ReadMode::TestLock, ReadMode::Blocking, ReadMode::BestEffort] {
        assert!(rig.cache.read_get(0, MipSize::Mip3, mode).is_none());
        assert!(rig.cache.read_get(-1, MipSize::Mip3, mode).is_none());
    }
    assert_eq!(rig.scheduler.pending(), 0);
}
