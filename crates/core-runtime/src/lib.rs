//! Process-wide lifecycle: logging, cache construction in dependency
//! order, the background worker pool, and the shutdown sequence.
//!
//! Initialization order is fixed: the record store comes in from the
//! caller, configuration limits are applied, the record cache is built on
//! the store, then the mipmap cache (which restores its thumbnail
//! snapshot), then the workers that drain the prefetch queue. Shutdown
//! walks the same list backwards, with the thumbnail snapshot written
//! before any tier is torn down and deferred sidecars flushed last.

use anyhow::Result;
use core_config::{Config, SidecarMode};
use core_jobs::{run_worker, QueueScheduler};
use core_mipmap::{
    Collaborators, EmbeddedThumbSource, JpegCodec, MipSize, MipmapCache, MipmapParams,
    PipelineExport, RawLoader, ReadMode,
};
use core_record::{ImageCache, RecordStore, WriteMode};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

/// The record cache is small and fixed: records are cheap to refetch and
/// the real memory pressure lives in the pixel tiers.
const RECORD_CACHE_BYTES: usize = 50 << 20;

/// File logging with env-filter control. Returns the appender guard; hold
/// it for the process lifetime or buffered lines are lost. `None` when a
/// global subscriber is already installed (tests).
pub fn init_logging(log_dir: &Path) -> Result<Option<WorkerGuard>> {
    let log_path = log_dir.join("darkroom.log");
    if log_path.exists() {
        let _ = std::fs::remove_file(&log_path);
    }
    let file_appender = tracing_appender::rolling::never(log_dir, "darkroom.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .try_init()
    {
        Ok(()) => Ok(Some(guard)),
        Err(_err) => {
            // Global subscriber already installed; drop the guard so the
            // writer thread shuts down.
            Ok(None)
        }
    }
}

/// Everything the caches cannot provide themselves.
pub struct RuntimeCollaborators {
    pub store: Arc<dyn RecordStore>,
    pub raw_loader: Arc<dyn RawLoader>,
    pub embedded: Arc<dyn EmbeddedThumbSource>,
    pub pipeline: Arc<dyn PipelineExport>,
    pub codec: Arc<dyn JpegCodec>,
}

pub struct Runtime {
    pub config: Config,
    pub records: Arc<ImageCache>,
    pub mipmaps: Arc<MipmapCache>,
    pub scheduler: Arc<QueueScheduler>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build the process state. The mipmap cache restores its snapshot as
    /// part of construction, so thumbnails from the previous session are
    /// available before the first worker starts.
    pub fn bootstrap(config: Config, collaborators: RuntimeCollaborators) -> Runtime {
        Self::bootstrap_with_cache_dir(config, collaborators, core_config::cache_dir())
    }

    /// [`Runtime::bootstrap`] with an explicit cache directory, for tests
    /// and portable installs.
    pub fn bootstrap_with_cache_dir(
        mut config: Config,
        collaborators: RuntimeCollaborators,
        cache_dir: std::path::PathBuf,
    ) -> Runtime {
        let limits = config.apply_limits();
        let records = Arc::new(ImageCache::new(
            Arc::clone(&collaborators.store),
            RECORD_CACHE_BYTES,
        ));
        let scheduler = Arc::new(QueueScheduler::new());
        let mipmaps = Arc::new(MipmapCache::new(
            MipmapParams {
                memory_per_tier: config.memory_per_tier() as usize,
                parallelism: limits.worker_threads as usize,
                thumbnail_width: limits.thumbnail_width,
                thumbnail_height: limits.thumbnail_height,
                snapshot_quality: limits.snapshot_quality,
                never_use_embedded: config.file.thumbnails.never_use_embedded,
                cache_dir,
            },
            Collaborators {
                records: Arc::clone(&records),
                raw_loader: collaborators.raw_loader,
                embedded: collaborators.embedded,
                pipeline: collaborators.pipeline,
                scheduler: Arc::clone(&scheduler) as Arc<dyn core_jobs::JobScheduler>,
                codec: collaborators.codec,
            },
        ));

        let workers = (0..limits.worker_threads)
            .map(|index| {
                let scheduler = Arc::clone(&scheduler);
                let mipmaps = Arc::clone(&mipmaps);
                std::thread::Builder::new()
                    .name(format!("thumb-worker-{index}"))
                    .spawn(move || {
                        run_worker(&scheduler, |job| {
                            let Some(size) = MipSize::from_index(job.tier as usize) else {
                                tracing::warn!(target: "runtime", tier = job.tier, "job with unknown tier dropped");
                                return;
                            };
                            mipmaps.read_get(job.image_id, size, ReadMode::Blocking);
                        });
                    })
                    .expect("spawn worker thread")
            })
            .collect();

        info!(
            target: "runtime",
            workers = limits.worker_threads,
            cache_memory = limits.cache_memory,
            "runtime bootstrapped"
        );
        Runtime {
            config,
            records,
            mipmaps,
            scheduler,
            workers,
        }
    }

    /// The write mode record edits should release with, per configuration.
    pub fn write_mode(&self) -> WriteMode {
        match self.config.file.sidecar.mode {
            SidecarMode::Safe => WriteMode::Safe,
            SidecarMode::Relaxed => WriteMode::Relaxed,
        }
    }

    /// Tear down in reverse order: drain the workers, snapshot and drop
    /// the mipmap tiers, then flush deferred sidecars.
    pub fn shutdown(self) {
        self.scheduler.close();
        for worker in self.workers {
            let _ = worker.join();
        }
        for (size, stats) in self.mipmaps.stats() {
            info!(
                target: "runtime",
                tier = size.index(),
                entries = stats.size,
                cost = stats.cost,
                quota = stats.cost_quota,
                "mipmap tier at shutdown"
            );
        }
        self.mipmaps.persist();
        drop(self.mipmaps);

        let record_stats = self.records.stats();
        info!(
            target: "runtime",
            entries = record_stats.size,
            cost = record_stats.cost,
            "record cache at shutdown"
        );
        self.records.flush_sidecars();
        info!(target: "runtime", "shutdown complete");
    }
}
