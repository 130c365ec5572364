//! Bounded-concurrency batch driver for the `despike` and `split` stages.
//!
//! Each stage runs on its own fixed-size rayon pool. A file's pipeline runs to
//! completion on one worker and never fans out further, so the number of files
//! in flight never exceeds the pool size. Per-file failures are logged and
//! recorded; they never stop sibling files.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::codec::{BinaryCodec, Compressor, TileCodec};
use crate::config::BatchConfig;
use crate::error::{BatchError, TileError};
use crate::geometry::{ClipKernel, GeometryKernel};
use crate::mesh;
use crate::partition::{partition_tile, GridPartitioner};
use crate::spikes::{correct_tile, CorrectionMode};
use crate::tilename::parse_tile_position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Despike,
    Split,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Despike => "removing spikes",
            Stage::Split => "splitting",
        })
    }
}

/// Counter values at the moment a file starts or finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub total: usize,
    pub done: usize,
    pub active: usize,
    pub failed: usize,
}

/// Receives progress from worker threads; must tolerate concurrent calls.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: ProgressSnapshot);
}

impl<F> ProgressObserver for F
where
    F: Fn(ProgressSnapshot) + Send + Sync,
{
    fn on_progress(&self, snapshot: ProgressSnapshot) {
        self(snapshot)
    }
}

/// Observer that ignores every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _snapshot: ProgressSnapshot) {}
}

struct Counters<'a> {
    stage: Stage,
    total: usize,
    active: AtomicUsize,
    done: AtomicUsize,
    failed: AtomicUsize,
    observer: &'a dyn ProgressObserver,
}

impl<'a> Counters<'a> {
    fn new(stage: Stage, total: usize, observer: &'a dyn ProgressObserver) -> Self {
        Self {
            stage,
            total,
            active: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            observer,
        }
    }

    fn started(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify(
            self.done.load(Ordering::SeqCst),
            active,
            self.failed.load(Ordering::SeqCst),
        );
    }

    fn finished(&self, ok: bool) {
        let failed = if ok {
            self.failed.load(Ordering::SeqCst)
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst) + 1
        };
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        self.notify(done, active, failed);
    }

    fn notify(&self, done: usize, active: usize, failed: usize) {
        self.observer.on_progress(ProgressSnapshot {
            stage: self.stage,
            total: self.total,
            done,
            active,
            failed,
        });
    }
}

/// Result for one input file.
#[derive(Debug)]
pub struct FileOutcome<T> {
    pub path: PathBuf,
    pub result: Result<T, TileError>,
}

/// Per-file outcomes of one stage, in input order.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub stage: Stage,
    pub outcomes: Vec<FileOutcome<T>>,
    pub elapsed: Duration,
}

impl<T> BatchReport<T> {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &TileError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.path.as_path(), e)))
    }
}

/// What the spike stage did to one file.
#[derive(Debug, Clone, PartialEq)]
pub struct DespikeSummary {
    /// `None` for a tile without vertices.
    pub mode: Option<CorrectionMode>,
    pub samples: usize,
    pub spikes: usize,
    pub mutated_objects: usize,
    /// Compressed artifact, when compression is enabled.
    pub compressed: Option<PathBuf>,
}

/// What the split stage did to one file.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitSummary {
    pub objects_in: usize,
    pub split_objects: usize,
    pub pieces: usize,
    pub objects_out: usize,
    /// Written tile; `None` when the tile held no objects.
    pub output: Option<PathBuf>,
}

/// Tile files directly inside `dir`, sorted by path.
///
/// Only files with extension `tile_extension` are considered. Data sidecars (names
/// ending in `data.<ext>` or containing `-data`) are skipped. With
/// `compressed_extension` set, a tile whose `<tile>.<compressed_extension>` artifact
/// was modified after the tile itself is skipped as already processed.
pub fn discover_tiles(
    dir: &Path,
    tile_extension: &str,
    compressed_extension: Option<&str>,
) -> Result<Vec<PathBuf>, BatchError> {
    let sidecar_suffix = format!("data.{}", tile_extension);
    let mut tiles = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "directory walk failed"));
            BatchError::Scan { path, source }
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();

        if path.extension().and_then(|e| e.to_str()) != Some(tile_extension) {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(&sidecar_suffix) || name.contains("-data") {
            continue;
        }

        if let Some(ext) = compressed_extension {
            if artifact_is_fresh(&path, ext) {
                debug!("{}: compressed artifact is up to date, skipping", path.display());
                continue;
            }
        }

        tiles.push(path);
    }

    tiles.sort();
    Ok(tiles)
}

fn artifact_is_fresh(tile: &Path, extension: &str) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();

    match (
        modified(&tilemesh::sidecar_path(tile, extension)),
        modified(tile),
    ) {
        (Some(artifact), Some(source)) => artifact > source,
        _ => false,
    }
}

/// Runs the spike and split stages over many tiles.
pub struct BatchDriver {
    config: BatchConfig,
    codec: Box<dyn TileCodec>,
    kernel: Box<dyn GeometryKernel>,
    compressor: Option<Box<dyn Compressor>>,
    observer: Box<dyn ProgressObserver>,
}

impl BatchDriver {
    /// Driver with the binary codec, the clip kernel, no compression and no progress output.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            codec: Box::new(BinaryCodec),
            kernel: Box::new(ClipKernel),
            compressor: None,
            observer: Box::new(NoProgress),
        }
    }

    pub fn with_codec(mut self, codec: impl TileCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn with_kernel(mut self, kernel: impl GeometryKernel + 'static) -> Self {
        self.kernel = Box::new(kernel);
        self
    }

    /// Compress every tile after it was written by the spike stage.
    pub fn with_compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.compressor = Some(Box::new(compressor));
        self
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Correct spikes in a single tile file, or in every new tile of a directory.
    pub fn despike(&self, path: &Path) -> Result<BatchReport<DespikeSummary>, BatchError> {
        let files = if path.is_dir() {
            discover_tiles(
                path,
                &self.config.tile_extension,
                Some(&self.config.compressed_extension),
            )?
        } else {
            vec![path.to_path_buf()]
        };

        self.despike_files(files)
    }

    pub fn despike_files(
        &self,
        files: Vec<PathBuf>,
    ) -> Result<BatchReport<DespikeSummary>, BatchError> {
        self.run(Stage::Despike, self.config.despike_workers, files, |path| {
            self.despike_file(path)
        })
    }

    /// Load, correct, renormalise, save and optionally compress one tile.
    pub fn despike_file(&self, path: &Path) -> Result<DespikeSummary, TileError> {
        let mut tile = self.codec.load(path)?;

        let report = correct_tile(&mut tile, &self.config.spike);

        for &index in &report.mutated_objects {
            mesh::recompute_normals(&*self.kernel, &mut tile.objects[index]);
        }

        self.codec.save(&tile)?;

        let compressed = match &self.compressor {
            Some(compressor) => Some(compressor.compress(&tile.path)?),
            None => None,
        };

        Ok(DespikeSummary {
            mode: report.mode,
            samples: report.samples,
            spikes: report.spikes,
            mutated_objects: report.mutated_objects.len(),
            compressed,
        })
    }

    /// Partition every tile in `input` (a file or a directory) into `output_dir`.
    pub fn split(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<BatchReport<SplitSummary>, BatchError> {
        let files = if input.is_dir() {
            discover_tiles(input, &self.config.tile_extension, None)?
        } else {
            vec![input.to_path_buf()]
        };

        fs::create_dir_all(output_dir).map_err(|source| BatchError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

        self.run(Stage::Split, self.config.split_workers, files, |path| {
            self.split_file(path, output_dir)
        })
    }

    /// Partition one tile on the world grid and write it under the same name in `output_dir`.
    pub fn split_file(&self, path: &Path, output_dir: &Path) -> Result<SplitSummary, TileError> {
        let position = parse_tile_position(path)?;
        let Some(name) = path.file_name() else {
            return Err(TileError::TileName {
                name: path.display().to_string(),
                reason: "no file name".to_owned(),
            });
        };

        let mut tile = self.codec.load(path)?;
        tile.position = position;
        let objects_in = tile.objects.len();

        let partitioner = GridPartitioner::new(&*self.kernel, self.config.cell_size);
        let summary = partition_tile(&mut tile, &partitioner);

        for &index in &summary.children {
            mesh::recompute_normals(&*self.kernel, &mut tile.objects[index]);
        }

        tile.path = output_dir.join(name);

        let output = if tile.objects.is_empty() {
            debug!("{}: no objects, nothing written", path.display());
            None
        } else {
            self.codec.save(&tile)?;
            Some(tile.path.clone())
        };

        Ok(SplitSummary {
            objects_in,
            split_objects: summary.split_objects,
            pieces: summary.children.len(),
            objects_out: tile.objects.len(),
            output,
        })
    }

    fn run<T, F>(
        &self,
        stage: Stage,
        workers: usize,
        files: Vec<PathBuf>,
        work: F,
    ) -> Result<BatchReport<T>, BatchError>
    where
        T: Send,
        F: Fn(&Path) -> Result<T, TileError> + Sync,
    {
        let started = Instant::now();
        let workers = workers.max(1);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("tilebake-{}", i))
            .build()?;

        info!("{}: {} files on {} workers", stage, files.len(), workers);

        let counters = Counters::new(stage, files.len(), &*self.observer);

        let outcomes: Vec<FileOutcome<T>> = pool.install(|| {
            files
                .into_par_iter()
                .map(|path| {
                    counters.started();
                    let result = work(&path);
                    counters.finished(result.is_ok());

                    if let Err(e) = &result {
                        warn!("Error processing {}: {}", path.display(), e);
                    }

                    FileOutcome { path, result }
                })
                .collect()
        });

        let report = BatchReport {
            stage,
            outcomes,
            elapsed: started.elapsed(),
        };

        info!(
            "{}: {} of {} files done in {:.1?}, {} failed",
            stage,
            report.succeeded(),
            report.total(),
            report.elapsed,
            report.failed()
        );

        Ok(report)
    }
}
