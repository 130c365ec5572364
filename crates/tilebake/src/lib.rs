//! Post-processing for baked mesh tiles.
//!
//! Two batch stages operate on directories of TBMS tiles:
//!
//! - **despike**: vertex elevations that are statistical outliers (survey noise)
//!   are pulled back to a winsorized mean, either against the whole tile or per
//!   overlapping local window ([`spikes`]).
//! - **split**: mesh objects whose footprint crosses grid lines are cut into
//!   cell-sized pieces with axis-aligned plane cuts ([`partition`]).
//!
//! [`batch::BatchDriver`] runs either stage over many files on a bounded rayon pool.

pub mod batch;
pub mod codec;
pub mod config;
pub mod error;
pub mod geometry;
pub mod mesh;
pub mod partition;
pub mod spikes;
pub mod stats;
pub mod tilename;

pub use batch::{
    discover_tiles, BatchDriver, BatchReport, DespikeSummary, FileOutcome, NoProgress,
    ProgressObserver, ProgressSnapshot, SplitSummary, Stage,
};
pub use codec::{BinaryCodec, Compressor, TileCodec, ZlibCompressor};
pub use config::BatchConfig;
pub use error::{BatchError, ConfigError, TileError};
pub use geometry::{ClipKernel, GeometryKernel, WorkMesh};
pub use mesh::{MeshObject, Tile};
pub use partition::{partition_tile, GridPartitioner, PartitionSummary};
pub use spikes::{correct_tile, CorrectionMode, CorrectionReport, SampleSet, SpikeParams};
pub use stats::{Statistics, WinsorizedDeviation};
