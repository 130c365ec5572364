//! Tile persistence and compression seams.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::TileError;
use crate::mesh::Tile;
use crate::tilename::parse_tile_position;

/// Loads and stores whole tiles.
pub trait TileCodec: Send + Sync {
    fn load(&self, path: &Path) -> Result<Tile, TileError>;
    /// Write `tile` to `tile.path`, replacing any existing file.
    fn save(&self, tile: &Tile) -> Result<(), TileError>;
}

/// TBMS files via the `tilemesh` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl TileCodec for BinaryCodec {
    fn load(&self, path: &Path) -> Result<Tile, TileError> {
        let file = tilemesh::read_file(path).map_err(|e| TileError::from_io(path, e))?;

        // Spike correction works in tile-local coordinates and does not need the
        // position, so a name without coordinates is not an error here.
        let position = match parse_tile_position(path) {
            Ok(position) => position,
            Err(e) => {
                debug!("{}", e);
                [0.0, 0.0]
            }
        };

        Ok(Tile {
            path: path.to_path_buf(),
            position,
            size: file.cell_size,
            objects: file.objects,
        })
    }

    fn save(&self, tile: &Tile) -> Result<(), TileError> {
        tilemesh::write_objects(&tile.path, tile.size, &tile.objects)
            .map_err(|e| TileError::from_io(&tile.path, e))
    }
}

/// Produces a compressed artifact next to a tile.
pub trait Compressor: Send + Sync {
    /// Compress `path` and return the artifact's path.
    fn compress(&self, path: &Path) -> Result<PathBuf, TileError>;
}

/// zlib sidecar `<tile>.<extension>`.
#[derive(Debug, Clone)]
pub struct ZlibCompressor {
    pub extension: String,
    pub level: u8,
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self {
            extension: tilemesh::ZLIB_EXTENSION.to_owned(),
            level: 9,
        }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, path: &Path) -> Result<PathBuf, TileError> {
        tilemesh::compress_file(path, &self.extension, self.level)
            .map_err(|e| TileError::from_io(path, e))
    }
}
