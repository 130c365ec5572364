//! Tile coordinates encoded in file names.
//!
//! Names look like `Terrain121000_487000.bin`, `buildings-121000_487000.bin` or
//! `121000_487000.lod1.bin`: an optional layer prefix, the lower-left corner as
//! `<x>_<y>`, then any number of dotted suffixes.

use std::path::Path;

use crate::error::TileError;

const PREFIXES: [&str; 2] = ["Terrain", "buildings-"];

/// Lower-left tile corner encoded in `path`'s file name.
pub fn parse_tile_position(path: &Path) -> Result<[f64; 2], TileError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TileError::TileName {
            name: path.display().to_string(),
            reason: "no UTF-8 file name".to_owned(),
        })?;

    let fail = |reason: &str| TileError::TileName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };

    let stem = name.split('.').next().unwrap_or(name);
    let stem = PREFIXES
        .iter()
        .find_map(|prefix| stem.strip_prefix(prefix))
        .unwrap_or(stem);

    let mut parts = stem.split('_');
    let (Some(x), Some(y), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(fail("expected <x>_<y> before the first '.'"));
    };

    let x: f64 = x.parse().map_err(|_| fail("x coordinate is not a number"))?;
    let y: f64 = y.parse().map_err(|_| fail("y coordinate is not a number"))?;

    if !(x.is_finite() && y.is_finite()) {
        return Err(fail("coordinates must be finite"));
    }

    Ok([x, y])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str) -> Result<[f64; 2], TileError> {
        parse_tile_position(Path::new("/data/tiles").join(name).as_path())
    }

    #[test]
    fn layer_prefixes_are_stripped() {
        assert_eq!(parse("Terrain121000_487000.bin").unwrap(), [121000.0, 487000.0]);
        assert_eq!(
            parse("buildings-121000_487000.bin").unwrap(),
            [121000.0, 487000.0]
        );
        assert_eq!(parse("0_-1000.bin").unwrap(), [0.0, -1000.0]);
    }

    #[test]
    fn dotted_suffixes_are_ignored() {
        assert_eq!(
            parse("Terrain121000_487000.2.5.bin").unwrap(),
            [121000.0, 487000.0]
        );
    }

    #[test]
    fn malformed_names_are_rejected() {
        for name in ["Terrain.bin", "Terrain12_ab.bin", "1_2_3.bin", "trees121000_487000.bin"] {
            let err = parse(name).unwrap_err();
            assert_eq!(err.kind(), "tile-name", "{}", name);
        }
    }
}
