//! TBMS: dependency-light binary container for baked mesh tiles.
//!
//! - One tile holds an ordered list of mesh objects.
//! - Positions are f64 (tile-local metres), normals and UVs are f32.
//! - Triangles are flat u32 index triples into the owning object's vertices.
//! - Optional zlib sidecar (`<tile>.zlib`) for distribution.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"TBMS"
//!   04  : u32     version = 1
//!   08  : f64[2]  cell size (width, height)
//!   18  : u32     object_count
//!   ..  : objects
//!
//! Object record:
//!   u16 id_len, [u8; id_len] id (UTF-8)
//!   i32 parent_group
//!   f64[2] centroid
//!   u32 vertex_count
//!   u32 index_count
//!   u8  flags
//!         bit 0 => normals present (vertex_count × f32[3])
//!         bit 1 => uvs present     (vertex_count × f32[2])
//!   vertex_count × f64[3] positions
//!   [normals]?
//!   [uvs]?
//!   index_count × u32 triangle indices

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const TBMS_MAGIC: [u8; 4] = *b"TBMS";
pub const TBMS_VERSION: u32 = 1;

/// Default extension of the compressed sidecar written by [`compress_file`].
pub const ZLIB_EXTENSION: &str = "zlib";

const FLAG_NORMALS: u8 = 1 << 0;
const FLAG_UVS: u8 = 1 << 1;

/// One mesh object of a tile, e.g. a building or a terrain patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshObject {
    /// Source identifier (e.g. a building id); copied onto partition fragments.
    pub id: String,
    /// Index of the submesh/material group the object belongs to.
    pub parent_group: i32,
    /// Planar centre used to route the object to a tile cell.
    pub centroid: [f64; 2],
    /// `[east, north, elevation]`
    pub vertices: Vec<[f64; 3]>,
    /// Empty, or one normal per vertex.
    pub normals: Vec<[f32; 3]>,
    /// Empty, or one UV per vertex.
    pub uvs: Vec<[f32; 2]>,
    /// Flat triangle list, `len() % 3 == 0`.
    pub triangles: Vec<u32>,
}

impl MeshObject {
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len() / 3
    }

    #[inline]
    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty() && self.normals.len() == self.vertices.len()
    }

    #[inline]
    pub fn has_uvs(&self) -> bool {
        !self.uvs.is_empty() && self.uvs.len() == self.vertices.len()
    }

    /// Check buffer lengths and triangle indices.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.vertices.len();

        if !self.normals.is_empty() && self.normals.len() != n {
            return Err(format!(
                "object '{}': {} normals for {} vertices",
                self.id,
                self.normals.len(),
                n
            ));
        }

        if !self.uvs.is_empty() && self.uvs.len() != n {
            return Err(format!(
                "object '{}': {} uvs for {} vertices",
                self.id,
                self.uvs.len(),
                n
            ));
        }

        if self.triangles.len() % 3 != 0 {
            return Err(format!(
                "object '{}': index count {} is not a multiple of 3",
                self.id,
                self.triangles.len()
            ));
        }

        if let Some(&bad_index) = self.triangles.iter().find(|&&i| i as usize >= n) {
            return Err(format!(
                "object '{}': triangle index {} out of range ({} vertices)",
                self.id, bad_index, n
            ));
        }

        Ok(())
    }
}

/// Contents of one TBMS file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileFile {
    pub cell_size: [f64; 2],
    pub objects: Vec<MeshObject>,
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated TBMS"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u8(buf: &mut &[u8]) -> io::Result<u8> {
    Ok(take(buf, 1)?[0])
}

#[inline(always)]
fn le_u16(buf: &mut &[u8]) -> io::Result<u16> {
    let b = take(buf, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_i32(buf: &mut &[u8]) -> io::Result<i32> {
    let b = take(buf, 4)?;
    Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_f64(buf: &mut &[u8]) -> io::Result<f64> {
    let b = take(buf, 8)?;
    Ok(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

/// Copy `count` packed little-endian records of `T` out of `p`.
///
/// The destination vector provides the alignment, so the source slice may sit at
/// any offset inside the file buffer.
fn take_records<T: bytemuck::Pod + Default>(p: &mut &[u8], count: usize) -> io::Result<Vec<T>> {
    let bytes = count
        .checked_mul(std::mem::size_of::<T>())
        .ok_or_else(|| bad("record block size overflow"))?;
    let raw = take(p, bytes)?;

    let mut out = vec![T::default(); count];

    #[cfg(target_endian = "little")]
    {
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(raw);
    }

    #[cfg(not(target_endian = "little"))]
    {
        // Every record type here is built from 4- or 8-byte scalars; swap each one.
        let dst = bytemuck::cast_slice_mut::<T, u8>(&mut out);
        let scalar = if std::mem::size_of::<T>() % 8 == 0 && std::mem::align_of::<T>() == 8 {
            8
        } else {
            4
        };
        for (d, s) in dst.chunks_exact_mut(scalar).zip(raw.chunks_exact(scalar)) {
            for (i, b) in s.iter().rev().enumerate() {
                d[i] = *b;
            }
        }
    }

    Ok(out)
}

fn parse_object(p: &mut &[u8]) -> io::Result<MeshObject> {
    let id_len = le_u16(p)? as usize;
    let id = std::str::from_utf8(take(p, id_len)?)
        .map_err(|_| bad("object id is not UTF-8"))?
        .to_owned();

    let parent_group = le_i32(p)?;
    let centroid = [le_f64(p)?, le_f64(p)?];

    let vertex_count = le_u32(p)? as usize;
    let index_count = le_u32(p)? as usize;
    let flags = le_u8(p)?;

    let vertices = take_records::<[f64; 3]>(p, vertex_count)?;

    let normals = if flags & FLAG_NORMALS != 0 {
        take_records::<[f32; 3]>(p, vertex_count)?
    } else {
        Vec::new()
    };

    let uvs = if flags & FLAG_UVS != 0 {
        take_records::<[f32; 2]>(p, vertex_count)?
    } else {
        Vec::new()
    };

    let triangles = take_records::<u32>(p, index_count)?;

    let object = MeshObject {
        id,
        parent_group,
        centroid,
        vertices,
        normals,
        uvs,
        triangles,
    };

    object.validate().map_err(|msg| bad(&msg))?;

    Ok(object)
}

/// Parse TBMS from a contiguous byte slice. This is the single source of truth for parsing.
pub fn parse_tile_bytes(mut p: &[u8]) -> io::Result<TileFile> {
    if take(&mut p, 4)? != b"TBMS" {
        return Err(bad("bad TBMS magic"));
    }

    let version = le_u32(&mut p)?;
    if version != TBMS_VERSION {
        return Err(bad("unsupported TBMS version"));
    }

    let cell_size = [le_f64(&mut p)?, le_f64(&mut p)?];
    if !(cell_size[0] > 0.0 && cell_size[1] > 0.0) {
        return Err(bad("cell size must be > 0"));
    }

    let object_count = le_u32(&mut p)? as usize;

    // Each object needs at least 27 header bytes; cap the reservation accordingly.
    let mut objects = Vec::with_capacity(object_count.min(p.len() / 27 + 1));
    for _ in 0..object_count {
        objects.push(parse_object(&mut p)?);
    }

    if !p.is_empty() {
        return Err(bad("trailing bytes after last object"));
    }

    Ok(TileFile { cell_size, objects })
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<TileFile> {
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    parse_tile_bytes(&map)
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<TileFile> {
    let bytes = std::fs::read(path)?;
    parse_tile_bytes(&bytes)
}

/// Serialize a tile into memory.
pub fn encode_tile(tile: &TileFile) -> io::Result<Vec<u8>> {
    encode_objects(tile.cell_size, &tile.objects)
}

/// Serialize a header and object list without assembling a [`TileFile`].
pub fn encode_objects(cell_size: [f64; 2], objects: &[MeshObject]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(
        28 + objects
            .iter()
            .map(|o| 64 + o.id.len() + o.vertices.len() * 44 + o.triangles.len() * 4)
            .sum::<usize>(),
    );

    out.write_all(&TBMS_MAGIC)?;
    write_u32(&mut out, TBMS_VERSION)?;
    write_f64(&mut out, cell_size[0])?;
    write_f64(&mut out, cell_size[1])?;
    write_u32(&mut out, count_u32(objects.len(), "object count")?)?;

    for object in objects {
        object.validate().map_err(|msg| bad(&msg))?;

        let id = object.id.as_bytes();
        if id.len() > u16::MAX as usize {
            return Err(bad("object id longer than 65535 bytes"));
        }

        let mut flags = 0u8;
        if object.has_normals() {
            flags |= FLAG_NORMALS;
        }
        if object.has_uvs() {
            flags |= FLAG_UVS;
        }

        write_u16(&mut out, id.len() as u16)?;
        out.write_all(id)?;
        write_i32(&mut out, object.parent_group)?;
        write_f64(&mut out, object.centroid[0])?;
        write_f64(&mut out, object.centroid[1])?;
        write_u32(&mut out, count_u32(object.vertices.len(), "vertex count")?)?;
        write_u32(&mut out, count_u32(object.triangles.len(), "index count")?)?;
        out.write_all(&[flags])?;

        write_records(&mut out, &object.vertices)?;
        if flags & FLAG_NORMALS != 0 {
            write_records(&mut out, &object.normals)?;
        }
        if flags & FLAG_UVS != 0 {
            write_records(&mut out, &object.uvs)?;
        }
        write_records(&mut out, &object.triangles)?;
    }

    Ok(out)
}

pub fn write_file<P: AsRef<Path>>(path: P, tile: &TileFile) -> io::Result<()> {
    write_objects(path, tile.cell_size, &tile.objects)
}

pub fn write_objects<P: AsRef<Path>>(
    path: P,
    cell_size: [f64; 2],
    objects: &[MeshObject],
) -> io::Result<()> {
    let bytes = encode_objects(cell_size, objects)?;

    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(&bytes)?;
    file.flush()?;

    Ok(())
}

/// `<tile>.<extension>`, e.g. `Terrain1000_2000.bin.zlib`.
pub fn sidecar_path(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Compress `path` into a zlib sidecar `<path>.<extension>` and return the sidecar path.
///
/// `level` is the miniz compression level (0..=10).
pub fn compress_file(path: &Path, extension: &str, level: u8) -> io::Result<PathBuf> {
    let raw = std::fs::read(path)?;
    let packed = miniz_oxide::deflate::compress_to_vec_zlib(&raw, level.min(10));

    let out_path = sidecar_path(path, extension);
    let mut file = BufWriter::new(File::create(&out_path)?);
    file.write_all(&packed)?;
    file.flush()?;

    Ok(out_path)
}

/// Inverse of [`compress_file`]: inflate a zlib sidecar back into tile bytes.
pub fn read_compressed(path: &Path) -> io::Result<Vec<u8>> {
    let packed = std::fs::read(path)?;
    miniz_oxide::inflate::decompress_to_vec_zlib(&packed)
        .map_err(|e| bad(&format!("zlib stream invalid: {:?}", e.status)))
}

#[inline]
fn count_u32(n: usize, what: &str) -> io::Result<u32> {
    u32::try_from(n).map_err(|_| bad(&format!("{} exceeds u32", what)))
}

fn write_records<T: bytemuck::Pod, W: Write>(w: &mut W, records: &[T]) -> io::Result<()> {
    #[cfg(target_endian = "little")]
    {
        w.write_all(bytemuck::cast_slice(records))
    }

    #[cfg(not(target_endian = "little"))]
    {
        let raw: &[u8] = bytemuck::cast_slice(records);
        let scalar = if std::mem::align_of::<T>() == 8 { 8 } else { 4 };
        for s in raw.chunks_exact(scalar) {
            let mut swapped = [0u8; 8];
            for (i, b) in s.iter().rev().enumerate() {
                swapped[i] = *b;
            }
            w.write_all(&swapped[..scalar])?;
        }
        Ok(())
    }
}

#[inline]
fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(id: &str) -> MeshObject {
        MeshObject {
            id: id.to_owned(),
            parent_group: 2,
            centroid: [500.0, 500.0],
            vertices: vec![
                [0.0, 0.0, 1.0],
                [10.0, 0.0, 1.5],
                [10.0, 10.0, 2.0],
                [0.0, 10.0, 2.5],
            ],
            normals: vec![[0.0, 0.0, 1.0]; 4],
            uvs: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
            triangles: vec![0, 1, 2, 0, 2, 3],
        }
    }

    #[test]
    fn encode_then_parse_preserves_objects() {
        let mut bare = quad("terrain");
        bare.normals.clear();
        bare.uvs.clear();

        let tile = TileFile {
            cell_size: [1000.0, 1000.0],
            objects: vec![quad("pand.0363100012345678"), bare],
        };

        let bytes = encode_tile(&tile).unwrap();
        let parsed = parse_tile_bytes(&bytes).unwrap();
        assert_eq!(parsed, tile);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut object = quad("broken");
        object.triangles[5] = 4;
        let tile = TileFile {
            cell_size: [1000.0, 1000.0],
            objects: vec![object.clone()],
        };

        // Writer refuses, and a hand-patched file is refused by the reader.
        assert!(encode_tile(&tile).is_err());

        object.triangles[5] = 3;
        let mut bytes = encode_tile(&TileFile {
            cell_size: [1000.0, 1000.0],
            objects: vec![object],
        })
        .unwrap();
        let last = bytes.len() - 4;
        bytes[last..].copy_from_slice(&9u32.to_le_bytes());

        let err = parse_tile_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_file_is_unexpected_eof() {
        let tile = TileFile {
            cell_size: [1000.0, 1000.0],
            objects: vec![quad("a")],
        };
        let bytes = encode_tile(&tile).unwrap();

        let err = parse_tile_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn compressed_sidecar_inflates_to_original() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir = temp_dir.path();
        let path = dir.join("Terrain0_0.bin");

        let tile = TileFile {
            cell_size: [1000.0, 1000.0],
            objects: vec![quad("a")],
        };
        write_file(&path, &tile).unwrap();

        let sidecar = compress_file(&path, ZLIB_EXTENSION, 6).unwrap();
        assert_eq!(sidecar, dir.join("Terrain0_0.bin.zlib"));

        let inflated = read_compressed(&sidecar).unwrap();
        assert_eq!(parse_tile_bytes(&inflated).unwrap(), tile);
    }
}
