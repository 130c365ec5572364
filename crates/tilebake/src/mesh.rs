//! Tile model and the object-level mesh helpers shared by both pipelines.

use std::path::PathBuf;

use hashbrown::HashMap;
pub use tilemesh::MeshObject;

use crate::geometry::{GeometryKernel, WorkMesh, UP};

/// One loaded tile file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tile {
    pub path: PathBuf,
    /// Lower-left corner of the tile in world coordinates.
    pub position: [f64; 2],
    /// Grid cell size (width, height).
    pub size: [f64; 2],
    pub objects: Vec<MeshObject>,
}

impl Tile {
    /// Offset from tile-local vertex coordinates to world coordinates.
    ///
    /// Local coordinates are relative to the tile centre.
    pub fn local_origin(&self) -> [f64; 2] {
        [
            self.position[0] + 0.5 * self.size[0],
            self.position[1] + 0.5 * self.size[1],
        ]
    }
}

/// Working mesh view of an object (positions, normals, triangles).
pub fn work_mesh(object: &MeshObject) -> WorkMesh {
    WorkMesh::from_buffers(&object.vertices, &object.normals, &object.triangles)
}

/// Recompute the normals of `object` with `kernel`. Topology is unchanged.
pub fn recompute_normals<K: GeometryKernel + ?Sized>(kernel: &K, object: &mut MeshObject) {
    let mut mesh = WorkMesh {
        vertices: std::mem::take(&mut object.vertices),
        normals: Vec::new(),
        triangles: object
            .triangles
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect(),
    };

    kernel.compute_vertex_normals(&mut mesh);

    object.vertices = mesh.vertices;
    object.normals = mesh.normals;
}

/// Translate every vertex of `object` by `(dx, dy)`.
pub fn translate(object: &mut MeshObject, dx: f64, dy: f64) {
    for v in &mut object.vertices {
        v[0] += dx;
        v[1] += dy;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct MergeKey {
    position: [u64; 3],
    normal: [u32; 3],
}

impl MergeKey {
    #[inline]
    fn new(position: [f64; 3], normal: [f32; 3]) -> Self {
        // `+ 0.0` folds -0.0 into 0.0 so both hash alike.
        Self {
            position: position.map(|c| (c + 0.0).to_bits()),
            normal: normal.map(|c| (c + 0.0).to_bits()),
        }
    }
}

/// Merge vertices sharing both position and normal, rewriting triangle indices.
///
/// Vertices no triangle references are dropped. UVs survive only when they were
/// vertex-parallel; missing normals are filled with [`UP`].
pub fn merge_similar_vertices(object: &mut MeshObject) {
    let has_normals = object.has_normals();
    let has_uvs = object.has_uvs();

    let mut vertices = Vec::with_capacity(object.vertices.len());
    let mut normals = Vec::with_capacity(object.vertices.len());
    let mut uvs = Vec::with_capacity(if has_uvs { object.vertices.len() } else { 0 });

    let mut seen: HashMap<MergeKey, u32> = HashMap::with_capacity(object.vertices.len());

    for index in object.triangles.iter_mut() {
        let old = *index as usize;
        let position = object.vertices[old];
        let normal = if has_normals { object.normals[old] } else { UP };

        *index = *seen.entry(MergeKey::new(position, normal)).or_insert_with(|| {
            vertices.push(position);
            normals.push(normal);
            if has_uvs {
                uvs.push(object.uvs[old]);
            }
            (vertices.len() - 1) as u32
        });
    }

    object.vertices = vertices;
    object.normals = normals;
    object.uvs = uvs;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ClipKernel;

    /// Two triangles with duplicated corner vertices, as a cut kernel emits them.
    fn split_quad() -> MeshObject {
        MeshObject {
            id: "pand".to_owned(),
            parent_group: 1,
            centroid: [0.0, 0.0],
            vertices: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
                [9.0, 9.0, 9.0],
            ],
            normals: vec![[0.0, 0.0, 1.0]; 7],
            uvs: Vec::new(),
            triangles: vec![0, 1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn merges_equal_position_and_normal() {
        let mut object = split_quad();
        merge_similar_vertices(&mut object);

        assert_eq!(object.vertices.len(), 4);
        assert_eq!(object.normals.len(), 4);
        assert_eq!(object.triangles, vec![0, 1, 2, 0, 2, 3]);
    }

    #[test]
    fn different_normals_are_kept_apart() {
        let mut object = split_quad();
        object.normals[3] = [0.0, 1.0, 0.0];
        merge_similar_vertices(&mut object);

        assert_eq!(object.vertices.len(), 5);
        assert_eq!(object.triangles, vec![0, 1, 2, 3, 2, 4]);
    }

    #[test]
    fn negative_zero_merges_with_zero() {
        let mut object = split_quad();
        object.vertices[3] = [-0.0, 0.0, -0.0];
        merge_similar_vertices(&mut object);
        assert_eq!(object.vertices.len(), 4);
    }

    #[test]
    fn uvs_follow_their_vertices() {
        let mut object = split_quad();
        object.uvs = (0..7).map(|i| [i as f32, 0.0]).collect();
        merge_similar_vertices(&mut object);

        assert_eq!(object.uvs, vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [5.0, 0.0]]);
    }

    #[test]
    fn recomputed_normals_cover_every_vertex() {
        let mut object = split_quad();
        object.normals.clear();
        recompute_normals(&ClipKernel, &mut object);

        assert_eq!(object.normals.len(), object.vertices.len());
        assert_eq!(object.normals[0], [0.0, 0.0, 1.0]);
        // The unreferenced vertex falls back to the default.
        assert_eq!(object.normals[6], UP);
    }

    #[test]
    fn local_origin_is_tile_centre() {
        let tile = Tile {
            position: [121_000.0, 487_000.0],
            size: [1000.0, 1000.0],
            ..Tile::default()
        };
        assert_eq!(tile.local_origin(), [121_500.0, 487_500.0]);
    }
}
