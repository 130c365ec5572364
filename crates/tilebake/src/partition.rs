//! Grid partitioning of oversized mesh objects.
//!
//! An object whose footprint spans more than one grid cell is cut into column
//! strips along x and, where a strip still spans several rows, into cells along
//! y. Every surviving piece becomes a new object centred on its cell.

use log::debug;

use crate::geometry::{Bounds, GeometryKernel, WorkMesh};
use crate::mesh::{self, MeshObject, Tile};

/// Grid-aligned cell range covering a bounding box on one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CellSpan {
    start: f64,
    cells: usize,
}

impl CellSpan {
    fn covering(min: f64, max: f64, cell: f64) -> Self {
        let start = (min / cell).floor() * cell;
        let end = (max / cell).ceil() * cell;
        // A zero-width extent sitting on a grid line still occupies one cell.
        let cells = (((end - start) / cell).round() as usize).max(1);
        Self { start, cells }
    }

    #[inline]
    fn origin(&self, k: usize, cell: f64) -> f64 {
        self.start + k as f64 * cell
    }
}

/// Splits mesh objects so each piece fits one `cell_size × cell_size` cell.
pub struct GridPartitioner<'k, K: GeometryKernel + ?Sized> {
    kernel: &'k K,
    cell_size: f64,
}

impl<'k, K: GeometryKernel + ?Sized> GridPartitioner<'k, K> {
    pub fn new(kernel: &'k K, cell_size: f64) -> Self {
        debug_assert!(cell_size > 0.0);
        Self { kernel, cell_size }
    }

    /// Cut `object` along the grid.
    ///
    /// Returns an empty vector when the object already fits in a single cell (or
    /// has no geometry); the caller then keeps the original.
    pub fn partition(&self, object: &MeshObject) -> Vec<MeshObject> {
        let cell = self.cell_size;

        let mut source = mesh::work_mesh(object);
        let Some(bounds) = source.bounds() else {
            return Vec::new();
        };

        let columns = CellSpan::covering(bounds.min[0], bounds.max[0], cell);
        let rows = CellSpan::covering(bounds.min[1], bounds.max[1], cell);

        if columns.cells == 1 && rows.cells == 1 {
            return Vec::new();
        }

        self.kernel.compute_vertex_normals(&mut source);

        let mut pieces = Vec::new();

        for c in 0..columns.cells {
            let x = columns.origin(c, cell);

            let column = self.cut_between(&source, &bounds, 0, x, x + cell);
            let Some(column_bounds) = column.bounds() else {
                continue;
            };

            let local_rows = CellSpan::covering(column_bounds.min[1], column_bounds.max[1], cell);

            if local_rows.cells == 1 {
                pieces.push(self.fragment(object, column, x, local_rows.start));
                continue;
            }

            for r in 0..local_rows.cells {
                let y = local_rows.origin(r, cell);

                let piece = self.cut_between(&column, &column_bounds, 1, y, y + cell);
                if piece.is_empty() {
                    continue;
                }

                pieces.push(self.fragment(object, piece, x, y));
            }
        }

        debug!(
            "partitioned '{}' ({} vertices) into {} pieces of {} m",
            object.id,
            object.vertices.len(),
            pieces.len(),
            cell
        );

        pieces
    }

    /// Keep `lo <= p[axis] <= hi`, skipping a cut the mesh does not cross.
    fn cut_between(
        &self,
        mesh: &WorkMesh,
        bounds: &Bounds,
        axis: usize,
        lo: f64,
        hi: f64,
    ) -> WorkMesh {
        let mut point = [0.0; 3];
        let mut normal = [0.0; 3];

        let mut current: Option<WorkMesh> = None;

        if bounds.max[axis] > hi {
            point[axis] = hi;
            normal[axis] = -1.0;
            current = Some(self.kernel.plane_cut(mesh, point, normal));
        }

        if bounds.min[axis] < lo {
            point[axis] = lo;
            normal[axis] = 1.0;
            let input = current.as_ref().unwrap_or(mesh);
            current = Some(self.kernel.plane_cut(input, point, normal));
        }

        current.unwrap_or_else(|| mesh.clone())
    }

    fn fragment(&self, source: &MeshObject, piece: WorkMesh, x: f64, y: f64) -> MeshObject {
        let half = 0.5 * self.cell_size;
        let triangles = piece.flat_indices();

        let mut object = MeshObject {
            id: source.id.clone(),
            parent_group: source.parent_group,
            centroid: [x + half, y + half],
            vertices: piece.vertices,
            normals: piece.normals,
            uvs: Vec::new(),
            triangles,
        };

        mesh::merge_similar_vertices(&mut object);
        object
    }
}

/// Outcome of [`partition_tile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    /// Objects that were replaced by pieces.
    pub split_objects: usize,
    /// Indices of the produced pieces in the tile's object list, ascending.
    pub children: Vec<usize>,
}

/// Partition every object of `tile` on the world grid.
///
/// Objects are cut in world coordinates (tile-local + [`Tile::local_origin`]) so the
/// pieces line up with neighbouring tiles. Pieces are stored back in tile-local
/// coordinates with world-space centroids, in place of their parent.
pub fn partition_tile<K: GeometryKernel + ?Sized>(
    tile: &mut Tile,
    partitioner: &GridPartitioner<'_, K>,
) -> PartitionSummary {
    let [ox, oy] = tile.local_origin();
    let mut summary = PartitionSummary::default();

    let objects = std::mem::take(&mut tile.objects);
    let mut out = Vec::with_capacity(objects.len());

    for object in objects {
        let mut world = object.clone();
        mesh::translate(&mut world, ox, oy);
        let pieces = partitioner.partition(&world);

        if pieces.is_empty() {
            out.push(object);
            continue;
        }

        summary.split_objects += 1;
        summary.children.extend(out.len()..out.len() + pieces.len());

        out.extend(pieces.into_iter().map(|mut piece| {
            mesh::translate(&mut piece, -ox, -oy);
            piece
        }));
    }

    tile.objects = out;
    summary
}
