//! Geometry kernel seam: axis-aligned plane cuts and vertex normals.
//!
//! [`WorkMesh`] is a plain value handed into and out of every kernel call; mesh
//! objects never hold on to kernel state between operations.

use hashbrown::HashMap;
use smallvec::SmallVec;

/// Fallback normal for vertices without a usable adjacent face (z-up).
pub const UP: [f32; 3] = [0.0, 0.0, 1.0];

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Bounds {
    pub fn of(points: &[[f64; 3]]) -> Option<Self> {
        let first = *points.first()?;
        Some(points.iter().fold(
            Bounds {
                min: first,
                max: first,
            },
            |mut b, p| {
                for axis in 0..3 {
                    b.min[axis] = b.min[axis].min(p[axis]);
                    b.max[axis] = b.max[axis].max(p[axis]);
                }
                b
            },
        ))
    }
}

/// Transient triangle mesh the kernel operates on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkMesh {
    pub vertices: Vec<[f64; 3]>,
    /// Empty, or one normal per vertex.
    pub normals: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

impl WorkMesh {
    /// Build from a flat index list; a trailing partial triangle is dropped.
    pub fn from_buffers(vertices: &[[f64; 3]], normals: &[[f32; 3]], indices: &[u32]) -> Self {
        let normals = if normals.len() == vertices.len() {
            normals.to_vec()
        } else {
            Vec::new()
        };

        Self {
            vertices: vertices.to_vec(),
            normals,
            triangles: indices
                .chunks_exact(3)
                .map(|t| [t[0], t[1], t[2]])
                .collect(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::of(&self.vertices)
    }

    pub fn flat_indices(&self) -> Vec<u32> {
        self.triangles.iter().flatten().copied().collect()
    }

    /// Total surface area.
    pub fn area(&self) -> f64 {
        self.triangles
            .iter()
            .map(|t| {
                let [a, b, c] = t.map(|i| self.vertices[i as usize]);
                0.5 * length(cross(sub(b, a), sub(c, a)))
            })
            .sum()
    }
}

/// Operations the partitioner and the normal pass need from a mesh kernel.
pub trait GeometryKernel: Send + Sync {
    /// Keep the part of `mesh` in the half-space `dot(p - point, normal) >= 0`,
    /// i.e. the side `normal` points toward. Returns an empty mesh when nothing
    /// remains.
    fn plane_cut(&self, mesh: &WorkMesh, point: [f64; 3], normal: [f64; 3]) -> WorkMesh;

    /// Replace `mesh.normals` with one unit normal per vertex.
    fn compute_vertex_normals(&self, mesh: &mut WorkMesh);
}

/// Reference kernel: per-triangle Sutherland–Hodgman clipping with fan
/// re-triangulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClipKernel;

impl GeometryKernel for ClipKernel {
    fn plane_cut(&self, mesh: &WorkMesh, point: [f64; 3], normal: [f64; 3]) -> WorkMesh {
        let distance: Vec<f64> = mesh
            .vertices
            .iter()
            .map(|&v| dot(sub(v, point), normal))
            .collect();

        let has_normals = mesh.normals.len() == mesh.vertices.len();

        let mut out = WorkMesh::default();
        let mut kept: HashMap<u32, u32> = HashMap::new();
        let mut crossings: HashMap<(u32, u32), u32> = HashMap::new();

        for tri in &mesh.triangles {
            let d = tri.map(|i| distance[i as usize]);

            if d.iter().all(|&x| x >= 0.0) {
                let mapped = tri.map(|i| keep_vertex(mesh, has_normals, &mut out, &mut kept, i));
                out.triangles.push(mapped);
                continue;
            }

            if d.iter().all(|&x| x <= 0.0) {
                continue;
            }

            // Walk the triangle's edges, collecting the clipped polygon (3 or 4 corners).
            let mut polygon: SmallVec<[u32; 4]> = SmallVec::new();
            for k in 0..3 {
                let (a, b) = (tri[k], tri[(k + 1) % 3]);
                let (da, db) = (d[k], d[(k + 1) % 3]);

                if da >= 0.0 {
                    polygon.push(keep_vertex(mesh, has_normals, &mut out, &mut kept, a));
                }

                if (da > 0.0 && db < 0.0) || (da < 0.0 && db > 0.0) {
                    polygon.push(edge_crossing(
                        mesh,
                        &distance,
                        has_normals,
                        &mut out,
                        &mut crossings,
                        a,
                        b,
                    ));
                }
            }

            for k in 1..polygon.len().saturating_sub(1) {
                out.triangles.push([polygon[0], polygon[k], polygon[k + 1]]);
            }
        }

        if out.triangles.is_empty() {
            return WorkMesh::default();
        }

        out
    }

    fn compute_vertex_normals(&self, mesh: &mut WorkMesh) {
        let mut sums = vec![[0.0_f64; 3]; mesh.vertices.len()];

        for tri in &mesh.triangles {
            let [a, b, c] = tri.map(|i| mesh.vertices[i as usize]);
            // Unnormalised cross product: larger faces weigh more.
            let face = cross(sub(b, a), sub(c, a));
            for &i in tri {
                let s = &mut sums[i as usize];
                s[0] += face[0];
                s[1] += face[1];
                s[2] += face[2];
            }
        }

        mesh.normals = sums
            .into_iter()
            .map(|s| {
                let len = length(s);
                if len > f64::EPSILON {
                    [(s[0] / len) as f32, (s[1] / len) as f32, (s[2] / len) as f32]
                } else {
                    UP
                }
            })
            .collect();
    }
}

fn keep_vertex(
    mesh: &WorkMesh,
    has_normals: bool,
    out: &mut WorkMesh,
    kept: &mut HashMap<u32, u32>,
    index: u32,
) -> u32 {
    *kept.entry(index).or_insert_with(|| {
        out.vertices.push(mesh.vertices[index as usize]);
        if has_normals {
            out.normals.push(mesh.normals[index as usize]);
        }
        (out.vertices.len() - 1) as u32
    })
}

/// New vertex where edge `a`–`b` crosses the plane, shared by both adjacent triangles.
fn edge_crossing(
    mesh: &WorkMesh,
    distance: &[f64],
    has_normals: bool,
    out: &mut WorkMesh,
    crossings: &mut HashMap<(u32, u32), u32>,
    a: u32,
    b: u32,
) -> u32 {
    // Interpolate from the lower index so both triangles sharing the edge, and the
    // opposite cut, produce bit-identical positions.
    let key = (a.min(b), a.max(b));

    *crossings.entry(key).or_insert_with(|| {
        let (lo, hi) = (key.0 as usize, key.1 as usize);
        let t = distance[lo] / (distance[lo] - distance[hi]);

        let (p, q) = (mesh.vertices[lo], mesh.vertices[hi]);
        out.vertices.push([
            p[0] + t * (q[0] - p[0]),
            p[1] + t * (q[1] - p[1]),
            p[2] + t * (q[2] - p[2]),
        ]);

        if has_normals {
            let (m, n) = (mesh.normals[lo], mesh.normals[hi]);
            let t = t as f32;
            let blended = [
                m[0] + t * (n[0] - m[0]),
                m[1] + t * (n[1] - m[1]),
                m[2] + t * (n[2] - m[2]),
            ];
            let len = (blended[0] * blended[0] + blended[1] * blended[1] + blended[2] * blended[2])
                .sqrt();
            out.normals.push(if len > f32::EPSILON {
                [blended[0] / len, blended[1] / len, blended[2] / len]
            } else {
                m
            });
        }

        (out.vertices.len() - 1) as u32
    })
}

#[inline]
fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
fn length(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2 × 1 grid of unit-ish quads spanning x in [0, 20], y in [0, 10].
    fn strip() -> WorkMesh {
        WorkMesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [10.0, 0.0, 0.0],
                [20.0, 0.0, 0.0],
                [0.0, 10.0, 0.0],
                [10.0, 10.0, 0.0],
                [20.0, 10.0, 0.0],
            ],
            normals: Vec::new(),
            triangles: vec![[0, 1, 4], [0, 4, 3], [1, 2, 5], [1, 5, 4]],
        }
    }

    #[test]
    fn cut_keeps_the_side_the_normal_points_to() {
        let kernel = ClipKernel;
        let mesh = strip();

        let right = kernel.plane_cut(&mesh, [5.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        let bounds = right.bounds().unwrap();
        assert_eq!(bounds.min[0], 5.0);
        assert_eq!(bounds.max[0], 20.0);
        assert!((right.area() - 150.0).abs() < 1e-9);

        let left = kernel.plane_cut(&mesh, [5.0, 0.0, 0.0], [-1.0, 0.0, 0.0]);
        assert!((left.area() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn opposite_cuts_share_boundary_vertices() {
        let kernel = ClipKernel;
        let mesh = strip();

        let left = kernel.plane_cut(&mesh, [7.5, 0.0, 0.0], [-1.0, 0.0, 0.0]);
        let right = kernel.plane_cut(&mesh, [7.5, 0.0, 0.0], [1.0, 0.0, 0.0]);

        let on_plane = |m: &WorkMesh| {
            let mut v: Vec<[f64; 3]> = m
                .vertices
                .iter()
                .copied()
                .filter(|v| v[0] == 7.5)
                .collect();
            v.sort_by(|a, b| a[1].total_cmp(&b[1]));
            v
        };

        assert!(!on_plane(&left).is_empty());
        assert_eq!(on_plane(&left), on_plane(&right));
    }

    #[test]
    fn cut_outside_the_mesh_is_empty() {
        let kernel = ClipKernel;
        let cut = kernel.plane_cut(&strip(), [30.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        assert!(cut.is_empty());
        assert!(cut.vertices.is_empty());
    }

    #[test]
    fn cut_along_a_mesh_edge_keeps_touching_triangles_whole() {
        let kernel = ClipKernel;
        let mesh = strip();

        let right = kernel.plane_cut(&mesh, [10.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        assert_eq!(right.triangles.len(), 2);
        assert_eq!(right.vertices.len(), 4);
    }

    #[test]
    fn flat_mesh_normals_point_up() {
        let kernel = ClipKernel;
        let mut mesh = strip();
        kernel.compute_vertex_normals(&mut mesh);

        assert_eq!(mesh.normals.len(), mesh.vertices.len());
        for n in &mesh.normals {
            assert!((n[2] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn interpolated_normals_are_unit_length() {
        let kernel = ClipKernel;
        let mut mesh = strip();
        mesh.vertices[4][2] = 5.0;
        kernel.compute_vertex_normals(&mut mesh);

        let cut = kernel.plane_cut(&mesh, [4.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        assert_eq!(cut.normals.len(), cut.vertices.len());
        for n in &cut.normals {
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            assert!((len - 1.0).abs() < 1e-5);
        }
    }
}
