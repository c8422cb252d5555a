//! Minimal triangle-mesh representation with the codecs and the simplifier
//! the asset pipelines need.
//!
//! Three on-disk encodings:
//!
//! * **archival** (`write_to`/`read_from`) – full-precision f32 arrays, used
//!   for stored models and LOD meshes.
//! * **packed** (`write_packed`) – the combined chunk mesh layout: position
//!   f32×3, packed 10/10/10 normal u32, UV half×2, material index u32.
//! * **optimised** (`write_optimised`) – aggressive quantisation: 13-bit
//!   positions relative to the mesh AABB, 8-bit UVs.
//!
//! All encoders are deterministic: same input bytes in, same bytes out.

use crate::codec::{CodecError, CodecResult, Reader, Writer};
use crate::types::Aabb;
use glam::{Vec2, Vec3};
use half::f16;

const MESH_SERIALISATION_VERSION: u32 = 1;
const MAX_MESH_SIZE: u32 = 256 * 1024 * 1024;
const MAX_MESH_VERTS: usize = 64 * 1024 * 1024 / 12;

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    /// Per-vertex material slot index.
    pub mat_indices: Vec<u32>,
    /// Triangle list.
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn num_verts(&self) -> usize {
        self.positions.len()
    }

    pub fn num_tris(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn aabb(&self) -> Aabb {
        let mut aabb = Aabb::EMPTY;
        for p in &self.positions {
            aabb.enlarge_to_hold(*p);
        }
        aabb
    }

    /// Material index driving a triangle (first vertex wins).
    pub fn tri_mat_index(&self, tri: usize) -> u32 {
        self.mat_indices
            .get(self.indices[tri * 3] as usize)
            .copied()
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Archival encoding
    // -----------------------------------------------------------------------

    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(MESH_SERIALISATION_VERSION);
        w.write_u32(self.positions.len() as u32);
        w.write_u32(self.indices.len() as u32);
        for p in &self.positions {
            w.write_vec3(*p);
        }
        for n in &self.normals {
            w.write_vec3(*n);
        }
        for uv in &self.uvs {
            w.write_vec2(*uv);
        }
        for m in &self.mat_indices {
            w.write_u32(*m);
        }
        for i in &self.indices {
            w.write_u32(*i);
        }
        w.end_block(mark);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write_to(&mut w);
        w.into_bytes()
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<Mesh> {
        let header = r.begin_block(MAX_MESH_SIZE)?;
        let num_verts = r.read_u32()? as usize;
        let num_indices = r.read_u32()? as usize;
        if num_verts > MAX_MESH_VERTS || num_indices > MAX_MESH_VERTS * 8 {
            return Err(CodecError::Corrupted(format!(
                "mesh with {} verts / {} indices",
                num_verts, num_indices
            )));
        }
        let mut mesh = Mesh::default();
        mesh.positions.reserve(num_verts);
        for _ in 0..num_verts {
            mesh.positions.push(r.read_vec3()?);
        }
        mesh.normals.reserve(num_verts);
        for _ in 0..num_verts {
            mesh.normals.push(r.read_vec3()?);
        }
        mesh.uvs.reserve(num_verts);
        for _ in 0..num_verts {
            mesh.uvs.push(r.read_vec2()?);
        }
        mesh.mat_indices.reserve(num_verts);
        for _ in 0..num_verts {
            mesh.mat_indices.push(r.read_u32()?);
        }
        mesh.indices.reserve(num_indices);
        for _ in 0..num_indices {
            let i = r.read_u32()?;
            if i as usize >= num_verts {
                return Err(CodecError::Corrupted(format!(
                    "index {} out of range ({} verts)",
                    i, num_verts
                )));
            }
            mesh.indices.push(i);
        }
        r.finish_block(header);
        Ok(mesh)
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Mesh> {
        Mesh::read_from(&mut Reader::new(bytes))
    }

    // -----------------------------------------------------------------------
    // Packed encoding (combined chunk mesh)
    // -----------------------------------------------------------------------

    /// Vertex layout: position f32×3, packed normal u32, UV half×2, material
    /// index u32; then the index list (opaque batch first, then transparent –
    /// the caller passes the already-ordered index list).
    pub fn write_packed(&self, w: &mut Writer) {
        let mark = w.begin_block(MESH_SERIALISATION_VERSION);
        w.write_u32(self.positions.len() as u32);
        w.write_u32(self.indices.len() as u32);
        for i in 0..self.positions.len() {
            w.write_vec3(self.positions[i]);
            w.write_u32(pack_normal(self.normals.get(i).copied().unwrap_or(Vec3::Z)));
            let uv = self.uvs.get(i).copied().unwrap_or(Vec2::ZERO);
            w.write_u32(
                (f16::from_f32(uv.x).to_bits() as u32)
                    | ((f16::from_f32(uv.y).to_bits() as u32) << 16),
            );
            w.write_u32(self.mat_indices.get(i).copied().unwrap_or(0));
        }
        for i in &self.indices {
            w.write_u32(*i);
        }
        w.end_block(mark);
    }

    // -----------------------------------------------------------------------
    // Optimised encoding
    // -----------------------------------------------------------------------

    /// 13-bit positions quantised against the AABB, 8-bit UVs.  Lossy but
    /// small; clients with old cached copies refetch on epoch bumps.
    pub fn write_optimised(&self, w: &mut Writer) {
        let aabb = self.aabb();
        let extent = if aabb.is_empty() {
            Vec3::ONE
        } else {
            (aabb.max - aabb.min).max(Vec3::splat(1e-6))
        };
        let origin = if aabb.is_empty() { Vec3::ZERO } else { aabb.min };

        let mark = w.begin_block(MESH_SERIALISATION_VERSION);
        w.write_u32(self.positions.len() as u32);
        w.write_u32(self.indices.len() as u32);
        w.write_vec3(origin);
        w.write_vec3(extent);
        const POS_MAX: f32 = ((1 << 13) - 1) as f32;
        for i in 0..self.positions.len() {
            let rel = (self.positions[i] - origin) / extent;
            let q = |v: f32| (v.clamp(0.0, 1.0) * POS_MAX).round() as u32;
            let qx = q(rel.x);
            let qy = q(rel.y);
            let qz = q(rel.z);
            w.write_u32(qx | (qy << 13));
            w.write_u32(qz | ((self.mat_indices.get(i).copied().unwrap_or(0) & 0x7FFFF) << 13));
            w.write_u32(pack_normal(self.normals.get(i).copied().unwrap_or(Vec3::Z)));
            let uv = self.uvs.get(i).copied().unwrap_or(Vec2::ZERO);
            let qu = |v: f32| (v.fract().rem_euclid(1.0) * 255.0).round() as u32;
            w.write_u32(qu(uv.x) | (qu(uv.y) << 8));
        }
        for i in &self.indices {
            w.write_u32(*i);
        }
        w.end_block(mark);
    }
}

/// 10-bit signed-normalised x/y/z in a u32 (2 spare bits).
pub fn pack_normal(n: Vec3) -> u32 {
    let n = if n.length_squared() > 1e-12 {
        n.normalize()
    } else {
        Vec3::Z
    };
    let q = |v: f32| (((v.clamp(-1.0, 1.0) * 511.0).round() as i32) & 0x3FF) as u32;
    q(n.x) | (q(n.y) << 10) | (q(n.z) << 20)
}

// ---------------------------------------------------------------------------
// Simplification
// ---------------------------------------------------------------------------

/// Deterministic vertex-clustering simplification.
///
/// Vertices are snapped to a uniform grid whose cell size comes from the
/// requested reduction ratio and error tolerance; triangles that collapse are
/// dropped.  `sloppy` doubles the cell size for meshes that did not shrink
/// enough on the first pass.
pub fn simplify(mesh: &Mesh, target_reduction_ratio: f32, target_error: f32, sloppy: bool) -> Mesh {
    // Tiny meshes are already as simple as they get.
    if mesh.num_verts() <= 4 {
        return mesh.clone();
    }

    let aabb = mesh.aabb();
    let longest = aabb.longest_axis().max(1e-6);

    // Aim for numverts / ratio clusters along the longest axis.
    let target_cells = ((mesh.num_verts() as f32 / target_reduction_ratio).cbrt()).max(1.0);
    let mut cell = (longest / target_cells).max(target_error.max(1e-6));
    if sloppy {
        cell *= 2.0;
    }

    let key_of = |p: Vec3| -> (i32, i32, i32) {
        (
            ((p.x - aabb.min.x) / cell).floor() as i32,
            ((p.y - aabb.min.y) / cell).floor() as i32,
            ((p.z - aabb.min.z) / cell).floor() as i32,
        )
    };

    // First-wins representative per (cell, material), in vertex order, so the
    // output is independent of hash iteration order.
    let mut remap = vec![u32::MAX; mesh.num_verts()];
    let mut cluster_of: std::collections::HashMap<(i32, i32, i32, u32), u32> =
        std::collections::HashMap::new();
    let mut out = Mesh::default();

    for (i, p) in mesh.positions.iter().enumerate() {
        let mat = mesh.mat_indices.get(i).copied().unwrap_or(0);
        let (cx, cy, cz) = key_of(*p);
        let slot = *cluster_of.entry((cx, cy, cz, mat)).or_insert_with(|| {
            let slot = out.positions.len() as u32;
            out.positions.push(*p);
            out.normals.push(mesh.normals.get(i).copied().unwrap_or(Vec3::Z));
            out.uvs.push(mesh.uvs.get(i).copied().unwrap_or(Vec2::ZERO));
            out.mat_indices.push(mat);
            slot
        });
        remap[i] = slot;
    }

    for tri in mesh.indices.chunks_exact(3) {
        let a = remap[tri[0] as usize];
        let b = remap[tri[1] as usize];
        let c = remap[tri[2] as usize];
        if a != b && b != c && a != c {
            out.indices.extend_from_slice(&[a, b, c]);
        }
    }
    out
}

/// Simplify for a LOD level the way the pipeline wants it: 10× vertex
/// reduction at level 1 (with a sloppy retry when a big mesh did not shrink
/// 4×), 100× sloppy at level 2.
pub fn simplify_for_lod_level(mesh: &Mesh, lod_level: i32) -> Mesh {
    if lod_level <= 1 {
        let simplified = simplify(mesh, 10.0, 0.02, false);
        if mesh.num_verts() > 1024 && simplified.num_verts() * 4 > mesh.num_verts() {
            simplify(mesh, 10.0, 0.02, true)
        } else {
            simplified
        }
    } else {
        simplify(mesh, 100.0, 0.08, true)
    }
}

// ---------------------------------------------------------------------------
// Primitive generation
// ---------------------------------------------------------------------------

/// One unit cube per voxel, carrying the voxel's material index.
pub fn voxel_group_to_mesh(voxels: &[(glam::IVec3, u32)]) -> Mesh {
    let mut mesh = Mesh::default();
    let cube = make_unit_cube();
    for (pos, mat) in voxels {
        let base = mesh.positions.len() as u32;
        let offset = Vec3::new(pos.x as f32 + 0.5, pos.y as f32 + 0.5, pos.z as f32 + 0.5);
        for i in 0..cube.positions.len() {
            mesh.positions.push(cube.positions[i] + offset);
            mesh.normals.push(cube.normals[i]);
            mesh.uvs.push(cube.uvs[i]);
            mesh.mat_indices.push(*mat);
        }
        mesh.indices.extend(cube.indices.iter().map(|i| i + base));
    }
    mesh
}

/// Unit cube centred at the origin; the stand-in mesh for voxel groups and
/// objects whose model has not arrived yet.
pub fn make_unit_cube() -> Mesh {
    let mut mesh = Mesh::default();
    let face_normals = [
        Vec3::X,
        Vec3::NEG_X,
        Vec3::Y,
        Vec3::NEG_Y,
        Vec3::Z,
        Vec3::NEG_Z,
    ];
    for n in face_normals {
        let u = if n.x.abs() > 0.5 { Vec3::Y } else { Vec3::X };
        let v = n.cross(u).normalize();
        let u = v.cross(n).normalize();
        let base = mesh.positions.len() as u32;
        for (du, dv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            mesh.positions.push(n * 0.5 + u * du + v * dv);
            mesh.normals.push(n);
            mesh.uvs.push(Vec2::new(du + 0.5, dv + 0.5));
            mesh.mat_indices.push(0);
        }
        mesh.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    mesh
}
