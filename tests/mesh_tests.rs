//! Mesh codec and simplification tests.

#[cfg(test)]
mod tests {
    use cyberspace_world::codec::Writer;
    use cyberspace_world::mesh::{
        make_unit_cube, pack_normal, simplify, simplify_for_lod_level, voxel_group_to_mesh, Mesh,
    };
    use glam::{IVec3, Vec3};

    /// A dense grid of triangles, enough vertices to be worth simplifying.
    fn dense_grid(n: usize) -> Mesh {
        let mut mesh = Mesh::default();
        for y in 0..n {
            for x in 0..n {
                mesh.positions.push(Vec3::new(x as f32, y as f32, ((x + y) % 3) as f32 * 0.1));
                mesh.normals.push(Vec3::Z);
                mesh.uvs.push(glam::Vec2::new(x as f32 / n as f32, y as f32 / n as f32));
                mesh.mat_indices.push(0);
            }
        }
        for y in 0..n - 1 {
            for x in 0..n - 1 {
                let i = (y * n + x) as u32;
                let right = i + 1;
                let down = i + n as u32;
                mesh.indices.extend_from_slice(&[i, right, down]);
                mesh.indices.extend_from_slice(&[right, down + 1, down]);
            }
        }
        mesh
    }

    // -----------------------------------------------------------------------
    // Codec
    // -----------------------------------------------------------------------

    #[test]
    fn archival_round_trip() {
        let mesh = dense_grid(8);
        let decoded = Mesh::decode(&mesh.encode()).unwrap();
        assert_eq!(mesh, decoded);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut mesh = make_unit_cube();
        mesh.indices[0] = 9999;
        assert!(Mesh::decode(&mesh.encode()).is_err());
    }

    #[test]
    fn encoders_are_deterministic() {
        let mesh = dense_grid(16);
        assert_eq!(mesh.encode(), mesh.encode());

        let mut a = Writer::new();
        mesh.write_packed(&mut a);
        let mut b = Writer::new();
        mesh.write_packed(&mut b);
        assert_eq!(a.into_bytes(), b.into_bytes());

        let mut a = Writer::new();
        mesh.write_optimised(&mut a);
        let mut b = Writer::new();
        mesh.write_optimised(&mut b);
        assert_eq!(a.into_bytes(), b.into_bytes());
    }

    #[test]
    fn packed_normal_roundtrips_axes() {
        // The three axes must pack to distinct, stable values.
        let px = pack_normal(Vec3::X);
        let py = pack_normal(Vec3::Y);
        let pz = pack_normal(Vec3::Z);
        assert_ne!(px, py);
        assert_ne!(py, pz);
        assert_eq!(pz, pack_normal(Vec3::Z));
    }

    // -----------------------------------------------------------------------
    // Simplification
    // -----------------------------------------------------------------------

    #[test]
    fn simplify_reduces_vertex_count() {
        let mesh = dense_grid(40); // 1600 verts
        let simplified = simplify(&mesh, 10.0, 0.02, false);
        assert!(
            simplified.num_verts() * 4 <= mesh.num_verts(),
            "{} verts left of {}",
            simplified.num_verts(),
            mesh.num_verts()
        );
        assert!(simplified.num_tris() > 0);
        // Every index stays in range.
        for i in &simplified.indices {
            assert!((*i as usize) < simplified.num_verts());
        }
    }

    #[test]
    fn simplify_is_deterministic() {
        let mesh = dense_grid(32);
        let a = simplify_for_lod_level(&mesh, 2);
        let b = simplify_for_lod_level(&mesh, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn tiny_meshes_are_left_alone() {
        let mut mesh = Mesh::default();
        for i in 0..3 {
            mesh.positions.push(Vec3::new(i as f32, 0.0, 0.0));
            mesh.normals.push(Vec3::Z);
            mesh.uvs.push(glam::Vec2::ZERO);
            mesh.mat_indices.push(0);
        }
        mesh.indices.extend_from_slice(&[0, 1, 2]);
        let simplified = simplify(&mesh, 10.0, 0.02, false);
        assert_eq!(simplified, mesh);
    }

    #[test]
    fn simplify_keeps_material_boundaries() {
        // Two materials must not collapse into one cluster.
        let mut mesh = dense_grid(10);
        let half = mesh.mat_indices.len() / 2;
        for m in &mut mesh.mat_indices[..half] {
            *m = 1;
        }
        let simplified = simplify(&mesh, 50.0, 0.02, true);
        let has_mat0 = simplified.mat_indices.iter().any(|m| *m == 0);
        let has_mat1 = simplified.mat_indices.iter().any(|m| *m == 1);
        assert!(has_mat0 && has_mat1);
    }

    // -----------------------------------------------------------------------
    // Voxels
    // -----------------------------------------------------------------------

    #[test]
    fn voxel_mesh_has_a_cube_per_voxel() {
        let voxels = vec![(IVec3::new(0, 0, 0), 0u32), (IVec3::new(2, 0, 0), 1)];
        let mesh = voxel_group_to_mesh(&voxels);
        let cube = make_unit_cube();
        assert_eq!(mesh.num_verts(), cube.num_verts() * 2);
        assert_eq!(mesh.num_tris(), cube.num_tris() * 2);
        // Second cube carries its voxel's material index.
        assert!(mesh.mat_indices[cube.num_verts()..].iter().all(|m| *m == 1));
    }
}
