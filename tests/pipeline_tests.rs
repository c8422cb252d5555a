//! Asset pipeline tests: LOD derivation idempotence and chunk bake
//! determinism.

#[cfg(test)]
mod tests {
    use cyberspace_world::baker;
    use cyberspace_world::lod::{self, lod_mesh_url, lod_texture_url, texture_lod_max_dim};
    use cyberspace_world::mesh;
    use cyberspace_world::object::{ObjectKind, WorldMaterial, WorldObject};
    use cyberspace_world::server::{LodCheckItem, Server, ServerConfig};
    use cyberspace_world::store::RecordStore;
    use cyberspace_world::types::{ChunkCoord, Uid, UserId};
    use cyberspace_world::worlds::AllWorlds;
    use cyberspace_world::ResourceManager;
    use glam::{DVec3, Vec2, Vec3};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn make_server(dir: &tempfile::TempDir) -> Arc<Server> {
        let config = ServerConfig {
            state_dir: dir.path().to_path_buf(),
            listen_port: 0,
            udp_port: 0,
            read_only: false,
            cert_file: dir.path().join("cert.pem"),
            key_file: dir.path().join("key.pem"),
        };
        std::fs::create_dir_all(config.resources_dir()).unwrap();
        let store = RecordStore::create(&config.records_file_path()).unwrap();
        let resources = ResourceManager::new(config.resources_dir());
        let (lod_tx, _lod_rx) = mpsc::unbounded_channel();
        let (npc_tx, _npc_rx) = mpsc::unbounded_channel();
        Arc::new(Server::new(
            config,
            AllWorlds::new(),
            store,
            resources,
            lod_tx,
            npc_tx,
        ))
    }

    /// A mesh big enough that the pipeline derives LOD levels for it.
    fn big_mesh() -> mesh::Mesh {
        let mut m = mesh::Mesh::default();
        let n = 40;
        for y in 0..n {
            for x in 0..n {
                m.positions.push(Vec3::new(x as f32, y as f32, 0.0));
                m.normals.push(Vec3::Z);
                m.uvs.push(Vec2::new(x as f32 / n as f32, y as f32 / n as f32));
                m.mat_indices.push(0);
            }
        }
        for y in 0..n - 1 {
            for x in 0..n - 1 {
                let i = (y * n + x) as u32;
                m.indices.extend_from_slice(&[i, i + 1, i + n as u32]);
                m.indices
                    .extend_from_slice(&[i + 1, i + n as u32 + 1, i + n as u32]);
            }
        }
        m
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 7])
        });
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn add_object(server: &Arc<Server>, model_url: &str, pos: DVec3) -> Uid {
        let mut state = server.state.lock();
        let uid = state.alloc_object_uid();
        let world = state.world_entry("");
        let mut ob = WorldObject::new(uid, ObjectKind::Generic, UserId(0));
        ob.model_url = model_url.to_string();
        ob.pos = pos;
        ob.materials = vec![WorldMaterial {
            colour_texture_url: "bricks_1.png".to_string(),
            ..Default::default()
        }];
        ob.update_world_aabb();
        world.objects.insert(uid, ob);
        uid
    }

    fn resource_dir_listing(server: &Arc<Server>) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        for entry in std::fs::read_dir(server.resources.base_dir()).unwrap() {
            let entry = entry.unwrap();
            out.insert(
                entry.file_name().to_string_lossy().to_string(),
                std::fs::read(entry.path()).unwrap(),
            );
        }
        out
    }

    // -----------------------------------------------------------------------
    // URL helpers
    // -----------------------------------------------------------------------

    #[test]
    fn lod_urls_insert_level_before_extension() {
        assert_eq!(lod_mesh_url("base_123.bmesh", 2), "base_123_lod2.bmesh");
        assert_eq!(lod_texture_url("tex_9.png", 1, false), "tex_9_lod1.jpg");
        assert_eq!(lod_texture_url("tex_9.png", 1, true), "tex_9_lod1.png");
    }

    #[test]
    fn texture_lod_ladder_dims() {
        assert_eq!(texture_lod_max_dim(0), 1024);
        assert_eq!(texture_lod_max_dim(1), 256);
        assert_eq!(texture_lod_max_dim(2), 64);
    }

    // -----------------------------------------------------------------------
    // LOD idempotence
    // -----------------------------------------------------------------------

    #[test]
    fn lod_generation_writes_files_only_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir);

        server
            .resources
            .write_resource_file("grid_5.bmesh", &big_mesh().encode())
            .unwrap();
        server
            .resources
            .write_resource_file("bricks_1.png", &png_bytes(512, 512))
            .unwrap();
        let uid = add_object(&server, "grid_5.bmesh", DVec3::new(10.0, 10.0, 0.0));

        let item = LodCheckItem {
            world_name: String::new(),
            uid,
        };
        lod::process_object_now(&server, &item).unwrap();

        assert!(server.resources.is_present("grid_5_lod1.bmesh"));
        assert!(server.resources.is_present("grid_5_lod2.bmesh"));
        assert!(server.resources.is_present("bricks_1_lod1.jpg"));
        assert!(server.resources.is_present("bricks_1_lod2.jpg"));

        // Second run touches nothing.
        let before = resource_dir_listing(&server);
        lod::process_object_now(&server, &item).unwrap();
        let after = resource_dir_listing(&server);
        assert_eq!(before, after);

        // The object-space AABB was corrected from the mesh.
        let state = server.state.lock();
        let ob = &state.world("").unwrap().objects[&uid];
        assert_eq!(ob.aabb_os.min, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(ob.aabb_os.max, Vec3::new(39.0, 39.0, 0.0));
    }

    // -----------------------------------------------------------------------
    // Chunk bake determinism
    // -----------------------------------------------------------------------

    #[test]
    fn baking_twice_produces_identical_outputs_and_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir);

        server
            .resources
            .write_resource_file("grid_5.bmesh", &big_mesh().encode())
            .unwrap();
        server
            .resources
            .write_resource_file("bricks_1.png", &png_bytes(128, 128))
            .unwrap();
        let a = add_object(&server, "grid_5.bmesh", DVec3::new(10.0, 10.0, 0.0));
        let b = add_object(&server, "grid_5.bmesh", DVec3::new(60.0, 60.0, 1.0));

        let coords = ChunkCoord::new(0, 0, 0);
        baker::bake_chunk(&server, "", coords).unwrap();
        let (mesh_url_1, ranges_1) = {
            let state = server.state.lock();
            let world = state.world("").unwrap();
            assert!(!world.chunks[&coords].needs_rebuild);
            (
                world.chunks[&coords].mesh_url.clone(),
                (world.objects[&a].batch_ranges, world.objects[&b].batch_ranges),
            )
        };
        assert!(!mesh_url_1.is_empty());
        let files_1 = resource_dir_listing(&server);

        baker::bake_chunk(&server, "", coords).unwrap();
        let (mesh_url_2, ranges_2) = {
            let state = server.state.lock();
            let world = state.world("").unwrap();
            (
                world.chunks[&coords].mesh_url.clone(),
                (world.objects[&a].batch_ranges, world.objects[&b].batch_ranges),
            )
        };

        // Same objects, same epoch: identical content-hashed URL and ranges.
        assert_eq!(mesh_url_1, mesh_url_2);
        assert_eq!(ranges_1, ranges_2);
        assert_eq!(files_1, resource_dir_listing(&server));

        // Both objects' opaque ranges are non-empty and within the mesh.
        assert!(ranges_1.0.batch0_end > ranges_1.0.batch0_start);
        assert!(ranges_1.1.batch0_end > ranges_1.1.batch0_start);
        assert_eq!(ranges_1.0.batch0_end, ranges_1.1.batch0_start);
    }
}
