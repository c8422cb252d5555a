//! Codec unit tests: round-trips, forward-compatible skip-ahead, limits.

#[cfg(test)]
mod tests {
    use cyberspace_world::codec::{CodecError, Reader, Writer};
    use cyberspace_world::object::{
        ObjectKind, ScalarVal, WorldMaterial, WorldObject, COLOUR_TEX_HAS_ALPHA_FLAG,
    };
    use cyberspace_world::parcel::Parcel;
    use cyberspace_world::records::{Photo, ServerCredentials, User};
    use cyberspace_world::types::{Uid, UserId};
    use glam::{DVec2, DVec3, IVec3, Mat2, Vec3};

    // -----------------------------------------------------------------------
    // Versioned blocks
    // -----------------------------------------------------------------------

    #[test]
    fn forward_skip_leaves_cursor_at_block_end() {
        let mut w = Writer::new();
        let mark = w.begin_block(7);
        w.write_u64(42);
        w.write_bytes(&[1, 2, 3, 4, 5]); // tail from a newer writer
        w.end_block(mark);
        w.write_u32(0xDEAD_BEEF); // next field after the block

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let header = r.begin_block(1024).unwrap();
        assert_eq!(header.version, 7);
        assert_eq!(r.read_u64().unwrap(), 42);
        // The 5 unknown tail bytes are skipped, not read.
        r.finish_block(header);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn undersized_block_is_corrupted() {
        let mut w = Writer::new();
        w.write_u32(1); // version
        w.write_u32(4); // size smaller than the 8-byte header
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.begin_block(1024), Err(CodecError::Corrupted(_))));
    }

    #[test]
    fn oversized_block_is_corrupted() {
        let mut w = Writer::new();
        let mark = w.begin_block(1);
        w.write_bytes(&[0; 100]);
        w.end_block(mark);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.begin_block(50), Err(CodecError::Corrupted(_))));
    }

    #[test]
    fn over_long_string_is_corrupted() {
        let mut w = Writer::new();
        w.write_string("hello world");
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.read_string(5), Err(CodecError::Corrupted(_))));
    }

    // -----------------------------------------------------------------------
    // Entity round-trips
    // -----------------------------------------------------------------------

    fn example_material() -> WorldMaterial {
        WorldMaterial {
            colour_rgb: Vec3::new(0.2, 0.4, 0.9),
            colour_texture_url: "bricks_12345.jpg".to_string(),
            emission_rgb: Vec3::new(1.0, 0.8, 0.1),
            emission_texture_url: String::new(),
            normal_map_url: "bricks_norm_99.png".to_string(),
            roughness: ScalarVal::constant(0.7),
            metallic_fraction: ScalarVal {
                val: 0.3,
                texture_url: "metal_5.jpg".to_string(),
            },
            opacity: ScalarVal::constant(1.0),
            tex_matrix: Mat2::from_cols_array(&[2.0, 0.0, 0.0, 2.0]),
            emission_lum_flux_or_lum: 800.0,
            flags: COLOUR_TEX_HAS_ALPHA_FLAG,
        }
    }

    #[test]
    fn material_round_trip() {
        let mat = example_material();
        let mut w = Writer::new();
        mat.write_to(&mut w);
        let bytes = w.into_bytes();
        let decoded = WorldMaterial::read_from(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(mat, decoded);
    }

    #[test]
    fn object_round_trip() {
        let mut ob = WorldObject::new(Uid(17), ObjectKind::VoxelGroup, UserId(3));
        ob.pos = DVec3::new(100.5, -20.25, 3.0);
        ob.axis = Vec3::new(0.0, 0.0, 1.0);
        ob.angle = 1.25;
        ob.scale = Vec3::new(2.0, 2.0, 0.5);
        ob.model_url = "cube_7.bmesh".to_string();
        ob.materials = vec![example_material(), WorldMaterial::default()];
        ob.script = "<dynamic_texture_update base_url=\"https://x\" material_index=\"0\" material_texture=\"colour\"/>".to_string();
        ob.content = "a test object".to_string();
        ob.audio_url = "loop_9.mp3".to_string();
        ob.audio_volume = 0.5;
        ob.compressed_voxels = cyberspace_world::object::compress_voxels(&[
            (IVec3::new(0, 0, 0), 0),
            (IVec3::new(1, 0, 0), 1),
        ]);
        ob.flags = 5;
        ob.max_model_lod_level = 2;
        ob.batch_ranges.batch0_start = 10;
        ob.batch_ranges.batch0_end = 40;
        ob.update_world_aabb();

        let mut w = Writer::new();
        ob.write_to(&mut w);
        let bytes = w.into_bytes();
        let decoded = WorldObject::read_from(&mut Reader::new(&bytes)).unwrap();
        // creator_name is denormalised, never serialised.
        let mut expected = ob.clone();
        expected.creator_name = String::new();
        assert_eq!(expected, decoded);
    }

    #[test]
    fn parcel_round_trip() {
        let mut parcel = Parcel::new(4, UserId(1));
        parcel.admin_ids = vec![UserId(1), UserId(2)];
        parcel.writer_ids = vec![UserId(9)];
        parcel.verts = [
            DVec2::new(0.0, 0.0),
            DVec2::new(30.0, 0.0),
            DVec2::new(30.0, 40.0),
            DVec2::new(0.0, 40.0),
        ];
        parcel.zbounds = (-2.0, 20.0);
        parcel.all_writeable = true;
        parcel.parcel_auction_ids = vec![77];
        parcel.build_aabb();

        let mut w = Writer::new();
        parcel.write_to(&mut w);
        let bytes = w.into_bytes();
        let decoded = Parcel::read_from(&mut Reader::new(&bytes)).unwrap();
        // Display names are denormalised after load.
        let mut expected = parcel.clone();
        expected.owner_name = String::new();
        expected.admin_names = Vec::new();
        expected.writer_names = Vec::new();
        assert_eq!(expected, decoded);
    }

    #[test]
    fn user_round_trip_preserves_password_check() {
        let mut user = User::new(UserId(12), "alice");
        user.email = "alice@example.com".to_string();
        user.set_password("hunter2", "salt123");
        user.flags = 3;

        let mut w = Writer::new();
        user.write_to(&mut w);
        let bytes = w.into_bytes();
        let decoded = User::read_from(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(user, decoded);
        assert!(decoded.check_password("hunter2"));
        assert!(!decoded.check_password("hunter3"));
    }

    #[test]
    fn photo_round_trip() {
        let mut photo = Photo::new(5, UserId(2));
        photo.world_name = "alice".to_string();
        photo.parcel_id = 9;
        photo.cam_pos = DVec3::new(1.0, 2.0, 3.0);
        photo.caption = "sunset".to_string();
        photo.local_filename = "photo_ab.jpg".to_string();
        photo.local_midsize_filename = "photo_ab_midsize1000.jpg".to_string();
        photo.local_thumbnail_filename = "photo_ab_thumb_230x172.jpg".to_string();

        let mut w = Writer::new();
        photo.write_to(&mut w);
        let bytes = w.into_bytes();
        let decoded = Photo::read_from(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(photo, decoded);
    }

    #[test]
    fn credentials_round_trip() {
        let mut creds = ServerCredentials::default();
        creds.creds.insert("llm_api_key".to_string(), "sk-test".to_string());
        creds.creds.insert("smtp_password".to_string(), "pw".to_string());

        let mut w = Writer::new();
        creds.write_to(&mut w);
        let bytes = w.into_bytes();
        let decoded = ServerCredentials::read_from(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(creds, decoded);
    }

    #[test]
    fn voxel_blob_round_trip() {
        let voxels = vec![
            (IVec3::new(0, 0, 0), 0u32),
            (IVec3::new(-5, 3, 100), 2),
            (IVec3::new(7, 7, 7), 1),
        ];
        let blob = cyberspace_world::object::compress_voxels(&voxels);
        let decoded = cyberspace_world::object::decompress_voxels(&blob).unwrap();
        assert_eq!(voxels, decoded);
    }
}
