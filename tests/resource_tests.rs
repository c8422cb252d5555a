//! Resource registry tests: URL derivation, path escaping, presence
//! semantics.

#[cfg(test)]
mod tests {
    use cyberspace_world::resources::{
        url_for_name_and_extension_and_hash, url_for_path_and_hash,
        url_for_path_and_hash_and_epoch, ResourceManager, ResourceState,
    };

    // -----------------------------------------------------------------------
    // URL derivation
    // -----------------------------------------------------------------------

    #[test]
    fn url_for_path_and_hash_uses_stem_and_extension() {
        assert_eq!(url_for_path_and_hash("d:/a/b.mp3", 17), "b_17.mp3");
        assert_eq!(url_for_path_and_hash("/home/x/some song.mp3", 5), "some_song_5.mp3");
        assert_eq!(url_for_path_and_hash("plain", 9), "plain_9.");
    }

    #[test]
    fn url_for_path_and_hash_and_epoch_appends_epoch() {
        assert_eq!(
            url_for_path_and_hash_and_epoch("d:/a/b.bmesh", 17, 2),
            "b_17_2.bmesh"
        );
    }

    #[test]
    fn url_for_name_and_extension_sanitises() {
        assert_eq!(
            url_for_name_and_extension_and_hash("my object!", "bmesh", 3),
            "my_object__3.bmesh"
        );
    }

    // -----------------------------------------------------------------------
    // Local path derivation
    // -----------------------------------------------------------------------

    #[test]
    fn local_path_escapes_special_characters() {
        let dir = tempfile::tempdir().unwrap();
        let rm = ResourceManager::new(dir.path());
        // Alphanumerics, underscores and dots pass through.
        assert_eq!(rm.default_local_path_for_url("cube_7.bmesh"), "cube_7.bmesh");
        // Everything else becomes _<decimal>.
        assert_eq!(rm.default_local_path_for_url("a b.png"), "a_32b.png");
    }

    #[test]
    fn over_long_url_falls_back_to_hashed_filename() {
        let dir = tempfile::tempdir().unwrap();
        let rm = ResourceManager::new(dir.path());
        let long_url = format!("{}.png", "x".repeat(400));
        let path = rm.default_local_path_for_url(&long_url);
        // 16 hex chars + ".png"
        assert_eq!(path.len(), 16 + 4);
        assert!(path.ends_with(".png"));
        assert!(path[..16].chars().all(|c| c.is_ascii_hexdigit()));
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    #[test]
    fn get_or_create_starts_not_present() {
        let dir = tempfile::tempdir().unwrap();
        let rm = ResourceManager::new(dir.path());
        let resource = rm.get_or_create("cube_7.bmesh");
        assert_eq!(resource.state, ResourceState::NotPresent);
        assert!(!rm.is_present("cube_7.bmesh"));
    }

    #[test]
    fn copy_local_file_marks_present_and_copies_once() {
        let dir = tempfile::tempdir().unwrap();
        let rm = ResourceManager::new(dir.path().join("res"));
        std::fs::create_dir_all(dir.path().join("res")).unwrap();

        let src = dir.path().join("input.bin");
        std::fs::write(&src, b"payload").unwrap();

        rm.copy_local_file(&src, "thing_1.bin").unwrap();
        assert!(rm.is_present("thing_1.bin"));
        let abs = rm.abs_path_for_url("thing_1.bin");
        assert_eq!(std::fs::read(&abs).unwrap(), b"payload");

        // A second copy with different source bytes is a no-op: the
        // resource was already present.
        std::fs::write(&src, b"changed").unwrap();
        rm.copy_local_file(&src, "thing_1.bin").unwrap();
        assert_eq!(std::fs::read(&abs).unwrap(), b"payload");
    }

    #[test]
    fn mark_as_locally_present_requires_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let rm = ResourceManager::new(dir.path());
        assert!(rm.mark_as_locally_present("missing_0.bin").is_err());

        rm.write_resource_file("exists_0.bin", b"x").unwrap();
        assert!(rm.is_present("exists_0.bin"));
        assert!(rm.mark_as_locally_present("exists_0.bin").is_ok());
    }

    #[test]
    fn download_failed_urls_are_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let rm = ResourceManager::new(dir.path());
        assert!(!rm.is_in_download_failed_urls("a_1.png"));
        rm.add_to_download_failed_urls("a_1.png");
        assert!(rm.is_in_download_failed_urls("a_1.png"));
    }

    #[test]
    fn dirty_set_drains_once() {
        let dir = tempfile::tempdir().unwrap();
        let rm = ResourceManager::new(dir.path());
        rm.get_or_create("a_1.png");
        rm.get_or_create("b_2.png");
        let dirty = rm.take_dirty();
        assert_eq!(dirty.len(), 2);
        assert!(rm.take_dirty().is_empty());
    }
}
