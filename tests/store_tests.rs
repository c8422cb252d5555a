//! Record store tests: scan-on-open, update/delete, crash tolerance,
//! compaction.

#[cfg(test)]
mod tests {
    use cyberspace_world::store::RecordStore;
    use std::fs::OpenOptions;

    fn temp_store_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("state.bin")
    }

    // -----------------------------------------------------------------------
    // Basic operation
    // -----------------------------------------------------------------------

    #[test]
    fn update_and_reopen_recovers_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);

        let (k1, k2) = {
            let mut store = RecordStore::create(&path).unwrap();
            let k1 = store.alloc_unused_key();
            let k2 = store.alloc_unused_key();
            store.update_record(k1, b"hello").unwrap();
            store.update_record(k2, b"world!").unwrap();
            store.flush().unwrap();
            (k1, k2)
        };

        let mut store = RecordStore::open(&path).unwrap();
        assert_eq!(store.num_records(), 2);
        assert_eq!(store.read_payload(k1).unwrap(), b"hello");
        assert_eq!(store.read_payload(k2).unwrap(), b"world!");
    }

    #[test]
    fn update_replaces_previous_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);

        let key = {
            let mut store = RecordStore::create(&path).unwrap();
            let key = store.alloc_unused_key();
            store.update_record(key, b"version one").unwrap();
            store.update_record(key, b"version two").unwrap();
            store.flush().unwrap();
            key
        };

        let mut store = RecordStore::open(&path).unwrap();
        assert_eq!(store.num_records(), 1);
        assert_eq!(store.read_payload(key).unwrap(), b"version two");
    }

    #[test]
    fn delete_removes_record_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);

        let (k1, k2) = {
            let mut store = RecordStore::create(&path).unwrap();
            let k1 = store.alloc_unused_key();
            let k2 = store.alloc_unused_key();
            store.update_record(k1, b"keep").unwrap();
            store.update_record(k2, b"drop").unwrap();
            store.delete_record(k2).unwrap();
            store.flush().unwrap();
            (k1, k2)
        };

        let mut store = RecordStore::open(&path).unwrap();
        assert_eq!(store.num_records(), 1);
        assert!(store.contains(k1));
        assert!(!store.contains(k2));
        // Deleted keys are never re-allocated.
        let k3 = store.alloc_unused_key();
        assert!(k3.0 > k2.0);
        assert_eq!(store.read_payload(k1).unwrap(), b"keep");
    }

    // -----------------------------------------------------------------------
    // Crash tolerance
    // -----------------------------------------------------------------------

    #[test]
    fn truncation_at_any_byte_recovers_valid_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);

        {
            let mut store = RecordStore::create(&path).unwrap();
            for i in 0..4u8 {
                let key = store.alloc_unused_key();
                store.update_record(key, &vec![i; 64]).unwrap();
            }
            store.flush().unwrap();
        }
        let full_len = std::fs::metadata(&path).unwrap().len();

        // Truncate at every byte position; open must never fail and must
        // recover every record whose bytes fully survive.
        for cut in (0..full_len).rev() {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(cut).unwrap();
            drop(file);

            let store = RecordStore::open(&path).unwrap();
            // 8-byte file header + 84 bytes per record (20 header + 64 body):
            // exactly the records whose bytes fully survive come back.
            let complete_records = (cut.saturating_sub(8) / 84).min(4);
            assert_eq!(
                store.num_records() as u64,
                complete_records,
                "cut={}",
                cut
            );
        }
    }

    #[test]
    fn corrupted_tail_checksum_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);

        let k1 = {
            let mut store = RecordStore::create(&path).unwrap();
            let k1 = store.alloc_unused_key();
            let k2 = store.alloc_unused_key();
            store.update_record(k1, b"good record").unwrap();
            store.update_record(k2, b"about to be torn").unwrap();
            store.flush().unwrap();
            k1
        };

        // Flip a byte in the last record's payload.
        let len = std::fs::metadata(&path).unwrap().len();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[(len - 3) as usize] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut store = RecordStore::open(&path).unwrap();
        assert_eq!(store.num_records(), 1);
        assert_eq!(store.read_payload(k1).unwrap(), b"good record");
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    #[test]
    fn compaction_keeps_live_records_and_shrinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);

        let mut store = RecordStore::create(&path).unwrap();
        let key = store.alloc_unused_key();
        for i in 0..50u32 {
            store.update_record(key, format!("copy {}", i).as_bytes()).unwrap();
        }
        let other = store.alloc_unused_key();
        store.update_record(other, b"other").unwrap();
        store.flush().unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        store.compact().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();

        assert!(after < before);
        assert_eq!(store.num_records(), 2);
        assert_eq!(store.read_payload(key).unwrap(), b"copy 49");
        assert_eq!(store.read_payload(other).unwrap(), b"other");

        // Key allocation stays monotonic after the swap.
        let next = store.alloc_unused_key();
        assert!(next.0 > other.0);
    }
}
