//! Append-only keyed-record file with a live in-memory index.
//!
//! ## File layout
//!
//! ```text
//! file header:   magic:u32, format_version:u32
//! record:        status:u32 (1 = valid, 0 = retired), key:u64, len:u32,
//!                crc:u32 (crc32 of payload), payload[len]
//! ```
//!
//! Updates append a fresh copy of the record and then retire the previous
//! copy in place; deletes just retire.  Nothing is durable until
//! [`RecordStore::flush`].  A crash mid-append leaves a torn record at the
//! tail: the scan detects it by length overrun or checksum mismatch and stops
//! there, so the previous valid copy stays authoritative.
//!
//! Retiring only touches the status word, which the checksum deliberately
//! does not cover.

use crate::types::RecordKey;
use log::warn;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const STORE_MAGIC: u32 = 0x43590DB1;
const STORE_FORMAT_VERSION: u32 = 1;
const FILE_HEADER_SIZE: u64 = 8;
const RECORD_HEADER_SIZE: u64 = 20;

const STATUS_VALID: u32 = 1;
const STATUS_RETIRED: u32 = 0;

/// Largest payload the store will read back.  Larger lengths at scan time are
/// treated as tail corruption.
const MAX_RECORD_LEN: u32 = 256 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("'{path}' is not a record store (bad magic)")]
    BadMagic { path: String },

    #[error("unsupported record store format version {0}")]
    UnsupportedFormat(u32),

    #[error("no record with key {0:?}")]
    NoSuchRecord(RecordKey),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Record info
// ---------------------------------------------------------------------------

/// Index entry: where a live record's payload sits in the file.
#[derive(Debug, Clone, Copy)]
pub struct RecordInfo {
    /// Offset of the record *header*.
    pub offset: u64,
    /// Payload length in bytes.
    pub len: u32,
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

pub struct RecordStore {
    file: File,
    path: PathBuf,
    index: HashMap<RecordKey, RecordInfo>,
    next_key: u64,
    append_pos: u64,
}

impl RecordStore {
    /// Open an existing store, scanning the whole file to rebuild the index,
    /// or create a fresh one if the file does not exist.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if path.exists() {
            Self::open_existing(path)
        } else {
            Self::create(path)
        }
    }

    /// Create a new empty store, truncating any existing file.
    pub fn create(path: &Path) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&STORE_MAGIC.to_le_bytes())?;
        file.write_all(&STORE_FORMAT_VERSION.to_le_bytes())?;
        file.sync_all()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            index: HashMap::new(),
            next_key: 0,
            append_pos: FILE_HEADER_SIZE,
        })
    }

    fn open_existing(path: &Path) -> StoreResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; 8];
        if file.read_exact(&mut header).is_err() {
            // Shorter than a file header: treat as empty and start over.
            warn!("record store '{}' has a truncated header, recreating", path.display());
            drop(file);
            return Self::create(path);
        }
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let format = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if magic != STORE_MAGIC {
            return Err(StoreError::BadMagic {
                path: path.display().to_string(),
            });
        }
        if format != STORE_FORMAT_VERSION {
            return Err(StoreError::UnsupportedFormat(format));
        }

        let file_len = file.metadata()?.len();
        let mut index: HashMap<RecordKey, RecordInfo> = HashMap::new();
        let mut next_key = 0u64;
        let mut pos = FILE_HEADER_SIZE;

        // Scan every record.  A later valid copy of a key beats an earlier
        // one (a crash can leave both valid).  Stop at the first record that
        // does not check out; everything after a torn tail is garbage.
        loop {
            if pos + RECORD_HEADER_SIZE > file_len {
                break;
            }
            let mut rec_header = [0u8; RECORD_HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut rec_header)?;

            let status = u32::from_le_bytes([rec_header[0], rec_header[1], rec_header[2], rec_header[3]]);
            let key = u64::from_le_bytes([
                rec_header[4], rec_header[5], rec_header[6], rec_header[7],
                rec_header[8], rec_header[9], rec_header[10], rec_header[11],
            ]);
            let len = u32::from_le_bytes([rec_header[12], rec_header[13], rec_header[14], rec_header[15]]);
            let crc = u32::from_le_bytes([rec_header[16], rec_header[17], rec_header[18], rec_header[19]]);

            if len > MAX_RECORD_LEN || pos + RECORD_HEADER_SIZE + len as u64 > file_len {
                warn!(
                    "record store '{}': torn record at offset {}, ignoring tail",
                    path.display(),
                    pos
                );
                break;
            }

            let mut payload = vec![0u8; len as usize];
            file.read_exact(&mut payload)?;
            if crc32fast::hash(&payload) != crc {
                warn!(
                    "record store '{}': checksum mismatch at offset {}, ignoring tail",
                    path.display(),
                    pos
                );
                break;
            }

            next_key = next_key.max(key + 1);
            if status == STATUS_VALID {
                index.insert(RecordKey(key), RecordInfo { offset: pos, len });
            }
            pos += RECORD_HEADER_SIZE + len as u64;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            index,
            next_key,
            append_pos: pos,
        })
    }

    /// Allocate a key no record has ever used.
    pub fn alloc_unused_key(&mut self) -> RecordKey {
        let key = RecordKey(self.next_key);
        self.next_key += 1;
        key
    }

    pub fn num_records(&self) -> usize {
        self.index.len()
    }

    pub fn contains(&self, key: RecordKey) -> bool {
        self.index.contains_key(&key)
    }

    /// Iterate over every live record's key and location.
    pub fn records(&self) -> impl Iterator<Item = (RecordKey, RecordInfo)> + '_ {
        self.index.iter().map(|(k, info)| (*k, *info))
    }

    /// Read a live record's payload bytes.
    pub fn read_payload(&mut self, key: RecordKey) -> StoreResult<Vec<u8>> {
        let info = *self.index.get(&key).ok_or(StoreError::NoSuchRecord(key))?;
        self.read_payload_at(info)
    }

    /// Read the payload for an index entry obtained from [`RecordStore::records`].
    pub fn read_payload_at(&mut self, info: RecordInfo) -> StoreResult<Vec<u8>> {
        let mut payload = vec![0u8; info.len as usize];
        self.file
            .seek(SeekFrom::Start(info.offset + RECORD_HEADER_SIZE))?;
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Append a fresh copy of the record, then retire the previous copy.
    /// The append happens first so a crash between the two leaves the newer
    /// copy winning the scan.
    pub fn update_record(&mut self, key: RecordKey, payload: &[u8]) -> StoreResult<()> {
        self.next_key = self.next_key.max(key.0 + 1);

        let offset = self.append_pos;
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&STATUS_VALID.to_le_bytes());
        header[4..12].copy_from_slice(&key.0.to_le_bytes());
        header[12..16].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[16..20].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.append_pos = offset + RECORD_HEADER_SIZE + payload.len() as u64;

        let previous = self
            .index
            .insert(key, RecordInfo { offset, len: payload.len() as u32 });
        if let Some(prev) = previous {
            self.retire_at(prev.offset)?;
        }
        Ok(())
    }

    /// Retire the record's slot.  Unknown keys are fine: the entity may never
    /// have been flushed.
    pub fn delete_record(&mut self, key: RecordKey) -> StoreResult<()> {
        if let Some(info) = self.index.remove(&key) {
            self.retire_at(info.offset)?;
        }
        Ok(())
    }

    /// Durability point.
    pub fn flush(&mut self) -> StoreResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Write every live record to a fresh file and atomically swap it in.
    pub fn compact(&mut self) -> StoreResult<()> {
        let tmp_path = self.path.with_extension("compacting");
        {
            let mut new_store = RecordStore::create(&tmp_path)?;
            let keys: Vec<RecordKey> = self.index.keys().copied().collect();
            for key in keys {
                let payload = self.read_payload(key)?;
                new_store.update_record(key, &payload)?;
            }
            new_store.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let reopened = RecordStore::open_existing(&self.path)?;
        let next_key = self.next_key.max(reopened.next_key);
        *self = reopened;
        self.next_key = next_key;
        Ok(())
    }

    fn retire_at(&mut self, offset: u64) -> StoreResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&STATUS_RETIRED.to_le_bytes())?;
        Ok(())
    }
}
