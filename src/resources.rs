//! Resource registry: content-addressed URLs mapped to local files.
//!
//! A *resource* is any binary asset (mesh, texture, audio, photo) named by a
//! URL of the form `<name>_<hash>.<ext>` or `<name>_<hash>_<epoch>.<ext>`.
//! The registry maps each URL to a relative path under the resource
//! directory and a presence state.  Presence is cached: `Present` is only
//! ever set after the file is known to exist on disk, so `Present ⇒ file
//! exists` holds without a stat per query.

use crate::types::{RecordKey, UserId};
use log::info;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh64::xxh64;

/// Longest absolute path we will derive from a URL before falling back to a
/// hashed filename.
const MAX_PATH_LEN: usize = 250;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no resource for URL '{0}'")]
    NoSuchResource(String),

    #[error("resource file missing for URL '{0}'")]
    FileMissing(String),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    NotPresent,
    Transferring,
    Present,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub url: String,
    /// Path relative to the resource directory.
    pub local_path: String,
    pub state: ResourceState,
    pub owner: UserId,
    /// External resources live outside the resource dir and are not persisted.
    pub external: bool,

    pub record_key: RecordKey,
}

impl Resource {
    pub fn new(url: impl Into<String>, local_path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            local_path: local_path.into(),
            state: ResourceState::NotPresent,
            owner: UserId::INVALID,
            external: false,
            record_key: RecordKey::INVALID,
        }
    }
}

const RESOURCE_SERIALISATION_VERSION: u32 = 3;

impl Resource {
    pub fn write_to(&self, w: &mut crate::codec::Writer) {
        let mark = w.begin_block(RESOURCE_SERIALISATION_VERSION);
        w.write_string(&self.url);
        w.write_string(&self.local_path);
        w.write_user_id(self.owner);
        w.write_u32(match self.state {
            ResourceState::NotPresent => 0,
            ResourceState::Transferring => 1,
            ResourceState::Present => 2,
        });
        w.end_block(mark);
    }

    pub fn read_from(r: &mut crate::codec::Reader) -> crate::codec::CodecResult<Resource> {
        let header = r.begin_block(crate::limits::MAX_AUX_RECORD_SIZE)?;
        let url = r.read_string(crate::limits::MAX_URL_SIZE)?;
        let local_path = r.read_string(crate::limits::MAX_URL_SIZE)?;
        let mut resource = Resource::new(url, local_path);
        resource.owner = r.read_user_id()?;
        if header.version >= 3 {
            resource.state = match r.read_u32()? {
                1 => ResourceState::Transferring,
                2 => ResourceState::Present,
                _ => ResourceState::NotPresent,
            };
        } else {
            // Records from before the state field was added are assumed to
            // have their file on disk.
            resource.state = ResourceState::Present;
        }
        r.finish_block(header);
        Ok(resource)
    }
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

fn filename_of(path: &str) -> &str {
    let cut = path.rfind(['/', '\\', ':']).map(|i| i + 1).unwrap_or(0);
    &path[cut..]
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(i) => (&filename[..i], &filename[i + 1..]),
        None => (filename, ""),
    }
}

/// Non-alphanumeric characters become underscores.
fn sanitise(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Alphanumerics, underscores and dots pass through; every other byte is
/// encoded as `_<decimal>`.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for b in s.bytes() {
        let c = b as char;
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            out.push(c);
        } else {
            out.push('_');
            out.push_str(&(b as u32).to_string());
        }
    }
    out
}

/// `"d:/a/b.mp3"`, 17 → `"b_17.mp3"`.
pub fn url_for_path_and_hash(path: &str, hash: u64) -> String {
    let (stem, ext) = split_extension(filename_of(path));
    format!("{}_{}.{}", sanitise(stem), hash, ext)
}

/// `"d:/a/b.bmesh"`, 17, 2 → `"b_17_2.bmesh"`.  The epoch varies the URL when
/// a derivation algorithm changes, punching through client caches.
pub fn url_for_path_and_hash_and_epoch(path: &str, hash: u64, epoch: u32) -> String {
    let (stem, ext) = split_extension(filename_of(path));
    format!("{}_{}_{}.{}", sanitise(stem), hash, epoch, ext)
}

pub fn url_for_name_and_extension_and_hash(name: &str, extension: &str, hash: u64) -> String {
    format!("{}_{}.{}", sanitise(name), hash, extension)
}

/// 64-bit content hash used throughout the URL scheme.
pub fn content_hash(data: &[u8]) -> u64 {
    xxh64(data, 1)
}

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

struct Inner {
    resource_for_url: HashMap<String, Resource>,
    /// URLs whose persisted form is stale; drained by the snapshotter.
    dirty: HashSet<String>,
    /// URLs we will not retry downloading this run.
    download_failed: HashSet<String>,
}

/// Threadsafe URL → [`Resource`] map over a base directory.
///
/// Callers must not hold the world mutex across the file copies this type
/// performs; the lock discipline is collect-under-lock, copy, commit.
pub struct ResourceManager {
    base_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl ResourceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            inner: Mutex::new(Inner {
                resource_for_url: HashMap::new(),
                dirty: HashSet::new(),
                download_failed: HashSet::new(),
            }),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Default relative path for a URL: the escaped URL, or a 16-hex hashed
    /// filename when the escaped form would blow the path-length limit.
    pub fn default_local_path_for_url(&self, url: &str) -> String {
        let escaped = escape(url);
        let abs_len = self.base_dir.as_os_str().len() + 1 + escaped.len();
        if abs_len >= MAX_PATH_LEN {
            let (_stem, ext) = split_extension(&escaped);
            format!("{:016x}.{}", xxh64(url.as_bytes(), 1), ext)
        } else {
            escaped
        }
    }

    /// Absolute path a resource's bytes live at (or will live at).
    pub fn local_abs_path(&self, resource: &Resource) -> PathBuf {
        if resource.external {
            PathBuf::from(&resource.local_path)
        } else {
            self.base_dir.join(&resource.local_path)
        }
    }

    pub fn abs_path_for_url(&self, url: &str) -> PathBuf {
        let resource = self.get_or_create(url);
        self.local_abs_path(&resource)
    }

    /// Return the existing entry or insert a `NotPresent` one.
    pub fn get_or_create(&self, url: &str) -> Resource {
        let mut inner = self.inner.lock();
        if let Some(r) = inner.resource_for_url.get(url) {
            return r.clone();
        }
        let resource = Resource::new(url, self.default_local_path_for_url(url));
        inner
            .resource_for_url
            .insert(url.to_string(), resource.clone());
        inner.dirty.insert(url.to_string());
        resource
    }

    pub fn get_existing(&self, url: &str) -> Option<Resource> {
        self.inner.lock().resource_for_url.get(url).cloned()
    }

    /// Presence check from cached state; no filesystem stat.
    pub fn is_present(&self, url: &str) -> bool {
        self.inner
            .lock()
            .resource_for_url
            .get(url)
            .map(|r| r.state == ResourceState::Present)
            .unwrap_or(false)
    }

    pub fn set_state(&self, url: &str, state: ResourceState) {
        let mut inner = self.inner.lock();
        if let Some(r) = inner.resource_for_url.get_mut(url) {
            r.state = state;
            inner.dirty.insert(url.to_string());
        }
    }

    pub fn set_owner(&self, url: &str, owner: UserId) {
        let mut inner = self.inner.lock();
        if let Some(r) = inner.resource_for_url.get_mut(url) {
            r.owner = owner;
            inner.dirty.insert(url.to_string());
        }
    }

    /// Assert the file is already on disk and mark the resource present.
    pub fn mark_as_locally_present(&self, url: &str) -> ResourceResult<()> {
        let resource = self.get_or_create(url);
        if !self.local_abs_path(&resource).exists() {
            return Err(ResourceError::FileMissing(url.to_string()));
        }
        self.set_state(url, ResourceState::Present);
        Ok(())
    }

    /// Copy a local file into the resource dir and mark the resource present,
    /// iff it was not already present.  The copy happens before the state
    /// transition and outside the registry lock.
    pub fn copy_local_file(&self, local_path: &Path, url: &str) -> ResourceResult<()> {
        let dest = {
            let resource = self.get_or_create(url);
            if resource.state == ResourceState::Present {
                None
            } else {
                Some(self.local_abs_path(&resource))
            }
        };

        if let Some(dest) = dest {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(local_path, &dest)?;
            self.set_state(url, ResourceState::Present);
            info!("copied '{}' into resource dir as '{}'", local_path.display(), url);
        }
        Ok(())
    }

    /// Write bytes straight into the resource dir and mark present.
    pub fn write_resource_file(&self, url: &str, data: &[u8]) -> ResourceResult<()> {
        let resource = self.get_or_create(url);
        let dest = self.local_abs_path(&resource);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, data)?;
        self.set_state(url, ResourceState::Present);
        Ok(())
    }

    /// Read a present resource's bytes.
    pub fn read_resource_file(&self, url: &str) -> ResourceResult<Vec<u8>> {
        let resource = self
            .get_existing(url)
            .ok_or_else(|| ResourceError::NoSuchResource(url.to_string()))?;
        if resource.state != ResourceState::Present {
            return Err(ResourceError::FileMissing(url.to_string()));
        }
        Ok(std::fs::read(self.local_abs_path(&resource))?)
    }

    // -----------------------------------------------------------------------
    // Download-failed set
    // -----------------------------------------------------------------------

    pub fn add_to_download_failed_urls(&self, url: &str) {
        self.inner.lock().download_failed.insert(url.to_string());
    }

    pub fn is_in_download_failed_urls(&self, url: &str) -> bool {
        self.inner.lock().download_failed.contains(url)
    }

    // -----------------------------------------------------------------------
    // Persistence plumbing
    // -----------------------------------------------------------------------

    /// Insert a resource deserialised from the record store.
    pub fn add_resource(&self, resource: Resource) {
        let mut inner = self.inner.lock();
        inner
            .resource_for_url
            .insert(resource.url.clone(), resource);
    }

    pub fn set_record_key(&self, url: &str, key: RecordKey) {
        let mut inner = self.inner.lock();
        if let Some(r) = inner.resource_for_url.get_mut(url) {
            r.record_key = key;
        }
    }

    /// Snapshot of the dirty, non-external resources, clearing the dirty set.
    pub fn take_dirty(&self) -> Vec<Resource> {
        let mut inner = self.inner.lock();
        let urls: Vec<String> = inner.dirty.drain().collect();
        urls.iter()
            .filter_map(|u| inner.resource_for_url.get(u))
            .filter(|r| !r.external)
            .cloned()
            .collect()
    }

    pub fn num_resources(&self) -> usize {
        self.inner.lock().resource_for_url.len()
    }
}
