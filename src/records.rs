//! Auxiliary persisted records: users, orders, sessions, auctions,
//! screenshots, transactions, news posts, events, photos, storage items,
//! secrets, and the singleton info records.
//!
//! These are plain data carriers; each knows its record key and how to
//! serialise itself as a versioned block.

use crate::codec::{CodecError, CodecResult, Reader, Writer};
use crate::limits;
use crate::types::{RecordKey, TimeStamp, UserId};
use glam::DVec3;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const MAX_LIST_LEN: usize = 100_000;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

pub const USER_SERVER_ADMIN_FLAG: u32 = 1;
/// May create objects outside parcels in the root world.
pub const USER_WORLD_GARDENER_FLAG: u32 = 2;
/// Opt-in for the dynamic-texture poller to rewrite this user's objects.
pub const USER_ALLOW_DYN_TEX_UPDATE_FLAG: u32 = 4;

const USER_SERIALISATION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub created_time: TimeStamp,

    pub password_hash: String,
    pub password_salt: String,

    pub flags: u32,
    pub avatar_model_url: String,

    pub record_key: RecordKey,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: String::new(),
            created_time: TimeStamp::now(),
            password_hash: String::new(),
            password_salt: String::new(),
            flags: 0,
            avatar_model_url: String::new(),
            record_key: RecordKey::INVALID,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.flags & USER_SERVER_ADMIN_FLAG != 0
    }

    pub fn is_world_gardener(&self) -> bool {
        self.flags & USER_WORLD_GARDENER_FLAG != 0
    }

    pub fn allows_dyn_tex_update(&self) -> bool {
        self.flags & USER_ALLOW_DYN_TEX_UPDATE_FLAG != 0
    }

    fn hash_password(password: &str, salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn set_password(&mut self, password: &str, salt: impl Into<String>) {
        self.password_salt = salt.into();
        self.password_hash = Self::hash_password(password, &self.password_salt);
    }

    pub fn check_password(&self, password: &str) -> bool {
        !self.password_hash.is_empty()
            && Self::hash_password(password, &self.password_salt) == self.password_hash
    }

    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(USER_SERIALISATION_VERSION);
        w.write_user_id(self.id);
        w.write_string(&self.name);
        w.write_string(&self.email);
        w.write_timestamp(self.created_time);
        w.write_string(&self.password_hash);
        w.write_string(&self.password_salt);
        w.write_u32(self.flags);
        w.write_string(&self.avatar_model_url);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<User> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let id = r.read_user_id()?;
        let name = r.read_string(limits::MAX_NAME_SIZE)?;
        let mut user = User::new(id, name);
        user.email = r.read_string(limits::MAX_NAME_SIZE)?;
        user.created_time = r.read_timestamp()?;
        user.password_hash = r.read_string(limits::MAX_NAME_SIZE)?;
        user.password_salt = r.read_string(limits::MAX_NAME_SIZE)?;
        user.flags = r.read_u32()?;
        user.avatar_model_url = r.read_string(limits::MAX_URL_SIZE)?;
        r.finish_block(header);
        Ok(user)
    }
}

// ---------------------------------------------------------------------------
// Photo
// ---------------------------------------------------------------------------

const PHOTO_SERIALISATION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub id: u64,
    pub creator_id: UserId,
    pub created_time: TimeStamp,
    pub world_name: String,
    pub parcel_id: u64,

    pub cam_pos: DVec3,
    pub cam_angles: DVec3,
    pub caption: String,

    pub local_filename: String,
    pub local_midsize_filename: String,
    pub local_thumbnail_filename: String,

    pub record_key: RecordKey,
}

impl Photo {
    pub fn new(id: u64, creator_id: UserId) -> Self {
        Self {
            id,
            creator_id,
            created_time: TimeStamp::now(),
            world_name: String::new(),
            parcel_id: 0,
            cam_pos: DVec3::ZERO,
            cam_angles: DVec3::ZERO,
            caption: String::new(),
            local_filename: String::new(),
            local_midsize_filename: String::new(),
            local_thumbnail_filename: String::new(),
            record_key: RecordKey::INVALID,
        }
    }

    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(PHOTO_SERIALISATION_VERSION);
        w.write_u64(self.id);
        w.write_user_id(self.creator_id);
        w.write_timestamp(self.created_time);
        w.write_string(&self.world_name);
        w.write_u64(self.parcel_id);
        w.write_dvec3(self.cam_pos);
        w.write_dvec3(self.cam_angles);
        w.write_string(&self.caption);
        w.write_string(&self.local_filename);
        w.write_string(&self.local_midsize_filename);
        w.write_string(&self.local_thumbnail_filename);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<Photo> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let id = r.read_u64()?;
        let creator_id = r.read_user_id()?;
        let mut photo = Photo::new(id, creator_id);
        photo.created_time = r.read_timestamp()?;
        photo.world_name = r.read_string(limits::MAX_WORLD_NAME_SIZE)?;
        photo.parcel_id = r.read_u64()?;
        photo.cam_pos = r.read_dvec3()?;
        photo.cam_angles = r.read_dvec3()?;
        photo.caption = r.read_string(limits::MAX_CAPTION_SIZE)?;
        photo.local_filename = r.read_string(limits::MAX_NAME_SIZE)?;
        photo.local_midsize_filename = r.read_string(limits::MAX_NAME_SIZE)?;
        photo.local_thumbnail_filename = r.read_string(limits::MAX_NAME_SIZE)?;
        r.finish_block(header);
        Ok(photo)
    }
}

// ---------------------------------------------------------------------------
// Small auxiliary entities
// ---------------------------------------------------------------------------

macro_rules! simple_record {
    ($name:ident, $version:expr, { $($field:ident : $ty:tt),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            pub id: u64,
            $(pub $field: simple_record!(@ty $ty),)*
            pub record_key: RecordKey,
        }

        impl $name {
            pub fn new(id: u64) -> Self {
                Self { id, record_key: RecordKey::INVALID, ..Default::default() }
            }

            pub fn write_to(&self, w: &mut Writer) {
                let mark = w.begin_block($version);
                w.write_u64(self.id);
                $(simple_record!(@write w, self.$field, $ty);)*
                w.end_block(mark);
            }

            pub fn read_from(r: &mut Reader) -> CodecResult<$name> {
                let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
                let mut rec = $name::new(r.read_u64()?);
                $(simple_record!(@read r, rec.$field, $ty);)*
                r.finish_block(header);
                Ok(rec)
            }
        }
    };
    (@ty u64) => { u64 };
    (@ty u32) => { u32 };
    (@ty f64) => { f64 };
    (@ty user) => { UserId };
    (@ty time) => { TimeStamp };
    (@ty string) => { String };
    (@write $w:ident, $v:expr, u64) => { $w.write_u64($v) };
    (@write $w:ident, $v:expr, u32) => { $w.write_u32($v) };
    (@write $w:ident, $v:expr, f64) => { $w.write_f64($v) };
    (@write $w:ident, $v:expr, user) => { $w.write_user_id($v) };
    (@write $w:ident, $v:expr, time) => { $w.write_timestamp($v) };
    (@write $w:ident, $v:expr, string) => { $w.write_string(&$v) };
    (@read $r:ident, $v:expr, u64) => { $v = $r.read_u64()? };
    (@read $r:ident, $v:expr, u32) => { $v = $r.read_u32()? };
    (@read $r:ident, $v:expr, f64) => { $v = $r.read_f64()? };
    (@read $r:ident, $v:expr, user) => { $v = $r.read_user_id()? };
    (@read $r:ident, $v:expr, time) => { $v = $r.read_timestamp()? };
    (@read $r:ident, $v:expr, string) => { $v = $r.read_string(limits::MAX_CONTENT_SIZE)? };
}

simple_record!(Order, 1, {
    user_id: user,
    parcel_id: u64,
    created_time: time,
    price: f64,
    currency: string,
    confirmed: u32,
});

simple_record!(UserWebSession, 1, {
    user_id: user,
    created_time: time,
    token: string,
});

simple_record!(ParcelAuction, 1, {
    parcel_id: u64,
    start_time: time,
    end_time: time,
    start_price: f64,
    end_price: f64,
    state: u32,
});

simple_record!(Screenshot, 1, {
    created_time: time,
    cam_x: f64,
    cam_y: f64,
    cam_z: f64,
    local_filename: string,
    state: u32,
});

simple_record!(SubEthTransaction, 1, {
    user_id: user,
    created_time: time,
    parcel_id: u64,
    state: u32,
    transaction_hash: string,
});

simple_record!(NewsPost, 1, {
    creator_id: user,
    created_time: time,
    title: string,
    content: string,
    state: u32,
});

simple_record!(SubEvent, 1, {
    creator_id: user,
    created_time: time,
    start_time: time,
    end_time: time,
    world_name: string,
    title: string,
    description: string,
    state: u32,
});

simple_record!(ObjectStorageItem, 1, {
    creator_id: user,
    key: string,
    value: string,
});

simple_record!(UserSecret, 1, {
    owner_id: user,
    name: string,
    value: string,
});

// ---------------------------------------------------------------------------
// Singleton info records
// ---------------------------------------------------------------------------

const INFO_SERIALISATION_VERSION: u32 = 1;

/// Server-wide credentials (LLM API keys, SMTP passwords, …), keyed by a
/// canonical name.  Stored as a single record; no environment fallback.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerCredentials {
    pub creds: HashMap<String, String>,
    pub record_key: RecordKey,
}

impl ServerCredentials {
    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(INFO_SERIALISATION_VERSION);
        w.write_u32(self.creds.len() as u32);
        let mut names: Vec<&String> = self.creds.keys().collect();
        names.sort(); // deterministic record bytes
        for name in names {
            w.write_string(name);
            w.write_string(&self.creds[name]);
        }
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<ServerCredentials> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let len = r.read_u32()? as usize;
        if len > MAX_LIST_LEN {
            return Err(CodecError::Corrupted("credentials map too large".to_string()));
        }
        let mut creds = ServerCredentials::default();
        for _ in 0..len {
            let name = r.read_string(limits::MAX_NAME_SIZE)?;
            let value = r.read_string(limits::MAX_CONTENT_SIZE)?;
            creds.creds.insert(name, value);
        }
        r.finish_block(header);
        Ok(creds)
    }
}

/// Feature kill-switches togglable at runtime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureFlags {
    pub flags: u64,
    pub record_key: RecordKey,
}

impl FeatureFlags {
    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(INFO_SERIALISATION_VERSION);
        w.write_u64(self.flags);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<FeatureFlags> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let flags = r.read_u64()?;
        r.finish_block(header);
        Ok(FeatureFlags {
            flags,
            record_key: RecordKey::INVALID,
        })
    }
}

/// Map-tile generation bookkeeping for the web map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapTileInfo {
    /// (x, y, zoom) → screenshot id.
    pub tiles: HashMap<(i32, i32, i32), u64>,
    pub record_key: RecordKey,
}

impl MapTileInfo {
    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(INFO_SERIALISATION_VERSION);
        w.write_u32(self.tiles.len() as u32);
        let mut keys: Vec<&(i32, i32, i32)> = self.tiles.keys().collect();
        keys.sort();
        for k in keys {
            w.write_i32(k.0);
            w.write_i32(k.1);
            w.write_i32(k.2);
            w.write_u64(self.tiles[k]);
        }
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<MapTileInfo> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let len = r.read_u32()? as usize;
        if len > MAX_LIST_LEN {
            return Err(CodecError::Corrupted("map tile table too large".to_string()));
        }
        let mut info = MapTileInfo::default();
        for _ in 0..len {
            let k = (r.read_i32()?, r.read_i32()?, r.read_i32()?);
            info.tiles.insert(k, r.read_u64()?);
        }
        r.finish_block(header);
        Ok(info)
    }
}

/// On-chain bookkeeping for parcel NFT minting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EthInfo {
    pub min_next_nonce: u64,
    pub record_key: RecordKey,
}

impl EthInfo {
    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(INFO_SERIALISATION_VERSION);
        w.write_u64(self.min_next_nonce);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<EthInfo> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let min_next_nonce = r.read_u64()?;
        r.finish_block(header);
        Ok(EthInfo {
            min_next_nonce,
            record_key: RecordKey::INVALID,
        })
    }
}

/// Persisted schema migration level; see `AllWorlds::run_migrations`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MigrationVersion {
    pub version: u32,
    pub record_key: RecordKey,
}

impl MigrationVersion {
    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(INFO_SERIALISATION_VERSION);
        w.write_u32(self.version);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<MigrationVersion> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let version = r.read_u32()?;
        r.finish_block(header);
        Ok(MigrationVersion {
            version,
            record_key: RecordKey::INVALID,
        })
    }
}
