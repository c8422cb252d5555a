//! World state: every world's entity maps, the per-type dirty sets, UID
//! counters, and (de)serialisation of the whole lot through the record store.
//!
//! ## Locking
//!
//! One process-wide `parking_lot::Mutex<AllWorlds>` guards everything here –
//! all entity maps, dirty sets and counters.  Mutating operations, and reads
//! that serialise entities, take it.  Callers must not hold it across
//! blocking I/O; the snapshotter's pattern is collect-under-lock, write,
//! re-acquire to commit record keys.
//!
//! ## Persistence
//!
//! Every record-store payload starts with a `u32` record-type tag, then the
//! entity's own versioned block.  Unknown tags are skipped with a warning so
//! a downgraded server can still open a newer database.

use crate::avatar::Avatar;
use crate::chunk::LodChunk;
use crate::codec::{CodecError, CodecResult, Reader, Writer};
use crate::limits;
use crate::object::{self, WorldObject};
use crate::parcel::Parcel;
use crate::records::{
    EthInfo, FeatureFlags, MapTileInfo, MigrationVersion, NewsPost, ObjectStorageItem, Order,
    ParcelAuction, Photo, Screenshot, ServerCredentials, SubEthTransaction, SubEvent, User,
    UserSecret, UserWebSession,
};
use crate::resources::{Resource, ResourceManager};
use crate::store::{RecordStore, StoreResult};
use crate::types::{ChunkCoord, RecordKey, Uid, UserId};
use glam::DVec3;
use log::{info, warn};
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// Record type tags
// ---------------------------------------------------------------------------

pub const WORLD_RECORD: u32 = 1;
pub const WORLD_SETTINGS_RECORD: u32 = 2;
pub const OBJECT_RECORD: u32 = 3;
pub const USER_RECORD: u32 = 4;
pub const PARCEL_RECORD: u32 = 5;
pub const RESOURCE_RECORD: u32 = 6;
pub const ORDER_RECORD: u32 = 7;
pub const WEB_SESSION_RECORD: u32 = 8;
pub const AUCTION_RECORD: u32 = 9;
pub const SCREENSHOT_RECORD: u32 = 10;
pub const ETH_TRANSACTION_RECORD: u32 = 11;
pub const NEWS_POST_RECORD: u32 = 12;
pub const FEATURE_FLAGS_RECORD: u32 = 13;
pub const OBJECT_STORAGE_ITEM_RECORD: u32 = 14;
pub const USER_SECRET_RECORD: u32 = 15;
pub const LOD_CHUNK_RECORD: u32 = 16;
pub const EVENT_RECORD: u32 = 17;
pub const MIGRATION_VERSION_RECORD: u32 = 18;
pub const PHOTO_RECORD: u32 = 19;
pub const MAP_TILE_INFO_RECORD: u32 = 20;
pub const ETH_INFO_RECORD: u32 = 21;
pub const CREDENTIALS_RECORD: u32 = 22;

/// End-of-stream sentinel in the legacy single-stream file format.
const LEGACY_EOS: u32 = 1000;
/// Magic number opening the legacy single-stream file format.
const LEGACY_MAGIC: u32 = 0xCB50_5EBA;

const CURRENT_MIGRATION_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// World settings
// ---------------------------------------------------------------------------

const WORLD_SETTINGS_SERIALISATION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct WorldSettings {
    pub spawn_pos: DVec3,
    pub description: String,
    pub record_key: RecordKey,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            spawn_pos: DVec3::new(0.0, 0.0, 2.0),
            description: String::new(),
            record_key: RecordKey::INVALID,
        }
    }
}

impl WorldSettings {
    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(WORLD_SETTINGS_SERIALISATION_VERSION);
        w.write_dvec3(self.spawn_pos);
        w.write_string(&self.description);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<WorldSettings> {
        let header = r.begin_block(limits::MAX_WORLD_SETTINGS_SIZE)?;
        let mut settings = WorldSettings {
            spawn_pos: r.read_dvec3()?,
            ..Default::default()
        };
        settings.description = r.read_string(limits::MAX_CONTENT_SIZE)?;
        r.finish_block(header);
        Ok(settings)
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

const WORLD_DETAILS_SERIALISATION_VERSION: u32 = 1;

/// A named world: entity maps plus db-dirty bookkeeping.
///
/// The empty name is the root world; a user's personal world carries their
/// username.
pub struct World {
    pub name: String,
    pub owner_id: UserId,
    pub created_time: crate::types::TimeStamp,
    pub settings: WorldSettings,

    pub objects: HashMap<Uid, WorldObject>,
    pub avatars: HashMap<Uid, Avatar>,
    pub parcels: HashMap<u64, Parcel>,
    pub chunks: HashMap<ChunkCoord, LodChunk>,

    pub db_dirty_objects: HashSet<Uid>,
    pub db_dirty_parcels: HashSet<u64>,
    pub db_dirty_chunks: HashSet<ChunkCoord>,
    pub db_dirty_world: bool,
    pub db_dirty_settings: bool,

    pub record_key: RecordKey,
}

impl World {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner_id: UserId::INVALID,
            created_time: crate::types::TimeStamp::now(),
            settings: WorldSettings::default(),
            objects: HashMap::new(),
            avatars: HashMap::new(),
            parcels: HashMap::new(),
            chunks: HashMap::new(),
            db_dirty_objects: HashSet::new(),
            db_dirty_parcels: HashSet::new(),
            db_dirty_chunks: HashSet::new(),
            db_dirty_world: false,
            db_dirty_settings: false,
            record_key: RecordKey::INVALID,
        }
    }

    /// The parcel containing a world-space point, if any.
    pub fn parcel_containing(&self, p: DVec3) -> Option<&Parcel> {
        self.parcels.values().find(|parcel| parcel.contains(p))
    }

    /// Get or lazily create the LOD chunk for a coordinate.
    pub fn chunk_entry(&mut self, coords: ChunkCoord) -> &mut LodChunk {
        self.chunks
            .entry(coords)
            .or_insert_with(|| LodChunk::new(coords))
    }

    fn write_details_to(&self, w: &mut Writer) {
        let mark = w.begin_block(WORLD_DETAILS_SERIALISATION_VERSION);
        w.write_string(&self.name);
        w.write_user_id(self.owner_id);
        w.write_timestamp(self.created_time);
        w.end_block(mark);
    }

    fn read_details_from(r: &mut Reader) -> CodecResult<World> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let name = r.read_string(limits::MAX_WORLD_NAME_SIZE)?;
        let mut world = World::new(name);
        world.owner_id = r.read_user_id()?;
        world.created_time = r.read_timestamp()?;
        r.finish_block(header);
        Ok(world)
    }
}

// ---------------------------------------------------------------------------
// AllWorlds
// ---------------------------------------------------------------------------

/// Everything the world mutex guards.
pub struct AllWorlds {
    pub worlds: HashMap<String, World>,

    pub users: HashMap<UserId, User>,
    pub orders: HashMap<u64, Order>,
    pub web_sessions: HashMap<u64, UserWebSession>,
    pub auctions: HashMap<u64, ParcelAuction>,
    pub screenshots: HashMap<u64, Screenshot>,
    pub eth_transactions: HashMap<u64, SubEthTransaction>,
    pub news_posts: HashMap<u64, NewsPost>,
    pub events: HashMap<u64, SubEvent>,
    pub object_storage_items: HashMap<u64, ObjectStorageItem>,
    pub user_secrets: HashMap<u64, UserSecret>,
    pub photos: HashMap<u64, Photo>,

    pub db_dirty_users: HashSet<UserId>,
    pub db_dirty_orders: HashSet<u64>,
    pub db_dirty_web_sessions: HashSet<u64>,
    pub db_dirty_auctions: HashSet<u64>,
    pub db_dirty_screenshots: HashSet<u64>,
    pub db_dirty_eth_transactions: HashSet<u64>,
    pub db_dirty_news_posts: HashSet<u64>,
    pub db_dirty_events: HashSet<u64>,
    pub db_dirty_object_storage_items: HashSet<u64>,
    pub db_dirty_user_secrets: HashSet<u64>,
    pub db_dirty_photos: HashSet<u64>,

    pub credentials: ServerCredentials,
    pub feature_flags: FeatureFlags,
    pub map_tile_info: MapTileInfo,
    pub eth_info: EthInfo,
    pub migration_version: MigrationVersion,
    pub db_dirty_credentials: bool,
    pub db_dirty_feature_flags: bool,
    pub db_dirty_map_tile_info: bool,
    pub db_dirty_eth_info: bool,
    pub db_dirty_migration_version: bool,

    /// Record keys of entities removed in memory whose disk slot still needs
    /// reclaiming at the next flush.
    pub db_records_to_delete: HashSet<RecordKey>,

    next_object_uid: u64,
    next_avatar_uid: u64,
    next_user_id: u64,
    next_parcel_id: u64,
    next_order_id: u64,
    next_photo_id: u64,
    next_screenshot_id: u64,
    next_transaction_id: u64,
    next_event_id: u64,
    next_news_post_id: u64,

    /// Admin toggle: the dynamic-texture poller runs immediately on its next
    /// wake-up instead of waiting out the hourly period.
    pub force_dyn_tex_update: bool,
}

impl Default for AllWorlds {
    fn default() -> Self {
        Self::new()
    }
}

impl AllWorlds {
    pub fn new() -> Self {
        let mut state = Self {
            worlds: HashMap::new(),
            users: HashMap::new(),
            orders: HashMap::new(),
            web_sessions: HashMap::new(),
            auctions: HashMap::new(),
            screenshots: HashMap::new(),
            eth_transactions: HashMap::new(),
            news_posts: HashMap::new(),
            events: HashMap::new(),
            object_storage_items: HashMap::new(),
            user_secrets: HashMap::new(),
            photos: HashMap::new(),
            db_dirty_users: HashSet::new(),
            db_dirty_orders: HashSet::new(),
            db_dirty_web_sessions: HashSet::new(),
            db_dirty_auctions: HashSet::new(),
            db_dirty_screenshots: HashSet::new(),
            db_dirty_eth_transactions: HashSet::new(),
            db_dirty_news_posts: HashSet::new(),
            db_dirty_events: HashSet::new(),
            db_dirty_object_storage_items: HashSet::new(),
            db_dirty_user_secrets: HashSet::new(),
            db_dirty_photos: HashSet::new(),
            credentials: ServerCredentials::default(),
            feature_flags: FeatureFlags::default(),
            map_tile_info: MapTileInfo::default(),
            eth_info: EthInfo::default(),
            migration_version: MigrationVersion::default(),
            db_dirty_credentials: false,
            db_dirty_feature_flags: false,
            db_dirty_map_tile_info: false,
            db_dirty_eth_info: false,
            db_dirty_migration_version: false,
            db_records_to_delete: HashSet::new(),
            next_object_uid: 0,
            next_avatar_uid: 0,
            next_user_id: 0,
            next_parcel_id: 0,
            next_order_id: 0,
            next_photo_id: 0,
            next_screenshot_id: 0,
            next_transaction_id: 0,
            next_event_id: 0,
            next_news_post_id: 0,
            force_dyn_tex_update: false,
        };
        state.ensure_root_world();
        state
    }

    pub fn ensure_root_world(&mut self) -> &mut World {
        self.worlds
            .entry(String::new())
            .or_insert_with(|| World::new(""))
    }

    pub fn world(&self, name: &str) -> Option<&World> {
        self.worlds.get(name)
    }

    pub fn world_mut(&mut self, name: &str) -> Option<&mut World> {
        self.worlds.get_mut(name)
    }

    /// Get or create a world, marking a new one db-dirty.
    pub fn world_entry(&mut self, name: &str) -> &mut World {
        self.worlds.entry(name.to_string()).or_insert_with(|| {
            let mut world = World::new(name);
            world.db_dirty_world = true;
            world
        })
    }

    // -----------------------------------------------------------------------
    // Id allocation
    // -----------------------------------------------------------------------

    pub fn alloc_object_uid(&mut self) -> Uid {
        let uid = Uid(self.next_object_uid);
        self.next_object_uid += 1;
        uid
    }

    pub fn alloc_avatar_uid(&mut self) -> Uid {
        let uid = Uid(self.next_avatar_uid);
        self.next_avatar_uid += 1;
        uid
    }

    pub fn alloc_user_id(&mut self) -> UserId {
        let id = UserId(self.next_user_id);
        self.next_user_id += 1;
        id
    }

    pub fn alloc_parcel_id(&mut self) -> u64 {
        let id = self.next_parcel_id;
        self.next_parcel_id += 1;
        id
    }

    pub fn alloc_order_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    pub fn alloc_photo_id(&mut self) -> u64 {
        let id = self.next_photo_id;
        self.next_photo_id += 1;
        id
    }

    pub fn alloc_screenshot_id(&mut self) -> u64 {
        let id = self.next_screenshot_id;
        self.next_screenshot_id += 1;
        id
    }

    pub fn alloc_transaction_id(&mut self) -> u64 {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        id
    }

    pub fn alloc_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    pub fn alloc_news_post_id(&mut self) -> u64 {
        let id = self.next_news_post_id;
        self.next_news_post_id += 1;
        id
    }

    // -----------------------------------------------------------------------
    // Lookup helpers
    // -----------------------------------------------------------------------

    pub fn user_by_name(&self, name: &str) -> Option<&User> {
        self.users.values().find(|u| u.name == name)
    }

    pub fn user_display_name(&self, id: UserId) -> String {
        self.users
            .get(&id)
            .map(|u| u.name.clone())
            .unwrap_or_default()
    }

    /// Queue an entity's record slot for reclamation at the next flush.
    pub fn queue_record_delete(&mut self, key: RecordKey) {
        if key.valid() {
            self.db_records_to_delete.insert(key);
        }
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    /// Populate from an opened record store, then denormalise and migrate.
    ///
    /// Corrupted records are skipped with a warning; the server runs with
    /// what it could read.
    pub fn load(&mut self, store: &mut RecordStore, resources: &ResourceManager) -> StoreResult<()> {
        let records: Vec<(RecordKey, crate::store::RecordInfo)> = store.records().collect();
        let mut num_loaded = 0usize;
        let mut num_corrupt = 0usize;

        for (key, info) in records {
            let payload = store.read_payload_at(info)?;
            match self.load_record(key, &payload, resources) {
                Ok(()) => num_loaded += 1,
                Err(e) => {
                    warn!("skipping corrupted record {:?}: {}", key, e);
                    num_corrupt += 1;
                }
            }
        }

        self.ensure_root_world();
        self.denormalise_data();
        self.run_migrations();

        info!(
            "loaded {} records ({} corrupt skipped), {} worlds, {} users",
            num_loaded,
            num_corrupt,
            self.worlds.len(),
            self.users.len()
        );
        Ok(())
    }

    fn load_record(
        &mut self,
        key: RecordKey,
        payload: &[u8],
        resources: &ResourceManager,
    ) -> CodecResult<()> {
        let mut r = Reader::new(payload);
        let tag = r.read_u32()?;
        self.load_tagged(tag, &mut r, key, resources)
    }

    /// Decode one tagged entity.  `key` is invalid during legacy import,
    /// where entities get a record key at their first flush instead.
    fn load_tagged(
        &mut self,
        tag: u32,
        r: &mut Reader,
        key: RecordKey,
        resources: &ResourceManager,
    ) -> CodecResult<()> {
        match tag {
            WORLD_RECORD => {
                let loaded = World::read_details_from(r)?;
                let name = loaded.name.clone();
                let world = self.world_entry(&name);
                world.owner_id = loaded.owner_id;
                world.created_time = loaded.created_time;
                world.record_key = key;
                world.db_dirty_world = false;
            }
            WORLD_SETTINGS_RECORD => {
                let world_name = r.read_string(limits::MAX_WORLD_NAME_SIZE)?;
                let mut settings = WorldSettings::read_from(r)?;
                settings.record_key = key;
                // Historical databases can hold several settings records for
                // one world; the largest key wins and the rest get reclaimed.
                let existing_key = self.world_entry(&world_name).settings.record_key;
                if !existing_key.valid() || key.0 > existing_key.0 {
                    self.world_entry(&world_name).settings = settings;
                    if existing_key.valid() {
                        self.db_records_to_delete.insert(existing_key);
                    }
                } else {
                    self.db_records_to_delete.insert(key);
                }
            }
            OBJECT_RECORD => {
                let world_name = r.read_string(limits::MAX_WORLD_NAME_SIZE)?;
                let mut ob = WorldObject::read_from(r)?;
                // Lightmap baking restarts from scratch each run.
                ob.flags &= !object::LIGHTMAP_NEEDS_COMPUTING_FLAG;
                ob.record_key = key;
                self.next_object_uid = self.next_object_uid.max(ob.uid.0 + 1);
                self.world_entry(&world_name).objects.insert(ob.uid, ob);
            }
            USER_RECORD => {
                let mut user = User::read_from(r)?;
                user.record_key = key;
                self.next_user_id = self.next_user_id.max(user.id.0 + 1);
                self.users.insert(user.id, user);
            }
            PARCEL_RECORD => {
                let world_name = r.read_string(limits::MAX_WORLD_NAME_SIZE)?;
                let mut parcel = Parcel::read_from(r)?;
                parcel.record_key = key;
                self.next_parcel_id = self.next_parcel_id.max(parcel.id + 1);
                self.world_entry(&world_name).parcels.insert(parcel.id, parcel);
            }
            RESOURCE_RECORD => {
                let mut resource = Resource::read_from(r)?;
                resource.record_key = key;
                resources.add_resource(resource);
            }
            LOD_CHUNK_RECORD => {
                let world_name = r.read_string(limits::MAX_WORLD_NAME_SIZE)?;
                let mut chunk = LodChunk::read_from(r)?;
                chunk.record_key = key;
                self.world_entry(&world_name)
                    .chunks
                    .insert(chunk.coords, chunk);
            }
            PHOTO_RECORD => {
                let mut photo = Photo::read_from(r)?;
                photo.record_key = key;
                self.next_photo_id = self.next_photo_id.max(photo.id + 1);
                self.photos.insert(photo.id, photo);
            }
            ORDER_RECORD => {
                let mut order = Order::read_from(r)?;
                order.record_key = key;
                self.next_order_id = self.next_order_id.max(order.id + 1);
                self.orders.insert(order.id, order);
            }
            WEB_SESSION_RECORD => {
                let mut session = UserWebSession::read_from(r)?;
                session.record_key = key;
                self.web_sessions.insert(session.id, session);
            }
            AUCTION_RECORD => {
                let mut auction = ParcelAuction::read_from(r)?;
                auction.record_key = key;
                self.auctions.insert(auction.id, auction);
            }
            SCREENSHOT_RECORD => {
                let mut shot = Screenshot::read_from(r)?;
                shot.record_key = key;
                self.next_screenshot_id = self.next_screenshot_id.max(shot.id + 1);
                self.screenshots.insert(shot.id, shot);
            }
            ETH_TRANSACTION_RECORD => {
                let mut trans = SubEthTransaction::read_from(r)?;
                trans.record_key = key;
                self.next_transaction_id = self.next_transaction_id.max(trans.id + 1);
                self.eth_transactions.insert(trans.id, trans);
            }
            NEWS_POST_RECORD => {
                let mut post = NewsPost::read_from(r)?;
                post.record_key = key;
                self.next_news_post_id = self.next_news_post_id.max(post.id + 1);
                self.news_posts.insert(post.id, post);
            }
            EVENT_RECORD => {
                let mut event = SubEvent::read_from(r)?;
                event.record_key = key;
                self.next_event_id = self.next_event_id.max(event.id + 1);
                self.events.insert(event.id, event);
            }
            OBJECT_STORAGE_ITEM_RECORD => {
                let mut item = ObjectStorageItem::read_from(r)?;
                item.record_key = key;
                self.object_storage_items.insert(item.id, item);
            }
            USER_SECRET_RECORD => {
                let mut secret = UserSecret::read_from(r)?;
                secret.record_key = key;
                self.user_secrets.insert(secret.id, secret);
            }
            FEATURE_FLAGS_RECORD => {
                self.feature_flags = FeatureFlags::read_from(r)?;
                self.feature_flags.record_key = key;
            }
            MAP_TILE_INFO_RECORD => {
                self.map_tile_info = MapTileInfo::read_from(r)?;
                self.map_tile_info.record_key = key;
            }
            ETH_INFO_RECORD => {
                self.eth_info = EthInfo::read_from(r)?;
                self.eth_info.record_key = key;
            }
            CREDENTIALS_RECORD => {
                self.credentials = ServerCredentials::read_from(r)?;
                self.credentials.record_key = key;
            }
            MIGRATION_VERSION_RECORD => {
                self.migration_version = MigrationVersion::read_from(r)?;
                self.migration_version.record_key = key;
            }
            other => {
                if key.valid() {
                    // The rest of this record's payload is isolated, so an
                    // unknown tag from a newer server is safe to ignore.
                    warn!("unknown record type tag {}, skipping", other);
                } else {
                    // Legacy stream: we cannot skip a chunk we cannot size.
                    return Err(CodecError::Corrupted(format!(
                        "unknown legacy chunk tag {}",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Legacy single-stream import
    // -----------------------------------------------------------------------

    /// Whether a state file is in the legacy magic-number + chunk-stream
    /// format that predates the record store.
    pub fn is_legacy_format(bytes: &[u8]) -> bool {
        bytes.len() >= 4
            && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == LEGACY_MAGIC
    }

    /// Import a legacy single-stream state file.  Every imported entity is
    /// marked dirty so the next snapshotter pass writes it to the new record
    /// store.
    pub fn import_legacy_format(
        &mut self,
        bytes: &[u8],
        resources: &ResourceManager,
    ) -> CodecResult<()> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u32()?;
        if magic != LEGACY_MAGIC {
            return Err(CodecError::Corrupted("bad legacy magic".to_string()));
        }
        let _format_version = r.read_u32()?;

        // Legacy chunks share the record-tag numbering and every entity block
        // is self-delimiting, so a sequential parse through the same per-tag
        // loader works.  Entities carry no store key yet; they get one at
        // their first flush.
        loop {
            let tag = r.read_u32()?;
            if tag == LEGACY_EOS {
                break;
            }
            self.load_tagged(tag, &mut r, RecordKey::INVALID, resources)?;
        }

        self.ensure_root_world();
        self.denormalise_data();
        self.run_migrations();
        self.mark_everything_dirty();
        Ok(())
    }

    /// Mark every entity dirty so the snapshotter rewrites the full state.
    pub fn mark_everything_dirty(&mut self) {
        for world in self.worlds.values_mut() {
            world.db_dirty_world = true;
            world.db_dirty_settings = true;
            world.db_dirty_objects = world.objects.keys().copied().collect();
            world.db_dirty_parcels = world.parcels.keys().copied().collect();
            world.db_dirty_chunks = world.chunks.keys().copied().collect();
        }
        self.db_dirty_users = self.users.keys().copied().collect();
        self.db_dirty_orders = self.orders.keys().copied().collect();
        self.db_dirty_web_sessions = self.web_sessions.keys().copied().collect();
        self.db_dirty_auctions = self.auctions.keys().copied().collect();
        self.db_dirty_screenshots = self.screenshots.keys().copied().collect();
        self.db_dirty_eth_transactions = self.eth_transactions.keys().copied().collect();
        self.db_dirty_news_posts = self.news_posts.keys().copied().collect();
        self.db_dirty_events = self.events.keys().copied().collect();
        self.db_dirty_object_storage_items =
            self.object_storage_items.keys().copied().collect();
        self.db_dirty_user_secrets = self.user_secrets.keys().copied().collect();
        self.db_dirty_photos = self.photos.keys().copied().collect();
        self.db_dirty_credentials = true;
        self.db_dirty_feature_flags = true;
        self.db_dirty_map_tile_info = true;
        self.db_dirty_eth_info = true;
        self.db_dirty_migration_version = true;
    }

    // -----------------------------------------------------------------------
    // Denormalisation
    // -----------------------------------------------------------------------

    /// Copy display names from the user table onto objects and parcels.
    /// Runs after load; names are not persisted on the entities themselves.
    pub fn denormalise_data(&mut self) {
        let names: HashMap<UserId, String> =
            self.users.iter().map(|(id, u)| (*id, u.name.clone())).collect();

        for world in self.worlds.values_mut() {
            for ob in world.objects.values_mut() {
                if let Some(name) = names.get(&ob.creator_id) {
                    ob.creator_name = name.clone();
                }
            }
            for parcel in world.parcels.values_mut() {
                parcel.owner_name = names.get(&parcel.owner_id).cloned().unwrap_or_default();
                parcel.admin_names = parcel
                    .admin_ids
                    .iter()
                    .map(|id| names.get(id).cloned().unwrap_or_default())
                    .collect();
                parcel.writer_names = parcel
                    .writer_ids
                    .iter()
                    .map(|id| names.get(id).cloned().unwrap_or_default())
                    .collect();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Migrations
    // -----------------------------------------------------------------------

    /// Idempotent world-walks gated on the persisted migration version.
    /// Migration *n* runs iff the stored version is below *n*.
    pub fn run_migrations(&mut self) {
        if self.migration_version.version < 1 {
            info!("migration 1: setting audio autoplay/loop flags on objects with audio");
            for world in self.worlds.values_mut() {
                for ob in world.objects.values_mut() {
                    if !ob.audio_url.is_empty() {
                        ob.flags |= object::AUDIO_AUTOPLAY_FLAG | object::AUDIO_LOOP_FLAG;
                        world.db_dirty_objects.insert(ob.uid);
                    }
                }
            }
        }

        if self.migration_version.version < 2 {
            info!("migration 2: ensuring a personal world exists for every user");
            let user_names: Vec<String> = self.users.values().map(|u| u.name.clone()).collect();
            let user_ids: HashMap<String, UserId> = self
                .users
                .values()
                .map(|u| (u.name.clone(), u.id))
                .collect();
            for name in user_names {
                if !self.worlds.contains_key(&name) {
                    let mut world = World::new(name.clone());
                    world.owner_id = user_ids[&name];
                    world.db_dirty_world = true;
                    self.worlds.insert(name, world);
                }
            }
        }

        if self.migration_version.version < CURRENT_MIGRATION_VERSION {
            self.migration_version.version = CURRENT_MIGRATION_VERSION;
            self.db_dirty_migration_version = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Record encoding helpers (used by the snapshotter)
// ---------------------------------------------------------------------------

pub fn encode_world_record(world: &World) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(WORLD_RECORD);
    world.write_details_to(&mut w);
    w.into_bytes()
}

pub fn encode_world_settings_record(world_name: &str, settings: &WorldSettings) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(WORLD_SETTINGS_RECORD);
    w.write_string(world_name);
    settings.write_to(&mut w);
    w.into_bytes()
}

pub fn encode_object_record(world_name: &str, ob: &WorldObject) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(OBJECT_RECORD);
    w.write_string(world_name);
    ob.write_to(&mut w);
    w.into_bytes()
}

pub fn encode_parcel_record(world_name: &str, parcel: &Parcel) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(PARCEL_RECORD);
    w.write_string(world_name);
    parcel.write_to(&mut w);
    w.into_bytes()
}

pub fn encode_chunk_record(world_name: &str, chunk: &LodChunk) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(LOD_CHUNK_RECORD);
    w.write_string(world_name);
    chunk.write_to(&mut w);
    w.into_bytes()
}

pub fn encode_resource_record(resource: &Resource) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(RESOURCE_RECORD);
    resource.write_to(&mut w);
    w.into_bytes()
}

pub fn encode_tagged<F: FnOnce(&mut Writer)>(tag: u32, f: F) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(tag);
    f(&mut w);
    w.into_bytes()
}
