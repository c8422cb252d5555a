//! Periodic world maintenance and the snapshotter.
//!
//! The **snapshotter** drains every db-dirty set through the record store on
//! a short period, so persistence lags an in-memory mutation by at most one
//! period.  Lock discipline: encode payloads under the world lock, write
//! records under the store lock, then re-acquire the world lock to commit
//! freshly allocated record keys.
//!
//! The **maintenance sweep** reaps dead avatars and objects, ages out
//! summoned objects, and queues record deletions for reaped entities.

use crate::object::SUMMONED_FLAG;
use crate::protocol;
use crate::server::Server;
use crate::types::{ChunkCoord, RecordKey, Uid, UserId};
use crate::worlds;
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const SNAPSHOT_PERIOD: Duration = Duration::from_secs(5);
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(600);

/// Summoned objects untouched for this long are reaped by the sweep.
const SUMMONED_REAP_AGE_SECS: u64 = 24 * 3600;

// ---------------------------------------------------------------------------
// Snapshotter
// ---------------------------------------------------------------------------

/// Which entity a freshly written record belongs to, so its new key can be
/// committed back after the store write.
enum KeyTarget {
    WorldDetails(String),
    WorldSettings(String),
    Object(String, Uid),
    Parcel(String, u64),
    Chunk(String, ChunkCoord),
    User(UserId),
    Order(u64),
    WebSession(u64),
    Auction(u64),
    Screenshot(u64),
    EthTransaction(u64),
    NewsPost(u64),
    Event(u64),
    ObjectStorageItem(u64),
    UserSecret(u64),
    Photo(u64),
    Resource(String),
    Credentials,
    FeatureFlags,
    MapTileInfo,
    EthInfo,
    MigrationVersion,
}

struct PendingWrite {
    existing_key: RecordKey,
    payload: Vec<u8>,
    target: KeyTarget,
}

pub async fn run_snapshotter(server: Arc<Server>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SNAPSHOT_PERIOD) => {}
            _ = shutdown.changed() => {
                // Final flush so a clean shutdown loses nothing.
                if let Err(e) = flush_dirty(&server) {
                    warn!("final snapshot flush failed: {}", e);
                }
                return;
            }
        }
        if let Err(e) = flush_dirty(&server) {
            warn!("snapshot flush failed: {}", e);
        }
    }
}

/// One snapshotter pass.  Returns the number of records written.
pub fn flush_dirty(server: &Arc<Server>) -> anyhow::Result<usize> {
    // ---- Phase 1: collect under the world lock ----
    let (mut writes, deletes) = {
        let mut state = server.state.lock();
        let mut writes: Vec<PendingWrite> = Vec::new();

        for (world_name, world) in state.worlds.iter_mut() {
            if std::mem::take(&mut world.db_dirty_world) {
                writes.push(PendingWrite {
                    existing_key: world.record_key,
                    payload: worlds::encode_world_record(world),
                    target: KeyTarget::WorldDetails(world_name.clone()),
                });
            }
            if std::mem::take(&mut world.db_dirty_settings) {
                writes.push(PendingWrite {
                    existing_key: world.settings.record_key,
                    payload: worlds::encode_world_settings_record(world_name, &world.settings),
                    target: KeyTarget::WorldSettings(world_name.clone()),
                });
            }
            for uid in std::mem::take(&mut world.db_dirty_objects) {
                // Dead objects are the sweep's business, not ours.
                if let Some(ob) = world.objects.get(&uid).filter(|ob| !ob.dead) {
                    writes.push(PendingWrite {
                        existing_key: ob.record_key,
                        payload: worlds::encode_object_record(world_name, ob),
                        target: KeyTarget::Object(world_name.clone(), uid),
                    });
                }
            }
            for id in std::mem::take(&mut world.db_dirty_parcels) {
                if let Some(parcel) = world.parcels.get(&id) {
                    writes.push(PendingWrite {
                        existing_key: parcel.record_key,
                        payload: worlds::encode_parcel_record(world_name, parcel),
                        target: KeyTarget::Parcel(world_name.clone(), id),
                    });
                }
            }
            for coords in std::mem::take(&mut world.db_dirty_chunks) {
                if let Some(chunk) = world.chunks.get(&coords) {
                    writes.push(PendingWrite {
                        existing_key: chunk.record_key,
                        payload: worlds::encode_chunk_record(world_name, chunk),
                        target: KeyTarget::Chunk(world_name.clone(), coords),
                    });
                }
            }
        }

        macro_rules! collect_aux {
            ($dirty:ident, $map:ident, $tag:expr, $target:path) => {
                for id in std::mem::take(&mut state.$dirty) {
                    if let Some(entity) = state.$map.get(&id) {
                        writes.push(PendingWrite {
                            existing_key: entity.record_key,
                            payload: worlds::encode_tagged($tag, |w| entity.write_to(w)),
                            target: $target(id),
                        });
                    }
                }
            };
        }
        collect_aux!(db_dirty_users, users, worlds::USER_RECORD, KeyTarget::User);
        collect_aux!(db_dirty_orders, orders, worlds::ORDER_RECORD, KeyTarget::Order);
        collect_aux!(
            db_dirty_web_sessions,
            web_sessions,
            worlds::WEB_SESSION_RECORD,
            KeyTarget::WebSession
        );
        collect_aux!(db_dirty_auctions, auctions, worlds::AUCTION_RECORD, KeyTarget::Auction);
        collect_aux!(
            db_dirty_screenshots,
            screenshots,
            worlds::SCREENSHOT_RECORD,
            KeyTarget::Screenshot
        );
        collect_aux!(
            db_dirty_eth_transactions,
            eth_transactions,
            worlds::ETH_TRANSACTION_RECORD,
            KeyTarget::EthTransaction
        );
        collect_aux!(
            db_dirty_news_posts,
            news_posts,
            worlds::NEWS_POST_RECORD,
            KeyTarget::NewsPost
        );
        collect_aux!(db_dirty_events, events, worlds::EVENT_RECORD, KeyTarget::Event);
        collect_aux!(
            db_dirty_object_storage_items,
            object_storage_items,
            worlds::OBJECT_STORAGE_ITEM_RECORD,
            KeyTarget::ObjectStorageItem
        );
        collect_aux!(
            db_dirty_user_secrets,
            user_secrets,
            worlds::USER_SECRET_RECORD,
            KeyTarget::UserSecret
        );
        collect_aux!(db_dirty_photos, photos, worlds::PHOTO_RECORD, KeyTarget::Photo);

        if std::mem::take(&mut state.db_dirty_credentials) {
            writes.push(PendingWrite {
                existing_key: state.credentials.record_key,
                payload: worlds::encode_tagged(worlds::CREDENTIALS_RECORD, |w| {
                    state.credentials.write_to(w)
                }),
                target: KeyTarget::Credentials,
            });
        }
        if std::mem::take(&mut state.db_dirty_feature_flags) {
            writes.push(PendingWrite {
                existing_key: state.feature_flags.record_key,
                payload: worlds::encode_tagged(worlds::FEATURE_FLAGS_RECORD, |w| {
                    state.feature_flags.write_to(w)
                }),
                target: KeyTarget::FeatureFlags,
            });
        }
        if std::mem::take(&mut state.db_dirty_map_tile_info) {
            writes.push(PendingWrite {
                existing_key: state.map_tile_info.record_key,
                payload: worlds::encode_tagged(worlds::MAP_TILE_INFO_RECORD, |w| {
                    state.map_tile_info.write_to(w)
                }),
                target: KeyTarget::MapTileInfo,
            });
        }
        if std::mem::take(&mut state.db_dirty_eth_info) {
            writes.push(PendingWrite {
                existing_key: state.eth_info.record_key,
                payload: worlds::encode_tagged(worlds::ETH_INFO_RECORD, |w| {
                    state.eth_info.write_to(w)
                }),
                target: KeyTarget::EthInfo,
            });
        }
        if std::mem::take(&mut state.db_dirty_migration_version) {
            writes.push(PendingWrite {
                existing_key: state.migration_version.record_key,
                payload: worlds::encode_tagged(worlds::MIGRATION_VERSION_RECORD, |w| {
                    state.migration_version.write_to(w)
                }),
                target: KeyTarget::MigrationVersion,
            });
        }

        let deletes: Vec<RecordKey> = state.db_records_to_delete.drain().collect();
        (writes, deletes)
    };

    // Dirty resources live behind the registry's own lock.
    for resource in server.resources.take_dirty() {
        writes.push(PendingWrite {
            existing_key: resource.record_key,
            payload: worlds::encode_resource_record(&resource),
            target: KeyTarget::Resource(resource.url),
        });
    }

    if writes.is_empty() && deletes.is_empty() {
        return Ok(0);
    }

    // ---- Phase 2: store writes ----
    let mut new_keys: Vec<(KeyTarget, RecordKey)> = Vec::new();
    {
        let mut store = server.store.lock();
        for write in writes {
            let key = if write.existing_key.valid() {
                write.existing_key
            } else {
                let key = store.alloc_unused_key();
                new_keys.push((write.target, key));
                key
            };
            store.update_record(key, &write.payload)?;
        }
        for key in deletes {
            store.delete_record(key)?;
        }
        store.flush()?;
    }
    let num_written = new_keys.len();

    // ---- Phase 3: commit freshly allocated keys ----
    {
        let mut state = server.state.lock();
        for (target, key) in new_keys {
            match target {
                KeyTarget::WorldDetails(name) => {
                    if let Some(world) = state.world_mut(&name) {
                        world.record_key = key;
                    }
                }
                KeyTarget::WorldSettings(name) => {
                    if let Some(world) = state.world_mut(&name) {
                        world.settings.record_key = key;
                    }
                }
                KeyTarget::Object(name, uid) => {
                    if let Some(ob) =
                        state.world_mut(&name).and_then(|w| w.objects.get_mut(&uid))
                    {
                        ob.record_key = key;
                    }
                }
                KeyTarget::Parcel(name, id) => {
                    if let Some(parcel) =
                        state.world_mut(&name).and_then(|w| w.parcels.get_mut(&id))
                    {
                        parcel.record_key = key;
                    }
                }
                KeyTarget::Chunk(name, coords) => {
                    if let Some(chunk) =
                        state.world_mut(&name).and_then(|w| w.chunks.get_mut(&coords))
                    {
                        chunk.record_key = key;
                    }
                }
                KeyTarget::User(id) => {
                    if let Some(u) = state.users.get_mut(&id) {
                        u.record_key = key;
                    }
                }
                KeyTarget::Order(id) => {
                    if let Some(e) = state.orders.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::WebSession(id) => {
                    if let Some(e) = state.web_sessions.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::Auction(id) => {
                    if let Some(e) = state.auctions.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::Screenshot(id) => {
                    if let Some(e) = state.screenshots.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::EthTransaction(id) => {
                    if let Some(e) = state.eth_transactions.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::NewsPost(id) => {
                    if let Some(e) = state.news_posts.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::Event(id) => {
                    if let Some(e) = state.events.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::ObjectStorageItem(id) => {
                    if let Some(e) = state.object_storage_items.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::UserSecret(id) => {
                    if let Some(e) = state.user_secrets.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::Photo(id) => {
                    if let Some(e) = state.photos.get_mut(&id) {
                        e.record_key = key;
                    }
                }
                KeyTarget::Resource(url) => {
                    server.resources.set_record_key(&url, key);
                }
                KeyTarget::Credentials => state.credentials.record_key = key,
                KeyTarget::FeatureFlags => state.feature_flags.record_key = key,
                KeyTarget::MapTileInfo => state.map_tile_info.record_key = key,
                KeyTarget::EthInfo => state.eth_info.record_key = key,
                KeyTarget::MigrationVersion => state.migration_version.record_key = key,
            }
        }
    }

    debug!("snapshotter wrote {} new records", num_written);
    Ok(num_written)
}

// ---------------------------------------------------------------------------
// Maintenance sweep
// ---------------------------------------------------------------------------

pub async fn run_maintenance(server: Arc<Server>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(MAINTENANCE_PERIOD) => {}
            _ = shutdown.changed() => return,
        }
        run_sweep_once(&server);
    }
}

/// One maintenance pass: age out summoned objects, reap dead entities.
pub fn run_sweep_once(server: &Arc<Server>) {
    let mut broadcasts: Vec<(String, Bytes)> = Vec::new();
    {
        let mut state = server.state.lock();
        let mut record_deletes: Vec<RecordKey> = Vec::new();

        for (world_name, world) in state.worlds.iter_mut() {
            // Summoned objects untouched for a day get marked dead now and
            // reaped on the next pass (after the broadcast went out).
            let mut newly_dead: Vec<Uid> = Vec::new();
            for ob in world.objects.values_mut() {
                if !ob.dead
                    && ob.flags & SUMMONED_FLAG != 0
                    && ob.last_modified_time.seconds_ago() > SUMMONED_REAP_AGE_SECS
                {
                    ob.dead = true;
                    newly_dead.push(ob.uid);
                }
            }
            for uid in newly_dead {
                broadcasts.push((world_name.clone(), protocol::object_destroyed_frame(uid)));
                let coords = world.objects[&uid].home_chunk();
                world.chunk_entry(coords).needs_rebuild = true;
                world.db_dirty_chunks.insert(coords);
            }

            // Reap bodies whose destruction has already been broadcast.
            let dead_obs: Vec<Uid> = world
                .objects
                .values()
                .filter(|ob| ob.dead)
                .map(|ob| ob.uid)
                .collect();
            for uid in dead_obs {
                if let Some(ob) = world.objects.remove(&uid) {
                    world.db_dirty_objects.remove(&uid);
                    if ob.record_key.valid() {
                        record_deletes.push(ob.record_key);
                    }
                }
            }

            // Dead avatars (their connection ended) leave the map here.
            world
                .avatars
                .retain(|_, a| a.state == crate::avatar::AvatarState::Alive);
        }

        for key in record_deletes {
            state.queue_record_delete(key);
        }
    }

    for (world_name, frame) in broadcasts {
        server.broadcast_to_world(&world_name, &frame, None);
    }
    info!("maintenance sweep done");
}
