//! Inbound message dispatch: validate, mutate the world under the lock,
//! mark entities dirty, enqueue reply and broadcast frames.
//!
//! ## Authorisation rule
//!
//! An operation on object *O* by sender *S* is permitted iff any of:
//! *S* is server admin; *S* == *O*.creator; *O* lies in a parcel whose admin
//! or writer list contains *S*; or *O* is outside any parcel and *S* has the
//! world-gardener flag.  Everything else gets a permission-denied reply and
//! the connection stays open.
//!
//! The pattern throughout: compute and collect frames under the world lock,
//! release, then send.  Nothing here holds the lock across an await.

use crate::avatar::AvatarState;
use crate::object::{self, WorldObject};
use crate::protocol::{self, ClientMessage};
use crate::server::{LodCheckItem, NpcEvent, Server};
use crate::session::{SessionError, SessionResult};
use crate::types::{TimeStamp, Uid, UserId};
use crate::worlds::AllWorlds;
use bytes::Bytes;
use glam::DVec3;
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Transform updates from one avatar are fanned out at most this often.
const TRANSFORM_BROADCAST_PERIOD: Duration = Duration::from_millis(100);

/// Bots this close to a speaking avatar hear the chat.
const BOT_HEARING_RADIUS: f64 = 20.0;

// ---------------------------------------------------------------------------
// Connection context
// ---------------------------------------------------------------------------

/// Per-connection dispatch state, owned by the reader loop.
pub struct ConnectionCtx {
    pub connection_id: u64,
    pub world_name: String,
    pub avatar_uid: Uid,
    /// Invalid until a successful `LogIn`.
    pub user_id: UserId,
    last_transform_broadcast: Option<Instant>,
}

impl ConnectionCtx {
    pub fn new(connection_id: u64, world_name: String, avatar_uid: Uid) -> Self {
        Self {
            connection_id,
            world_name,
            avatar_uid,
            user_id: UserId::INVALID,
            last_transform_broadcast: None,
        }
    }
}

/// Where a produced frame goes.
enum Out {
    /// To every subscriber of the sender's world.
    Broadcast(Bytes),
    /// To every subscriber except the sender.
    BroadcastOthers(Bytes),
    /// Only back to the sender.
    Reply(Bytes),
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn finite_dvec3(v: DVec3) -> bool {
    v.x.is_finite() && v.y.is_finite() && v.z.is_finite()
}

// ---------------------------------------------------------------------------
// Authorisation
// ---------------------------------------------------------------------------

fn user_is_admin(state: &AllWorlds, user_id: UserId) -> bool {
    state.users.get(&user_id).map(|u| u.is_admin()).unwrap_or(false)
}

fn user_is_gardener(state: &AllWorlds, user_id: UserId) -> bool {
    state
        .users
        .get(&user_id)
        .map(|u| u.is_world_gardener())
        .unwrap_or(false)
}

/// May `user_id` create an object at `pos` in `world_name`?
pub fn user_may_create_object_at(
    state: &AllWorlds,
    world_name: &str,
    pos: DVec3,
    user_id: UserId,
) -> bool {
    if !user_id.valid() {
        return false;
    }
    if user_is_admin(state, user_id) {
        return true;
    }
    let Some(world) = state.world(world_name) else {
        return false;
    };
    match world.parcel_containing(pos) {
        Some(parcel) => parcel.user_may_write(user_id),
        None => user_is_gardener(state, user_id),
    }
}

/// May `user_id` mutate or destroy `ob`?
pub fn user_may_modify_object(
    state: &AllWorlds,
    world_name: &str,
    ob: &WorldObject,
    user_id: UserId,
) -> bool {
    if !user_id.valid() {
        return false;
    }
    if ob.creator_id == user_id {
        return true;
    }
    user_may_create_object_at(state, world_name, ob.centroid(), user_id)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn handle_message(
    server: &Arc<Server>,
    ctx: &mut ConnectionCtx,
    message: ClientMessage,
) -> SessionResult<()> {
    // The resource request path does file I/O; everything else is a short
    // world-lock critical section producing frames.
    if let ClientMessage::ResourceRequest { url } = message {
        return handle_resource_request(server, ctx, &url).await;
    }

    let mut out: Vec<Out> = Vec::new();
    let mut lod_checks: Vec<LodCheckItem> = Vec::new();
    let mut npc_events: Vec<NpcEvent> = Vec::new();

    {
        let mut state = server.state.lock();
        handle_under_lock(
            server,
            ctx,
            message,
            &mut state,
            &mut out,
            &mut lod_checks,
            &mut npc_events,
        )?;
    }

    for item in lod_checks {
        let _ = server.lod_queue.send(item);
    }
    for event in npc_events {
        let _ = server.npc_events.send(event);
    }
    for frame in out {
        match frame {
            Out::Broadcast(f) => server.broadcast_to_world(&ctx.world_name, &f, None),
            Out::BroadcastOthers(f) => {
                server.broadcast_to_world(&ctx.world_name, &f, Some(ctx.connection_id))
            }
            Out::Reply(f) => server.send_to_connection(ctx.connection_id, f),
        }
    }
    Ok(())
}

fn handle_under_lock(
    server: &Arc<Server>,
    ctx: &mut ConnectionCtx,
    message: ClientMessage,
    state: &mut AllWorlds,
    out: &mut Vec<Out>,
    lod_checks: &mut Vec<LodCheckItem>,
    npc_events: &mut Vec<NpcEvent>,
) -> SessionResult<()> {
    match message {
        ClientMessage::KeepAlive => {
            out.push(Out::Reply(protocol::keep_alive_frame()));
        }

        ClientMessage::LogIn { username, password } => {
            let user = state
                .user_by_name(&username)
                .filter(|u| u.check_password(&password))
                .map(|u| (u.id, u.name.clone()));
            match user {
                Some((user_id, name)) => {
                    ctx.user_id = user_id;
                    server.set_connection_user(ctx.connection_id, user_id);
                    if let Some(world) = state.world_mut(&ctx.world_name) {
                        if let Some(avatar) = world.avatars.get_mut(&ctx.avatar_uid) {
                            avatar.owner_id = user_id;
                            avatar.name = name.clone();
                            out.push(Out::Broadcast(protocol::avatar_full_update_frame(avatar)));
                        }
                    }
                    out.push(Out::Reply(protocol::logged_in_frame(user_id, &name)));
                    debug!("connection {} logged in as '{}'", ctx.connection_id, name);
                }
                None => {
                    out.push(Out::Reply(protocol::log_in_failed_frame(
                        "invalid username or password",
                    )));
                }
            }
        }

        ClientMessage::ClientUdpSocketPort { port } => {
            server.set_connection_udp_port(ctx.connection_id, port);
        }

        ClientMessage::ChatMessage { body } => {
            let sender_name = state
                .world(&ctx.world_name)
                .and_then(|w| w.avatars.get(&ctx.avatar_uid))
                .map(|a| a.name.clone())
                .unwrap_or_default();
            out.push(Out::Broadcast(protocol::chat_message_frame(
                ctx.avatar_uid,
                &sender_name,
                &body,
            )));

            // Bots in hearing range get the utterance forwarded.
            if let Some(world) = state.world(&ctx.world_name) {
                if let Some(sender) = world.avatars.get(&ctx.avatar_uid) {
                    for bot in world.avatars.values().filter(|a| a.is_bot) {
                        if sender.pos.distance(bot.pos) <= BOT_HEARING_RADIUS {
                            npc_events.push(NpcEvent::ChatHeard {
                                world_name: ctx.world_name.clone(),
                                bot_uid: bot.uid,
                                speaker_name: sender_name.clone(),
                                body: body.clone(),
                            });
                        }
                    }
                }
            }
        }

        ClientMessage::AvatarTransformUpdate {
            pos,
            axis,
            angle,
            anim_state,
        } => {
            if !finite_dvec3(pos) || !angle.is_finite() {
                return Err(SessionError::Other("non-finite avatar pose".to_string()));
            }
            if let Some(world) = state.world_mut(&ctx.world_name) {
                if let Some(avatar) = world.avatars.get_mut(&ctx.avatar_uid) {
                    avatar.set_transform(pos, axis, angle, now_seconds());
                    avatar.anim_state = anim_state;
                }
            }
            // Coalesce the fan-out to 10 Hz per sender; the live pose above
            // is always current.
            let due = ctx
                .last_transform_broadcast
                .map(|t| t.elapsed() >= TRANSFORM_BROADCAST_PERIOD)
                .unwrap_or(true);
            if due {
                ctx.last_transform_broadcast = Some(Instant::now());
                out.push(Out::BroadcastOthers(protocol::avatar_transform_update_frame(
                    ctx.avatar_uid,
                    pos,
                    axis,
                    angle,
                    anim_state,
                )));
            }
        }

        ClientMessage::AvatarFullUpdate {
            name,
            model_url,
            anim_state,
        } => {
            if let Some(world) = state.world_mut(&ctx.world_name) {
                if let Some(avatar) = world.avatars.get_mut(&ctx.avatar_uid) {
                    avatar.name = name;
                    avatar.model_url = model_url;
                    avatar.anim_state = anim_state;
                    out.push(Out::Broadcast(protocol::avatar_full_update_frame(avatar)));
                }
            }
        }

        ClientMessage::AvatarPerformGesture { gesture } => {
            out.push(Out::BroadcastOthers(protocol::avatar_gesture_frame(
                ctx.avatar_uid,
                &gesture,
            )));
        }

        ClientMessage::AvatarStopGesture => {
            out.push(Out::BroadcastOthers(protocol::avatar_stop_gesture_frame(
                ctx.avatar_uid,
            )));
        }

        ClientMessage::CreateObject { object } => {
            if server.config.read_only {
                out.push(Out::Reply(protocol::read_only_mode_frame(true)));
                return Ok(());
            }
            if !finite_dvec3(object.pos) {
                return Err(SessionError::Other("non-finite object position".to_string()));
            }
            if !user_may_create_object_at(state, &ctx.world_name, object.pos, ctx.user_id) {
                out.push(Out::Reply(protocol::permission_denied_frame(
                    "you do not have permission to create objects here",
                )));
                return Ok(());
            }

            let uid = state.alloc_object_uid();
            let creator_name = state.user_display_name(ctx.user_id);
            let mut ob = object;
            ob.uid = uid;
            ob.creator_id = ctx.user_id;
            ob.creator_name = creator_name;
            ob.created_time = TimeStamp::now();
            ob.last_modified_time = ob.created_time;
            ob.record_key = crate::types::RecordKey::INVALID;
            ob.dead = false;
            ob.update_world_aabb();

            let frame = protocol::object_created_frame(&ob);
            let coords = ob.home_chunk();
            let world = state.world_entry(&ctx.world_name);
            world.objects.insert(uid, ob);
            world.db_dirty_objects.insert(uid);
            world.chunk_entry(coords).needs_rebuild = true;
            world.db_dirty_chunks.insert(coords);

            lod_checks.push(LodCheckItem {
                world_name: ctx.world_name.clone(),
                uid,
            });
            out.push(Out::Broadcast(frame));
        }

        ClientMessage::ObjectFullUpdate { object } => {
            if server.config.read_only {
                out.push(Out::Reply(protocol::read_only_mode_frame(true)));
                return Ok(());
            }
            let uid = object.uid;
            let authorised = state
                .world(&ctx.world_name)
                .and_then(|w| w.objects.get(&uid))
                .map(|ob| user_may_modify_object(state, &ctx.world_name, ob, ctx.user_id));
            match authorised {
                None => return Ok(()), // unknown object, ignore
                Some(false) => {
                    out.push(Out::Reply(protocol::permission_denied_frame(
                        "you do not have permission to modify this object",
                    )));
                    return Ok(());
                }
                Some(true) => {}
            }

            let world = state.world_entry(&ctx.world_name);
            let Some(ob) = world.objects.get_mut(&uid) else {
                return Ok(());
            };
            let old_chunk = ob.home_chunk();
            let geometry_changed = ob.model_url != object.model_url
                || ob.materials != object.materials
                || ob.script != object.script
                || ob.content != object.content
                || ob.compressed_voxels != object.compressed_voxels
                || ob.scale != object.scale;

            // Identity, creator and bookkeeping fields stay ours.
            ob.kind = object.kind;
            ob.pos = object.pos;
            ob.axis = object.axis;
            ob.angle = object.angle;
            ob.scale = object.scale;
            ob.model_url = object.model_url;
            ob.materials = object.materials;
            ob.script = object.script;
            ob.content = object.content;
            ob.audio_url = object.audio_url;
            ob.audio_volume = object.audio_volume;
            ob.compressed_voxels = object.compressed_voxels;
            ob.aabb_os = object.aabb_os;
            ob.flags = object.flags;
            ob.touch();
            ob.update_world_aabb();
            let new_chunk = ob.home_chunk();
            let frame = protocol::object_full_update_frame(ob);

            world.db_dirty_objects.insert(uid);
            if geometry_changed || new_chunk != old_chunk {
                for coords in [old_chunk, new_chunk] {
                    world.chunk_entry(coords).needs_rebuild = true;
                    world.db_dirty_chunks.insert(coords);
                }
                lod_checks.push(LodCheckItem {
                    world_name: ctx.world_name.clone(),
                    uid,
                });
            }
            out.push(Out::Broadcast(frame));
        }

        ClientMessage::ObjectTransformUpdate {
            uid,
            pos,
            axis,
            angle,
            scale,
        } => {
            if server.config.read_only {
                out.push(Out::Reply(protocol::read_only_mode_frame(true)));
                return Ok(());
            }
            if !finite_dvec3(pos) || !angle.is_finite() {
                return Err(SessionError::Other("non-finite object pose".to_string()));
            }
            let authorised = state
                .world(&ctx.world_name)
                .and_then(|w| w.objects.get(&uid))
                .map(|ob| user_may_modify_object(state, &ctx.world_name, ob, ctx.user_id));
            match authorised {
                None => return Ok(()),
                Some(false) => {
                    out.push(Out::Reply(protocol::permission_denied_frame(
                        "you do not have permission to move this object",
                    )));
                    return Ok(());
                }
                Some(true) => {}
            }

            let world = state.world_entry(&ctx.world_name);
            let Some(ob) = world.objects.get_mut(&uid) else {
                return Ok(());
            };
            let old_chunk = ob.home_chunk();
            ob.pos = pos;
            ob.axis = axis;
            ob.angle = angle;
            ob.scale = scale;
            ob.touch();
            ob.update_world_aabb();
            let new_chunk = ob.home_chunk();
            let frame = protocol::object_transform_update_frame(ob);

            world.db_dirty_objects.insert(uid);
            for coords in [old_chunk, new_chunk] {
                world.chunk_entry(coords).needs_rebuild = true;
                world.db_dirty_chunks.insert(coords);
            }
            out.push(Out::Broadcast(frame));
        }

        ClientMessage::DestroyObject { uid } => {
            if server.config.read_only {
                out.push(Out::Reply(protocol::read_only_mode_frame(true)));
                return Ok(());
            }
            let authorised = state
                .world(&ctx.world_name)
                .and_then(|w| w.objects.get(&uid))
                .map(|ob| user_may_modify_object(state, &ctx.world_name, ob, ctx.user_id));
            match authorised {
                None => return Ok(()),
                Some(false) => {
                    out.push(Out::Reply(protocol::permission_denied_frame(
                        "you do not have permission to destroy this object",
                    )));
                    return Ok(());
                }
                Some(true) => {}
            }

            let world = state.world_entry(&ctx.world_name);
            let Some(ob) = world.objects.get_mut(&uid) else {
                return Ok(());
            };
            // Logical delete: broadcast first, the sweep reaps the body and
            // reclaims the record slot.
            ob.dead = true;
            ob.touch();
            let coords = ob.home_chunk();
            world.db_dirty_objects.insert(uid);
            world.chunk_entry(coords).needs_rebuild = true;
            world.db_dirty_chunks.insert(coords);
            out.push(Out::Broadcast(protocol::object_destroyed_frame(uid)));
        }

        ClientMessage::SummonObject { uid, pos, axis, angle } => {
            if server.config.read_only {
                out.push(Out::Reply(protocol::read_only_mode_frame(true)));
                return Ok(());
            }
            if !finite_dvec3(pos) || !angle.is_finite() {
                return Err(SessionError::Other("non-finite summon pose".to_string()));
            }
            let authorised = state
                .world(&ctx.world_name)
                .and_then(|w| w.objects.get(&uid))
                .map(|ob| user_may_modify_object(state, &ctx.world_name, ob, ctx.user_id));
            match authorised {
                None => return Ok(()),
                Some(false) => {
                    out.push(Out::Reply(protocol::permission_denied_frame(
                        "you do not have permission to summon this object",
                    )));
                    return Ok(());
                }
                Some(true) => {}
            }

            let world = state.world_entry(&ctx.world_name);
            let Some(ob) = world.objects.get_mut(&uid) else {
                return Ok(());
            };
            // Idempotent teleport-and-claim.  The last-modified stamp is what
            // the maintenance sweep ages summoned objects by.
            let old_chunk = ob.home_chunk();
            ob.pos = pos;
            ob.axis = axis;
            ob.angle = angle;
            ob.flags |= object::SUMMONED_FLAG;
            ob.touch();
            ob.update_world_aabb();
            let new_chunk = ob.home_chunk();
            world.db_dirty_objects.insert(uid);
            for coords in [old_chunk, new_chunk] {
                world.chunk_entry(coords).needs_rebuild = true;
                world.db_dirty_chunks.insert(coords);
            }
            out.push(Out::Broadcast(protocol::summon_object_frame(
                uid,
                pos,
                axis,
                angle,
                ctx.avatar_uid,
            )));
        }

        ClientMessage::UserMovedNearToBotAvatar { bot_uid } => {
            let user_name = sender_display_name(state, ctx);
            npc_events.push(NpcEvent::UserMovedNear {
                world_name: ctx.world_name.clone(),
                bot_uid,
                user_name,
            });
        }

        ClientMessage::UserMovedAwayFromBotAvatar { bot_uid } => {
            let user_name = sender_display_name(state, ctx);
            npc_events.push(NpcEvent::UserMovedAway {
                world_name: ctx.world_name.clone(),
                bot_uid,
                user_name,
            });
        }

        ClientMessage::ResourceRequest { .. } => unreachable!("handled before the lock"),
    }
    Ok(())
}

fn sender_display_name(state: &AllWorlds, ctx: &ConnectionCtx) -> String {
    state
        .world(&ctx.world_name)
        .and_then(|w| w.avatars.get(&ctx.avatar_uid))
        .filter(|a| a.state == AvatarState::Alive)
        .map(|a| a.name.clone())
        .unwrap_or_default()
}

async fn handle_resource_request(
    server: &Arc<Server>,
    ctx: &ConnectionCtx,
    url: &str,
) -> SessionResult<()> {
    let present = server.resources.is_present(url);
    if !present {
        server.send_to_connection(ctx.connection_id, protocol::resource_not_present_frame(url));
        return Ok(());
    }
    let path = server.resources.abs_path_for_url(url);
    match tokio::fs::read(&path).await {
        Ok(data) => {
            server.send_to_connection(
                ctx.connection_id,
                protocol::resource_transfer_frame(url, &data),
            );
        }
        Err(e) => {
            debug!("resource '{}' read failed: {}", url, e);
            server.send_to_connection(ctx.connection_id, protocol::resource_not_present_frame(url));
        }
    }
    Ok(())
}
