//! Wire protocol: handshake constants, frame layout, message ids, and the
//! typed decode of every client → server message.
//!
//! This module owns **every message that crosses the connection boundary**
//! between the server and any client.
//!
//! ## Framing
//!
//! Every message is `id:u32, length:u32, payload[length-8]`, little-endian,
//! over TLS.  `length` includes the 8-byte header.  The writer loop writes
//! whole frames atomically; the reader rejects frames over
//! [`limits::MAX_FRAME_SIZE`].
//!
//! ## Handshake
//!
//! | Step | Bytes |
//! |------|-------|
//! | client hello | `magic:u32, protocol_version:u32, connection_type:u32, world_name:string` |
//! | server reply | `magic:u32, response:u32[, reason:string]` |
//! | on OK (subscription) | `avatar_uid:u64` |
//!
//! ## Design rules
//!
//! 1. Every string field is bounded before deserialisation.
//! 2. Unknown message ids are a protocol error in strict mode – the
//!    connection is closed, the world is untouched.
//! 3. Server → client frames are built once and broadcast as shared bytes.

use crate::avatar::Avatar;
use crate::codec::{CodecError, CodecResult, Reader, Writer};
use crate::limits;
use crate::object::WorldObject;
use crate::types::{ChunkCoord, Uid};
use bytes::Bytes;
use glam::{DVec3, Vec3};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// "CyberspaceHello".
pub const HELLO_MAGIC: u32 = 0x29D8_C5DF;

pub const CURRENT_PROTOCOL_VERSION: u32 = 41;
/// Oldest client protocol version we still speak.
pub const MIN_PROTOCOL_VERSION: u32 = 38;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    UpdatesSubscription,
    ResourceUpload,
    PhotoUpload,
    ScreenshotUpload,
    WebsocketUpgrade,
}

impl ConnectionType {
    pub fn from_u32(v: u32) -> CodecResult<Self> {
        Ok(match v {
            0 => ConnectionType::UpdatesSubscription,
            1 => ConnectionType::ResourceUpload,
            2 => ConnectionType::PhotoUpload,
            3 => ConnectionType::ScreenshotUpload,
            4 => ConnectionType::WebsocketUpgrade,
            _ => {
                return Err(CodecError::Corrupted(format!(
                    "unknown connection type {}",
                    v
                )))
            }
        })
    }
}

pub const HANDSHAKE_OK: u32 = 0;
pub const HANDSHAKE_CLIENT_TOO_OLD: u32 = 1;
pub const HANDSHAKE_CLIENT_TOO_NEW: u32 = 2;

// ---------------------------------------------------------------------------
// Message ids
// ---------------------------------------------------------------------------

pub mod msg {
    pub const KEEP_ALIVE: u32 = 1;
    pub const CHAT_MESSAGE: u32 = 2;

    pub const AVATAR_CREATED: u32 = 3;
    pub const AVATAR_TRANSFORM_UPDATE: u32 = 4;
    pub const AVATAR_FULL_UPDATE: u32 = 5;
    pub const AVATAR_DESTROYED: u32 = 6;
    pub const AVATAR_PERFORM_GESTURE: u32 = 7;
    pub const AVATAR_STOP_GESTURE: u32 = 8;

    pub const CREATE_OBJECT: u32 = 9;
    pub const OBJECT_CREATED: u32 = 10;
    pub const OBJECT_TRANSFORM_UPDATE: u32 = 11;
    pub const OBJECT_FULL_UPDATE: u32 = 12;
    pub const DESTROY_OBJECT: u32 = 13;
    pub const OBJECT_DESTROYED: u32 = 14;
    pub const SUMMON_OBJECT: u32 = 15;

    pub const RESOURCE_REQUEST: u32 = 16;
    pub const RESOURCE_TRANSFER: u32 = 17;
    pub const RESOURCE_NOT_PRESENT: u32 = 18;

    pub const CHUNK_UPDATED: u32 = 19;
    pub const WORLD_SETTINGS_UPDATED: u32 = 20;
    pub const SERVER_ADMIN_MESSAGE: u32 = 21;
    pub const READ_ONLY_MODE: u32 = 22;
    pub const PERMISSION_DENIED: u32 = 23;

    pub const USER_MOVED_NEAR_TO_BOT_AVATAR: u32 = 24;
    pub const USER_MOVED_AWAY_FROM_BOT_AVATAR: u32 = 25;

    pub const LOG_IN: u32 = 26;
    pub const LOGGED_IN: u32 = 27;
    pub const LOG_IN_FAILED: u32 = 28;
    /// Client advertises the UDP port its voice socket listens on.
    pub const CLIENT_UDP_SOCKET_PORT: u32 = 29;
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Builder for one outbound frame.  The length slot is patched on finish.
pub struct Frame {
    w: Writer,
}

impl Frame {
    pub fn new(message_id: u32) -> Self {
        let mut w = Writer::new();
        w.write_u32(message_id);
        w.write_u32(0); // length, patched in finish()
        Self { w }
    }

    pub fn writer(&mut self) -> &mut Writer {
        &mut self.w
    }

    /// Patch the length field and freeze the frame for (shared) sending.
    pub fn finish(self) -> Bytes {
        let mut bytes = self.w.into_bytes();
        let len = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&len.to_le_bytes());
        Bytes::from(bytes)
    }
}

/// Split one frame header off a read buffer: `(id, total_len)`.
pub fn peek_frame_header(buf: &[u8]) -> CodecResult<Option<(u32, usize)>> {
    if buf.len() < 8 {
        return Ok(None);
    }
    let id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len < 8 {
        return Err(CodecError::Corrupted(format!("frame length {} too small", len)));
    }
    if len > limits::MAX_FRAME_SIZE {
        return Err(CodecError::Corrupted(format!(
            "frame length {} exceeds maximum {}",
            len,
            limits::MAX_FRAME_SIZE
        )));
    }
    if buf.len() < len as usize {
        return Ok(None);
    }
    Ok(Some((id, len as usize)))
}

// ---------------------------------------------------------------------------
// Client → server messages
// ---------------------------------------------------------------------------

/// A decoded inbound message.  The payload reader is handed to the per-id
/// decoder; string fields are bounded there.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    KeepAlive,
    ChatMessage {
        body: String,
    },
    AvatarTransformUpdate {
        pos: DVec3,
        axis: Vec3,
        angle: f32,
        anim_state: u32,
    },
    AvatarFullUpdate {
        name: String,
        model_url: String,
        anim_state: u32,
    },
    AvatarPerformGesture {
        gesture: String,
    },
    AvatarStopGesture,
    CreateObject {
        object: WorldObject,
    },
    ObjectTransformUpdate {
        uid: Uid,
        pos: DVec3,
        axis: Vec3,
        angle: f32,
        scale: Vec3,
    },
    ObjectFullUpdate {
        object: WorldObject,
    },
    DestroyObject {
        uid: Uid,
    },
    SummonObject {
        uid: Uid,
        pos: DVec3,
        axis: Vec3,
        angle: f32,
    },
    ResourceRequest {
        url: String,
    },
    UserMovedNearToBotAvatar {
        bot_uid: Uid,
    },
    UserMovedAwayFromBotAvatar {
        bot_uid: Uid,
    },
    LogIn {
        username: String,
        password: String,
    },
    ClientUdpSocketPort {
        port: u16,
    },
}

impl ClientMessage {
    /// Decode a frame payload (bytes after the 8-byte header).
    pub fn decode(id: u32, payload: &[u8]) -> CodecResult<ClientMessage> {
        let mut r = Reader::new(payload);
        let m = match id {
            msg::KEEP_ALIVE => ClientMessage::KeepAlive,
            msg::CHAT_MESSAGE => ClientMessage::ChatMessage {
                body: r.read_string(limits::MAX_CHAT_SIZE)?,
            },
            msg::AVATAR_TRANSFORM_UPDATE => ClientMessage::AvatarTransformUpdate {
                pos: r.read_dvec3()?,
                axis: r.read_vec3()?,
                angle: r.read_f32()?,
                anim_state: r.read_u32()?,
            },
            msg::AVATAR_FULL_UPDATE => ClientMessage::AvatarFullUpdate {
                name: r.read_string(limits::MAX_NAME_SIZE)?,
                model_url: r.read_string(limits::MAX_URL_SIZE)?,
                anim_state: r.read_u32()?,
            },
            msg::AVATAR_PERFORM_GESTURE => ClientMessage::AvatarPerformGesture {
                gesture: r.read_string(limits::MAX_NAME_SIZE)?,
            },
            msg::AVATAR_STOP_GESTURE => ClientMessage::AvatarStopGesture,
            msg::CREATE_OBJECT => ClientMessage::CreateObject {
                object: WorldObject::read_from(&mut r)?,
            },
            msg::OBJECT_TRANSFORM_UPDATE => ClientMessage::ObjectTransformUpdate {
                uid: r.read_uid()?,
                pos: r.read_dvec3()?,
                axis: r.read_vec3()?,
                angle: r.read_f32()?,
                scale: r.read_vec3()?,
            },
            msg::OBJECT_FULL_UPDATE => ClientMessage::ObjectFullUpdate {
                object: WorldObject::read_from(&mut r)?,
            },
            msg::DESTROY_OBJECT => ClientMessage::DestroyObject { uid: r.read_uid()? },
            msg::SUMMON_OBJECT => ClientMessage::SummonObject {
                uid: r.read_uid()?,
                pos: r.read_dvec3()?,
                axis: r.read_vec3()?,
                angle: r.read_f32()?,
            },
            msg::RESOURCE_REQUEST => ClientMessage::ResourceRequest {
                url: r.read_string(limits::MAX_URL_SIZE)?,
            },
            msg::USER_MOVED_NEAR_TO_BOT_AVATAR => ClientMessage::UserMovedNearToBotAvatar {
                bot_uid: r.read_uid()?,
            },
            msg::USER_MOVED_AWAY_FROM_BOT_AVATAR => ClientMessage::UserMovedAwayFromBotAvatar {
                bot_uid: r.read_uid()?,
            },
            msg::LOG_IN => ClientMessage::LogIn {
                username: r.read_string(limits::MAX_NAME_SIZE)?,
                password: r.read_string(limits::MAX_NAME_SIZE)?,
            },
            msg::CLIENT_UDP_SOCKET_PORT => ClientMessage::ClientUdpSocketPort {
                port: r.read_u32()? as u16,
            },
            other => {
                return Err(CodecError::Corrupted(format!("unknown message id {}", other)))
            }
        };
        Ok(m)
    }
}

// ---------------------------------------------------------------------------
// Server → client frame builders
// ---------------------------------------------------------------------------

pub fn keep_alive_frame() -> Bytes {
    Frame::new(msg::KEEP_ALIVE).finish()
}

/// Chat tagged with the sender's display name and avatar UID.
pub fn chat_message_frame(avatar_uid: Uid, sender_name: &str, body: &str) -> Bytes {
    let mut f = Frame::new(msg::CHAT_MESSAGE);
    f.writer().write_uid(avatar_uid);
    f.writer().write_string(sender_name);
    f.writer().write_string(body);
    f.finish()
}

pub fn avatar_created_frame(avatar: &Avatar) -> Bytes {
    let mut f = Frame::new(msg::AVATAR_CREATED);
    avatar.write_to(f.writer());
    f.finish()
}

pub fn avatar_transform_update_frame(
    avatar_uid: Uid,
    pos: DVec3,
    axis: Vec3,
    angle: f32,
    anim_state: u32,
) -> Bytes {
    let mut f = Frame::new(msg::AVATAR_TRANSFORM_UPDATE);
    f.writer().write_uid(avatar_uid);
    f.writer().write_dvec3(pos);
    f.writer().write_vec3(axis);
    f.writer().write_f32(angle);
    f.writer().write_u32(anim_state);
    f.finish()
}

pub fn avatar_full_update_frame(avatar: &Avatar) -> Bytes {
    let mut f = Frame::new(msg::AVATAR_FULL_UPDATE);
    avatar.write_to(f.writer());
    f.finish()
}

pub fn avatar_destroyed_frame(avatar_uid: Uid) -> Bytes {
    let mut f = Frame::new(msg::AVATAR_DESTROYED);
    f.writer().write_uid(avatar_uid);
    f.finish()
}

pub fn avatar_gesture_frame(avatar_uid: Uid, gesture: &str) -> Bytes {
    let mut f = Frame::new(msg::AVATAR_PERFORM_GESTURE);
    f.writer().write_uid(avatar_uid);
    f.writer().write_string(gesture);
    f.finish()
}

pub fn avatar_stop_gesture_frame(avatar_uid: Uid) -> Bytes {
    let mut f = Frame::new(msg::AVATAR_STOP_GESTURE);
    f.writer().write_uid(avatar_uid);
    f.finish()
}

pub fn object_created_frame(ob: &WorldObject) -> Bytes {
    let mut f = Frame::new(msg::OBJECT_CREATED);
    ob.write_to(f.writer());
    f.finish()
}

pub fn object_full_update_frame(ob: &WorldObject) -> Bytes {
    let mut f = Frame::new(msg::OBJECT_FULL_UPDATE);
    ob.write_to(f.writer());
    f.finish()
}

pub fn object_transform_update_frame(ob: &WorldObject) -> Bytes {
    let mut f = Frame::new(msg::OBJECT_TRANSFORM_UPDATE);
    f.writer().write_uid(ob.uid);
    f.writer().write_dvec3(ob.pos);
    f.writer().write_vec3(ob.axis);
    f.writer().write_f32(ob.angle);
    f.writer().write_vec3(ob.scale);
    f.finish()
}

pub fn object_destroyed_frame(uid: Uid) -> Bytes {
    let mut f = Frame::new(msg::OBJECT_DESTROYED);
    f.writer().write_uid(uid);
    f.finish()
}

/// Server's echo of a summon: the claimed pose plus who moved it.
pub fn summon_object_frame(uid: Uid, pos: DVec3, axis: Vec3, angle: f32, by_avatar: Uid) -> Bytes {
    let mut f = Frame::new(msg::SUMMON_OBJECT);
    f.writer().write_uid(uid);
    f.writer().write_dvec3(pos);
    f.writer().write_vec3(axis);
    f.writer().write_f32(angle);
    f.writer().write_uid(by_avatar);
    f.finish()
}

pub fn resource_transfer_frame(url: &str, data: &[u8]) -> Bytes {
    let mut f = Frame::new(msg::RESOURCE_TRANSFER);
    f.writer().write_string(url);
    f.writer().write_buffer(data);
    f.finish()
}

pub fn resource_not_present_frame(url: &str) -> Bytes {
    let mut f = Frame::new(msg::RESOURCE_NOT_PRESENT);
    f.writer().write_string(url);
    f.finish()
}

pub fn chunk_updated_frame(chunk: &crate::chunk::LodChunk) -> Bytes {
    let mut f = Frame::new(msg::CHUNK_UPDATED);
    let coords: ChunkCoord = chunk.coords;
    f.writer().write_i32(coords.x);
    f.writer().write_i32(coords.y);
    f.writer().write_i32(coords.z);
    f.writer().write_string(&chunk.mesh_url);
    f.writer().write_string(&chunk.combined_array_texture_url);
    f.writer().write_buffer(&chunk.compressed_mat_info);
    f.finish()
}

pub fn world_settings_updated_frame(settings: &crate::worlds::WorldSettings) -> Bytes {
    let mut f = Frame::new(msg::WORLD_SETTINGS_UPDATED);
    settings.write_to(f.writer());
    f.finish()
}

pub fn server_admin_message_frame(message: &str) -> Bytes {
    let mut f = Frame::new(msg::SERVER_ADMIN_MESSAGE);
    f.writer().write_string(message);
    f.finish()
}

pub fn read_only_mode_frame(read_only: bool) -> Bytes {
    let mut f = Frame::new(msg::READ_ONLY_MODE);
    f.writer().write_u8(read_only as u8);
    f.finish()
}

pub fn permission_denied_frame(reason: &str) -> Bytes {
    let mut f = Frame::new(msg::PERMISSION_DENIED);
    f.writer().write_string(reason);
    f.finish()
}

pub fn logged_in_frame(user_id: crate::types::UserId, username: &str) -> Bytes {
    let mut f = Frame::new(msg::LOGGED_IN);
    f.writer().write_user_id(user_id);
    f.writer().write_string(username);
    f.finish()
}

pub fn log_in_failed_frame(reason: &str) -> Bytes {
    let mut f = Frame::new(msg::LOG_IN_FAILED);
    f.writer().write_string(reason);
    f.finish()
}
