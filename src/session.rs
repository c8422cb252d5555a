//! Per-connection handling: handshake, reader/writer tasks, initial world
//! snapshot, and the upload connection types.
//!
//! ## Connection state machine
//!
//! ```text
//! INIT → (handshake ok) → SUBSCRIBED → (disconnect) → CLOSED
//!   │                        │
//!   │                        ├─> (message loop)
//!   │                        └─> (fatal protocol error) → CLOSED
//!   └─> (handshake fail) → CLOSED
//! ```
//!
//! A protocol error from one client closes that connection and nothing else;
//! the world is untouched.

use crate::avatar::{Avatar, AvatarState};
use crate::codec::CodecError;
use crate::dispatch::{self, ConnectionCtx};
use crate::limits;
use crate::photo;
use crate::protocol::{self, ClientMessage, ConnectionType};
use crate::resources::ResourceState;
use crate::server::{ConnectionHandle, Server, CONNECTION_QUEUE_HIGH_WATER};
use crate::types::UserId;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

/// Connections with no inbound traffic (not even a keep-alive probe) for
/// this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection idle for {}s", IDLE_TIMEOUT.as_secs())]
    IdleTimeout,

    #[error("{0}")]
    Other(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

// ---------------------------------------------------------------------------
// Async read/write helpers
// ---------------------------------------------------------------------------

pub async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> SessionResult<u32> {
    let mut b = [0u8; 4];
    stream.read_exact(&mut b).await?;
    Ok(u32::from_le_bytes(b))
}

pub async fn read_u64<S: AsyncRead + Unpin>(stream: &mut S) -> SessionResult<u64> {
    let mut b = [0u8; 8];
    stream.read_exact(&mut b).await?;
    Ok(u64::from_le_bytes(b))
}

pub async fn read_string<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_len: usize,
) -> SessionResult<String> {
    let len = read_u32(stream).await? as usize;
    if len > max_len {
        return Err(SessionError::Protocol(CodecError::Corrupted(format!(
            "string length {} exceeds maximum {}",
            len, max_len
        ))));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| {
        SessionError::Protocol(CodecError::Corrupted("string is not valid UTF-8".to_string()))
    })
}

pub async fn write_u32<S: AsyncWrite + Unpin>(stream: &mut S, v: u32) -> SessionResult<()> {
    stream.write_all(&v.to_le_bytes()).await?;
    Ok(())
}

pub async fn write_u64<S: AsyncWrite + Unpin>(stream: &mut S, v: u64) -> SessionResult<()> {
    stream.write_all(&v.to_le_bytes()).await?;
    Ok(())
}

pub async fn write_string<S: AsyncWrite + Unpin>(stream: &mut S, s: &str) -> SessionResult<()> {
    write_u32(stream, s.len() as u32).await?;
    stream.write_all(s.as_bytes()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Connection entry point
// ---------------------------------------------------------------------------

/// Accept one TCP connection: TLS-wrap it, run the handshake, and hand off
/// to the handler for its connection type.  Runs as its own task.
pub async fn handle_connection(
    server: Arc<Server>,
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    remote_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let stream = match acceptor.accept(tcp).await {
        Ok(s) => s,
        Err(e) => {
            debug!("TLS accept from {} failed: {}", remote_addr, e);
            return;
        }
    };

    match run_handshake_and_session(server, stream, remote_addr, shutdown).await {
        Ok(()) => info!("connection from {} closed", remote_addr),
        Err(e) => info!("connection from {} closed: {}", remote_addr, e),
    }
}

async fn run_handshake_and_session<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    server: Arc<Server>,
    mut stream: S,
    remote_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> SessionResult<()> {
    // Hello: magic, protocol version, connection type, world name.
    let magic = read_u32(&mut stream).await?;
    if magic != protocol::HELLO_MAGIC {
        return Err(SessionError::Handshake("bad hello magic".to_string()));
    }
    let client_version = read_u32(&mut stream).await?;
    let connection_type = read_u32(&mut stream).await?;
    let world_name = read_string(&mut stream, limits::MAX_WORLD_NAME_SIZE).await?;

    write_u32(&mut stream, protocol::HELLO_MAGIC).await?;
    if client_version < protocol::MIN_PROTOCOL_VERSION {
        write_u32(&mut stream, protocol::HANDSHAKE_CLIENT_TOO_OLD).await?;
        write_string(
            &mut stream,
            "client protocol version is too old, please update your client",
        )
        .await?;
        return Err(SessionError::Handshake("client protocol too old".to_string()));
    }
    if client_version > protocol::CURRENT_PROTOCOL_VERSION {
        write_u32(&mut stream, protocol::HANDSHAKE_CLIENT_TOO_NEW).await?;
        write_string(
            &mut stream,
            "client protocol version is newer than this server",
        )
        .await?;
        return Err(SessionError::Handshake("client protocol too new".to_string()));
    }
    let connection_type = ConnectionType::from_u32(connection_type)?;
    write_u32(&mut stream, protocol::HANDSHAKE_OK).await?;

    match connection_type {
        ConnectionType::UpdatesSubscription => {
            run_subscription(server, stream, remote_addr, world_name, shutdown).await
        }
        ConnectionType::ResourceUpload => run_resource_upload(server, stream).await,
        ConnectionType::PhotoUpload => photo::run_photo_upload(server, stream).await,
        ConnectionType::ScreenshotUpload => run_screenshot_upload(server, stream).await,
        ConnectionType::WebsocketUpgrade => Err(SessionError::Handshake(
            "websocket connections are served by the web front-end".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Updates subscription
// ---------------------------------------------------------------------------

async fn run_subscription<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    server: Arc<Server>,
    stream: S,
    remote_addr: SocketAddr,
    world_name: String,
    mut shutdown: watch::Receiver<bool>,
) -> SessionResult<()> {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // Join the world: allocate the avatar and build the initial snapshot
    // under one world-lock hold.
    let connection_id = server.alloc_connection_id();
    let (avatar_uid, initial_frames) = {
        let mut state = server.state.lock();
        let avatar_uid = state.alloc_avatar_uid();
        let world = state.world_entry(&world_name);

        let avatar = Avatar::new(avatar_uid, UserId::INVALID, format!("Avatar {}", avatar_uid));
        let mut frames: Vec<Bytes> = Vec::new();
        frames.push(protocol::read_only_mode_frame(server.config.read_only));
        for ob in world.objects.values().filter(|ob| !ob.dead) {
            frames.push(protocol::object_created_frame(ob));
        }
        for other in world.avatars.values() {
            if other.state == AvatarState::Alive {
                frames.push(protocol::avatar_created_frame(other));
            }
        }
        for chunk in world.chunks.values() {
            if !chunk.mesh_url.is_empty() {
                frames.push(protocol::chunk_updated_frame(chunk));
            }
        }
        world.avatars.insert(avatar_uid, avatar);
        (avatar_uid, frames)
    };

    // Tell the world about the new avatar, and the client its own UID.
    let new_avatar_frame = {
        let state = server.state.lock();
        state
            .world(&world_name)
            .and_then(|w| w.avatars.get(&avatar_uid))
            .map(protocol::avatar_created_frame)
    };
    if let Some(frame) = new_avatar_frame {
        server.broadcast_to_world(&world_name, &frame, Some(connection_id));
    }
    write_u64(&mut write_half, avatar_uid.0).await?;

    // The initial snapshot can dwarf the outbound queue; write it straight
    // to the stream before the writer task takes over.
    for frame in initial_frames {
        write_half.write_all(&frame).await?;
    }

    let (tx, mut rx) = mpsc::channel::<Bytes>(CONNECTION_QUEUE_HIGH_WATER);
    server.register_connection(ConnectionHandle {
        id: connection_id,
        world_name: world_name.clone(),
        avatar_uid,
        user_id: UserId::INVALID,
        remote_addr,
        client_udp_port: 0,
        sender: tx,
    });

    // Writer task: drains the outbound queue, writing whole frames.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reader loop.
    let mut ctx = ConnectionCtx::new(connection_id, world_name.clone(), avatar_uid);
    let result = read_loop(&server, &mut ctx, &mut read_half, &mut shutdown).await;

    // Tear down: the avatar dies, subscribers hear about it, the sweep reaps.
    server.unregister_connection(connection_id);
    {
        let mut state = server.state.lock();
        if let Some(world) = state.world_mut(&world_name) {
            if let Some(avatar) = world.avatars.get_mut(&avatar_uid) {
                avatar.state = AvatarState::Dead;
            }
        }
    }
    server.broadcast_to_world(&world_name, &protocol::avatar_destroyed_frame(avatar_uid), None);
    writer.abort();

    result
}

async fn read_loop<S: AsyncRead + Unpin>(
    server: &Arc<Server>,
    ctx: &mut ConnectionCtx,
    read_half: &mut S,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionResult<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);

    loop {
        // Parse every complete frame in the buffer before reading more.
        while let Some((id, total_len)) = protocol::peek_frame_header(&buf)? {
            let frame = buf.split_to(total_len);
            let message = ClientMessage::decode(id, &frame[8..])?;
            dispatch::handle_message(server, ctx, message).await?;
        }

        let read = tokio::select! {
            r = tokio::time::timeout(IDLE_TIMEOUT, read_half.read_buf(&mut buf)) => {
                match r {
                    Ok(n) => n?,
                    Err(_) => return Err(SessionError::IdleTimeout),
                }
            }
            _ = shutdown.changed() => return Ok(()),
        };
        if read == 0 {
            return Ok(()); // clean EOF
        }
    }
}

// ---------------------------------------------------------------------------
// Resource upload
// ---------------------------------------------------------------------------

/// Header: username, password, URL, byte length; body streamed to a temp
/// file and moved into place, after which the resource is marked present.
async fn run_resource_upload<S: AsyncRead + AsyncWrite + Unpin>(
    server: Arc<Server>,
    mut stream: S,
) -> SessionResult<()> {
    let username = read_string(&mut stream, limits::MAX_NAME_SIZE).await?;
    let password = read_string(&mut stream, limits::MAX_NAME_SIZE).await?;
    let url = read_string(&mut stream, limits::MAX_URL_SIZE).await?;
    let length = read_u64(&mut stream).await?;

    let user_id = {
        let state = server.state.lock();
        state
            .user_by_name(&username)
            .filter(|u| u.check_password(&password))
            .map(|u| u.id)
    };
    let Some(user_id) = user_id else {
        write_u32(&mut stream, upload_response::FAILED).await?;
        write_string(&mut stream, "invalid username or password").await?;
        return Ok(());
    };

    if server.config.read_only {
        write_u32(&mut stream, upload_response::FAILED).await?;
        write_string(&mut stream, "server is in read-only mode").await?;
        return Ok(());
    }
    if length > limits::MAX_RESOURCE_UPLOAD_SIZE {
        write_u32(&mut stream, upload_response::FAILED).await?;
        write_string(&mut stream, "upload too large").await?;
        return Ok(());
    }

    server.resources.get_or_create(&url);
    server.resources.set_state(&url, ResourceState::Transferring);

    // Stream the body into a temp file next to the final location, then move
    // it into place so Present only ever sees complete bytes.
    let final_path = server.resources.abs_path_for_url(&url);
    let tmp_path = final_path.with_extension("part");
    let body = read_exact_bytes(&mut stream, length as usize).await?;
    tokio::fs::write(&tmp_path, &body).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;

    server.resources.set_owner(&url, user_id);
    server
        .resources
        .mark_as_locally_present(&url)
        .map_err(|e| SessionError::Other(e.to_string()))?;

    info!("resource '{}' uploaded by {} ({} bytes)", url, username, length);
    write_u32(&mut stream, upload_response::SUCCEEDED).await?;
    Ok(())
}

pub mod upload_response {
    pub const SUCCEEDED: u32 = 0;
    pub const FAILED: u32 = 1;
}

pub async fn read_exact_bytes<S: AsyncRead + Unpin>(
    stream: &mut S,
    len: usize,
) -> SessionResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Screenshot upload
// ---------------------------------------------------------------------------

/// Screenshot-bot connection: authenticated upload of a rendered screenshot,
/// recorded as a `Screenshot` entity.
async fn run_screenshot_upload<S: AsyncRead + AsyncWrite + Unpin>(
    server: Arc<Server>,
    mut stream: S,
) -> SessionResult<()> {
    let username = read_string(&mut stream, limits::MAX_NAME_SIZE).await?;
    let password = read_string(&mut stream, limits::MAX_NAME_SIZE).await?;
    let screenshot_id = read_u64(&mut stream).await?;
    let length = read_u64(&mut stream).await?;

    let authorised = {
        let state = server.state.lock();
        state
            .user_by_name(&username)
            .map(|u| u.check_password(&password) && u.is_admin())
            .unwrap_or(false)
    };
    if !authorised || server.config.read_only {
        write_u32(&mut stream, upload_response::FAILED).await?;
        write_string(&mut stream, "not authorised").await?;
        return Ok(());
    }
    if length > limits::MAX_PHOTO_SIZE {
        write_u32(&mut stream, upload_response::FAILED).await?;
        write_string(&mut stream, "upload too large").await?;
        return Ok(());
    }

    let body = read_exact_bytes(&mut stream, length as usize).await?;
    let dir = server.config.state_dir.join("screenshots");
    tokio::fs::create_dir_all(&dir).await?;
    let filename = format!("screenshot_{}.jpg", screenshot_id);
    tokio::fs::write(dir.join(&filename), &body).await?;

    {
        let mut state = server.state.lock();
        if let Some(shot) = state.screenshots.get_mut(&screenshot_id) {
            shot.local_filename = filename;
            shot.state = 1; // done
            state.db_dirty_screenshots.insert(screenshot_id);
        } else {
            warn!("screenshot upload for unknown id {}", screenshot_id);
        }
    }

    write_u32(&mut stream, upload_response::SUCCEEDED).await?;
    Ok(())
}
