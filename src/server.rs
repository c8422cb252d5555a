//! Server context: the one value owning world state, record store, resource
//! registry, the connection table, and the background-worker queues.
//!
//! Everything is reached through a `&Arc<Server>`; there are no module-level
//! singletons.

use crate::resources::ResourceManager;
use crate::store::RecordStore;
use crate::types::{Uid, UserId};
use crate::worlds::AllWorlds;
use bytes::Bytes;
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Frames queued per connection before we consider it stalled and drop it.
pub const CONNECTION_QUEUE_HIGH_WATER: usize = 2048;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub state_dir: PathBuf,
    pub listen_port: u16,
    pub udp_port: u16,
    pub read_only: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl ServerConfig {
    pub fn records_file_path(&self) -> PathBuf {
        self.state_dir.join("server_state.bin")
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.state_dir.join("server_resources")
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.state_dir.join("photos")
    }
}

// ---------------------------------------------------------------------------
// Connection table
// ---------------------------------------------------------------------------

/// What the server needs to reach one live subscribed connection.
pub struct ConnectionHandle {
    pub id: u64,
    pub world_name: String,
    pub avatar_uid: Uid,
    pub user_id: UserId,
    pub remote_addr: SocketAddr,
    pub client_udp_port: u16,
    /// Outbound frame queue; popped by the connection's writer task.
    pub sender: mpsc::Sender<Bytes>,
}

// ---------------------------------------------------------------------------
// Background-worker handles
// ---------------------------------------------------------------------------

/// A "re-check LOD derivations for this object" work item.
#[derive(Debug, Clone)]
pub struct LodCheckItem {
    pub world_name: String,
    pub uid: Uid,
}

/// Events forwarded from the dispatcher to the NPC chat subsystem.
#[derive(Debug, Clone)]
pub enum NpcEvent {
    ChatHeard {
        world_name: String,
        bot_uid: Uid,
        speaker_name: String,
        body: String,
    },
    UserMovedNear {
        world_name: String,
        bot_uid: Uid,
        user_name: String,
    },
    UserMovedAway {
        world_name: String,
        bot_uid: Uid,
        user_name: String,
    },
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct Server {
    pub config: ServerConfig,

    /// The world mutex.  Guards all of [`AllWorlds`].
    pub state: Mutex<AllWorlds>,
    pub store: Mutex<RecordStore>,
    pub resources: ResourceManager,

    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    next_connection_id: AtomicU64,
    /// Set whenever the connection table changes; the UDP echo task polls it
    /// to rebuild its client list.
    pub connected_clients_changed: AtomicBool,

    pub lod_queue: mpsc::UnboundedSender<LodCheckItem>,
    pub npc_events: mpsc::UnboundedSender<NpcEvent>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        state: AllWorlds,
        store: RecordStore,
        resources: ResourceManager,
        lod_queue: mpsc::UnboundedSender<LodCheckItem>,
        npc_events: mpsc::UnboundedSender<NpcEvent>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(state),
            store: Mutex::new(store),
            resources,
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            connected_clients_changed: AtomicBool::new(false),
            lod_queue,
            npc_events,
        }
    }

    // -----------------------------------------------------------------------
    // Connection registry
    // -----------------------------------------------------------------------

    pub fn alloc_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_connection(&self, handle: ConnectionHandle) {
        self.connections.lock().insert(handle.id, handle);
        self.connected_clients_changed.store(true, Ordering::Release);
    }

    pub fn unregister_connection(&self, id: u64) -> Option<ConnectionHandle> {
        let removed = self.connections.lock().remove(&id);
        self.connected_clients_changed.store(true, Ordering::Release);
        removed
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Record the UDP port a client's voice socket listens on.
    pub fn set_connection_udp_port(&self, id: u64, port: u16) {
        if let Some(conn) = self.connections.lock().get_mut(&id) {
            conn.client_udp_port = port;
        }
        self.connected_clients_changed.store(true, Ordering::Release);
    }

    /// Associate a logged-in user with a connection.
    pub fn set_connection_user(&self, id: u64, user_id: UserId) {
        if let Some(conn) = self.connections.lock().get_mut(&id) {
            conn.user_id = user_id;
        }
    }

    /// Snapshot of (remote address, advertised UDP port) for the echo task.
    pub fn connected_udp_endpoints(&self) -> Vec<(SocketAddr, u16)> {
        self.connections
            .lock()
            .values()
            .map(|c| (c.remote_addr, c.client_udp_port))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Enqueue a frame to every connection subscribed to `world_name`,
    /// optionally excluding one connection (usually the sender).
    ///
    /// Connections whose outbound queue is full have stalled; they are
    /// dropped rather than allowed to apply back-pressure to the world.
    pub fn broadcast_to_world(&self, world_name: &str, frame: &Bytes, exclude: Option<u64>) {
        let mut stalled = Vec::new();
        {
            let connections = self.connections.lock();
            for conn in connections.values() {
                if conn.world_name != world_name || Some(conn.id) == exclude {
                    continue;
                }
                if conn.sender.try_send(frame.clone()).is_err() {
                    stalled.push(conn.id);
                }
            }
        }
        for id in stalled {
            warn!("connection {} stalled (outbound queue full), dropping", id);
            self.unregister_connection(id);
        }
    }

    /// Enqueue a frame to a single connection.
    pub fn send_to_connection(&self, id: u64, frame: Bytes) {
        let stalled = {
            let connections = self.connections.lock();
            match connections.get(&id) {
                Some(conn) => conn.sender.try_send(frame).is_err(),
                None => false,
            }
        };
        if stalled {
            warn!("connection {} stalled (outbound queue full), dropping", id);
            self.unregister_connection(id);
        }
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    /// Look up a credential by canonical name under the world lock.
    pub fn credential(&self, name: &str) -> Option<String> {
        self.state.lock().credentials.creds.get(name).cloned()
    }
}
