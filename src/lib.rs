//! Cyberspace world server
//!
//! A persistent multi-user 3D world-state engine: clients connect over
//! TCP/TLS, subscribe to a world, and receive differential updates while
//! background pipelines derive LOD assets, bake chunk meshes, poll dynamic
//! textures and drive NPC chat.
//!
//! ## Architecture
//!
//! ```text
//! listener  (listener.rs)   ← TCP accept + TLS
//!   └── session  (session.rs)            ← handshake, reader/writer tasks
//!         └── dispatch  (dispatch.rs)    ← mutate world under the lock
//!               └── Server  (server.rs)  ← context owning everything
//!                     ├── AllWorlds        (worlds.rs)     ← world mutex
//!                     ├── RecordStore      (store.rs)      ← append-only db
//!                     └── ResourceManager  (resources.rs)  ← content-addressed files
//! background: lod.rs, baker.rs, dyntex.rs, npc.rs/llm.rs, maintenance.rs, udp.rs
//! ```
//!
//! Lock discipline: one `parking_lot::Mutex<AllWorlds>` guards the whole
//! world model; the resource registry carries its own lock; neither is held
//! across blocking I/O or an `.await`.

pub mod avatar;
pub mod baker;
pub mod chunk;
pub mod codec;
pub mod creation;
pub mod dispatch;
pub mod dyntex;
pub mod limits;
pub mod listener;
pub mod llm;
pub mod lod;
pub mod maintenance;
pub mod mesh;
pub mod npc;
pub mod object;
pub mod parcel;
pub mod photo;
pub mod protocol;
pub mod records;
pub mod resources;
pub mod server;
pub mod session;
pub mod store;
pub mod types;
pub mod udp;
pub mod worlds;

// Convenience re-exports
pub use resources::ResourceManager;
pub use server::{Server, ServerConfig};
pub use store::RecordStore;
pub use types::{ChunkCoord, RecordKey, TimeStamp, Uid, UserId};
pub use worlds::{AllWorlds, World};
