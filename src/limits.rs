//! Size caps applied before deserialising anything a client or the database
//! hands us.  Exceeding a cap is treated as corruption, never truncated.

/// Display names, user names.
pub const MAX_NAME_SIZE: usize = 200;

/// World names (personal worlds are named after their user).
pub const MAX_WORLD_NAME_SIZE: usize = 1000;

/// Resource URLs.
pub const MAX_URL_SIZE: usize = 4096;

/// Object script source.
pub const MAX_SCRIPT_SIZE: usize = 1024 * 1024;

/// Object content strings (hypercard text, biome tags, …).
pub const MAX_CONTENT_SIZE: usize = 10_000;

/// Chat message bodies.
pub const MAX_CHAT_SIZE: usize = 10_000;

/// Photo captions.
pub const MAX_CAPTION_SIZE: usize = 10_000;

/// Material slots per object.
pub const MAX_NUM_MATERIALS: usize = 32;

/// Compressed voxel blob per object.
pub const MAX_VOXEL_DATA_SIZE: usize = 8 * 1024 * 1024;

/// One serialised world object record.
pub const MAX_OBJECT_SIZE: u32 = 10 * 1024 * 1024;

/// One serialised material block.
pub const MAX_MATERIAL_SIZE: u32 = 65536;

/// One serialised world-settings record.  Two historical caps existed; the
/// larger is authoritative.
pub const MAX_WORLD_SETTINGS_SIZE: u32 = 1024 * 1024;

/// Generic cap for small auxiliary records (users, orders, sessions, …).
pub const MAX_AUX_RECORD_SIZE: u32 = 1024 * 1024;

/// Serialised LOD chunk record (holds the compressed mat-info blob).
pub const MAX_LOD_CHUNK_SIZE: u32 = 4 * 1024 * 1024;

/// One framed protocol message on the main connection.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Photo upload body.
pub const MAX_PHOTO_SIZE: u64 = 20 * 1024 * 1024;

/// Resource upload body.
pub const MAX_RESOURCE_UPLOAD_SIZE: u64 = 256 * 1024 * 1024;

/// Dynamic-texture HTTP GET response body.
pub const MAX_DYN_TEX_SIZE: u64 = 32 * 1024 * 1024;
