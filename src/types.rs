//! Core identifier and value types shared across all modules.

use glam::{DVec3, Vec3};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// UIDs
// ---------------------------------------------------------------------------

/// 64-bit UID for objects and avatars, allocated monotonically by the world
/// state.  The all-ones value is the invalid sentinel.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Uid(pub u64);

impl Uid {
    pub const INVALID: Uid = Uid(u64::MAX);

    pub fn valid(self) -> bool {
        self != Self::INVALID
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit user id allocated on account creation.  The all-ones value is the
/// invalid sentinel (used for anonymous / server-owned entities).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct UserId(pub u64);

impl UserId {
    pub const INVALID: UserId = UserId(u64::MAX);

    pub fn valid(self) -> bool {
        self != Self::INVALID
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for UserId {
    fn default() -> Self {
        UserId::INVALID
    }
}

// ---------------------------------------------------------------------------
// Record keys
// ---------------------------------------------------------------------------

/// Opaque handle allocated by the record store.  Stored back onto every
/// persisted entity so later updates re-use the same slot.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RecordKey(pub u64);

impl RecordKey {
    pub const INVALID: RecordKey = RecordKey(u64::MAX);

    pub fn valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for RecordKey {
    fn default() -> Self {
        RecordKey::INVALID
    }
}

// ---------------------------------------------------------------------------
// Spatial chunking
// ---------------------------------------------------------------------------

/// World-space width of one LOD chunk cell.  The world is tiled in x/y;
/// z is reserved and always 0 for now.
pub const CHUNK_W: f64 = 128.0;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chunk containing a world-space position.
    pub fn for_position(pos: DVec3) -> Self {
        Self {
            x: (pos.x / CHUNK_W).floor() as i32,
            y: (pos.y / CHUNK_W).floor() as i32,
            z: 0,
        }
    }

    /// World-space x/y footprint of this chunk: (min_x, min_y, max_x, max_y).
    pub fn footprint(self) -> (f64, f64, f64, f64) {
        (
            self.x as f64 * CHUNK_W,
            self.y as f64 * CHUNK_W,
            (self.x + 1) as f64 * CHUNK_W,
            (self.y + 1) as f64 * CHUNK_W,
        )
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{},{}]", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Seconds since the Unix epoch.  Good enough for creation and modification
/// times; sub-second timing uses `Instant` instead.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct TimeStamp(pub u64);

impl TimeStamp {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self(secs)
    }

    pub fn seconds_ago(self) -> u64 {
        Self::now().0.saturating_sub(self.0)
    }
}

// ---------------------------------------------------------------------------
// Axis-aligned bounding boxes
// ---------------------------------------------------------------------------

/// f32 AABB in object space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn enlarge_to_hold(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Longest axis length, or 0 for an empty box.
    pub fn longest_axis(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            (self.max - self.min).max_element()
        }
    }

    /// Transform all eight corners and take the bounds of the result.
    pub fn transformed(&self, m: &glam::Mat4) -> Aabb {
        let mut out = Aabb::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.enlarge_to_hold(m.transform_point3(corner));
        }
        out
    }
}

/// f64 AABB in world space (positions are double precision).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DAabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl DAabb {
    pub const EMPTY: DAabb = DAabb {
        min: DVec3::splat(f64::INFINITY),
        max: DVec3::splat(f64::NEG_INFINITY),
    };

    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, p: DVec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}
