//! Avatars and their transform-snapshot history.

use crate::codec::{CodecResult, Reader, Writer};
use crate::limits;
use crate::types::{Uid, UserId};
use glam::{DVec3, Vec3};

/// Number of pose snapshots kept per avatar for interpolated playback.
pub const HISTORY_BUF_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSnapshot {
    pub pos: DVec3,
    pub axis: Vec3,
    pub angle: f32,
    /// Seconds on the caller's monotonic clock when the snapshot arrived.
    pub time: f64,
}

impl Default for PoseSnapshot {
    fn default() -> Self {
        Self {
            pos: DVec3::ZERO,
            axis: Vec3::Z,
            angle: 0.0,
            time: 0.0,
        }
    }
}

/// Fixed-size ring of the last few pose updates.
///
/// `next_i` is the slot the next snapshot lands in; `next_i - 1` holds the
/// most recent update.  Interpolation is a pure function over the ring and a
/// clock, so subscribers can replay motion smoothly between 100 ms updates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PoseHistory {
    snapshots: [PoseSnapshot; HISTORY_BUF_SIZE],
    next_i: u32,
}

impl PoseHistory {
    pub fn push(&mut self, snapshot: PoseSnapshot) {
        self.snapshots[self.next_i as usize % HISTORY_BUF_SIZE] = snapshot;
        self.next_i += 1;
    }

    pub fn latest(&self) -> Option<&PoseSnapshot> {
        if self.next_i == 0 {
            return None;
        }
        Some(&self.snapshots[(self.next_i as usize + HISTORY_BUF_SIZE - 1) % HISTORY_BUF_SIZE])
    }

    /// Pose at `time`, interpolating between the two snapshots that straddle
    /// it, clamping to the newest / oldest available.
    pub fn interpolated(&self, time: f64) -> Option<PoseSnapshot> {
        let newest = *self.latest()?;
        if self.next_i == 1 || time >= newest.time {
            return Some(newest);
        }

        let mut prev = newest;
        let count = (self.next_i as usize).min(HISTORY_BUF_SIZE);
        for back in 1..count {
            let s = self.snapshots
                [(self.next_i as usize + HISTORY_BUF_SIZE - 1 - back) % HISTORY_BUF_SIZE];
            if time >= s.time {
                let span = prev.time - s.time;
                let frac = if span > 1e-9 {
                    ((time - s.time) / span).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                return Some(PoseSnapshot {
                    pos: s.pos.lerp(prev.pos, frac),
                    axis: prev.axis,
                    angle: s.angle + (prev.angle - s.angle) * frac as f32,
                    time,
                });
            }
            prev = s;
        }
        Some(prev)
    }
}

// ---------------------------------------------------------------------------
// Avatar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarState {
    Alive,
    /// Owning connection is gone; removed by the next world sweep.
    Dead,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Avatar {
    pub uid: Uid,
    pub owner_id: UserId,
    pub name: String,

    pub pos: DVec3,
    pub axis: Vec3,
    pub angle: f32,

    pub model_url: String,
    pub anim_state: u32,

    pub state: AvatarState,
    pub history: PoseHistory,

    /// True for avatars driven by the NPC chat subsystem rather than a
    /// connection.
    pub is_bot: bool,
}

impl Avatar {
    pub fn new(uid: Uid, owner_id: UserId, name: impl Into<String>) -> Self {
        Self {
            uid,
            owner_id,
            name: name.into(),
            pos: DVec3::ZERO,
            axis: Vec3::Z,
            angle: 0.0,
            model_url: String::new(),
            anim_state: 0,
            state: AvatarState::Alive,
            history: PoseHistory::default(),
            is_bot: false,
        }
    }

    /// Record a transform update and refresh the live pose.
    pub fn set_transform(&mut self, pos: DVec3, axis: Vec3, angle: f32, time: f64) {
        self.pos = pos;
        self.axis = axis;
        self.angle = angle;
        self.history.push(PoseSnapshot {
            pos,
            axis,
            angle,
            time,
        });
    }

    // -----------------------------------------------------------------------
    // Wire form (avatars are not persisted, only streamed)
    // -----------------------------------------------------------------------

    pub fn write_to(&self, w: &mut Writer) {
        w.write_uid(self.uid);
        w.write_string(&self.name);
        w.write_dvec3(self.pos);
        w.write_vec3(self.axis);
        w.write_f32(self.angle);
        w.write_string(&self.model_url);
        w.write_u32(self.anim_state);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<Avatar> {
        let uid = r.read_uid()?;
        let name = r.read_string(limits::MAX_NAME_SIZE)?;
        let mut avatar = Avatar::new(uid, UserId::INVALID, name);
        avatar.pos = r.read_dvec3()?;
        avatar.axis = r.read_vec3()?;
        avatar.angle = r.read_f32()?;
        avatar.model_url = r.read_string(limits::MAX_URL_SIZE)?;
        avatar.anim_state = r.read_u32()?;
        Ok(avatar)
    }
}
