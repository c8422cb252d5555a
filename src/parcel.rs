//! Parcels: polygonal areas of a world with owner and writer ACLs.

use crate::codec::{CodecError, CodecResult, Reader, Writer};
use crate::limits;
use crate::types::{DAabb, RecordKey, TimeStamp, UserId};
use glam::{DVec2, DVec3};

const PARCEL_SERIALISATION_VERSION: u32 = 1;

const MAX_USER_LIST_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Parcel {
    pub id: u64,
    pub owner_id: UserId,
    pub admin_ids: Vec<UserId>,
    pub writer_ids: Vec<UserId>,

    /// Denormalised display names, filled from the user table after load.
    pub owner_name: String,
    pub admin_names: Vec<String>,
    pub writer_names: Vec<String>,

    /// Four x/y corner verts, counter-clockwise.
    pub verts: [DVec2; 4],
    pub zbounds: (f64, f64),

    pub created_time: TimeStamp,
    /// All users may create objects here, not just listed writers.
    pub all_writeable: bool,

    pub parcel_auction_ids: Vec<u64>,

    /// Derived from `verts` and `zbounds`; not persisted.
    pub aabb: DAabb,

    pub record_key: RecordKey,
}

impl Parcel {
    pub fn new(id: u64, owner_id: UserId) -> Self {
        Self {
            id,
            owner_id,
            admin_ids: Vec::new(),
            writer_ids: Vec::new(),
            owner_name: String::new(),
            admin_names: Vec::new(),
            writer_names: Vec::new(),
            verts: [DVec2::ZERO; 4],
            zbounds: (-1.0, 10.0),
            created_time: TimeStamp::now(),
            all_writeable: false,
            parcel_auction_ids: Vec::new(),
            aabb: DAabb::EMPTY,
            record_key: RecordKey::INVALID,
        }
    }

    /// Recompute the derived axis-aligned bounds.  The four verts span the
    /// x/y footprint, `zbounds` the height range.
    pub fn build_aabb(&mut self) {
        let mut min = DVec2::splat(f64::INFINITY);
        let mut max = DVec2::splat(f64::NEG_INFINITY);
        for v in &self.verts {
            min = min.min(*v);
            max = max.max(*v);
        }
        self.aabb = DAabb::new(
            DVec3::new(min.x, min.y, self.zbounds.0),
            DVec3::new(max.x, max.y, self.zbounds.1),
        );
    }

    pub fn contains(&self, p: DVec3) -> bool {
        self.aabb.contains(p)
    }

    pub fn user_is_admin(&self, user: UserId) -> bool {
        self.owner_id == user || self.admin_ids.contains(&user)
    }

    /// Whether `user` may create and mutate objects in this parcel.
    pub fn user_may_write(&self, user: UserId) -> bool {
        self.all_writeable || self.user_is_admin(user) || self.writer_ids.contains(&user)
    }

    // -----------------------------------------------------------------------
    // Serialisation
    // -----------------------------------------------------------------------

    fn write_user_list(w: &mut Writer, list: &[UserId]) {
        w.write_u32(list.len() as u32);
        for id in list {
            w.write_user_id(*id);
        }
    }

    fn read_user_list(r: &mut Reader) -> CodecResult<Vec<UserId>> {
        let len = r.read_u32()? as usize;
        if len > MAX_USER_LIST_LEN {
            return Err(CodecError::Corrupted(format!(
                "parcel user list of length {}",
                len
            )));
        }
        (0..len).map(|_| r.read_user_id()).collect()
    }

    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(PARCEL_SERIALISATION_VERSION);
        w.write_u64(self.id);
        w.write_user_id(self.owner_id);
        Self::write_user_list(w, &self.admin_ids);
        Self::write_user_list(w, &self.writer_ids);
        for v in &self.verts {
            w.write_f64(v.x);
            w.write_f64(v.y);
        }
        w.write_f64(self.zbounds.0);
        w.write_f64(self.zbounds.1);
        w.write_timestamp(self.created_time);
        w.write_u8(self.all_writeable as u8);
        w.write_u32(self.parcel_auction_ids.len() as u32);
        for id in &self.parcel_auction_ids {
            w.write_u64(*id);
        }
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<Parcel> {
        let header = r.begin_block(limits::MAX_AUX_RECORD_SIZE)?;
        let id = r.read_u64()?;
        let owner_id = r.read_user_id()?;
        let mut parcel = Parcel::new(id, owner_id);
        parcel.admin_ids = Self::read_user_list(r)?;
        parcel.writer_ids = Self::read_user_list(r)?;
        for v in &mut parcel.verts {
            v.x = r.read_f64()?;
            v.y = r.read_f64()?;
        }
        parcel.zbounds = (r.read_f64()?, r.read_f64()?);
        parcel.created_time = r.read_timestamp()?;
        parcel.all_writeable = r.read_u8()? != 0;
        let num_auctions = r.read_u32()? as usize;
        if num_auctions > MAX_USER_LIST_LEN {
            return Err(CodecError::Corrupted("auction list too long".to_string()));
        }
        parcel.parcel_auction_ids = (0..num_auctions)
            .map(|_| r.read_u64())
            .collect::<CodecResult<Vec<_>>>()?;
        r.finish_block(header);
        parcel.build_aabb();
        Ok(parcel)
    }
}
