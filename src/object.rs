//! World objects and their materials.

use crate::codec::{CodecError, CodecResult, Reader, Writer};
use crate::limits;
use crate::types::{Aabb, ChunkCoord, DAabb, RecordKey, TimeStamp, Uid, UserId};
use glam::{DVec3, Mat2, Mat4, Quat, Vec3};

// ---------------------------------------------------------------------------
// Materials
// ---------------------------------------------------------------------------

/// A scalar material parameter that may instead be driven by a texture.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScalarVal {
    pub val: f32,
    pub texture_url: String,
}

impl ScalarVal {
    pub fn constant(val: f32) -> Self {
        Self {
            val,
            texture_url: String::new(),
        }
    }
}

pub const COLOUR_TEX_HAS_ALPHA_FLAG: u32 = 1;
pub const MIN_LOD_LEVEL_IS_NEGATIVE_1_FLAG: u32 = 2;
pub const HOLOGRAM_FLAG: u32 = 4;
pub const USE_VERT_COLOURS_FOR_WIND_FLAG: u32 = 8;
pub const DOUBLE_SIDED_FLAG: u32 = 16;
pub const DECAL_FLAG: u32 = 32;

const MATERIAL_SERIALISATION_VERSION: u32 = 1;

/// One material slot on a world object.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldMaterial {
    /// sRGB base colour.
    pub colour_rgb: Vec3,
    pub colour_texture_url: String,

    pub emission_rgb: Vec3,
    pub emission_texture_url: String,

    pub normal_map_url: String,

    pub roughness: ScalarVal,
    pub metallic_fraction: ScalarVal,
    pub opacity: ScalarVal,

    pub tex_matrix: Mat2,
    /// Luminous flux of the emitter, in lumens.
    pub emission_lum_flux_or_lum: f32,

    pub flags: u32,
}

impl Default for WorldMaterial {
    fn default() -> Self {
        Self {
            colour_rgb: Vec3::new(0.85, 0.85, 0.85),
            colour_texture_url: String::new(),
            emission_rgb: Vec3::ZERO,
            emission_texture_url: String::new(),
            normal_map_url: String::new(),
            roughness: ScalarVal::constant(0.5),
            metallic_fraction: ScalarVal::constant(0.0),
            opacity: ScalarVal::constant(1.0),
            tex_matrix: Mat2::IDENTITY,
            emission_lum_flux_or_lum: 0.0,
            flags: 0,
        }
    }
}

impl WorldMaterial {
    /// Lowest texture LOD level for this material: −1 for very high-res
    /// textures (the ladder becomes {−1, 0, 1, 2}), else 0.
    pub fn min_lod_level(&self) -> i32 {
        if self.flags & MIN_LOD_LEVEL_IS_NEGATIVE_1_FLAG != 0 {
            -1
        } else {
            0
        }
    }

    pub fn colour_tex_has_alpha(&self) -> bool {
        self.flags & COLOUR_TEX_HAS_ALPHA_FLAG != 0
    }

    /// A transparent material lets the chunk baker route its triangles into
    /// the transparent index batch.
    pub fn is_transparent(&self) -> bool {
        self.opacity.val < 1.0
    }

    fn write_scalar_val(w: &mut Writer, v: &ScalarVal) {
        w.write_f32(v.val);
        w.write_string(&v.texture_url);
    }

    fn read_scalar_val(r: &mut Reader) -> CodecResult<ScalarVal> {
        Ok(ScalarVal {
            val: r.read_f32()?,
            texture_url: r.read_string(limits::MAX_URL_SIZE)?,
        })
    }

    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(MATERIAL_SERIALISATION_VERSION);
        w.write_vec3(self.colour_rgb);
        w.write_string(&self.colour_texture_url);
        w.write_vec3(self.emission_rgb);
        w.write_string(&self.emission_texture_url);
        w.write_string(&self.normal_map_url);
        Self::write_scalar_val(w, &self.roughness);
        Self::write_scalar_val(w, &self.metallic_fraction);
        Self::write_scalar_val(w, &self.opacity);
        let m = self.tex_matrix.to_cols_array();
        for v in m {
            w.write_f32(v);
        }
        w.write_f32(self.emission_lum_flux_or_lum);
        w.write_u32(self.flags);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<WorldMaterial> {
        let header = r.begin_block(limits::MAX_MATERIAL_SIZE)?;
        let mut mat = WorldMaterial {
            colour_rgb: r.read_vec3()?,
            colour_texture_url: r.read_string(limits::MAX_URL_SIZE)?,
            emission_rgb: r.read_vec3()?,
            emission_texture_url: r.read_string(limits::MAX_URL_SIZE)?,
            normal_map_url: r.read_string(limits::MAX_URL_SIZE)?,
            roughness: Self::read_scalar_val(r)?,
            metallic_fraction: Self::read_scalar_val(r)?,
            opacity: Self::read_scalar_val(r)?,
            ..Default::default()
        };
        let mut m = [0.0f32; 4];
        for v in &mut m {
            *v = r.read_f32()?;
        }
        mat.tex_matrix = Mat2::from_cols_array(&m);
        mat.emission_lum_flux_or_lum = r.read_f32()?;
        mat.flags = r.read_u32()?;
        r.finish_block(header);
        Ok(mat)
    }
}

// ---------------------------------------------------------------------------
// Object flags
// ---------------------------------------------------------------------------

pub const COLLIDABLE_FLAG: u32 = 1;
pub const DYNAMIC_FLAG: u32 = 2;
pub const SUMMONED_FLAG: u32 = 4;
/// Set by the chunk baker's exclusion sweep; excluded objects do not
/// contribute to the chunk's combined mesh.
pub const EXCLUDED_FROM_LOD_CHUNK_MESH_FLAG: u32 = 8;
pub const LIGHTMAP_NEEDS_COMPUTING_FLAG: u32 = 16;
pub const AUDIO_AUTOPLAY_FLAG: u32 = 32;
pub const AUDIO_LOOP_FLAG: u32 = 64;

// ---------------------------------------------------------------------------
// Object variant kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Plain mesh referenced by `model_url`.
    Generic,
    /// Flat text panel; the text lives in `content`.
    Hypercard,
    /// Voxel group; geometry lives in `compressed_voxels`.
    VoxelGroup,
    Spotlight,
    WebView,
    Video,
}

impl ObjectKind {
    pub fn to_u32(self) -> u32 {
        match self {
            ObjectKind::Generic => 0,
            ObjectKind::Hypercard => 1,
            ObjectKind::VoxelGroup => 2,
            ObjectKind::Spotlight => 3,
            ObjectKind::WebView => 4,
            ObjectKind::Video => 5,
        }
    }

    pub fn from_u32(v: u32) -> CodecResult<Self> {
        Ok(match v {
            0 => ObjectKind::Generic,
            1 => ObjectKind::Hypercard,
            2 => ObjectKind::VoxelGroup,
            3 => ObjectKind::Spotlight,
            4 => ObjectKind::WebView,
            5 => ObjectKind::Video,
            _ => return Err(CodecError::Corrupted(format!("unknown object kind {}", v))),
        })
    }
}

// ---------------------------------------------------------------------------
// WorldObject
// ---------------------------------------------------------------------------

/// Index ranges this object contributed to its chunk's combined mesh:
/// `[batch0_start, batch0_end)` opaque, `[batch1_start, batch1_end)`
/// transparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchRanges {
    pub batch0_start: u32,
    pub batch0_end: u32,
    pub batch1_start: u32,
    pub batch1_end: u32,
}

const OBJECT_SERIALISATION_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct WorldObject {
    pub uid: Uid,
    pub kind: ObjectKind,

    pub creator_id: UserId,
    /// Denormalised from the user table after load; not persisted.
    pub creator_name: String,
    pub created_time: TimeStamp,
    pub last_modified_time: TimeStamp,

    pub pos: DVec3,
    pub axis: Vec3,
    pub angle: f32,
    pub scale: Vec3,

    pub model_url: String,
    pub materials: Vec<WorldMaterial>,
    pub script: String,
    pub content: String,
    pub audio_url: String,
    pub audio_volume: f32,
    /// Voxel-group geometry, zstd compressed.  Empty for other kinds.
    pub compressed_voxels: Vec<u8>,

    pub aabb_os: Aabb,
    /// World-space bounds; recomputed whenever the transform changes.
    pub aabb_ws: DAabb,

    pub flags: u32,
    pub max_model_lod_level: i32,
    pub batch_ranges: BatchRanges,

    pub record_key: RecordKey,
    /// Dead objects are reaped by the next maintenance sweep after their
    /// destruction has been broadcast.
    pub dead: bool,
}

impl WorldObject {
    pub fn new(uid: Uid, kind: ObjectKind, creator_id: UserId) -> Self {
        let now = TimeStamp::now();
        Self {
            uid,
            kind,
            creator_id,
            creator_name: String::new(),
            created_time: now,
            last_modified_time: now,
            pos: DVec3::ZERO,
            axis: Vec3::Z,
            angle: 0.0,
            scale: Vec3::ONE,
            model_url: String::new(),
            materials: Vec::new(),
            script: String::new(),
            content: String::new(),
            audio_url: String::new(),
            audio_volume: 1.0,
            compressed_voxels: Vec::new(),
            aabb_os: Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5)),
            aabb_ws: DAabb::EMPTY,
            flags: 0,
            max_model_lod_level: 2,
            batch_ranges: BatchRanges::default(),
            record_key: RecordKey::INVALID,
            dead: false,
        }
    }

    // -----------------------------------------------------------------------
    // Transform
    // -----------------------------------------------------------------------

    /// Rotation and scale part of the object-to-world transform.  The f64
    /// translation is applied separately to keep precision at large
    /// coordinates.
    pub fn rot_scale_matrix(&self) -> Mat4 {
        let axis = if self.axis.length_squared() > 1e-12 {
            self.axis.normalize()
        } else {
            Vec3::Z
        };
        Mat4::from_quat(Quat::from_axis_angle(axis, self.angle))
            * Mat4::from_scale(self.scale)
    }

    /// Full single-precision object-to-world matrix (used by the chunk
    /// baker, whose output is chunk-relative anyway).
    pub fn obj_to_world_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.pos.as_vec3()) * self.rot_scale_matrix()
    }

    /// Recompute the denormalised world-space AABB from the object-space one.
    pub fn update_world_aabb(&mut self) {
        if self.aabb_os.is_empty() {
            self.aabb_ws = DAabb::new(self.pos, self.pos);
            return;
        }
        let rotated = self.aabb_os.transformed(&self.rot_scale_matrix());
        self.aabb_ws = DAabb::new(
            self.pos + rotated.min.as_dvec3(),
            self.pos + rotated.max.as_dvec3(),
        );
    }

    /// Chunk containing the object's centroid.
    pub fn home_chunk(&self) -> ChunkCoord {
        ChunkCoord::for_position(self.centroid())
    }

    pub fn centroid(&self) -> DVec3 {
        if self.aabb_ws.min.x > self.aabb_ws.max.x {
            self.pos
        } else {
            (self.aabb_ws.min + self.aabb_ws.max) * 0.5
        }
    }

    /// By how many units the world AABB extends outside the home chunk's x/y
    /// footprint.
    pub fn overhang_from_home_chunk(&self) -> f64 {
        let (min_x, min_y, max_x, max_y) = self.home_chunk().footprint();
        let mut overhang: f64 = 0.0;
        overhang = overhang.max(min_x - self.aabb_ws.min.x);
        overhang = overhang.max(min_y - self.aabb_ws.min.y);
        overhang = overhang.max(self.aabb_ws.max.x - max_x);
        overhang = overhang.max(self.aabb_ws.max.y - max_y);
        overhang
    }

    pub fn touch(&mut self) {
        self.last_modified_time = TimeStamp::now();
    }

    // -----------------------------------------------------------------------
    // Voxels
    // -----------------------------------------------------------------------

    /// Decode this object's voxel blob.  Empty blob decodes to no voxels.
    pub fn decompressed_voxels(&self) -> CodecResult<Vec<(glam::IVec3, u32)>> {
        if self.compressed_voxels.is_empty() {
            return Ok(Vec::new());
        }
        decompress_voxels(&self.compressed_voxels)
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Every resource URL this object references.
    pub fn dependency_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        let mut push = |u: &str| {
            if !u.is_empty() {
                urls.push(u.to_string());
            }
        };
        push(&self.model_url);
        push(&self.audio_url);
        for mat in &self.materials {
            push(&mat.colour_texture_url);
            push(&mat.emission_texture_url);
            push(&mat.normal_map_url);
            push(&mat.roughness.texture_url);
            push(&mat.metallic_fraction.texture_url);
            push(&mat.opacity.texture_url);
        }
        urls
    }

    // -----------------------------------------------------------------------
    // Serialisation
    // -----------------------------------------------------------------------

    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(OBJECT_SERIALISATION_VERSION);
        w.write_uid(self.uid);
        w.write_u32(self.kind.to_u32());
        w.write_user_id(self.creator_id);
        w.write_timestamp(self.created_time);
        w.write_timestamp(self.last_modified_time);
        w.write_dvec3(self.pos);
        w.write_vec3(self.axis);
        w.write_f32(self.angle);
        w.write_vec3(self.scale);
        w.write_string(&self.model_url);
        w.write_u32(self.materials.len() as u32);
        for mat in &self.materials {
            mat.write_to(w);
        }
        w.write_string(&self.script);
        w.write_string(&self.content);
        w.write_string(&self.audio_url);
        w.write_f32(self.audio_volume);
        w.write_buffer(&self.compressed_voxels);
        w.write_vec3(self.aabb_os.min);
        w.write_vec3(self.aabb_os.max);
        w.write_u32(self.flags);
        w.write_i32(self.max_model_lod_level);
        w.write_u32(self.batch_ranges.batch0_start);
        w.write_u32(self.batch_ranges.batch0_end);
        w.write_u32(self.batch_ranges.batch1_start);
        w.write_u32(self.batch_ranges.batch1_end);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<WorldObject> {
        let header = r.begin_block(limits::MAX_OBJECT_SIZE)?;

        let uid = r.read_uid()?;
        let kind = ObjectKind::from_u32(r.read_u32()?)?;
        let mut ob = WorldObject::new(uid, kind, UserId::INVALID);
        ob.creator_id = r.read_user_id()?;
        ob.created_time = r.read_timestamp()?;
        ob.last_modified_time = r.read_timestamp()?;
        ob.pos = r.read_dvec3()?;
        ob.axis = r.read_vec3()?;
        ob.angle = r.read_f32()?;
        ob.scale = r.read_vec3()?;
        ob.model_url = r.read_string(limits::MAX_URL_SIZE)?;

        let num_mats = r.read_u32()? as usize;
        if num_mats > limits::MAX_NUM_MATERIALS {
            return Err(CodecError::Corrupted(format!(
                "object has {} materials, max {}",
                num_mats,
                limits::MAX_NUM_MATERIALS
            )));
        }
        ob.materials = (0..num_mats)
            .map(|_| WorldMaterial::read_from(r))
            .collect::<CodecResult<Vec<_>>>()?;

        ob.script = r.read_string(limits::MAX_SCRIPT_SIZE)?;
        ob.content = r.read_string(limits::MAX_CONTENT_SIZE)?;
        ob.audio_url = r.read_string(limits::MAX_URL_SIZE)?;
        ob.audio_volume = r.read_f32()?;
        ob.compressed_voxels = r.read_buffer(limits::MAX_VOXEL_DATA_SIZE)?;
        ob.aabb_os = Aabb::new(r.read_vec3()?, r.read_vec3()?);
        ob.flags = r.read_u32()?;
        if header.version >= 2 {
            ob.max_model_lod_level = r.read_i32()?;
            ob.batch_ranges.batch0_start = r.read_u32()?;
            ob.batch_ranges.batch0_end = r.read_u32()?;
            ob.batch_ranges.batch1_start = r.read_u32()?;
            ob.batch_ranges.batch1_end = r.read_u32()?;
        }

        r.finish_block(header);
        ob.update_world_aabb();
        Ok(ob)
    }
}

// ---------------------------------------------------------------------------
// Voxel blobs
// ---------------------------------------------------------------------------

/// Voxel groups are stored as a zstd-compressed stream of
/// `(x:i32, y:i32, z:i32, mat:u32)` little-endian tuples.
pub fn compress_voxels(voxels: &[(glam::IVec3, u32)]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u32(voxels.len() as u32);
    for (pos, mat) in voxels {
        w.write_i32(pos.x);
        w.write_i32(pos.y);
        w.write_i32(pos.z);
        w.write_u32(*mat);
    }
    zstd::encode_all(w.into_bytes().as_slice(), 3).unwrap_or_default()
}

pub fn decompress_voxels(blob: &[u8]) -> CodecResult<Vec<(glam::IVec3, u32)>> {
    let bytes = zstd::decode_all(blob)
        .map_err(|e| CodecError::Corrupted(format!("voxel blob decompression failed: {}", e)))?;
    let mut r = Reader::new(&bytes);
    let count = r.read_u32()? as usize;
    if count > limits::MAX_VOXEL_DATA_SIZE / 16 {
        return Err(CodecError::Corrupted(format!("{} voxels", count)));
    }
    let mut voxels = Vec::with_capacity(count);
    for _ in 0..count {
        let pos = glam::IVec3::new(r.read_i32()?, r.read_i32()?, r.read_i32()?);
        voxels.push((pos, r.read_u32()?));
    }
    Ok(voxels)
}
