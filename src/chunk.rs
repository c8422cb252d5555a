//! LOD chunks: the per-cell baked mesh and texture-array outputs.

use crate::codec::{CodecResult, Reader, Writer};
use crate::limits;
use crate::types::{ChunkCoord, RecordKey};

const LOD_CHUNK_SERIALISATION_VERSION: u32 = 1;

/// One 128×128 world cell's baked output: a combined low-detail mesh, a
/// packed texture array, and a compressed per-material-info blob.
#[derive(Debug, Clone, PartialEq)]
pub struct LodChunk {
    pub coords: ChunkCoord,

    /// Optimised (quantised) combined mesh, what clients fetch.
    pub mesh_url: String,
    /// Full-precision combined mesh kept for re-derivation.
    pub archival_mesh_url: String,
    pub combined_array_texture_url: String,
    pub compressed_mat_info: Vec<u8>,

    /// An object in the chunk changed; the baker will rebuild the outputs.
    pub needs_rebuild: bool,

    pub record_key: RecordKey,
}

impl LodChunk {
    pub fn new(coords: ChunkCoord) -> Self {
        Self {
            coords,
            mesh_url: String::new(),
            archival_mesh_url: String::new(),
            combined_array_texture_url: String::new(),
            compressed_mat_info: Vec::new(),
            needs_rebuild: true,
            record_key: RecordKey::INVALID,
        }
    }

    pub fn write_to(&self, w: &mut Writer) {
        let mark = w.begin_block(LOD_CHUNK_SERIALISATION_VERSION);
        w.write_i32(self.coords.x);
        w.write_i32(self.coords.y);
        w.write_i32(self.coords.z);
        w.write_string(&self.mesh_url);
        w.write_string(&self.archival_mesh_url);
        w.write_string(&self.combined_array_texture_url);
        w.write_buffer(&self.compressed_mat_info);
        w.write_u8(self.needs_rebuild as u8);
        w.end_block(mark);
    }

    pub fn read_from(r: &mut Reader) -> CodecResult<LodChunk> {
        let header = r.begin_block(limits::MAX_LOD_CHUNK_SIZE)?;
        let coords = ChunkCoord::new(r.read_i32()?, r.read_i32()?, r.read_i32()?);
        let mut chunk = LodChunk::new(coords);
        chunk.mesh_url = r.read_string(limits::MAX_URL_SIZE)?;
        chunk.archival_mesh_url = r.read_string(limits::MAX_URL_SIZE)?;
        chunk.combined_array_texture_url = r.read_string(limits::MAX_URL_SIZE)?;
        chunk.compressed_mat_info = r.read_buffer(limits::MAX_LOD_CHUNK_SIZE as usize)?;
        chunk.needs_rebuild = r.read_u8()? != 0;
        r.finish_block(header);
        Ok(chunk)
    }
}
