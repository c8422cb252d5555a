//! Binary codec primitives: little-endian reads and writes, length-prefixed
//! strings, and versioned record blocks with forward-compatible skip-ahead.
//!
//! ## Versioned blocks
//!
//! Every structured record is serialised as `version:u32, size:u32, payload…`
//! where `size` is the total byte length *including* the 8-byte header.
//! Writers reserve the size slot and patch it after the payload is written;
//! readers note the block start, decode the fields their version knows, then
//! jump the cursor to `start + size`.  Trailing bytes written by a newer
//! server are silently discarded, which is what makes old readers forward
//! compatible.

use crate::types::{TimeStamp, Uid, UserId};
use glam::{DVec3, Vec2, Vec3};

/// Smallest legal versioned block: just the version + size header.
pub const BLOCK_HEADER_SIZE: u32 = 8;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Structurally invalid data: bad sizes, over-long strings, bad tags.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Ran off the end of the buffer.
    #[error("unexpected end of buffer (wanted {wanted} more bytes)")]
    Eof { wanted: usize },
}

pub type CodecResult<T> = Result<T, CodecError>;

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over a byte slice.  All reads are little-endian.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::Eof {
                wanted: n - self.remaining(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> CodecResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> CodecResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> CodecResult<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_f32(&mut self) -> CodecResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> CodecResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_vec2(&mut self) -> CodecResult<Vec2> {
        Ok(Vec2::new(self.read_f32()?, self.read_f32()?))
    }

    pub fn read_vec3(&mut self) -> CodecResult<Vec3> {
        Ok(Vec3::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }

    pub fn read_dvec3(&mut self) -> CodecResult<DVec3> {
        Ok(DVec3::new(
            self.read_f64()?,
            self.read_f64()?,
            self.read_f64()?,
        ))
    }

    pub fn read_uid(&mut self) -> CodecResult<Uid> {
        Ok(Uid(self.read_u64()?))
    }

    pub fn read_user_id(&mut self) -> CodecResult<UserId> {
        Ok(UserId(self.read_u64()?))
    }

    pub fn read_timestamp(&mut self) -> CodecResult<TimeStamp> {
        Ok(TimeStamp(self.read_u64()?))
    }

    /// 32-bit length then raw bytes.  `max_len` is the per-field documented
    /// maximum; anything longer is treated as corruption, not truncated.
    pub fn read_string(&mut self, max_len: usize) -> CodecResult<String> {
        let len = self.read_u32()? as usize;
        if len > max_len {
            return Err(CodecError::Corrupted(format!(
                "string length {} exceeds maximum {}",
                len, max_len
            )));
        }
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::Corrupted("string is not valid UTF-8".to_string()))
    }

    /// 32-bit length then raw bytes, returned verbatim.
    pub fn read_buffer(&mut self, max_len: usize) -> CodecResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > max_len {
            return Err(CodecError::Corrupted(format!(
                "buffer length {} exceeds maximum {}",
                len, max_len
            )));
        }
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// Read a `version, size` block header and validate `size` against the
    /// per-type cap.  Call [`Reader::finish_block`] after decoding the fields
    /// this version knows about.
    pub fn begin_block(&mut self, max_size: u32) -> CodecResult<BlockHeader> {
        let start = self.pos;
        let version = self.read_u32()?;
        let size = self.read_u32()?;
        if size < BLOCK_HEADER_SIZE {
            return Err(CodecError::Corrupted(format!(
                "block size {} is smaller than its header",
                size
            )));
        }
        if size > max_size {
            return Err(CodecError::Corrupted(format!(
                "block size {} exceeds maximum {}",
                size, max_size
            )));
        }
        if start + size as usize > self.buf.len() {
            return Err(CodecError::Eof {
                wanted: start + size as usize - self.buf.len(),
            });
        }
        Ok(BlockHeader { version, size, start })
    }

    /// Jump to the end of a block, discarding any trailing bytes written by a
    /// newer serialiser.
    pub fn finish_block(&mut self, header: BlockHeader) {
        self.pos = header.start + header.size as usize;
    }
}

/// Header of a versioned block, as returned by [`Reader::begin_block`].
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub version: u32,
    pub size: u32,
    start: usize,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only byte-buffer writer.  All writes are little-endian.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_u32(v.to_bits());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    pub fn write_vec2(&mut self, v: Vec2) {
        self.write_f32(v.x);
        self.write_f32(v.y);
    }

    pub fn write_vec3(&mut self, v: Vec3) {
        self.write_f32(v.x);
        self.write_f32(v.y);
        self.write_f32(v.z);
    }

    pub fn write_dvec3(&mut self, v: DVec3) {
        self.write_f64(v.x);
        self.write_f64(v.y);
        self.write_f64(v.z);
    }

    pub fn write_uid(&mut self, uid: Uid) {
        self.write_u64(uid.0);
    }

    pub fn write_user_id(&mut self, id: UserId) {
        self.write_u64(id.0);
    }

    pub fn write_timestamp(&mut self, t: TimeStamp) {
        self.write_u64(t.0);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    pub fn write_buffer(&mut self, b: &[u8]) {
        self.write_u32(b.len() as u32);
        self.write_bytes(b);
    }

    /// Write a block header with a placeholder size slot.  Pair with
    /// [`Writer::end_block`] once the payload is written.
    pub fn begin_block(&mut self, version: u32) -> BlockMark {
        let start = self.buf.len();
        self.write_u32(version);
        self.write_u32(0); // size, patched by end_block
        BlockMark { start }
    }

    /// Patch a block's size slot with the total length including header.
    pub fn end_block(&mut self, mark: BlockMark) {
        let size = (self.buf.len() - mark.start) as u32;
        self.buf[mark.start + 4..mark.start + 8].copy_from_slice(&size.to_le_bytes());
    }
}

/// Marks an open versioned block in a [`Writer`].
#[derive(Debug, Clone, Copy)]
#[must_use = "an open block must be closed with end_block"]
pub struct BlockMark {
    start: usize,
}
