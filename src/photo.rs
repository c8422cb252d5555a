//! Photo intake: validates an uploaded JPEG, derives midsize and thumbnail
//! variants, stores all three files and appends a `Photo` record.

use crate::limits;
use crate::records::Photo;
use crate::server::Server;
use crate::session::{
    read_exact_bytes, read_string, read_u64, upload_response, write_string, write_u32,
    SessionResult,
};
use glam::DVec3;
use image::imageops::FilterType;
use image::GenericImageView;
use log::{info, warn};
use rand::RngCore;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

const THUMB_WIDTH: u32 = 230;
/// 4:3 aspect.
const THUMB_HEIGHT: u32 = THUMB_WIDTH * 3 / 4;

const MIDSIZE_LONG_EDGE: u32 = 1000;

const JPEG_QUALITY: u8 = 95;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PhotoError {
    #[error("image decoding failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image is too small ({w}x{h}); need at least 8x8")]
    TooSmall { w: u32, h: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// The derived files for one upload.  `midsize` is `None` when the source is
/// already small enough, in which case the full-size file doubles as the
/// midsize one.
pub struct PhotoVariants {
    pub midsize: Option<Vec<u8>>,
    pub thumbnail: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode and validate an uploaded JPEG and derive its variants.  Pure
/// function of the input bytes.
pub fn derive_photo_variants(data: &[u8]) -> Result<PhotoVariants, PhotoError> {
    let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?;
    let (w, h) = img.dimensions();
    if w < 8 || h < 8 {
        return Err(PhotoError::TooSmall { w, h });
    }

    // Midsize: long edge scaled to 1000 px, only if the source exceeds that.
    let midsize = if w.max(h) > MIDSIZE_LONG_EDGE {
        let resized = img.resize(MIDSIZE_LONG_EDGE, MIDSIZE_LONG_EDGE, FilterType::Triangle);
        Some(encode_jpeg(&resized)?)
    } else {
        None
    };

    // Thumbnail: centre-crop to 4:3 first, then resize.
    let src_aspect = w as f64 / h as f64;
    let thumb_aspect = THUMB_WIDTH as f64 / THUMB_HEIGHT as f64;
    let (crop_w, crop_h) = if src_aspect > thumb_aspect {
        (((h as f64) * thumb_aspect).round() as u32, h)
    } else {
        (w, ((w as f64) / thumb_aspect).round() as u32)
    };
    let crop_x = (w - crop_w) / 2;
    let crop_y = (h - crop_h) / 2;
    let thumb = img
        .crop_imm(crop_x, crop_y, crop_w, crop_h)
        .resize_exact(THUMB_WIDTH, THUMB_HEIGHT, FilterType::Triangle);
    let thumbnail = encode_jpeg(&thumb)?;

    Ok(PhotoVariants {
        midsize,
        thumbnail,
        width: w,
        height: h,
    })
}

fn encode_jpeg(img: &image::DynamicImage) -> Result<Vec<u8>, PhotoError> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode_image(&img.to_rgb8())?;
    Ok(out)
}

fn random_token_hex() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Upload connection
// ---------------------------------------------------------------------------

/// Handle one photo-upload connection (after the protocol handshake).
pub async fn run_photo_upload<S: AsyncRead + AsyncWrite + Unpin>(
    server: Arc<Server>,
    mut stream: S,
) -> SessionResult<()> {
    let username = read_string(&mut stream, limits::MAX_NAME_SIZE).await?;
    let password = read_string(&mut stream, limits::MAX_NAME_SIZE).await?;

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

    let world_name = read_string(&mut stream, limits::MAX_WORLD_NAME_SIZE).await?;
    let parcel_id = read_u64(&mut stream).await?;
    let cam_pos = read_dvec3(&mut stream).await?;
    let cam_angles = read_dvec3(&mut stream).await?;
    let caption = read_string(&mut stream, limits::MAX_CAPTION_SIZE).await?;
    let length = read_u64(&mut stream).await?;
    if length > limits::MAX_PHOTO_SIZE {
        write_u32(&mut stream, upload_response::FAILED).await?;
        write_string(&mut stream, "photo is too large").await?;
        return Ok(());
    }
    let data = read_exact_bytes(&mut stream, length as usize).await?;

    // Derive variants off the async runtime; a bad JPEG produces no litter.
    let variants = match tokio::task::spawn_blocking(move || derive_photo_variants(&data).map(|v| (v, data)))
        .await
    {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            warn!("photo upload from '{}' rejected: {}", username, e);
            write_u32(&mut stream, upload_response::FAILED).await?;
            write_string(&mut stream, &format!("bad photo: {}", e)).await?;
            return Ok(());
        }
        Err(e) => {
            warn!("photo derivation task failed: {}", e);
            write_u32(&mut stream, upload_response::FAILED).await?;
            write_string(&mut stream, "server error while processing photo").await?;
            return Ok(());
        }
    };
    let (variants, data) = variants;

    let token = random_token_hex();
    let filename = format!("photo_{}.jpg", token);
    let midsize_filename = match &variants.midsize {
        Some(_) => format!("photo_{}_midsize{}.jpg", token, MIDSIZE_LONG_EDGE),
        None => filename.clone(),
    };
    let thumbnail_filename = format!("photo_{}_thumb_{}x{}.jpg", token, THUMB_WIDTH, THUMB_HEIGHT);

    let photo_dir = server.config.photos_dir();
    tokio::fs::create_dir_all(&photo_dir).await?;
    if let Some(midsize) = &variants.midsize {
        tokio::fs::write(photo_dir.join(&midsize_filename), midsize).await?;
    }
    tokio::fs::write(photo_dir.join(&thumbnail_filename), &variants.thumbnail).await?;
    // Full-size bytes go last, only after both derivatives are on disk.
    tokio::fs::write(photo_dir.join(&filename), &data).await?;

    {
        let mut state = server.state.lock();
        let id = state.alloc_photo_id();
        let mut photo = Photo::new(id, user_id);
        photo.world_name = world_name;
        photo.parcel_id = parcel_id;
        photo.cam_pos = cam_pos;
        photo.cam_angles = cam_angles;
        photo.caption = caption;
        photo.local_filename = filename.clone();
        photo.local_midsize_filename = midsize_filename;
        photo.local_thumbnail_filename = thumbnail_filename;
        state.photos.insert(id, photo);
        state.db_dirty_photos.insert(id);
    }

    info!(
        "photo '{}' ({}x{}) uploaded by '{}'",
        filename, variants.width, variants.height, username
    );
    write_u32(&mut stream, upload_response::SUCCEEDED).await?;
    Ok(())
}

async fn read_dvec3<S: AsyncRead + Unpin>(stream: &mut S) -> SessionResult<DVec3> {
    let x = f64::from_bits(read_u64(stream).await?);
    let y = f64::from_bits(read_u64(stream).await?);
    let z = f64::from_bits(read_u64(stream).await?);
    Ok(DVec3::new(x, y, z))
}
