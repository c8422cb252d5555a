//! LOD / asset pipeline: derives lower-detail meshes and textures for every
//! object's referenced resources.
//!
//! On startup the worker does one full scan of all worlds; afterwards it
//! processes per-object check items posted by the dispatcher whenever a
//! model or material set changes.  The world lock is only held to snapshot
//! candidates and to commit results – never across mesh simplification or
//! texture resizing.

use crate::mesh::{self, Mesh};
use crate::object::{ObjectKind, WorldMaterial};
use crate::server::{LodCheckItem, Server};
use crate::types::{TimeStamp, Uid};
use image::imageops::FilterType;
use image::GenericImageView;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A very small mesh (a cuboid or so) gets no LOD ladder at all.
const NO_LOD_VERT_THRESHOLD: usize = 4 * 6;

// ---------------------------------------------------------------------------
// Derived-URL helpers
// ---------------------------------------------------------------------------

/// `base_123.bmesh`, 2 → `base_123_lod2.bmesh`.
pub fn lod_mesh_url(base_url: &str, lod_level: i32) -> String {
    let (stem, ext) = match base_url.rfind('.') {
        Some(i) => (&base_url[..i], &base_url[i..]),
        None => (base_url, ""),
    };
    format!("{}_lod{}{}", stem, lod_level, ext)
}

/// `tex_9.png`, 1, has_alpha=false → `tex_9_lod1.jpg`.  The extension
/// follows the save format, which follows the alpha flag.
pub fn lod_texture_url(base_url: &str, lod_level: i32, has_alpha: bool) -> String {
    let stem = match base_url.rfind('.') {
        Some(i) => &base_url[..i],
        None => base_url,
    };
    let ext = if has_alpha { "png" } else { "jpg" };
    format!("{}_lod{}.{}", stem, lod_level, ext)
}

/// Long-edge cap for a texture LOD level.  Level 0 only exists for very
/// high-res textures whose min level is −1.
pub fn texture_lod_max_dim(lod_level: i32) -> u32 {
    match lod_level {
        l if l <= 0 => 1024,
        1 => 256,
        _ => 64,
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Snapshot of the fields the pipeline needs, taken under the world lock.
struct ObjectSnapshot {
    kind: ObjectKind,
    model_url: String,
    materials: Vec<WorldMaterial>,
    compressed_voxels: Vec<u8>,
}

pub async fn run(
    server: Arc<Server>,
    mut queue: mpsc::UnboundedReceiver<LodCheckItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("LOD pipeline starting full scan");
    let mut error_times: HashMap<(String, Uid), TimeStamp> = HashMap::new();

    let initial: Vec<LodCheckItem> = {
        let state = server.state.lock();
        state
            .worlds
            .iter()
            .flat_map(|(name, world)| {
                world.objects.keys().map(move |uid| LodCheckItem {
                    world_name: name.clone(),
                    uid: *uid,
                })
            })
            .collect()
    };
    for item in initial {
        if *shutdown.borrow() {
            return;
        }
        if let Err(e) = process_object(&server, &item).await {
            warn!("LOD generation for {} in '{}' failed: {}", item.uid, item.world_name, e);
            error_times.insert((item.world_name.clone(), item.uid), TimeStamp::now());
        }
    }
    info!("LOD pipeline full scan done");

    loop {
        let item = tokio::select! {
            item = queue.recv() => match item {
                Some(item) => item,
                None => return,
            },
            _ = shutdown.changed() => return,
        };
        if let Err(e) = process_object(&server, &item).await {
            warn!("LOD generation for {} in '{}' failed: {}", item.uid, item.world_name, e);
            error_times.insert((item.world_name.clone(), item.uid), TimeStamp::now());
        }
    }
}

async fn process_object(server: &Arc<Server>, item: &LodCheckItem) -> anyhow::Result<()> {
    // Off-lock heavy work happens on the blocking pool.
    let server2 = server.clone();
    let item2 = item.clone();
    tokio::task::spawn_blocking(move || process_object_now(&server2, &item2)).await??;
    Ok(())
}

/// Run one object's LOD checks synchronously: AABB fixup, derived meshes,
/// derived textures.  Idempotent: derivations whose URL is already present
/// are skipped.
pub fn process_object_now(server: &Arc<Server>, item: &LodCheckItem) -> anyhow::Result<()> {
    let Some(snapshot) = snapshot_object(server, item) else {
        return Ok(()); // object went away, nothing to do
    };
    process_object_blocking(server, item, snapshot)
}

fn snapshot_object(server: &Arc<Server>, item: &LodCheckItem) -> Option<ObjectSnapshot> {
    let state = server.state.lock();
    let ob = state.world(&item.world_name)?.objects.get(&item.uid)?;
    if ob.dead {
        return None;
    }
    Some(ObjectSnapshot {
        kind: ob.kind,
        model_url: ob.model_url.clone(),
        materials: ob.materials.clone(),
        compressed_voxels: ob.compressed_voxels.clone(),
    })
}

fn process_object_blocking(
    server: &Arc<Server>,
    item: &LodCheckItem,
    snapshot: ObjectSnapshot,
) -> anyhow::Result<()> {
    // ---- Load the base mesh ----
    let base_mesh: Option<Mesh> = match snapshot.kind {
        ObjectKind::VoxelGroup => {
            let voxels = crate::object::decompress_voxels(&snapshot.compressed_voxels)?;
            if voxels.is_empty() {
                None
            } else {
                Some(mesh::voxel_group_to_mesh(&voxels))
            }
        }
        _ if !snapshot.model_url.is_empty() && server.resources.is_present(&snapshot.model_url) => {
            let bytes = server.resources.read_resource_file(&snapshot.model_url)?;
            Some(Mesh::decode(&bytes)?)
        }
        _ => None,
    };

    if let Some(base_mesh) = &base_mesh {
        // ---- AABB fixup ----
        let computed_aabb = base_mesh.aabb();
        let new_max_lod_level = if base_mesh.num_verts() <= NO_LOD_VERT_THRESHOLD {
            0
        } else {
            2
        };
        commit_object_checks(server, item, computed_aabb, new_max_lod_level);

        // ---- Derived LOD meshes ----
        if new_max_lod_level == 2 && !snapshot.model_url.is_empty() {
            for lod_level in 1..=2 {
                let url = lod_mesh_url(&snapshot.model_url, lod_level);
                if server.resources.is_present(&url) {
                    continue;
                }
                let simplified = mesh::simplify_for_lod_level(base_mesh, lod_level);
                server.resources.write_resource_file(&url, &simplified.encode())?;
                debug!(
                    "wrote LOD {} mesh '{}' ({} -> {} verts)",
                    lod_level,
                    url,
                    base_mesh.num_verts(),
                    simplified.num_verts()
                );
            }
        }
    }

    // ---- Derived LOD textures ----
    for mat in &snapshot.materials {
        for tex_url in [
            &mat.colour_texture_url,
            &mat.emission_texture_url,
            &mat.normal_map_url,
        ] {
            if tex_url.is_empty() {
                continue;
            }
            generate_texture_lods(server, tex_url, mat)?;
        }
    }
    Ok(())
}

fn commit_object_checks(
    server: &Arc<Server>,
    item: &LodCheckItem,
    computed_aabb: crate::types::Aabb,
    new_max_lod_level: i32,
) {
    let mut state = server.state.lock();
    let Some(world) = state.world_mut(&item.world_name) else {
        return;
    };
    let Some(ob) = world.objects.get_mut(&item.uid) else {
        return;
    };
    let aabb_stale = ob.aabb_os.is_empty()
        || (ob.aabb_os.min - computed_aabb.min).length() > 1e-4
        || (ob.aabb_os.max - computed_aabb.max).length() > 1e-4;
    let lod_level_stale = ob.max_model_lod_level != new_max_lod_level;
    if aabb_stale {
        ob.aabb_os = computed_aabb;
        ob.update_world_aabb();
    }
    if lod_level_stale {
        ob.max_model_lod_level = new_max_lod_level;
    }
    if aabb_stale || lod_level_stale {
        world.db_dirty_objects.insert(item.uid);
    }
}

/// Write every missing LOD level of one texture.  Level 0 is only generated
/// when the material's minimum level is −1 (very high-res source).
fn generate_texture_lods(
    server: &Arc<Server>,
    tex_url: &str,
    mat: &WorldMaterial,
) -> anyhow::Result<()> {
    if !server.resources.is_present(tex_url) {
        return Ok(()); // still transferring; a later check re-runs us
    }
    if server.resources.is_in_download_failed_urls(tex_url) {
        return Ok(());
    }

    let has_alpha = mat.colour_tex_has_alpha() && *tex_url == mat.colour_texture_url;
    let start_level = mat.min_lod_level() + 1;

    let missing: Vec<i32> = (start_level..=2)
        .filter(|l| !server.resources.is_present(&lod_texture_url(tex_url, *l, has_alpha)))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let bytes = server.resources.read_resource_file(tex_url)?;
    let img = image::load_from_memory(&bytes)?;

    for lod_level in missing {
        let url = lod_texture_url(tex_url, lod_level, has_alpha);
        let max_dim = texture_lod_max_dim(lod_level);
        let resized = if img.width().max(img.height()) > max_dim {
            img.resize(max_dim, max_dim, FilterType::Triangle)
        } else {
            img.clone()
        };

        let mut out = Vec::new();
        if has_alpha {
            resized.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
        } else {
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90);
            encoder.encode_image(&resized.to_rgb8())?;
        }
        server.resources.write_resource_file(&url, &out)?;
        debug!(
            "wrote LOD {} texture '{}' ({}x{})",
            lod_level,
            url,
            resized.width(),
            resized.height()
        );
    }
    Ok(())
}
