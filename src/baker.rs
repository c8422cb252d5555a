//! Chunk baker: combines every object in a 128×128 cell into one simplified
//! mesh and a packed texture array.
//!
//! Runs a sweep roughly every 30 s:
//!
//! 1. **Exclusion pass** – recompute the excluded-from-chunk-mesh flag per
//!    object (scripted, `biome: park` content, or sticking more than 6 units
//!    out of its home chunk).  Flag changes mark the owning chunk for
//!    rebuild.
//! 2. **Build pass** – for every chunk marked `needs_rebuild`, bake the
//!    combined mesh, the texture array, and the per-material-info blob, all
//!    off the world lock, then commit the URLs and clear the flag.
//!
//! Outputs are deterministic: same objects + same epoch ⇒ byte-identical
//! files and identical per-object batch ranges.

use crate::chunk::LodChunk;
use crate::codec::Writer;
use crate::mesh::{self, Mesh};
use crate::object::{self, BatchRanges, WorldMaterial, WorldObject};
use crate::protocol;
use crate::resources::{self, ResourceManager};
use crate::server::Server;
use crate::types::{ChunkCoord, Uid};
use glam::Mat4;
use image::imageops::FilterType;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Bumped whenever the bake algorithm changes, so clients refetch.
pub const CHUNK_BAKE_EPOCH: u32 = 1;

const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Objects overhanging their home chunk by more than this are excluded from
/// the chunk's combined mesh (they would straddle cells).
const MAX_CHUNK_OVERHANG: f64 = 6.0;

/// Edge length of one layer of the packed texture array.
const ARRAY_TEX_DIM: u32 = 64;

const MAT_INFO_SERIALISATION_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

pub async fn run(server: Arc<Server>, mut shutdown: watch::Receiver<bool>) {
    info!("chunk baker starting");
    loop {
        run_sweep(&server).await;
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_PERIOD) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_sweep(server: &Arc<Server>) {
    let rebuilds = {
        let mut state = server.state.lock();
        let mut rebuilds: Vec<(String, ChunkCoord)> = Vec::new();
        for (world_name, world) in state.worlds.iter_mut() {
            // Exclusion pass.
            let mut flips: Vec<(Uid, bool, ChunkCoord)> = Vec::new();
            for ob in world.objects.values() {
                if ob.dead {
                    continue;
                }
                let excluded = !ob.script.is_empty()
                    || ob.content.starts_with("biome: park")
                    || ob.overhang_from_home_chunk() > MAX_CHUNK_OVERHANG;
                let currently =
                    ob.flags & object::EXCLUDED_FROM_LOD_CHUNK_MESH_FLAG != 0;
                if excluded != currently {
                    flips.push((ob.uid, excluded, ob.home_chunk()));
                }
            }
            for (uid, excluded, coords) in flips {
                if let Some(ob) = world.objects.get_mut(&uid) {
                    if excluded {
                        ob.flags |= object::EXCLUDED_FROM_LOD_CHUNK_MESH_FLAG;
                    } else {
                        ob.flags &= !object::EXCLUDED_FROM_LOD_CHUNK_MESH_FLAG;
                    }
                }
                world.db_dirty_objects.insert(uid);
                world.chunk_entry(coords).needs_rebuild = true;
                world.db_dirty_chunks.insert(coords);
            }

            for (coords, chunk) in world.chunks.iter() {
                if chunk.needs_rebuild {
                    rebuilds.push((world_name.clone(), *coords));
                }
            }
        }
        rebuilds
    };

    for (world_name, coords) in rebuilds {
        let server2 = server.clone();
        let world_name2 = world_name.clone();
        let result = tokio::task::spawn_blocking(move || {
            bake_chunk(&server2, &world_name2, coords)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("baking chunk {} in '{}' failed: {}", coords, world_name, e),
            Err(e) => warn!("chunk bake task panicked: {}", e),
        }
    }
}

// ---------------------------------------------------------------------------
// Bake inputs
// ---------------------------------------------------------------------------

struct BakeObject {
    uid: Uid,
    mesh_source: MeshSource,
    to_world: Mat4,
    materials: Vec<WorldMaterial>,
}

enum MeshSource {
    Url(String),
    Voxels(Vec<u8>),
}

fn snapshot_chunk_objects(
    server: &Arc<Server>,
    world_name: &str,
    coords: ChunkCoord,
) -> Vec<BakeObject> {
    let state = server.state.lock();
    let Some(world) = state.world(world_name) else {
        return Vec::new();
    };
    let mut obs: Vec<&WorldObject> = world
        .objects
        .values()
        .filter(|ob| {
            !ob.dead
                && ob.flags & object::EXCLUDED_FROM_LOD_CHUNK_MESH_FLAG == 0
                && ob.home_chunk() == coords
        })
        .collect();
    // Deterministic bake order.
    obs.sort_by_key(|ob| ob.uid);

    obs.into_iter()
        .map(|ob| BakeObject {
            uid: ob.uid,
            mesh_source: if ob.kind == object::ObjectKind::VoxelGroup {
                MeshSource::Voxels(ob.compressed_voxels.clone())
            } else {
                MeshSource::Url(ob.model_url.clone())
            },
            to_world: ob.obj_to_world_matrix(),
            materials: ob.materials.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Bake
// ---------------------------------------------------------------------------

/// Per-material info carried alongside the combined mesh, one entry per
/// referenced material, in reference order.
struct MatInfo {
    mat: WorldMaterial,
    array_tex_index: i32,
}

/// Bake one chunk's combined mesh, texture array and mat-info blob, commit
/// the URLs and clear `needs_rebuild`.  Deterministic for a given object set
/// and [`CHUNK_BAKE_EPOCH`].
pub fn bake_chunk(server: &Arc<Server>, world_name: &str, coords: ChunkCoord) -> anyhow::Result<()> {
    let objects = snapshot_chunk_objects(server, world_name, coords);

    // ---- Packed texture array ----
    // Unique colour textures in deterministic first-use order.
    let mut tex_urls: Vec<String> = Vec::new();
    for ob in &objects {
        for mat in &ob.materials {
            let url = &mat.colour_texture_url;
            if !url.is_empty() && !tex_urls.contains(url) && server.resources.is_present(url) {
                tex_urls.push(url.clone());
            }
        }
    }
    let (array_tex_url, tex_index_for_url) =
        build_texture_array(&server.resources, &tex_urls)?;

    // ---- Combined mesh ----
    let mut combined = Mesh::default();
    let mut opaque_indices: Vec<u32> = Vec::new();
    let mut trans_indices: Vec<u32> = Vec::new();
    let mut mat_infos: Vec<MatInfo> = Vec::new();
    let mut batch_ranges: HashMap<Uid, BatchRanges> = HashMap::new();

    for ob in &objects {
        let src_mesh = match load_bake_mesh(server, &ob.mesh_source) {
            Some(m) => m,
            None => continue, // model not present yet; a later sweep catches it
        };
        // Chunk meshes are coarse: bake from an aggressively simplified mesh.
        let src_mesh = mesh::simplify_for_lod_level(&src_mesh, 2);

        // This object's materials join the combined material table.
        let mat_info_offset = mat_infos.len() as u32;
        let num_mats = ob.materials.len().max(1);
        for slot in 0..num_mats {
            let mat = ob.materials.get(slot).cloned().unwrap_or_default();
            let array_tex_index = tex_index_for_url
                .get(&mat.colour_texture_url)
                .copied()
                .unwrap_or(-1);
            mat_infos.push(MatInfo {
                mat,
                array_tex_index,
            });
        }

        let vert_offset = combined.positions.len() as u32;
        let normal_matrix = ob.to_world.inverse().transpose();
        for i in 0..src_mesh.positions.len() {
            combined
                .positions
                .push(ob.to_world.transform_point3(src_mesh.positions[i]));
            let n = normal_matrix
                .transform_vector3(src_mesh.normals.get(i).copied().unwrap_or(glam::Vec3::Z));
            combined.normals.push(if n.length_squared() > 1e-12 {
                n.normalize()
            } else {
                glam::Vec3::Z
            });
            combined
                .uvs
                .push(src_mesh.uvs.get(i).copied().unwrap_or(glam::Vec2::ZERO));
            let local_mat = src_mesh.mat_indices.get(i).copied().unwrap_or(0);
            combined
                .mat_indices
                .push(mat_info_offset + local_mat.min(num_mats as u32 - 1));
        }

        let mut ranges = BatchRanges {
            batch0_start: opaque_indices.len() as u32,
            batch1_start: trans_indices.len() as u32,
            ..Default::default()
        };
        for tri in 0..src_mesh.num_tris() {
            let local_mat = src_mesh.tri_mat_index(tri).min(num_mats as u32 - 1);
            let mat = &mat_infos[(mat_info_offset + local_mat) as usize].mat;
            // Fully transparent triangles are invisible; drop them here so
            // the ranges never reference them.
            if mat.opacity.val <= 0.0 {
                continue;
            }
            let dest = if mat.is_transparent() {
                &mut trans_indices
            } else {
                &mut opaque_indices
            };
            for k in 0..3 {
                dest.push(vert_offset + src_mesh.indices[tri * 3 + k]);
            }
        }
        ranges.batch0_end = opaque_indices.len() as u32;
        ranges.batch1_end = trans_indices.len() as u32;
        batch_ranges.insert(ob.uid, ranges);
    }

    // Trim material entries nothing references any more.
    trim_unused_materials(&mut combined, &mut mat_infos);

    // Final index list: opaque then transparent.  Transparent ranges shift
    // by the opaque total.
    let opaque_len = opaque_indices.len() as u32;
    combined.indices = opaque_indices;
    combined.indices.extend_from_slice(&trans_indices);
    for ranges in batch_ranges.values_mut() {
        ranges.batch1_start += opaque_len;
        ranges.batch1_end += opaque_len;
    }

    // ---- Encode outputs ----
    let mut archival = Writer::new();
    combined.write_packed(&mut archival);
    let archival_bytes = archival.into_bytes();

    let mut optimised = Writer::new();
    combined.write_optimised(&mut optimised);
    let optimised_bytes = optimised.into_bytes();

    let mat_info_blob = encode_mat_info_blob(&mat_infos)?;

    let base_name = format!("chunk_{}_{}_mesh.bmesh", coords.x, coords.y);
    let archival_url = resources::url_for_path_and_hash_and_epoch(
        &base_name,
        resources::content_hash(&archival_bytes),
        CHUNK_BAKE_EPOCH,
    );
    let opt_name = format!("chunk_{}_{}_opt.bmesh", coords.x, coords.y);
    let optimised_url = resources::url_for_path_and_hash_and_epoch(
        &opt_name,
        resources::content_hash(&optimised_bytes),
        CHUNK_BAKE_EPOCH,
    );

    server.resources.write_resource_file(&archival_url, &archival_bytes)?;
    server.resources.write_resource_file(&optimised_url, &optimised_bytes)?;

    // ---- Commit ----
    let frame = {
        let mut state = server.state.lock();
        let Some(world) = state.world_mut(world_name) else {
            return Ok(());
        };
        for (uid, ranges) in &batch_ranges {
            if let Some(ob) = world.objects.get_mut(uid) {
                ob.batch_ranges = *ranges;
                world.db_dirty_objects.insert(*uid);
            }
        }
        let chunk: &mut LodChunk = world.chunk_entry(coords);
        chunk.mesh_url = optimised_url;
        chunk.archival_mesh_url = archival_url;
        chunk.combined_array_texture_url = array_tex_url;
        chunk.compressed_mat_info = mat_info_blob;
        chunk.needs_rebuild = false;
        let frame = protocol::chunk_updated_frame(chunk);
        world.db_dirty_chunks.insert(coords);
        frame
    };
    server.broadcast_to_world(world_name, &frame, None);

    debug!(
        "baked chunk {} in '{}': {} objects, {} verts, {} tris",
        coords,
        world_name,
        objects.len(),
        combined.num_verts(),
        combined.num_tris()
    );
    Ok(())
}

fn load_bake_mesh(server: &Arc<Server>, source: &MeshSource) -> Option<Mesh> {
    match source {
        MeshSource::Voxels(blob) => {
            let voxels = object::decompress_voxels(blob).ok()?;
            if voxels.is_empty() {
                None
            } else {
                Some(mesh::voxel_group_to_mesh(&voxels))
            }
        }
        MeshSource::Url(url) => {
            if url.is_empty() || !server.resources.is_present(url) {
                return None;
            }
            let bytes = server.resources.read_resource_file(url).ok()?;
            Mesh::decode(&bytes).ok()
        }
    }
}

/// Resize each unique texture to 64×64 RGB and pack the layers into one
/// zstd-compressed array file named by its own content hash.
fn build_texture_array(
    resources_mgr: &ResourceManager,
    tex_urls: &[String],
) -> anyhow::Result<(String, HashMap<String, i32>)> {
    let mut raw = Vec::with_capacity(tex_urls.len() * (ARRAY_TEX_DIM * ARRAY_TEX_DIM * 3) as usize);
    let mut index_for_url = HashMap::new();
    let mut num_layers = 0u32;

    for url in tex_urls {
        let bytes = match resources_mgr.read_resource_file(url) {
            Ok(b) => b,
            Err(e) => {
                warn!("texture '{}' unreadable for chunk array: {}", url, e);
                continue;
            }
        };
        let img = match image::load_from_memory(&bytes) {
            Ok(i) => i,
            Err(e) => {
                warn!("texture '{}' undecodable for chunk array: {}", url, e);
                continue;
            }
        };
        let layer = img
            .resize_exact(ARRAY_TEX_DIM, ARRAY_TEX_DIM, FilterType::Triangle)
            .to_rgb8();
        raw.extend_from_slice(layer.as_raw());
        index_for_url.insert(url.clone(), num_layers as i32);
        num_layers += 1;
    }

    let mut w = Writer::new();
    let mark = w.begin_block(MAT_INFO_SERIALISATION_VERSION);
    w.write_u32(num_layers);
    w.write_u32(ARRAY_TEX_DIM);
    w.write_u32(ARRAY_TEX_DIM);
    w.write_buffer(&zstd::encode_all(raw.as_slice(), 3)?);
    w.end_block(mark);
    let bytes = w.into_bytes();

    let url = resources::url_for_path_and_hash(
        "chunk_array_texture.tex",
        resources::content_hash(&bytes),
    );
    resources_mgr.write_resource_file(&url, &bytes)?;
    Ok((url, index_for_url))
}

fn trim_unused_materials(combined: &mut Mesh, mat_infos: &mut Vec<MatInfo>) {
    let mut used = vec![false; mat_infos.len()];
    for m in &combined.mat_indices {
        if let Some(slot) = used.get_mut(*m as usize) {
            *slot = true;
        }
    }
    let mut remap = vec![0u32; mat_infos.len()];
    let mut next = 0u32;
    for (i, in_use) in used.iter().enumerate() {
        if *in_use {
            remap[i] = next;
            next += 1;
        }
    }
    let mut i = 0;
    mat_infos.retain(|_| {
        let keep = used[i];
        i += 1;
        keep
    });
    for m in &mut combined.mat_indices {
        *m = remap.get(*m as usize).copied().unwrap_or(0);
    }
}

/// Texture matrix, emission, roughness, metallic, linear colour, flags and
/// packed-array index per material, zstd compressed.
fn encode_mat_info_blob(mat_infos: &[MatInfo]) -> anyhow::Result<Vec<u8>> {
    let mut w = Writer::new();
    let mark = w.begin_block(MAT_INFO_SERIALISATION_VERSION);
    w.write_u32(mat_infos.len() as u32);
    for info in mat_infos {
        let mat = &info.mat;
        for v in mat.tex_matrix.to_cols_array() {
            w.write_f32(v);
        }
        w.write_vec3(mat.emission_rgb);
        w.write_f32(mat.emission_lum_flux_or_lum);
        w.write_f32(mat.roughness.val);
        w.write_f32(mat.metallic_fraction.val);
        w.write_f32(mat.opacity.val);
        // sRGB → linear for the shader's benefit.
        let lin = mat.colour_rgb.powf(2.2);
        w.write_vec3(lin);
        w.write_u32(mat.flags);
        w.write_i32(info.array_tex_index);
    }
    w.end_block(mark);
    Ok(zstd::encode_all(w.into_bytes().as_slice(), 3)?)
}
