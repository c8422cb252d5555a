//! Dynamic-texture poller: objects can opt in to having a material texture
//! re-fetched from a remote URL.
//!
//! Once an hour (or immediately when an admin sets the force flag) the
//! poller walks all objects for script declarations of the form
//!
//! ```text
//! <dynamic_texture_update base_url="https://…" material_index="0" material_texture="colour"/>
//! ```
//!
//! gated on the creator's allow-dyn-tex-update flag.  Each distinct URL is
//! fetched once, capped at 32 MB, validated by image magic bytes, hashed and
//! ingested as a content-addressed resource.  Only when the minted URL
//! differs from the object's current one is the material rewritten.

use crate::limits;
use crate::resources;
use crate::server::{LodCheckItem, Server};
use crate::types::Uid;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const POLL_PERIOD: Duration = Duration::from_secs(3600);
/// How often the force-update flag is checked between full polls.
const FORCE_CHECK_PERIOD: Duration = Duration::from_secs(10);

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_secs(1);
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Script declaration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynTexTarget {
    Colour,
    Emission,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DynTexDecl {
    pub base_url: String,
    pub material_index: usize,
    pub material_texture: DynTexTarget,
}

/// Pull a `<dynamic_texture_update …/>` declaration out of a script, if any.
pub fn parse_dyn_tex_decl(script: &str) -> Option<DynTexDecl> {
    let start = script.find("<dynamic_texture_update")?;
    let rest = &script[start..];
    let end = rest.find("/>")?;
    let tag = &rest[..end];

    let attr = |name: &str| -> Option<&str> {
        let pat = format!("{}=\"", name);
        let i = tag.find(&pat)? + pat.len();
        let j = tag[i..].find('"')? + i;
        Some(&tag[i..j])
    };

    let base_url = attr("base_url")?.to_string();
    if base_url.len() > limits::MAX_URL_SIZE || !base_url.starts_with("http") {
        return None;
    }
    let material_index: usize = attr("material_index")?.parse().ok()?;
    let material_texture = match attr("material_texture")? {
        "colour" => DynTexTarget::Colour,
        "emission" => DynTexTarget::Emission,
        _ => return None,
    };
    Some(DynTexDecl {
        base_url,
        material_index,
        material_texture,
    })
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct DynTexItem {
    world_name: String,
    uid: Uid,
    decl: DynTexDecl,
}

pub async fn run(server: Arc<Server>, mut shutdown: watch::Receiver<bool>) {
    let client = match reqwest::Client::builder().timeout(FETCH_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            warn!("dynamic-texture poller could not build HTTP client: {}", e);
            return;
        }
    };

    let mut elapsed_since_poll = POLL_PERIOD; // poll once shortly after start
    loop {
        let force = {
            let mut state = server.state.lock();
            std::mem::take(&mut state.force_dyn_tex_update)
        };
        if force || elapsed_since_poll >= POLL_PERIOD {
            elapsed_since_poll = Duration::ZERO;
            run_poll(&server, &client).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(FORCE_CHECK_PERIOD) => {
                elapsed_since_poll += FORCE_CHECK_PERIOD;
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_poll(server: &Arc<Server>, client: &reqwest::Client) {
    // Collect opted-in declarations under the lock.
    let items: Vec<DynTexItem> = {
        let state = server.state.lock();
        let mut items = Vec::new();
        for (world_name, world) in &state.worlds {
            for ob in world.objects.values() {
                if ob.dead || ob.script.is_empty() {
                    continue;
                }
                let allowed = state
                    .users
                    .get(&ob.creator_id)
                    .map(|u| u.allows_dyn_tex_update())
                    .unwrap_or(false);
                if !allowed {
                    continue;
                }
                if let Some(decl) = parse_dyn_tex_decl(&ob.script) {
                    items.push(DynTexItem {
                        world_name: world_name.clone(),
                        uid: ob.uid,
                        decl,
                    });
                }
            }
        }
        items
    };
    if items.is_empty() {
        return;
    }
    info!("dynamic-texture poll: {} declarations", items.len());

    // One fetch per distinct URL.
    let mut fetched: HashMap<String, Option<String>> = HashMap::new();
    for item in &items {
        if fetched.contains_key(&item.decl.base_url) {
            continue;
        }
        let result = fetch_and_ingest(server, client, &item.decl.base_url).await;
        fetched.insert(item.decl.base_url.clone(), result);
    }

    // Rewrite materials whose URL actually changed.
    for item in items {
        let Some(Some(new_url)) = fetched.get(&item.decl.base_url) else {
            continue;
        };
        let mut state = server.state.lock();
        let Some(world) = state.world_mut(&item.world_name) else {
            continue;
        };
        let Some(ob) = world.objects.get_mut(&item.uid) else {
            continue;
        };
        let Some(mat) = ob.materials.get_mut(item.decl.material_index) else {
            continue;
        };
        let target: &mut String = match item.decl.material_texture {
            DynTexTarget::Colour => &mut mat.colour_texture_url,
            DynTexTarget::Emission => &mut mat.emission_texture_url,
        };
        if target != new_url {
            *target = new_url.clone();
            ob.touch();
            world.db_dirty_objects.insert(item.uid);
            drop(state);
            let _ = server.lod_queue.send(LodCheckItem {
                world_name: item.world_name,
                uid: item.uid,
            });
        }
    }
}

/// GET one remote image, validate it, and ingest it as a content-addressed
/// resource.  Returns the minted URL, or `None` if anything failed (the
/// failure is terminal for this poll run).
async fn fetch_and_ingest(
    server: &Arc<Server>,
    client: &reqwest::Client,
    remote_url: &str,
) -> Option<String> {
    let mut body = None;
    for attempt in 0..FETCH_ATTEMPTS {
        match fetch_bounded(client, remote_url).await {
            Ok(bytes) => {
                body = Some(bytes);
                break;
            }
            Err(e) => {
                debug!(
                    "dyn-tex fetch '{}' attempt {}/{} failed: {}",
                    remote_url,
                    attempt + 1,
                    FETCH_ATTEMPTS,
                    e
                );
                tokio::time::sleep(FETCH_BACKOFF).await;
            }
        }
    }
    let body = match body {
        Some(b) => b,
        None => {
            warn!("dyn-tex fetch '{}' failed after {} attempts", remote_url, FETCH_ATTEMPTS);
            return None;
        }
    };

    // Magic-byte validation picks the extension; anything unrecognised is
    // rejected outright.
    let format = image::guess_format(&body).ok()?;
    let ext = match format {
        image::ImageFormat::Jpeg => "jpg",
        image::ImageFormat::Png => "png",
        _ => {
            warn!("dyn-tex fetch '{}': unsupported image format", remote_url);
            return None;
        }
    };

    let hash = resources::content_hash(&body);
    let filename = remote_url.rsplit('/').next().unwrap_or("dyntex");
    let name = if filename.is_empty() { "dyntex" } else { filename };
    let url = resources::url_for_path_and_hash(&format!("{}.{}", name, ext), hash);

    if !server.resources.is_present(&url) {
        if let Err(e) = server.resources.write_resource_file(&url, &body) {
            warn!("dyn-tex ingest '{}' failed: {}", url, e);
            return None;
        }
    }
    Some(url)
}

async fn fetch_bounded(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<u8>> {
    let response = client.get(url).send().await?.error_for_status()?;
    if let Some(len) = response.content_length() {
        if len > limits::MAX_DYN_TEX_SIZE {
            anyhow::bail!("response of {} bytes exceeds cap", len);
        }
    }
    let mut body: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(piece) = stream.next().await {
        let piece = piece?;
        if body.len() as u64 + piece.len() as u64 > limits::MAX_DYN_TEX_SIZE {
            anyhow::bail!("response exceeds {} byte cap", limits::MAX_DYN_TEX_SIZE);
        }
        body.extend_from_slice(&piece);
    }
    Ok(body)
}
