//! First-run world creation: lays out the root world's initial parcel grid.
//!
//! Runs once, when the root world has no parcels at all.  The layout is a
//! town square left empty in the middle, ringed by blocks of 2×2 parcels,
//! with one sandbox parcel anyone may build in.

use crate::parcel::Parcel;
use crate::types::UserId;
use crate::worlds::AllWorlds;
use glam::DVec2;
use log::info;

/// Side length of one parcel in world units.
const PARCEL_W: f64 = 20.0;
/// Side length of one block (2×2 parcels plus a road margin).
const BLOCK_W: f64 = 70.0;
/// Blocks extend this many block-widths out from the origin in each axis.
const BLOCK_RADIUS: i32 = 4;
/// Default parcel height range.
const PARCEL_ZBOUNDS: (f64, f64) = (-1.0, 10.0);

/// Lay out the initial parcels if the root world has none.
pub fn create_initial_parcels(state: &mut AllWorlds) {
    if !state
        .world("")
        .map(|w| w.parcels.is_empty())
        .unwrap_or(true)
    {
        return;
    }

    let mut created = 0usize;
    for bx in -BLOCK_RADIUS..BLOCK_RADIUS {
        for by in -BLOCK_RADIUS..BLOCK_RADIUS {
            // The middle 4×4 blocks are the town square; no parcels there.
            if (-2..=1).contains(&bx) && (-2..=1).contains(&by) {
                continue;
            }
            let botleft = DVec2::new(5.0 + bx as f64 * BLOCK_W, 5.0 + by as f64 * BLOCK_W);
            created += make_block(state, botleft);
        }
    }

    // One sandbox parcel by the square: world-writeable, for new users.
    if let Some(sandbox) = state
        .world_mut("")
        .and_then(|w| w.parcels.values_mut().min_by_key(|p| p.id))
    {
        sandbox.all_writeable = true;
    }

    info!("created {} initial parcels in the root world", created);
}

/// One block: 2×2 parcels in the block's corner, the rest road margin.
fn make_block(state: &mut AllWorlds, botleft: DVec2) -> usize {
    let mut created = 0;
    for xi in 0..2 {
        for yi in 0..2 {
            let id = state.alloc_parcel_id();
            let mut parcel = Parcel::new(id, UserId(0));
            parcel.admin_ids.push(UserId(0));
            parcel.verts = [
                botleft + DVec2::new(xi as f64 * PARCEL_W, yi as f64 * PARCEL_W),
                botleft + DVec2::new((xi + 1) as f64 * PARCEL_W, yi as f64 * PARCEL_W),
                botleft + DVec2::new((xi + 1) as f64 * PARCEL_W, (yi + 1) as f64 * PARCEL_W),
                botleft + DVec2::new(xi as f64 * PARCEL_W, (yi + 1) as f64 * PARCEL_W),
            ];
            parcel.zbounds = PARCEL_ZBOUNDS;
            parcel.build_aabb();

            let world = state.world_entry("");
            world.parcels.insert(id, parcel);
            world.db_dirty_parcels.insert(id);
            created += 1;
        }
    }
    created
}
