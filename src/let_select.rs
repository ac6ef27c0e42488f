//! Local Essential Tree selector.
//!
//! Implements `traverseLET`/`setLET` from
//! `examples/original_source/include/tree_mpi.h`: decide, for each remote rank,
//! which cells and bodies of the local tree it needs so its own evaluation is
//! locally complete under the multipole acceptance criterion.
//!
//! The original two-pass emission (size with `copy_data=false`, then write with
//! `copy_data=true`) exists to avoid reallocating the MPI send buffer mid-pack.
//! This implementation grows the segment's `Vec`s directly instead — the packed
//! result is identical, the two-pass discipline only matters once the buffer is
//! handed to a fixed-size `MPI_Alltoallv` call, which `exchange.rs` does from the
//! already-built segment.

use std::collections::HashMap;

use mpi::topology::Rank;

use crate::body::Body;
use crate::cell::{Cell, NONE};
use crate::types::{Config, Domain, PointType};

/// One rank's share of the local tree: self-contained, with `iparent`/`ichild`
/// rewritten to be indices into `cells` here rather than into the sender's array.
#[derive(Default, Clone, Debug)]
pub struct LetSegment {
    pub cells: Vec<Cell>,
    pub bodies: Vec<Body>,
}

/// Squared distance from `point` to the nearest point of `domain`'s AABB, zero if
/// `point` lies inside it.
fn aabb_sqdist(point: [PointType; 3], domain: &Domain) -> PointType {
    let mut d2 = 0.0;
    for i in 0..3 {
        let lo = domain.origin[i];
        let hi = domain.origin[i] + domain.diameter[i];
        let clamped = point[i].max(lo).min(hi);
        let d = point[i] - clamped;
        d2 += d * d;
    }
    d2
}

/// Squared distance from `point` to `domain`, minimized over the periodic image
/// lattice `[-images, images]^3` scaled by `cycle` (a no-op 1x1x1 lattice when
/// `images == 0`).
fn periodic_sqdist(point: [PointType; 3], domain: &Domain, cycle: [PointType; 3], images: u32) -> PointType {
    if images == 0 {
        return aabb_sqdist(point, domain);
    }
    let range = images as i32;
    let mut best = PointType::INFINITY;
    for ix in -range..=range {
        for iy in -range..=range {
            for iz in -range..=range {
                let shifted = [
                    point[0] + ix as PointType * cycle[0],
                    point[1] + iy as PointType * cycle[1],
                    point[2] + iz as PointType * cycle[2],
                ];
                best = best.min(aabb_sqdist(shifted, domain));
            }
        }
    }
    best
}

/// `level = floor(log8(mpisize - 1)) + 1` per spec §4.3: the scale at which every
/// rank's local root sits, used as a floor on how small a cell may be before the
/// selector always refines past it regardless of distance.
pub fn local_root_level(mpisize: Rank) -> u64 {
    if mpisize <= 1 {
        return 0;
    }
    let base = (mpisize - 1) as f64;
    (base.log(8.0).floor() as u64) + 1
}

/// Build the LET segment rank `my_rank` must send to `target_rank`, given
/// `target_rank`'s subdomain bounds.
pub fn traverse_let(
    cells: &[Cell],
    bodies: &[Body],
    target_domain: &Domain,
    mpisize: Rank,
    config: &Config,
) -> LetSegment {
    let mut out = LetSegment::default();
    if cells.is_empty() {
        return out;
    }

    let level = local_root_level(mpisize);
    let threshold = config.cycle.iter().cloned().fold(0.0, PointType::max) / (1u64 << (level + 1)) as PointType;

    // original-index -> segment-local index, filled in as cells are appended.
    let mut remap: HashMap<usize, usize> = HashMap::new();

    let root_idx = 0;
    let root = &cells[root_idx];
    let mut packed_root = rewrite(root, NONE, &remap);
    if root.is_leaf() && root.nbody > 0 {
        let body_start = root.ibody as usize;
        let body_end = body_start + root.nbody as usize;
        packed_root.ibody = 0;
        packed_root.nbody = root.nbody;
        out.bodies.extend_from_slice(&bodies[body_start..body_end]);
    }
    out.cells.push(packed_root);
    remap.insert(root_idx, 0);

    traverse(
        cells,
        bodies,
        root_idx,
        target_domain,
        config,
        threshold,
        &mut out,
        &mut remap,
    );

    out
}

fn rewrite(cell: &Cell, iparent: i64, _remap: &HashMap<usize, usize>) -> Cell {
    let mut c = cell.clone();
    c.iparent = iparent;
    c.ichild = NONE;
    c.nchild = 0;
    c.ibody = NONE;
    c.nbody = 0;
    c
}

fn traverse(
    cells: &[Cell],
    bodies: &[Body],
    idx: usize,
    target_domain: &Domain,
    config: &Config,
    threshold: PointType,
    out: &mut LetSegment,
    remap: &mut HashMap<usize, usize>,
) {
    let cell = &cells[idx];
    if cell.is_leaf() {
        return;
    }

    let first_child = cell.ichild as usize;
    let mut local_children = Vec::with_capacity(cell.nchild as usize);

    for offset in 0..cell.nchild as usize {
        let child_idx = first_child + offset;
        let child = &cells[child_idx];

        if child.is_leaf() {
            let seg_idx = out.cells.len();
            let mut packed = rewrite(child, *remap.get(&idx).unwrap() as i64, remap);
            if child.nbody > 0 {
                let body_start = child.ibody as usize;
                let body_end = body_start + child.nbody as usize;
                packed.ibody = out.bodies.len() as i64;
                packed.nbody = child.nbody;
                out.bodies.extend_from_slice(&bodies[body_start..body_end]);
            }
            out.cells.push(packed);
            remap.insert(child_idx, seg_idx);
            local_children.push(seg_idx);
            continue;
        }

        let r2 = periodic_sqdist(child.x, target_domain, config.cycle, config.images);
        let too_close = 4.0 * child.r * child.r > r2;
        let coarser_than_local_root = child.r > threshold;

        // The child is always sent, at minimum as a childless multipole summary
        // (`addSendCell` in the original is unconditional); only the recursion
        // into its own children is gated by the distance/size test.
        let seg_idx = out.cells.len();
        let packed = rewrite(child, *remap.get(&idx).unwrap() as i64, remap);
        out.cells.push(packed);
        remap.insert(child_idx, seg_idx);
        local_children.push(seg_idx);

        if too_close || coarser_than_local_root {
            traverse(cells, bodies, child_idx, target_domain, config, threshold, out, remap);
        }
    }

    if !local_children.is_empty() {
        let parent_seg_idx = *remap.get(&idx).unwrap();
        let first = local_children[0];
        for (i, &c) in local_children.iter().enumerate() {
            debug_assert_eq!(c, first + i, "LET children must be packed contiguously");
        }
        out.cells[parent_seg_idx].ichild = first as i64;
        out.cells[parent_seg_idx].nchild = local_children.len() as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::build_tree;

    #[test]
    fn leaf_only_tree_produces_a_single_cell_segment() {
        let domain = Domain {
            origin: [0.0, 0.0, 0.0],
            diameter: [1.0, 1.0, 1.0],
        };
        let bodies = vec![Body {
            x: [0.5, 0.5, 0.5],
            src: 1.0,
            trg: [0.0; 4],
            ibody: 0,
            irank: 0,
        }];
        let tree = build_tree(&bodies, &domain, 16).unwrap();
        let config = Config::default();
        let target_domain = domain;

        let segment = traverse_let(&tree.cells, &tree.bodies, &target_domain, 2, &config);
        assert_eq!(segment.cells.len(), 1);
        assert_eq!(segment.bodies.len(), 1);
        assert!(segment.cells[0].is_leaf());
    }
}
