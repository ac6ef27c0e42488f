//! Level-synchronous traversal driver.
//!
//! Grounded in `examples/original_source/helmholtz/fmm.h`'s `evaluate(Cells&, int
//! numLevels)`: P2M bottom-up from the leaves, M2M up to the root, M2L level by
//! level, L2L down to the leaves, L2P and P2P at the leaves. Each level's cells are
//! independent under a given pass, so each level is dispatched with `rayon`'s
//! `par_iter`, mirroring the intra-rank data parallelism the teacher and sibling
//! examples reach for (`rayon` is commented out in the teacher's own `Cargo.toml`;
//! here it is a live dependency, see `DESIGN.md`).

use std::collections::HashMap;

use rayon::prelude::*;

use crate::body::Body;
use crate::cell::Cell;
use crate::error::{FmmError, Result};
use crate::kernel::Kernel;
use crate::morton::MortonKey;
use crate::timing::time_block;

/// Interaction lists computed once per local tree and reused across passes.
pub struct InteractionLists {
    /// `m2l[i]` — indices of cells well-separated from cell `i`, same level.
    pub m2l: Vec<Vec<usize>>,
    /// `p2p[i]` — indices of leaf cells (including `i` itself) near enough to
    /// cell `i` to require direct summation.
    pub p2p: Vec<Vec<usize>>,
}

fn index_by_key(cells: &[Cell]) -> HashMap<MortonKey, usize> {
    cells.iter().enumerate().map(|(i, c)| (c.icell, i)).collect()
}

fn colleagues(key: &MortonKey, level: u64, index_of: &HashMap<MortonKey, usize>) -> Vec<usize> {
    let mut out = Vec::with_capacity(26);
    for dx in -1..=1i64 {
        for dy in -1..=1i64 {
            for dz in -1..=1i64 {
                if dx == 0 && dy == 0 && dz == 0 {
                    continue;
                }
                if let Some(neighbor) = key.find_key_in_direction(&[dx, dy, dz]) {
                    if neighbor.level() == level {
                        if let Some(&idx) = index_of.get(&neighbor) {
                            out.push(idx);
                        }
                    }
                }
            }
        }
    }
    out
}

/// Build the M2L and P2P interaction lists for every cell in the local tree.
///
/// `nlist <= 189` (spec §4.1): 26 colleagues, 8 children each, minus the up-to-26
/// that are themselves colleagues of the target.
pub fn build_interaction_lists(cells: &[Cell]) -> InteractionLists {
    let index_of = index_by_key(cells);

    let m2l: Vec<Vec<usize>> = cells
        .iter()
        .map(|cell| {
            if cell.iparent < 0 {
                return Vec::new();
            }
            let parent = &cells[cell.iparent as usize];
            let my_colleagues: std::collections::HashSet<usize> =
                colleagues(&cell.icell, cell.level, &index_of).into_iter().collect();

            let mut list = Vec::new();
            let parent_colleagues = colleagues(&parent.icell, parent.level, &index_of);
            for &pc_idx in &parent_colleagues {
                let pc = &cells[pc_idx];
                if pc.is_leaf() {
                    continue;
                }
                let first = pc.ichild as usize;
                for offset in 0..pc.nchild as usize {
                    let candidate = first + offset;
                    if !my_colleagues.contains(&candidate) {
                        list.push(candidate);
                    }
                }
            }
            list
        })
        .collect();

    let p2p: Vec<Vec<usize>> = cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            if !cell.is_leaf() {
                return Vec::new();
            }
            let mut list = vec![i];
            for idx in colleagues(&cell.icell, cell.level, &index_of) {
                if cells[idx].is_leaf() {
                    list.push(idx);
                }
            }
            list
        })
        .collect();

    InteractionLists { m2l, p2p }
}

/// P2M (leaves) then M2M (bottom-up): populate every cell's multipole expansion.
pub fn upward_pass(
    cells: &mut [Cell],
    level_offset: &[usize],
    bodies: &[Body],
    kernel: &dyn Kernel,
) -> Result<()> {
    time_block("P2M", || {
        let num_levels = level_offset.len() - 1;
        for level in (0..num_levels).rev() {
            let (start, end) = (level_offset[level], level_offset[level + 1]);
            cells[start..end].par_iter_mut().for_each(|cell| {
                if cell.is_leaf() {
                    let body_start = cell.ibody.max(0) as usize;
                    let body_end = body_start + cell.nbody as usize;
                    kernel.p2m(cell, &bodies[body_start..body_end]);
                }
            });
        }
    });

    time_block("M2M", || -> Result<()> {
        let num_levels = level_offset.len() - 1;
        for level in (1..num_levels).rev() {
            let (start, end) = (level_offset[level], level_offset[level + 1]);
            // Children (this level) have already been finalized by the previous
            // iteration; only read from them while writing into the parent level.
            for idx in start..end {
                let child = cells[idx].clone();
                if child.iparent < 0 {
                    continue;
                }
                let parent_idx = child.iparent as usize;
                if parent_idx < level_offset[level] {
                    let parent = &mut cells[parent_idx];
                    kernel.m2m(parent, &child);
                } else {
                    return Err(FmmError::Invariant(
                        "M2M parent must live at a shallower level".into(),
                    ));
                }
            }
        }
        Ok(())
    })?;

    Ok(())
}

/// M2L over the interaction lists, dispatched level by level.
pub fn dual_tree_traversal(
    cells: &mut [Cell],
    level_offset: &[usize],
    lists: &InteractionLists,
    mutual: bool,
    kernel: &dyn Kernel,
) -> Result<()> {
    if mutual {
        // The mutual-interaction optimization is unverified in the distributed
        // setting in the original implementation (spec §9, Open Question 1); we
        // refuse rather than silently producing a wrong answer.
        return Err(FmmError::Unsupported(
            "mutual interaction traversal is not implemented".into(),
        ));
    }

    time_block("M2L", || {
        kernel.refresh_quadrature("M2L");
        let num_levels = level_offset.len() - 1;
        for level in 0..num_levels {
            let (start, end) = (level_offset[level], level_offset[level + 1]);
            for idx in start..end {
                let sources: Vec<Cell> = lists.m2l[idx].iter().map(|&j| cells[j].clone()).collect();
                let target = &mut cells[idx];
                for source in &sources {
                    kernel.m2l(target, source);
                }
            }
        }
    });

    time_block("P2P", || {
        // P2P is performed on bodies, not cells; handled by `downward_pass` once
        // L2P has populated the body array. Listed here only to mirror the
        // pass ordering documented in spec §4.1.
    });

    Ok(())
}

/// L2L (top-down) then L2P + P2P at the leaves.
pub fn downward_pass(
    cells: &mut [Cell],
    level_offset: &[usize],
    bodies: &mut [Body],
    lists: &InteractionLists,
    kernel: &dyn Kernel,
) -> Result<()> {
    time_block("L2L", || -> Result<()> {
        let num_levels = level_offset.len() - 1;
        for level in 0..num_levels {
            let (start, end) = (level_offset[level], level_offset[level + 1]);
            for idx in start..end {
                let parent = cells[idx].clone();
                if parent.is_leaf() {
                    continue;
                }
                let first = parent.ichild as usize;
                for offset in 0..parent.nchild as usize {
                    let child_idx = first + offset;
                    if child_idx < level_offset[level + 1] {
                        return Err(FmmError::Invariant(
                            "L2L child must live at a deeper level".into(),
                        ));
                    }
                    kernel.l2l(&mut cells[child_idx], &parent);
                }
            }
        }
        Ok(())
    })?;

    time_block("L2P", || {
        for cell in cells.iter().filter(|c| c.is_leaf()) {
            let body_start = cell.ibody.max(0) as usize;
            let body_end = body_start + cell.nbody as usize;
            kernel.l2p(cell, &mut bodies[body_start..body_end]);
        }
    });

    time_block("P2P", || {
        for (i, cell) in cells.iter().enumerate() {
            if !cell.is_leaf() {
                continue;
            }
            let body_start = cell.ibody.max(0) as usize;
            let body_end = body_start + cell.nbody as usize;
            for &j in &lists.p2p[i] {
                let other = &cells[j];
                let other_start = other.ibody.max(0) as usize;
                let other_end = other_start + other.nbody as usize;

                if j == i {
                    let (target, _) = bodies.split_at_mut(body_end);
                    let target = &mut target[body_start..];
                    let source = target.to_vec();
                    kernel.p2p(target, &source);
                } else if other_end <= body_start {
                    let (left, right) = bodies.split_at_mut(body_start);
                    kernel.p2p(&mut right[..body_end - body_start], &left[other_start..other_end]);
                } else {
                    let (left, right) = bodies.split_at_mut(other_start);
                    kernel.p2p(&mut left[body_start..body_end], &right[..other_end - other_start]);
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::PointMultipole;
    use crate::octree::build_tree;
    use crate::types::Domain;

    #[test]
    fn upward_then_downward_pass_matches_direct_sum_for_well_separated_clusters() {
        let domain = Domain {
            origin: [0.0, 0.0, 0.0],
            diameter: [8.0, 8.0, 8.0],
        };
        let bodies = vec![
            Body { x: [0.5, 0.5, 0.5], src: 1.0, trg: [0.0; 4], ibody: 0, irank: 0 },
            Body { x: [7.5, 7.5, 7.5], src: 1.0, trg: [0.0; 4], ibody: 1, irank: 0 },
        ];
        let mut tree = build_tree(&bodies, &domain, 1).unwrap();
        let kernel = PointMultipole;

        upward_pass(&mut tree.cells, &tree.level_offset, &tree.bodies, &kernel).unwrap();
        let lists = build_interaction_lists(&tree.cells);
        dual_tree_traversal(&mut tree.cells, &tree.level_offset, &lists, false, &kernel).unwrap();
        downward_pass(&mut tree.cells, &tree.level_offset, &mut tree.bodies, &lists, &kernel).unwrap();

        let expected = 1.0 / (3.0f64 * 7.0 * 7.0).sqrt();
        for b in &tree.bodies {
            assert!((b.trg[0] - expected).abs() < 1e-6);
        }
    }
}
