//! Local octree construction: bodies in, a contiguous indexed `Cell` array out.
//!
//! Builds on the linearized/completed-tree machinery in `serial_octree.rs`
//! (`Tree::linearize`, `LinearTree::complete`, `CompleteLinearTree::coarsen_by_weights`)
//! rather than reimplementing leaf subdivision from scratch: the finest-level leaf
//! keys are completed into a gap-free, overlap-free tiling of the domain, weighted
//! by body count, then coarsened wherever a subtree holds no more than `ncrit`
//! bodies — exactly the `coarsen_by_weights` contract the teacher already wrote.

use std::collections::{HashMap, HashSet};

use crate::body::Body;
use crate::cell::{Cell, NONE};
use crate::constants::ROOT;
use crate::error::{FmmError, Result};
use crate::morton::MortonKey;
use crate::serial_octree::Tree;
use crate::types::Domain;

/// Result of building the local tree: the cell array, a level -> `[start, end)`
/// offset table, and the body array reordered so each leaf's bodies occupy a
/// contiguous range (`Cell::ibody .. Cell::ibody + Cell::nbody`).
pub struct LocalTree {
    pub cells: Vec<Cell>,
    pub level_offset: Vec<usize>,
    pub bodies: Vec<Body>,
}

/// Build the local octree for the bodies this rank owns.
///
/// `ncrit` bounds how many bodies a leaf may hold before `build_tree` would have
/// refined it further; the returned leaves all satisfy this bound except where a
/// leaf has already reached the deepest representable level.
pub fn build_tree(bodies: &[Body], domain: &Domain, ncrit: usize) -> Result<LocalTree> {
    if bodies.is_empty() {
        let mut root_cell = Cell::default();
        root_cell.x = cell_center(&ROOT, domain);
        root_cell.r = cell_radius(&ROOT, domain);
        root_cell.level = 0;
        root_cell.icell = ROOT;
        root_cell.ibody = 0;
        root_cell.nbody = 0;
        return Ok(LocalTree {
            cells: vec![root_cell],
            level_offset: vec![0, 1],
            bodies: Vec::new(),
        });
    }

    let deepest_keys: Vec<MortonKey> = bodies.iter().map(|b| MortonKey::from_point(&b.x, domain)).collect();

    let tree = Tree::from_iterable(deepest_keys.iter().copied());
    let mut linear = tree.linearize();
    let complete = linear.complete(ROOT);

    let weights: Vec<f64> = complete
        .keys
        .iter()
        .map(|leaf| {
            deepest_keys
                .iter()
                .filter(|&&k| k == *leaf || leaf.is_ancestor(&k))
                .count() as f64
        })
        .collect();

    let coarsened = complete.coarsen_by_weights(&ROOT, &weights, ncrit as f64);

    let mut leaves = coarsened.keys.clone();
    leaves.sort();

    // Materialize every ancestor of every leaf: a leaf's whole ancestor chain
    // must exist as an internal `Cell` so upward/downward passes have somewhere
    // to write M2M/L2L results.
    let mut all_nodes: HashSet<MortonKey> = HashSet::new();
    for leaf in &leaves {
        all_nodes.insert(*leaf);
        for ancestor in leaf.ancestors() {
            all_nodes.insert(ancestor);
        }
    }

    let max_level = all_nodes.iter().map(|k| k.level()).max().unwrap_or(0) as usize;
    let mut by_level: Vec<Vec<MortonKey>> = vec![Vec::new(); max_level + 1];
    for key in all_nodes {
        by_level[key.level() as usize].push(key);
    }
    for level_keys in by_level.iter_mut() {
        level_keys.sort();
    }

    let mut level_offset = Vec::with_capacity(by_level.len() + 1);
    let mut running = 0usize;
    level_offset.push(0);
    for level_keys in &by_level {
        running += level_keys.len();
        level_offset.push(running);
    }

    let mut index_of: HashMap<MortonKey, usize> = HashMap::with_capacity(running);
    for (level, level_keys) in by_level.iter().enumerate() {
        for (pos, key) in level_keys.iter().enumerate() {
            index_of.insert(*key, level_offset[level] + pos);
        }
    }

    let leaf_set: HashSet<MortonKey> = leaves.iter().copied().collect();

    // Reorder bodies so each leaf's bodies form a contiguous range.
    let mut sorted_bodies: Vec<Body> = Vec::with_capacity(bodies.len());
    let mut body_range: HashMap<MortonKey, (usize, usize)> = HashMap::with_capacity(leaves.len());
    for leaf in &leaves {
        let start = sorted_bodies.len();
        for (body, key) in bodies.iter().zip(deepest_keys.iter()) {
            if *key == *leaf || leaf.is_ancestor(key) {
                sorted_bodies.push(*body);
            }
        }
        body_range.insert(*leaf, (start, sorted_bodies.len()));
    }

    let mut cells = vec![Cell::default(); running];
    for (level, level_keys) in by_level.iter().enumerate() {
        for (pos, key) in level_keys.iter().enumerate() {
            let idx = level_offset[level] + pos;
            let mut cell = Cell::default();
            cell.x = cell_center(key, domain);
            cell.r = cell_radius(key, domain);
            cell.level = level as u64;
            cell.icell = *key;

            if key.level() > 0 {
                let parent_idx = *index_of.get(&key.parent()).ok_or_else(|| {
                    FmmError::Invariant(format!("missing parent of cell {:?}", key))
                })?;
                cell.iparent = parent_idx as i64;
            } else {
                cell.iparent = NONE;
            }

            if leaf_set.contains(key) {
                cell.nchild = 0;
                cell.ichild = NONE;
                let (start, end) = body_range[key];
                cell.ibody = start as i64;
                cell.nbody = (end - start) as u32;
            } else {
                let children = key.children();
                let first_child_idx = *index_of.get(&children[0]).ok_or_else(|| {
                    FmmError::Invariant(format!("missing first child of cell {:?}", key))
                })?;
                for (offset, child) in children.iter().enumerate() {
                    let expected = first_child_idx + offset;
                    let actual = *index_of.get(child).ok_or_else(|| {
                        FmmError::Invariant(format!("missing child {:?} of cell {:?}", child, key))
                    })?;
                    if actual != expected {
                        return Err(FmmError::Invariant(format!(
                            "children of {:?} are not contiguous in the level array",
                            key
                        )));
                    }
                }
                cell.nchild = 8;
                cell.ichild = first_child_idx as i64;
                cell.ibody = NONE;
                cell.nbody = 0;
            }

            cells[idx] = cell;
        }
    }

    Ok(LocalTree {
        cells,
        level_offset,
        bodies: sorted_bodies,
    })
}

/// Build the small coarse tree whose leaves are each rank's own subtree root
/// (`leaf_keys[r]` = rank `r`'s key, `leaf_summaries[r]` its already-M2M'd
/// multipole at that level). Every rank builds this identically since
/// `leaf_keys`/`leaf_summaries` are agreed via `Allgather` beforehand; it is the
/// frame `attach.rs` grafts incoming LET segments onto, kept separate from each
/// rank's own (much larger) local tree.
///
/// Returns the skeleton tree plus, per rank, the index of that rank's leaf.
pub fn build_skeleton(
    leaf_keys: &[MortonKey],
    leaf_summaries: &[Cell],
    domain: &Domain,
) -> Result<(LocalTree, Vec<usize>)> {
    let mut all_nodes: HashSet<MortonKey> = HashSet::new();
    for key in leaf_keys {
        all_nodes.insert(*key);
        for ancestor in key.ancestors() {
            all_nodes.insert(ancestor);
        }
    }

    let max_level = all_nodes.iter().map(|k| k.level()).max().unwrap_or(0) as usize;
    let mut by_level: Vec<Vec<MortonKey>> = vec![Vec::new(); max_level + 1];
    for key in all_nodes {
        by_level[key.level() as usize].push(key);
    }
    for level_keys in by_level.iter_mut() {
        level_keys.sort();
    }

    let mut level_offset = Vec::with_capacity(by_level.len() + 1);
    let mut running = 0usize;
    level_offset.push(0);
    for level_keys in &by_level {
        running += level_keys.len();
        level_offset.push(running);
    }

    let mut index_of: HashMap<MortonKey, usize> = HashMap::with_capacity(running);
    for (level, level_keys) in by_level.iter().enumerate() {
        for (pos, key) in level_keys.iter().enumerate() {
            index_of.insert(*key, level_offset[level] + pos);
        }
    }

    let leaf_set: HashMap<MortonKey, Cell> = leaf_keys
        .iter()
        .copied()
        .zip(leaf_summaries.iter().cloned())
        .collect();

    let mut cells = vec![Cell::default(); running];
    for (level, level_keys) in by_level.iter().enumerate() {
        for (pos, key) in level_keys.iter().enumerate() {
            let idx = level_offset[level] + pos;
            let mut cell = Cell::default();
            cell.level = level as u64;
            cell.icell = *key;

            cell.iparent = if key.level() > 0 {
                let parent_idx = *index_of.get(&key.parent()).ok_or_else(|| {
                    FmmError::Invariant(format!("skeleton missing parent of {:?}", key))
                })?;
                parent_idx as i64
            } else {
                NONE
            };

            if let Some(summary) = leaf_set.get(key) {
                cell.x = summary.x;
                cell.r = summary.r;
                cell.m = summary.m;
                cell.l = summary.l;
                cell.nchild = 0;
                cell.ichild = NONE;
            } else {
                cell.x = cell_center(key, domain);
                cell.r = cell_radius(key, domain);

                // Children present in the union are exactly the descendants that
                // lead to a rank subroot; Morton order at a fixed level already
                // groups same-parent siblings contiguously, so whatever subset is
                // present still packs into one contiguous run.
                let mut present_children: Vec<usize> =
                    key.children().iter().filter_map(|c| index_of.get(c).copied()).collect();
                present_children.sort_unstable();
                if present_children.is_empty() {
                    cell.ichild = NONE;
                    cell.nchild = 0;
                } else {
                    let first = present_children[0];
                    for (offset, &child_idx) in present_children.iter().enumerate() {
                        if child_idx != first + offset {
                            return Err(FmmError::Invariant(format!(
                                "skeleton children of {:?} are not contiguous in the level array",
                                key
                            )));
                        }
                    }
                    cell.ichild = first as i64;
                    cell.nchild = present_children.len() as u32;
                }
            }

            cells[idx] = cell;
        }
    }

    let rank_leaf_idx: Vec<usize> = leaf_keys.iter().map(|k| index_of[k]).collect();

    Ok((
        LocalTree {
            cells,
            level_offset,
            bodies: Vec::new(),
        },
        rank_leaf_idx,
    ))
}

/// Center of the cube a Morton key identifies.
pub fn cell_center(key: &MortonKey, domain: &Domain) -> [f64; 3] {
    let corner = key.to_coordinates(domain);
    let side = cell_side(key, domain);
    let mut center = [0.0; 3];
    for i in 0..3 {
        center[i] = corner[i] + side[i] / 2.0;
    }
    center
}

/// Bounding-cube radius: half the largest per-axis side length, so the
/// multipole-acceptance test stays conservative for non-cubic domains.
pub fn cell_radius(key: &MortonKey, domain: &Domain) -> f64 {
    let side = cell_side(key, domain);
    side.iter().cloned().fold(0.0, f64::max) / 2.0
}

fn cell_side(key: &MortonKey, domain: &Domain) -> [f64; 3] {
    let levels = 1u64 << key.level();
    let mut side = [0.0; 3];
    for i in 0..3 {
        side[i] = domain.diameter[i] / (levels as f64);
    }
    side
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn make_body(x: [f64; 3], idx: u64) -> Body {
        Body {
            x,
            src: 1.0,
            trg: [0.0; 4],
            ibody: idx,
            irank: 0,
        }
    }

    #[test]
    fn build_tree_covers_all_bodies() {
        let domain = Domain {
            origin: [0.0, 0.0, 0.0],
            diameter: [1.0, 1.0, 1.0],
        };
        let mut rng = rand::thread_rng();
        let bodies: Vec<Body> = (0..200)
            .map(|i| make_body([rng.gen(), rng.gen(), rng.gen()], i as u64))
            .collect();

        let tree = build_tree(&bodies, &domain, 16).unwrap();
        let total_in_leaves: u32 = tree
            .cells
            .iter()
            .filter(|c| c.is_leaf())
            .map(|c| c.nbody)
            .sum();
        assert_eq!(total_in_leaves as usize, bodies.len());
        assert_eq!(tree.bodies.len(), bodies.len());
    }

    #[test]
    fn empty_domain_yields_single_leaf_root() {
        let domain = Domain {
            origin: [0.0, 0.0, 0.0],
            diameter: [1.0, 1.0, 1.0],
        };
        let tree = build_tree(&[], &domain, 16).unwrap();
        assert_eq!(tree.cells.len(), 1);
        assert!(tree.cells[0].is_leaf());
        assert_eq!(tree.cells[0].nbody, 0);
    }

    #[test]
    fn build_skeleton_places_every_rank_leaf_and_links_its_ancestors() {
        let domain = Domain {
            origin: [0.0, 0.0, 0.0],
            diameter: [1.0, 1.0, 1.0],
        };
        let leaf_keys = vec![
            MortonKey::from_point(&[0.1, 0.1, 0.1], &domain),
            MortonKey::from_point(&[0.9, 0.1, 0.1], &domain),
            MortonKey::from_point(&[0.1, 0.9, 0.9], &domain),
        ];
        let leaf_summaries: Vec<Cell> = leaf_keys
            .iter()
            .map(|k| {
                let mut c = Cell::default();
                c.x = cell_center(k, &domain);
                c.r = cell_radius(k, &domain);
                c
            })
            .collect();

        let (skeleton, rank_leaf_idx) = build_skeleton(&leaf_keys, &leaf_summaries, &domain).unwrap();
        assert_eq!(rank_leaf_idx.len(), leaf_keys.len());
        for (rank, &idx) in rank_leaf_idx.iter().enumerate() {
            assert_eq!(skeleton.cells[idx].icell, leaf_keys[rank]);
            assert!(skeleton.cells[idx].is_leaf());
            let mut cur = idx;
            while skeleton.cells[cur].iparent != NONE {
                cur = skeleton.cells[cur].iparent as usize;
                assert!(!skeleton.cells[cur].is_leaf());
            }
        }
    }

    #[test]
    fn children_are_contiguous_in_level_array() {
        let domain = Domain {
            origin: [0.0, 0.0, 0.0],
            diameter: [1.0, 1.0, 1.0],
        };
        let mut rng = rand::thread_rng();
        let bodies: Vec<Body> = (0..500)
            .map(|i| make_body([rng.gen(), rng.gen(), rng.gen()], i as u64))
            .collect();
        let tree = build_tree(&bodies, &domain, 8).unwrap();
        for cell in tree.cells.iter().filter(|c| !c.is_leaf()) {
            let first = cell.ichild as usize;
            let parent_idx = tree.cells.iter().position(|c| c.icell == cell.icell).unwrap();
            for offset in 0..cell.nchild as usize {
                let child = &tree.cells[first + offset];
                assert_eq!(child.iparent as usize, parent_idx);
            }
        }
    }
}
