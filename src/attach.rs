//! Global tree attachment.
//!
//! Grounded in `examples/original_source/include/tree_mpi.h`'s `attachRoot` /
//! `root2body`: graft each peer's LET segment onto the local leaf that requested
//! it, then recompute the multipoles of every local cell whose children are now
//! remote.

use crate::body::Body;
use crate::cell::{Cell, NONE};
use crate::kernel::Kernel;
use crate::octree::LocalTree;

/// Append `recv_cells`/`recv_bodies` (the concatenation of every peer's LET
/// segment, in rank order) to the local tree, grafting each segment onto the
/// local leaf that used to summarize that remote subtree.
///
/// `segment_bounds[r] = (cell_start, cell_count, body_start, body_count)` locates
/// rank `r`'s contribution within the flat receive buffers, and `leaf_for_rank[r]`
/// is the index of the local cell that was the placeholder for rank `r`'s data
/// (found via the LET selector having added a non-leaf "root" entry for it).
pub fn attach(
    tree: &mut LocalTree,
    recv_cells: Vec<Cell>,
    recv_bodies: Vec<Body>,
    segment_bounds: &[(usize, usize, usize, usize)],
    leaf_for_rank: &[Option<usize>],
    kernel: &dyn Kernel,
) {
    let global_cells = tree.cells.len();
    let global_bodies = tree.bodies.len();

    for (rank, &(cell_start, cell_count, body_start, _body_count)) in segment_bounds.iter().enumerate() {
        let Some(old_leaf_idx) = leaf_for_rank[rank] else {
            continue;
        };
        if cell_count == 0 {
            continue;
        }

        let segment = &recv_cells[cell_start..cell_start + cell_count];
        let imported_root_idx = global_cells + cell_start;

        // Splice in this segment, offsetting every imported cell's own
        // parent/child indices by where it lands in the combined array, and by
        // where its bodies land in the combined body array.
        for cell in segment.iter() {
            let mut imported = cell.clone();
            if imported.iparent == NONE {
                imported.iparent = old_leaf_idx as i64;
            } else {
                imported.iparent += imported_root_idx as i64;
            }
            if imported.ichild != NONE {
                imported.ichild += imported_root_idx as i64;
            }
            if imported.ibody != NONE {
                imported.ibody += (global_bodies + body_start) as i64;
            }
            tree.cells.push(imported);
        }

        tree.cells[old_leaf_idx].ichild = imported_root_idx as i64;
        tree.cells[old_leaf_idx].nchild = 1;
        tree.cells[old_leaf_idx].ibody = NONE;
        tree.cells[old_leaf_idx].nbody = 0;
    }

    tree.bodies.extend(recv_bodies);

    // Recompute (X, R) and the multipole of every cell whose children changed,
    // bottom-up, so upper-level M2M results reflect the grafted remote data.
    let mut touched: Vec<usize> = segment_bounds
        .iter()
        .enumerate()
        .filter_map(|(rank, &(_, cell_count, _, _))| {
            if cell_count == 0 {
                None
            } else {
                leaf_for_rank[rank]
            }
        })
        .collect();
    touched.sort_unstable();
    touched.dedup();

    let mut frontier = touched;
    while !frontier.is_empty() {
        let mut parents = std::collections::HashSet::new();
        for &idx in &frontier {
            let cell = tree.cells[idx].clone();
            if cell.nchild > 0 {
                let first = cell.ichild as usize;
                let mut min_x = [f64::INFINITY; 3];
                let mut max_x = [f64::NEG_INFINITY; 3];
                tree.cells[idx].reset_expansions();
                for c in 0..cell.nchild as usize {
                    let child = tree.cells[first + c].clone();
                    kernel.m2m(&mut tree.cells[idx], &child);
                    for i in 0..3 {
                        min_x[i] = min_x[i].min(child.x[i] - child.r);
                        max_x[i] = max_x[i].max(child.x[i] + child.r);
                    }
                }
                let mut center = [0.0; 3];
                let mut half = 0.0f64;
                for i in 0..3 {
                    center[i] = (min_x[i] + max_x[i]) / 2.0;
                    half = half.max((max_x[i] - min_x[i]) / 2.0);
                }
                tree.cells[idx].x = center;
                tree.cells[idx].r = half;
            }
            if tree.cells[idx].iparent != NONE {
                parents.insert(tree.cells[idx].iparent as usize);
            }
        }
        frontier = parents.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::PointMultipole;
    use crate::morton::MortonKey;

    fn leaf(x: [f64; 3], r: f64, src: f64) -> Cell {
        let mut c = Cell::default();
        c.x = x;
        c.r = r;
        c.icell = MortonKey::default();
        c.iparent = 0;
        c.m[0] = num_complex::Complex64::new(src, 0.0);
        c
    }

    #[test]
    fn grafting_a_remote_segment_updates_the_placeholder_leafs_multipole() {
        let mut root = Cell::default();
        root.x = [0.5, 0.5, 0.5];
        root.r = 0.5;
        root.iparent = NONE;
        root.nchild = 1;
        root.ichild = 1;

        let mut placeholder = Cell::default();
        placeholder.x = [0.25, 0.25, 0.25];
        placeholder.r = 0.25;
        placeholder.iparent = 0;

        let mut tree = LocalTree {
            cells: vec![root, placeholder],
            level_offset: vec![0, 1, 2],
            bodies: vec![Body {
                x: [0.75, 0.75, 0.75],
                src: 1.0,
                trg: [0.0; 4],
                ibody: 0,
                irank: 0,
            }],
        };

        let recv_cells = vec![leaf([0.125, 0.125, 0.125], 0.125, 3.0)];
        let recv_bodies = vec![Body {
            x: [0.125, 0.125, 0.125],
            src: 3.0,
            trg: [0.0; 4],
            ibody: 1,
            irank: 1,
        }];
        let segment_bounds = vec![(0usize, 1usize, 0usize, 1usize)];
        let leaf_for_rank = vec![Some(1usize)];
        let kernel = PointMultipole;

        attach(&mut tree, recv_cells, recv_bodies, &segment_bounds, &leaf_for_rank, &kernel);

        assert_eq!(tree.cells.len(), 3);
        assert_eq!(tree.bodies.len(), 2);
        assert_eq!(tree.cells[1].ichild, 2);
        assert_eq!(tree.cells[1].nchild, 1);
        assert!(!tree.cells[1].is_leaf());
        assert_eq!(tree.cells[2].iparent, 1);
        assert_eq!(tree.cells[2].m[0].re, 3.0);
    }
}

