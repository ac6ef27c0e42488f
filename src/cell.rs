//! The `Cell` record: one octree node plus its multipole/local expansion.

use memoffset::offset_of;
use mpi::{
    datatype::{Equivalence, UncommittedUserDatatype, UserDatatype},
    Address,
};
use num_complex::Complex64;

use crate::constants::P;
use crate::morton::MortonKey;
use crate::types::PointType;

/// Number of 4-byte words in a serialized `Cell`.
pub const CELLWORD: usize = std::mem::size_of::<Cell>() / 4;

/// Sentinel for "no parent"/"no children"/"no bodies" index fields.
pub const NONE: i64 = -1;

/// One node of the local, indexed octree. Tree edges (`iparent`, `ichild`) are
/// indices into the cell array that owns this record, never pointers — the same
/// discipline the Morton-key tree uses, and the property that makes a `Cell`
/// array trivially relocatable across a LET segment boundary.
#[repr(C)]
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    /// Center of the cell's bounding cube.
    pub x: [PointType; 3],
    /// Half-side length of the bounding cube.
    pub r: PointType,
    /// Octree level, root at 0.
    pub level: u64,
    /// Morton key identifying this cell's position.
    pub icell: MortonKey,
    /// Index of the parent cell, or `NONE` at the root.
    pub iparent: i64,
    /// Index of the first child, or `NONE` if this is a leaf.
    pub ichild: i64,
    /// Number of children, 0 for a leaf.
    pub nchild: u32,
    /// Index of the first body owned by this leaf, or `NONE` for a non-leaf.
    pub ibody: i64,
    /// Number of bodies owned by this leaf.
    pub nbody: u32,
    /// Multipole expansion coefficients.
    pub m: [Complex64; P],
    /// Local expansion coefficients.
    pub l: [Complex64; P],
}

impl Cell {
    pub fn is_leaf(&self) -> bool {
        self.nchild == 0
    }

    pub fn reset_expansions(&mut self) {
        self.m = [Complex64::new(0.0, 0.0); P];
        self.l = [Complex64::new(0.0, 0.0); P];
    }
}

impl Default for Cell {
    fn default() -> Self {
        Cell {
            x: [0.0; 3],
            r: 0.0,
            level: 0,
            icell: MortonKey::default(),
            iparent: NONE,
            ichild: NONE,
            nchild: 0,
            ibody: NONE,
            nbody: 0,
            m: [Complex64::new(0.0, 0.0); P],
            l: [Complex64::new(0.0, 0.0); P],
        }
    }
}

unsafe impl Equivalence for Cell {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
            &[
                offset_of!(Cell, x) as Address,
                offset_of!(Cell, r) as Address,
                offset_of!(Cell, level) as Address,
                offset_of!(Cell, icell) as Address,
                offset_of!(Cell, iparent) as Address,
                offset_of!(Cell, ichild) as Address,
                offset_of!(Cell, nchild) as Address,
                offset_of!(Cell, ibody) as Address,
                offset_of!(Cell, nbody) as Address,
                offset_of!(Cell, m) as Address,
                offset_of!(Cell, l) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(3, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &MortonKey::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &i64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &i64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &u32::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &i64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &u32::equivalent_datatype()).as_ref(),
                // `Complex64` has the C99-compatible (re, im) layout, so 2*P
                // contiguous f64 lanes reproduce the field's bytes exactly.
                UncommittedUserDatatype::contiguous((2 * P) as mpi::Count, &PointType::equivalent_datatype())
                    .as_ref(),
                UncommittedUserDatatype::contiguous((2 * P) as mpi::Count, &PointType::equivalent_datatype())
                    .as_ref(),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_is_word_aligned() {
        assert_eq!(std::mem::size_of::<Cell>() % 4, 0);
    }

    #[test]
    fn default_cell_is_a_leaf() {
        assert!(Cell::default().is_leaf());
    }
}
