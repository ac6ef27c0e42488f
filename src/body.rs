//! The `Body` record: a single source/target point carried through partitioning,
//! tree construction, and LET exchange.

use memoffset::offset_of;
use mpi::{
    datatype::{Equivalence, UncommittedUserDatatype, UserDatatype},
    Address,
};

use crate::types::PointType;

/// Number of 4-byte words in a serialized `Body`, used to rescale MPI counts and
/// displacements when a buffer of bodies is exchanged as a raw word array.
pub const BODYWORD: usize = std::mem::size_of::<Body>() / 4;

/// A point carrying a source strength and a target accumulator.
///
/// `#[repr(C)]` and 4-byte-aligned by construction (all fields are `f64`/`i64`
/// multiples of 4 bytes), so it can cross the wire as a raw word array without a
/// serialization pass — the same contract `MortonKey` relies on.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Body {
    /// Cartesian position.
    pub x: [PointType; 3],
    /// Source strength. Complex (Helmholtz) strengths pair two lanes here and in
    /// a second `Body` field rather than widening this one, keeping the record a
    /// fixed, POD-friendly shape.
    pub src: PointType,
    /// Target accumulator: potential plus 3 force components.
    pub trg: [PointType; 4],
    /// Originating global index, stable across partitioning and LET exchange.
    pub ibody: u64,
    /// Destination rank, set by the partitioner and consulted by `comm_bodies`.
    pub irank: i32,
}

impl Default for Body {
    fn default() -> Self {
        Body {
            x: [0.0; 3],
            src: 0.0,
            trg: [0.0; 4],
            ibody: 0,
            irank: 0,
        }
    }
}

unsafe impl Equivalence for Body {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1, 1, 1],
            &[
                offset_of!(Body, x) as Address,
                offset_of!(Body, src) as Address,
                offset_of!(Body, trg) as Address,
                offset_of!(Body, ibody) as Address,
                offset_of!(Body, irank) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(3, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(4, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &i32::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_word_aligned() {
        assert_eq!(std::mem::size_of::<Body>() % 4, 0);
    }
}
