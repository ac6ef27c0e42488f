//! Crate wide constants
//!
//! `DEEPEST_LEVEL`, `LEVEL_SIZE` and `ROOT` live alongside `MortonKey` in `morton.rs`
//! since they're needed to define that type; re-exported here so callers have one
//! place to look for crate-wide constants.
pub use crate::morton::{DEEPEST_LEVEL, LEVEL_SIZE, ROOT};

/// Default criterion for subdivision: a leaf is refined once it holds more than
/// this many bodies.
pub const NCRIT: usize = 150;

/// Multipole/local expansion truncation order. Compile-time per spec §1: fixed
/// at build time rather than threaded through every `Kernel` call, overridable
/// via the `P` environment variable at compile time (`const_env::from_env`),
/// falling back to 6 when unset.
#[const_env::from_env]
pub const P: usize = 6;

/// Maximum possible M2L/P2P interaction list length (27 colleagues minus self,
/// times at most 7 well-separated shells in the worst case geometry).
pub const MAX_LIST_LEN: usize = 189;
