//! Crate-wide error type.
//!
//! Per spec §7, failures fall into three buckets: programming invariant violations
//! (propagated, never silently swallowed), protocol mismatches (handled inline by
//! the request service via `NullTag`, not surfaced as `Err`), and numerical edge
//! cases (sanitized away, not errors at all). `FmmError` covers the first bucket;
//! the latter two are handled at their call sites without an error type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FmmError {
    #[error("tree invariant violated: {0}")]
    Invariant(String),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("MPI communication failed: {0}")]
    Communication(String),
}

pub type Result<T> = std::result::Result<T, FmmError>;
