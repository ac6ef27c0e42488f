//! Wall-clock instrumentation.
//!
//! Generalizes the original engine's `logger::startTimer("P2M")` /
//! `logger::stopTimer("P2M")` pairs (see `examples/original_source/helmholtz/fmm.h`)
//! away from a process-wide singleton logger and into a stack-discipline closure
//! wrapper over `log` + `std::time::Instant`, so any `log` subscriber the embedding
//! application installs sees the timing without this crate depending on which one.

use std::time::Instant;

/// Run `body`, logging its wall-clock duration under `name` at debug level.
pub fn time_block<T>(name: &str, body: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = body();
    log::debug!("{name} took {:?}", start.elapsed());
    result
}
