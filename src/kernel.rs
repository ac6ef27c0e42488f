//! Kernel abstraction.
//!
//! The translation operators themselves are out of scope (spec §1): this module
//! gives them trait-level signatures, grounded in the free-function call sites of
//! `examples/original_source/helmholtz/fmm.h` (`kernel::P2M`, `::M2M`, `::M2L`,
//! `::L2L`, `::L2P`, `::P2P`), so the traversal driver has something concrete to
//! dispatch through end to end. `PointMultipole` is the one shipped implementation:
//! a monopole-only (`P`-truncated-to-its-first-term) expansion, exact for
//! translations and good enough, at a loose tolerance, to exercise the accuracy
//! test in spec §8.

use num_complex::Complex64;

use crate::body::Body;
use crate::cell::Cell;
use crate::constants::P;

/// The operations a traversal pass dispatches through. Implementations are free
/// to use however many of the `P` expansion coefficients they need; `PointMultipole`
/// only uses the first.
pub trait Kernel: Sync {
    /// Particle-to-multipole: accumulate `bodies` into `cell.m`.
    fn p2m(&self, cell: &mut Cell, bodies: &[Body]);

    /// Multipole-to-multipole: translate `child.m` into `parent.m`.
    fn m2m(&self, parent: &mut Cell, child: &Cell);

    /// Multipole-to-local: translate `source.m` into `target.l`.
    fn m2l(&self, target: &mut Cell, source: &Cell);

    /// Local-to-local: translate `parent.l` into `child.l`.
    fn l2l(&self, child: &mut Cell, parent: &Cell);

    /// Local-to-particle: expand `cell.l` onto `bodies`' target accumulators.
    fn l2p(&self, cell: &Cell, bodies: &mut [Body]);

    /// Particle-to-particle: direct summation of `source` bodies onto `target`.
    fn p2p(&self, target: &mut [Body], source: &[Body]);

    /// Refresh any quadrature table this kernel needs before a given pass.
    /// A no-op for kernels, like `PointMultipole`, that need none.
    fn refresh_quadrature(&self, _pass: &str) {}
}

/// Truncated point-charge (monopole) expansion: `cell.m[0]` holds the total
/// source strength, `cell.l[0]` the accumulated potential contribution. Exact
/// for M2M/L2L (pure translation of a point value); M2L/P2P degrade gracefully
/// with separation.
pub struct PointMultipole;

impl Kernel for PointMultipole {
    fn p2m(&self, cell: &mut Cell, bodies: &[Body]) {
        let mut total = Complex64::new(0.0, 0.0);
        for b in bodies {
            total += Complex64::new(b.src, 0.0);
        }
        cell.m[0] = total;
    }

    fn m2m(&self, parent: &mut Cell, child: &Cell) {
        parent.m[0] += child.m[0];
    }

    fn m2l(&self, target: &mut Cell, source: &Cell) {
        let mut d2 = 0.0;
        for i in 0..3 {
            let d = target.x[i] - source.x[i];
            d2 += d * d;
        }
        if d2 > 0.0 {
            target.l[0] += source.m[0] / d2.sqrt();
        }
    }

    fn l2l(&self, child: &mut Cell, parent: &Cell) {
        child.l[0] += parent.l[0];
    }

    fn l2p(&self, cell: &Cell, bodies: &mut [Body]) {
        for b in bodies {
            b.trg[0] += cell.l[0].re;
        }
    }

    fn p2p(&self, target: &mut [Body], source: &[Body]) {
        for t in target.iter_mut() {
            for s in source {
                let mut d2 = 0.0;
                for i in 0..3 {
                    let d = t.x[i] - s.x[i];
                    d2 += d * d;
                }
                let inv_r = if d2 > 0.0 { 1.0 / d2.sqrt() } else { 0.0 };
                t.trg[0] += s.src * inv_r;
            }
        }
    }
}

const _: () = assert!(P >= 1, "expansion order must hold at least a monopole term");

#[cfg(test)]
mod tests {
    use super::*;

    fn body_at(x: [f64; 3], src: f64) -> Body {
        Body {
            x,
            src,
            trg: [0.0; 4],
            ibody: 0,
            irank: 0,
        }
    }

    #[test]
    fn p2m_sums_source_strengths() {
        let kernel = PointMultipole;
        let mut cell = Cell::default();
        let bodies = vec![body_at([0.0; 3], 1.0), body_at([0.0; 3], 2.5)];
        kernel.p2m(&mut cell, &bodies);
        assert_eq!(cell.m[0].re, 3.5);
    }

    #[test]
    fn p2p_self_interaction_has_no_singularity() {
        let kernel = PointMultipole;
        let mut target = vec![body_at([0.0; 3], 1.0)];
        let source = target.clone();
        kernel.p2p(&mut target, &source);
        assert_eq!(target[0].trg[0], 0.0);
    }
}
