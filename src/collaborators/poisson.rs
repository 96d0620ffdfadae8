//! `PoissonSolver` collaborator interface plus a reference Jacobi
//! relaxation, sufficient to exercise the `PotForPoisson`/`PotAfterRefine`
//! exchange modes without a real multigrid solver.

use crate::error::Result;
use crate::patch::PS;

/// Solves `∇²φ = 4πGρ` on one patch's interior, given a fixed ghost halo
/// of `φ` already filled by a `PotForPoisson` exchange.
pub trait PoissonSolver {
    /// Runs one relaxation pass over `pot[..]` using `density[..]` as the
    /// source term, both laid out (k, j, i)-major over `PS` interior cells
    /// plus a one-cell ghost halo on every side (so each array is
    /// `(PS+2)^3` long). Returns the L2 residual norm reached.
    fn relax(&self, pot: &mut [f64], density: &[f64], cell_size: f64) -> Result<f64>;
}

/// Bounded Jacobi relaxation: `self.max_iterations` full sweeps, each cell
/// updated from the unweighted average of its six face neighbors minus the
/// local source term, a standard (if slow-converging) reference multigrid
/// smoother.
pub struct JacobiRelaxation {
    pub max_iterations: usize,
    pub gravitational_constant: f64,
}

const HALO: usize = PS + 2;

fn idx(i: usize, j: usize, k: usize) -> usize {
    (k * HALO + j) * HALO + i
}

impl PoissonSolver for JacobiRelaxation {
    fn relax(&self, pot: &mut [f64], density: &[f64], cell_size: f64) -> Result<f64> {
        debug_assert_eq!(pot.len(), HALO * HALO * HALO);
        debug_assert_eq!(density.len(), HALO * HALO * HALO);

        let source_scale = 4.0 * std::f64::consts::PI * self.gravitational_constant * cell_size * cell_size;
        let mut residual = 0.0;

        for _ in 0..self.max_iterations {
            let previous = pot.to_vec();
            residual = 0.0;
            for i in 1..=PS {
                for j in 1..=PS {
                    for k in 1..=PS {
                        let neighbor_sum = previous[idx(i - 1, j, k)]
                            + previous[idx(i + 1, j, k)]
                            + previous[idx(i, j - 1, k)]
                            + previous[idx(i, j + 1, k)]
                            + previous[idx(i, j, k - 1)]
                            + previous[idx(i, j, k + 1)];
                        let source = source_scale * density[idx(i, j, k)];
                        let updated = (neighbor_sum - source) / 6.0;
                        residual += (updated - previous[idx(i, j, k)]).powi(2);
                        pot[idx(i, j, k)] = updated;
                    }
                }
            }
        }
        Ok(residual.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaxation_smooths_a_point_source_toward_a_well() {
        let mut pot = vec![0.0; HALO * HALO * HALO];
        let mut density = vec![0.0; HALO * HALO * HALO];
        let center = HALO / 2;
        density[idx(center, center, center)] = 1.0;

        let solver = JacobiRelaxation { max_iterations: 20, gravitational_constant: 1.0 };
        solver.relax(&mut pot, &density, 1.0).unwrap();

        let center_pot = pot[idx(center, center, center)];
        let corner_pot = pot[idx(1, 1, 1)];
        assert!(center_pot < corner_pot, "potential should deepen near the source");
    }

    #[test]
    fn residual_shrinks_across_successive_passes() {
        let mut pot = vec![0.0; HALO * HALO * HALO];
        let mut density = vec![0.1; HALO * HALO * HALO];
        let solver_few = JacobiRelaxation { max_iterations: 1, gravitational_constant: 1.0 };
        let first_residual = solver_few.relax(&mut pot, &density, 1.0).unwrap();

        let solver_more = JacobiRelaxation { max_iterations: 1, gravitational_constant: 1.0 };
        let second_residual = solver_more.relax(&mut pot, &density, 1.0).unwrap();
        assert!(second_residual <= first_residual);
    }
}
