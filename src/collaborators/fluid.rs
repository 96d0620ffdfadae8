//! `FluidIntegrator` collaborator interface plus a reference implementation
//! built around ideal-gas conserved/primitive conversions and flux vectors.
//! The reference integrator itself is a trivial first-order donor-cell
//! scheme rather than a real Riemann solver: it picks the upwind state by
//! the sign of the face-normal velocity and evaluates that state's flux
//! vector directly, which is enough to drive conservative fix-up and
//! exchange tests without importing real shock-capturing numerics.

use crate::error::{Error, Result};
use crate::patch::{DENSITY, ENERGY, MOMENTUM_X, MOMENTUM_Y, MOMENTUM_Z, NUM_FLUID_VARS};

/// The five conserved Euler variables, in the same order `patch.rs` lays
/// out `DENSITY, MOMENTUM_X, MOMENTUM_Y, MOMENTUM_Z, ENERGY`.
#[derive(Clone, Copy, Debug)]
pub struct Conserved([f64; NUM_FLUID_VARS]);

/// Primitive variables: density, three velocity components, gas pressure.
#[derive(Clone, Copy, Debug)]
pub struct Primitive([f64; NUM_FLUID_VARS]);

impl Conserved {
    pub fn from_slice(cons: &[f64]) -> Self {
        Self(std::array::from_fn(|v| cons[v]))
    }

    pub fn write_to_slice(&self, cons: &mut [f64]) {
        cons[..NUM_FLUID_VARS].copy_from_slice(&self.0);
    }

    pub fn mass_density(&self) -> f64 {
        self.0[DENSITY]
    }

    pub fn momentum(&self, axis: usize) -> f64 {
        self.0[MOMENTUM_X + axis]
    }

    pub fn momentum_squared(&self) -> f64 {
        (0..3).map(|a| self.momentum(a).powi(2)).sum()
    }

    pub fn energy_density(&self) -> f64 {
        self.0[ENERGY]
    }

    pub fn to_primitive(&self, gamma_law_index: f64) -> Result<Primitive> {
        let rho = self.mass_density();
        if rho < 0.0 {
            return Err(Error::NumericalGuard {
                level: 0,
                patch: 0,
                cell: (0, 0, 0),
                what: format!("negative mass density {} in cons_to_prim", rho),
            });
        }
        let kinetic = 0.5 * self.momentum_squared() / rho;
        let thermal = self.energy_density() - kinetic;
        let pressure = thermal * (gamma_law_index - 1.0);
        if pressure < 0.0 {
            return Err(Error::NumericalGuard {
                level: 0,
                patch: 0,
                cell: (0, 0, 0),
                what: format!("negative gas pressure {} in cons_to_prim", pressure),
            });
        }
        let mut out = [0.0; NUM_FLUID_VARS];
        out[DENSITY] = rho;
        for axis in 0..3 {
            out[MOMENTUM_X + axis] = self.momentum(axis) / rho;
        }
        out[ENERGY] = pressure;
        Ok(Primitive(out))
    }
}

impl Primitive {
    pub fn from_slice(prim: &[f64]) -> Self {
        Self(std::array::from_fn(|v| prim[v]))
    }

    pub fn mass_density(&self) -> f64 {
        self.0[DENSITY]
    }

    pub fn velocity(&self, axis: usize) -> f64 {
        self.0[MOMENTUM_X + axis]
    }

    pub fn velocity_squared(&self) -> f64 {
        (0..3).map(|a| self.velocity(a).powi(2)).sum()
    }

    pub fn gas_pressure(&self) -> f64 {
        self.0[ENERGY]
    }

    pub fn sound_speed_squared(&self, gamma_law_index: f64) -> f64 {
        gamma_law_index * self.gas_pressure() / self.mass_density()
    }

    pub fn outer_wavespeeds(&self, axis: usize, gamma_law_index: f64) -> (f64, f64) {
        let cs = self.sound_speed_squared(gamma_law_index).sqrt();
        let vn = self.velocity(axis);
        (vn - cs, vn + cs)
    }

    pub fn to_conserved(&self, gamma_law_index: f64) -> Conserved {
        let rho = self.mass_density();
        let vsq = self.velocity_squared();
        let mut out = [0.0; NUM_FLUID_VARS];
        out[DENSITY] = rho;
        for axis in 0..3 {
            out[MOMENTUM_X + axis] = rho * self.velocity(axis);
        }
        out[ENERGY] = rho * vsq * 0.5 + self.gas_pressure() / (gamma_law_index - 1.0);
        Conserved(out)
    }

    pub fn flux_vector(&self, axis: usize, gamma_law_index: f64) -> Conserved {
        let pg = self.gas_pressure();
        let vn = self.velocity(axis);
        let u = self.to_conserved(gamma_law_index);
        let mut out = [0.0; NUM_FLUID_VARS];
        out[DENSITY] = u.mass_density() * vn;
        for a in 0..3 {
            out[MOMENTUM_X + a] = u.momentum(a) * vn + if a == axis { pg } else { 0.0 };
        }
        out[ENERGY] = u.energy_density() * vn + pg * vn;
        Conserved(out)
    }
}

/// A collaborator that turns a pair of neighboring cell states into a
/// single-axis flux vector and reports a maximum signal speed for CFL
/// timestep selection.
pub trait FluidIntegrator {
    fn face_flux(&self, left: &[f64], right: &[f64], axis: usize) -> Result<[f64; NUM_FLUID_VARS]>;
    fn max_signal_speed(&self, state: &[f64]) -> Result<f64>;
}

/// The reference collaborator: ideal-gas conserved/primitive conversions
/// plus a donor-cell (upwind-by-sign) flux rather than a real Riemann
/// solver.
pub struct Euler {
    pub gamma_law_index: f64,
}

impl FluidIntegrator for Euler {
    fn face_flux(&self, left: &[f64], right: &[f64], axis: usize) -> Result<[f64; NUM_FLUID_VARS]> {
        let pl = Conserved::from_slice(left).to_primitive(self.gamma_law_index)?;
        let pr = Conserved::from_slice(right).to_primitive(self.gamma_law_index)?;
        let vn = 0.5 * (pl.velocity(axis) + pr.velocity(axis));
        let upwind = if vn >= 0.0 { pl } else { pr };
        Ok(upwind.flux_vector(axis, self.gamma_law_index).0)
    }

    fn max_signal_speed(&self, state: &[f64]) -> Result<f64> {
        let p = Conserved::from_slice(state).to_primitive(self.gamma_law_index)?;
        Ok(p.velocity_squared().sqrt() + p.sound_speed_squared(self.gamma_law_index).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(rho: f64, vx: f64, pressure: f64, gamma: f64) -> [f64; NUM_FLUID_VARS] {
        Primitive::from_slice(&[rho, vx, 0.0, 0.0, pressure])
            .to_conserved(gamma)
            .0
    }

    #[test]
    fn round_trips_through_primitive_and_back() {
        let gamma = 5.0 / 3.0;
        let cons = state(1.2, 0.3, 0.8, gamma);
        let prim = Conserved::from_slice(&cons).to_primitive(gamma).unwrap();
        let back = prim.to_conserved(gamma);
        for v in 0..NUM_FLUID_VARS {
            assert!((back.0[v] - cons[v]).abs() < 1e-12);
        }
    }

    #[test]
    fn face_flux_picks_the_upwind_state() {
        let gamma = 5.0 / 3.0;
        let euler = Euler { gamma_law_index: gamma };
        let moving_right = state(1.0, 2.0, 1.0, gamma);
        let still = state(1.0, 0.0, 1.0, gamma);
        let flux_mass = euler.face_flux(&moving_right, &still, 0).unwrap()[DENSITY];
        let prim = Conserved::from_slice(&moving_right).to_primitive(gamma).unwrap();
        assert!((flux_mass - prim.mass_density() * prim.velocity(0)).abs() < 1e-12);
    }

    #[test]
    fn negative_density_is_rejected() {
        let gamma = 5.0 / 3.0;
        let euler = Euler { gamma_law_index: gamma };
        let bad = [-1.0, 0.0, 0.0, 0.0, 1.0];
        assert!(euler.max_signal_speed(&bad).is_err());
    }
}
