//! External acceleration / potential hook.
//!
//! A simulation supplies an external gravity source (a point mass, a
//! background halo, a tidal field) as a pair of pure functions operating on
//! physical coordinates and a small bounded parameter array, rather than a
//! trait object: the hook is evaluated once per cell per substep, so it's
//! plain function pointers to avoid dynamic dispatch and
//! closures-capturing-state surprises in that hot loop.

use crate::error::{Error, Result};
use crate::patch::NUM_AUX_MAX;

/// Auxiliary parameters passed to an [`ExternalAccel`]/[`ExternalPot`] hook,
/// bounded at [`NUM_AUX_MAX`] entries so the hook call stays a fixed-size,
/// allocation-free argument list.
#[derive(Clone, Copy, Debug)]
pub struct AuxParams {
    values: [f64; NUM_AUX_MAX],
    len: usize,
}

impl AuxParams {
    pub fn new(values: &[f64]) -> Result<Self> {
        if values.len() > NUM_AUX_MAX {
            return Err(Error::Precondition {
                what: format!("aux params exceed NUM_AUX_MAX = {}", NUM_AUX_MAX),
                value: values.len().to_string(),
            });
        }
        let mut buf = [0.0; NUM_AUX_MAX];
        buf[..values.len()].copy_from_slice(values);
        Ok(Self { values: buf, len: values.len() })
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values[..self.len]
    }
}

/// `(x, y, z, time, aux) -> (ax, ay, az)`.
pub type ExternalAccel = fn([f64; 3], f64, &[f64]) -> [f64; 3];

/// `(x, y, z, time, aux) -> potential`.
pub type ExternalPot = fn([f64; 3], f64, &[f64]) -> f64;

/// The hook a simulation installs: both a gradient (acceleration) and a
/// potential evaluator for the same external source, plus the aux
/// parameters both are called with.
#[derive(Clone, Copy)]
pub struct ExternalGravity {
    pub accel: ExternalAccel,
    pub pot: ExternalPot,
    pub aux: AuxParams,
}

impl ExternalGravity {
    pub fn accel_at(&self, x: [f64; 3], time: f64) -> [f64; 3] {
        (self.accel)(x, time, self.aux.as_slice())
    }

    pub fn pot_at(&self, x: [f64; 3], time: f64) -> f64 {
        (self.pot)(x, time, self.aux.as_slice())
    }
}

/// A softened point mass (aux = `[mass, gx, gy, gz, softening_length]`): a
/// standard reference source for testing self-gravity coupling against a
/// known analytic field. `softening_length <= 0` disables softening
/// entirely rather than being clamped to zero, so a caller can request the
/// bare (singular at the origin) point-mass field explicitly.
pub fn plummer_accel(x: [f64; 3], _time: f64, aux: &[f64]) -> [f64; 3] {
    let (mass, gx, gy, gz, eps) = (aux[0], aux[1], aux[2], aux[3], aux[4]);
    let dx = x[0] - gx;
    let dy = x[1] - gy;
    let dz = x[2] - gz;
    let softening = if eps > 0.0 { eps * eps } else { 0.0 };
    let r2 = dx * dx + dy * dy + dz * dz + softening;
    let inv_r3 = r2.powf(-1.5);
    let scale = -mass * inv_r3;
    [dx * scale, dy * scale, dz * scale]
}

pub fn plummer_pot(x: [f64; 3], _time: f64, aux: &[f64]) -> f64 {
    let (mass, gx, gy, gz, eps) = (aux[0], aux[1], aux[2], aux[3], aux[4]);
    let dx = x[0] - gx;
    let dy = x[1] - gy;
    let dz = x[2] - gz;
    let softening = if eps > 0.0 { eps * eps } else { 0.0 };
    let r2 = dx * dx + dy * dy + dz * dz + softening;
    -mass / r2.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aux_params_reject_oversized_input() {
        let too_many = vec![0.0; NUM_AUX_MAX + 1];
        assert!(AuxParams::new(&too_many).is_err());
    }

    #[test]
    fn plummer_field_points_toward_the_mass() {
        let aux = AuxParams::new(&[1.0, 0.0, 0.0, 0.0, 0.1]).unwrap();
        let gravity = ExternalGravity {
            accel: plummer_accel,
            pot: plummer_pot,
            aux,
        };
        let a = gravity.accel_at([2.0, 0.0, 0.0], 0.0);
        assert!(a[0] < 0.0);
        assert_eq!(a[1], 0.0);
        assert_eq!(a[2], 0.0);
        assert!(gravity.pot_at([2.0, 0.0, 0.0], 0.0) < 0.0);
    }

    #[test]
    fn non_positive_softening_length_disables_softening() {
        let unsoftened = AuxParams::new(&[1.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let negative = AuxParams::new(&[1.0, 0.0, 0.0, 0.0, -5.0]).unwrap();
        let x = [2.0, 0.0, 0.0];
        assert_eq!(plummer_pot(x, 0.0, unsoftened.as_slice()), -0.5);
        assert_eq!(plummer_pot(x, 0.0, negative.as_slice()), -0.5);
    }

    #[test]
    fn potential_is_deeper_closer_to_the_mass() {
        let aux = AuxParams::new(&[1.0, 0.0, 0.0, 0.0, 0.1]).unwrap();
        let gravity = ExternalGravity {
            accel: plummer_accel,
            pot: plummer_pot,
            aux,
        };
        let near = gravity.pot_at([1.0, 0.0, 0.0], 0.0);
        let far = gravity.pot_at([5.0, 0.0, 0.0], 0.0);
        assert!(near < far);
    }
}
