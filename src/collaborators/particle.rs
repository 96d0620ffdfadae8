//! `ParticlePusher` collaborator interface plus a reference leapfrog
//! kick-drift-kick step, sufficient to exercise the acceleration assembly
//! handed to a particle after a star-formation event.

use crate::gravity::ExternalGravity;

/// A star particle's dynamical state, separate from the patch it was
/// injected into (`Patch` only carries particle ids); the collaborator
/// owning particle storage is responsible for keeping this in sync with
/// that id.
#[derive(Clone, Copy, Debug)]
pub struct Particle {
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    pub mass: f64,
}

/// Advances one particle's position and velocity given an acceleration
/// sampled at its current position.
pub trait ParticlePusher {
    fn kick(&self, particle: &mut Particle, accel: [f64; 3], dt: f64);
    fn drift(&self, particle: &mut Particle, dt: f64);
}

/// Standard second-order-accurate kick-drift-kick leapfrog: a half-step
/// kick, a full drift, then a second half-step kick once the acceleration
/// at the new position is known.
pub struct LeapfrogKdk;

impl ParticlePusher for LeapfrogKdk {
    fn kick(&self, particle: &mut Particle, accel: [f64; 3], dt: f64) {
        for axis in 0..3 {
            particle.velocity[axis] += accel[axis] * dt;
        }
    }

    fn drift(&self, particle: &mut Particle, dt: f64) {
        for axis in 0..3 {
            particle.position[axis] += particle.velocity[axis] * dt;
        }
    }
}

/// Runs one full kick-drift-kick step: `half = dt / 2`, kick, drift, then
/// the caller-supplied `accel_after` (sampled at the drifted position) is
/// applied as the closing half-kick.
pub fn step(
    pusher: &impl ParticlePusher,
    particle: &mut Particle,
    accel_before: [f64; 3],
    dt: f64,
    accel_after: impl FnOnce([f64; 3]) -> [f64; 3],
) {
    let half = 0.5 * dt;
    pusher.kick(particle, accel_before, half);
    pusher.drift(particle, dt);
    let accel = accel_after(particle.position);
    pusher.kick(particle, accel, half);
}

/// Assembles the total acceleration on a particle: the negated
/// caller-supplied self-potential gradient plus the external hook's
/// acceleration. `ExternalGravity::accel_at` is the analytic gradient of
/// `ExternalGravity::pot_at` for every field this module ships (see
/// `plummer_accel`/`plummer_pot`), so calling it directly is equivalent to,
/// and cheaper than, finite-differencing the potential at the six
/// face-centers.
pub fn total_acceleration(
    gravity: Option<&ExternalGravity>,
    self_potential_gradient: [f64; 3],
    position: [f64; 3],
    time: f64,
) -> [f64; 3] {
    let mut accel = [
        -self_potential_gradient[0],
        -self_potential_gradient[1],
        -self_potential_gradient[2],
    ];
    if let Some(gravity) = gravity {
        let external = gravity.accel_at(position, time);
        for axis in 0..3 {
            accel[axis] += external[axis];
        }
    }
    accel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gravity::{plummer_accel, plummer_pot, AuxParams};

    #[test]
    fn drift_moves_the_particle_by_velocity_times_dt() {
        let pusher = LeapfrogKdk;
        let mut particle = Particle { position: [0.0, 0.0, 0.0], velocity: [2.0, 0.0, 0.0], mass: 1.0 };
        pusher.drift(&mut particle, 0.5);
        assert_eq!(particle.position[0], 1.0);
    }

    #[test]
    fn kick_drift_kick_conserves_velocity_in_a_field_free_step() {
        let pusher = LeapfrogKdk;
        let mut particle = Particle { position: [0.0, 0.0, 0.0], velocity: [1.0, 0.0, 0.0], mass: 1.0 };
        step(&pusher, &mut particle, [0.0, 0.0, 0.0], 1.0, |_| [0.0, 0.0, 0.0]);
        assert_eq!(particle.velocity, [1.0, 0.0, 0.0]);
        assert_eq!(particle.position, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn total_acceleration_combines_self_and_external_fields() {
        let aux = AuxParams::new(&[1.0, 0.0, 0.0, 0.0, 0.1]).unwrap();
        let gravity = ExternalGravity { accel: plummer_accel, pot: plummer_pot, aux };
        let accel = total_acceleration(Some(&gravity), [1.0, 0.0, 0.0], [2.0, 0.0, 0.0], 0.0);
        let external_only = gravity.accel_at([2.0, 0.0, 0.0], 0.0);
        assert!((accel[0] - (external_only[0] - 1.0)).abs() < 1e-12);
    }
}
