//! Stochastic Schmidt-law star formation: cells above a density threshold
//! convert part of their mass into a star particle once per step. The
//! converted mass is quantized at `m_min` — a continuous mass below that
//! floor is promoted to it with probability proportional to how close it
//! came, rather than every cell losing an immeasurably small sliver of mass
//! on every step it clears the density threshold.

use rayon::prelude::*;

use crate::collaborators::particle::total_acceleration;
use crate::error::{Error, Result};
use crate::gravity::ExternalGravity;
use crate::hierarchy::Hierarchy;
use crate::patch::{Patch, Sandglass, DENSITY, ENERGY, METALS, MOMENTUM_X, MOMENTUM_Y, MOMENTUM_Z, PS};
use crate::rng::Lcg48;

/// Tunables for [`form_stars_in_patch`].
#[derive(Clone, Copy, Debug)]
pub struct StarFormationParams {
    /// Minimum gas density a cell needs before it is even considered.
    pub density_threshold: f64,
    /// Fraction of a cell's free-fall time's worth of mass converted, once
    /// a cell is chosen to form a star.
    pub efficiency: f64,
    /// Never remove more than this fraction of a cell's mass in one event,
    /// regardless of what the efficiency/free-fall-time ratio would
    /// otherwise imply.
    pub max_mass_fraction: f64,
    /// Newton's constant, in the code's unit system.
    pub gravitational_constant: f64,
    /// Minimum particle mass. A cell whose continuous Schmidt-law mass
    /// falls short of this is quantized up to `m_min` with probability
    /// `m_star / m_min`, and otherwise forms nothing this step.
    pub m_min: f64,
}

/// A freshly spawned star particle, local to the patch it was created in.
#[derive(Clone, Copy, Debug)]
pub struct NewParticle {
    pub cell: [usize; 3],
    pub mass: f64,
    pub velocity: [f64; 3],
    pub metal_fraction: f64,
    /// Self-potential gradient plus the external-gravity hook, sampled at
    /// the particle's birth position; see
    /// [`crate::collaborators::particle::total_acceleration`].
    pub acceleration: [f64; 3],
    pub birth_time: f64,
}

/// Runs the per-cell star-formation check over one patch's interior and
/// returns every particle it spawned (the hierarchy's particle ids are
/// assigned by the caller once the particle is registered elsewhere; this
/// function only decides *that* and *how much* mass converts).
///
/// Steps, per cell:
/// 1. Skip cells below the density threshold.
/// 2. Compute the free-fall time from the cell's density.
/// 3. Compute the continuous Schmidt-law mass `m_star = efficiency * dt *
///    rho * cell_volume / t_ff`.
/// 4. If `m_star < m_min`, promote it to `m_min` with probability
///    `m_star / m_min`; otherwise the cell forms nothing this step. A cell
///    whose continuous mass already clears `m_min` forms deterministically.
/// 5. Clamp the resulting gas-to-star mass fraction at `max_mass_fraction`.
/// 6. Subtract the converted mass (and its proportional momentum, thermal
///    energy, and metal mass) from the cell, and record a new particle
///    carrying that mass, the cell's bulk velocity, its metal mass
///    fraction, the assembled birth acceleration, and the current time.
#[allow(clippy::too_many_arguments)]
pub fn form_stars_in_patch(
    hierarchy: &mut Hierarchy,
    level: u32,
    patch_id: u32,
    sg: Sandglass,
    dt: f64,
    time: f64,
    cell_size: f64,
    gravity: Option<&ExternalGravity>,
    params: StarFormationParams,
    rng: &mut Lcg48,
) -> Result<Vec<NewParticle>> {
    form_stars_on_patch(
        hierarchy.real_patch_mut(level, patch_id)?,
        sg,
        dt,
        time,
        cell_size,
        gravity,
        params,
        rng,
    )
}

/// Level-wide star-formation sweep: every real patch is checked in parallel,
/// one rayon task per patch. Each patch draws from its own stream, seeded
/// from `(base_seed, patch_id)` rather than from a rayon worker index, so
/// the set of particles formed is independent of how many threads the
/// sweep happens to run on.
#[allow(clippy::too_many_arguments)]
pub fn form_stars_in_level(
    hierarchy: &mut Hierarchy,
    level: u32,
    sg: Sandglass,
    dt: f64,
    time: f64,
    cell_size: f64,
    gravity: Option<&ExternalGravity>,
    params: StarFormationParams,
    base_seed: u64,
) -> Result<Vec<(u32, NewParticle)>> {
    if params.efficiency < 0.0 || params.efficiency > 1.0 {
        return Err(Error::Precondition {
            what: "star formation efficiency must be in [0, 1]".into(),
            value: params.efficiency.to_string(),
        });
    }
    hierarchy
        .par_real_patches_mut(level)?
        .map(|(patch_id, patch)| -> Result<Vec<(u32, NewParticle)>> {
            let mut rng = Lcg48::new(base_seed, patch_id);
            let spawned = form_stars_on_patch(patch, sg, dt, time, cell_size, gravity, params, &mut rng)?;
            Ok(spawned.into_iter().map(|p| (patch_id, p)).collect())
        })
        .collect::<Result<Vec<_>>>()
        .map(|per_patch| per_patch.into_iter().flatten().collect())
}

/// Gradient of the patch's own solved potential at cell `(i, j, k)`: a
/// two-point central difference against interior neighbors, falling back to
/// a one-sided difference at a patch edge where [`Patch::pot`] (interior
/// only, no ghost halo) has no neighbor to read. `None` (no potential
/// solved on this patch/sandglass) contributes nothing.
fn self_potential_gradient(patch: &Patch, sg: Sandglass, i: usize, j: usize, k: usize, cell_size: f64) -> [f64; 3] {
    let idx = |i: usize, j: usize, k: usize| (k * PS + j) * PS + i;
    let pot = match patch.pot(sg) {
        Some(pot) => pot,
        None => return [0.0, 0.0, 0.0],
    };
    let axis_gradient = |lo: Option<f64>, here: f64, hi: Option<f64>| match (lo, hi) {
        (Some(lo), Some(hi)) => (hi - lo) / (2.0 * cell_size),
        (Some(lo), None) => (here - lo) / cell_size,
        (None, Some(hi)) => (hi - here) / cell_size,
        (None, None) => 0.0,
    };
    let here = pot[idx(i, j, k)];
    [
        axis_gradient(i.checked_sub(1).map(|lo| pot[idx(lo, j, k)]), here, (i + 1 < PS).then(|| pot[idx(i + 1, j, k)])),
        axis_gradient(j.checked_sub(1).map(|lo| pot[idx(i, lo, k)]), here, (j + 1 < PS).then(|| pot[idx(i, j + 1, k)])),
        axis_gradient(k.checked_sub(1).map(|lo| pot[idx(i, j, lo)]), here, (k + 1 < PS).then(|| pot[idx(i, j, k + 1)])),
    ]
}

#[allow(clippy::too_many_arguments)]
fn form_stars_on_patch(
    patch: &mut Patch,
    sg: Sandglass,
    dt: f64,
    time: f64,
    cell_size: f64,
    gravity: Option<&ExternalGravity>,
    params: StarFormationParams,
    rng: &mut Lcg48,
) -> Result<Vec<NewParticle>> {
    if params.efficiency < 0.0 || params.efficiency > 1.0 {
        return Err(Error::Precondition {
            what: "star formation efficiency must be in [0, 1]".into(),
            value: params.efficiency.to_string(),
        });
    }
    let mut spawned = Vec::new();
    let cell_volume = cell_size * cell_size * cell_size;
    let corner = patch.corner_phys(cell_size);

    for i in 0..PS {
        for j in 0..PS {
            for k in 0..PS {
                let rho = patch.cell(sg, DENSITY, i, j, k);
                if rho < params.density_threshold {
                    continue; // step 1
                }

                let inv_t_ff = (32.0 * params.gravitational_constant / (3.0 * std::f64::consts::PI)).sqrt() * rho.sqrt(); // step 2
                let m_star_raw = params.efficiency * dt * rho * cell_volume * inv_t_ff; // step 3

                let m_star = if m_star_raw < params.m_min {
                    if rng.next_f64() >= m_star_raw / params.m_min {
                        continue; // step 4: quantization draw lost
                    }
                    params.m_min
                } else {
                    m_star_raw
                };

                let fraction = (m_star / (rho * cell_volume)).min(params.max_mass_fraction); // step 5

                let (px, py, pz) = (
                    patch.cell(sg, MOMENTUM_X, i, j, k),
                    patch.cell(sg, MOMENTUM_Y, i, j, k),
                    patch.cell(sg, MOMENTUM_Z, i, j, k),
                );
                let velocity = [px / rho, py / rho, pz / rho];
                let metals = patch.cell(sg, METALS, i, j, k);
                let metal_fraction = metals / rho;

                let converted_mass = fraction * rho * cell_volume; // step 6
                let energy = patch.cell(sg, ENERGY, i, j, k);
                patch.set_cell(sg, DENSITY, i, j, k, rho - converted_mass / cell_volume);
                patch.set_cell(sg, MOMENTUM_X, i, j, k, px * (1.0 - fraction));
                patch.set_cell(sg, MOMENTUM_Y, i, j, k, py * (1.0 - fraction));
                patch.set_cell(sg, MOMENTUM_Z, i, j, k, pz * (1.0 - fraction));
                patch.set_cell(sg, ENERGY, i, j, k, energy * (1.0 - fraction));
                patch.set_cell(sg, METALS, i, j, k, metals * (1.0 - fraction));

                let position = [
                    corner[0] + cell_size * (i as f64 + 0.5),
                    corner[1] + cell_size * (j as f64 + 0.5),
                    corner[2] + cell_size * (k as f64 + 0.5),
                ];
                let gradient = self_potential_gradient(patch, sg, i, j, k, cell_size);
                let acceleration = total_acceleration(gravity, gradient, position, time);

                spawned.push(NewParticle {
                    cell: [i, j, k],
                    mass: converted_mass,
                    velocity,
                    metal_fraction,
                    acceleration,
                    birth_time: time,
                });
            }
        }
    }
    Ok(spawned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::Hierarchy;

    fn params() -> StarFormationParams {
        StarFormationParams {
            density_threshold: 1.0,
            efficiency: 1.0,
            max_mass_fraction: 0.5,
            gravitational_constant: 1.0,
            m_min: 1.0,
        }
    }

    #[test]
    fn cells_below_threshold_never_form_stars() {
        let mut h = Hierarchy::new(0);
        let p = h.alloc_root([0, 0, 0], 0).unwrap();
        let mut rng = Lcg48::new(1, 0);
        let spawned = form_stars_in_patch(&mut h, 0, p, 0, 1.0, 0.0, 1.0, None, params(), &mut rng).unwrap();
        assert!(spawned.is_empty());
    }

    #[test]
    fn forming_a_star_conserves_mass_between_gas_and_particle() {
        let mut h = Hierarchy::new(0);
        let p = h.alloc_root([0, 0, 0], 0).unwrap();
        h.real_patch_mut(0, p).unwrap().set_cell(0, DENSITY, 0, 0, 0, 100.0);
        h.real_patch_mut(0, p).unwrap().set_cell(0, ENERGY, 0, 0, 0, 50.0);

        // efficiency = 1.0 and a huge dt push the continuous Schmidt-law
        // mass far above m_min, so this cell forms deterministically and the
        // max_mass_fraction clamp is what actually bounds the conversion.
        let mut rng = Lcg48::new(0, 0);
        let spawned = form_stars_in_patch(&mut h, 0, p, 0, 1e6, 0.0, 1.0, None, params(), &mut rng).unwrap();

        assert_eq!(spawned.len(), 1);
        let mass = spawned[0].mass;
        assert!((mass - 50.0).abs() < 1e-9); // max_mass_fraction = 0.5 of 100.0
        let remaining = h.real_patch(0, p).unwrap().cell(0, DENSITY, 0, 0, 0);
        assert!((remaining - 50.0).abs() < 1e-9);
        assert_eq!(spawned[0].birth_time, 0.0);
    }

    #[test]
    fn mass_fraction_matches_schmidt_law_closed_form() {
        let mut h = Hierarchy::new(0);
        let p = h.alloc_root([0, 0, 0], 0).unwrap();
        h.real_patch_mut(0, p).unwrap().set_cell(0, DENSITY, 0, 0, 0, 100.0);
        h.real_patch_mut(0, p).unwrap().set_cell(0, ENERGY, 0, 0, 0, 50.0);

        let params = StarFormationParams {
            density_threshold: 10.0,
            efficiency: 0.01,
            max_mass_fraction: 1.0,
            gravitational_constant: 1.0,
            m_min: 1.0,
        };
        // m_star (~18.4) clears m_min (1.0) outright, so the formation is
        // deterministic and the seed does not matter.
        let mut rng = Lcg48::new(42, 0);
        let spawned = form_stars_in_patch(&mut h, 0, p, 0, 1.0, 0.0, 1.0, None, params, &mut rng).unwrap();

        assert_eq!(spawned.len(), 1);
        let expected_fraction =
            params.efficiency * (32.0 * params.gravitational_constant / (3.0 * std::f64::consts::PI)).sqrt() * 100f64.sqrt();
        let expected_mass = expected_fraction * 100.0;
        assert!((spawned[0].mass - expected_mass).abs() < 1e-6);
    }

    #[test]
    fn sub_m_min_cells_are_quantized_by_a_probabilistic_draw() {
        // efficiency small enough that the continuous mass (~1.8e-3) falls
        // far short of m_min = 1.0: this cell only forms a star on a draw.
        let small = StarFormationParams {
            density_threshold: 1.0,
            efficiency: 1e-6,
            max_mass_fraction: 0.5,
            gravitational_constant: 1.0,
            m_min: 1.0,
        };

        let mut seed = 0u64;
        let spawned = loop {
            let mut h = Hierarchy::new(0);
            let p = h.alloc_root([0, 0, 0], 0).unwrap();
            h.real_patch_mut(0, p).unwrap().set_cell(0, DENSITY, 0, 0, 0, 100.0);
            h.real_patch_mut(0, p).unwrap().set_cell(0, ENERGY, 0, 0, 0, 50.0);
            let mut rng = Lcg48::new(seed, 0);
            let result = form_stars_in_patch(&mut h, 0, p, 0, 1.0, 0.0, 1.0, None, small, &mut rng).unwrap();
            if !result.is_empty() {
                break result;
            }
            seed += 1;
            assert!(seed < 10_000, "no seed produced a quantized star formation event");
        };
        assert!((spawned[0].mass - small.m_min).abs() < 1e-9);
    }

    #[test]
    fn level_sweep_matches_per_patch_seeding_and_is_order_independent() {
        let mut h = Hierarchy::new(0);
        let a = h.alloc_root([0, 0, 0], 0).unwrap();
        let b = h.alloc_root([1, 0, 0], 0).unwrap();
        for p in [a, b] {
            h.real_patch_mut(0, p).unwrap().set_cell(0, DENSITY, 0, 0, 0, 100.0);
            h.real_patch_mut(0, p).unwrap().set_cell(0, ENERGY, 0, 0, 0, 50.0);
        }

        let spawned = form_stars_in_level(&mut h, 0, 0, 1e6, 0.0, 1.0, None, params(), 7).unwrap();

        // Re-derive what each patch should have produced on its own stream
        // and check the level sweep agrees cell-for-cell, independent of
        // which order rayon happened to visit the two patches in.
        for (patch_id, particle) in &spawned {
            let mut rng = Lcg48::new(7, *patch_id);
            let mut solo = Hierarchy::new(0);
            let q = solo.alloc_root([0, 0, 0], 0).unwrap();
            solo.real_patch_mut(0, q).unwrap().set_cell(0, DENSITY, 0, 0, 0, 100.0);
            solo.real_patch_mut(0, q).unwrap().set_cell(0, ENERGY, 0, 0, 0, 50.0);
            let solo_spawned = form_stars_in_patch(&mut solo, 0, q, 0, 1e6, 0.0, 1.0, None, params(), &mut rng).unwrap();
            assert_eq!(solo_spawned.len(), 1);
            assert!((solo_spawned[0].mass - particle.mass).abs() < 1e-9);
        }
    }
}
