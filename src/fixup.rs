//! Fix-up engine.
//!
//! Reconciles fine and coarse data at coarse-fine boundaries after a fine
//! level has advanced past its coarser parent: flux correction applies the
//! mismatch between a coarse patch's own boundary flux estimate and the
//! fine-summed flux now sitting in its flux register; restriction then
//! overwrites every coarse cell shadowed by a refined child with the block
//! average of that child's data. A final positivity pass repairs negative
//! densities or pressures either step can produce from roundoff near a
//! steep gradient.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::geometry::{self, NUM_FACES};
use crate::hierarchy::Hierarchy;
use crate::patch::{Patch, Sandglass, DENSITY, ENERGY, MOMENTUM_X, MOMENTUM_Y, MOMENTUM_Z, NUM_FIELDS, PS, SonLink};

/// Floors applied by [`enforce_positivity`].
#[derive(Clone, Copy, Debug)]
pub struct Floors {
    pub density: f64,
    pub pressure: f64,
    pub gamma_law_index: f64,
}

/// Whether a negative-density clamp is active for flux correction: when
/// `Some`, a cell whose corrected density would fall below the floor is
/// left at its pre-correction density instead (density only; every other
/// variable in that cell still updates unconditionally).
pub type DensityClamp = Option<f64>;

/// The single-patch, single-face correction applied by both [`correct_flux`]
/// and the level-wide [`correct_all_fluxes`] sweep: subtracts the coarse
/// patch's own boundary-flux estimate and replaces it with the true
/// fine-summed flux sitting in `patch.flux(face)`.
fn correct_flux_on_patch(patch: &mut Patch, face: usize, sg: Sandglass, dt: f64, cell_size: f64, clamp: DensityClamp) -> Result<()> {
    const AREA_RATIO: f64 = 0.25; // four refinement-ratio-2 fine faces per coarse face in 3D
    let sign = geometry::face_sign(face);
    let boundary_i = if geometry::face_is_low(face) { 0 } else { PS - 1 };

    let flux = patch
        .flux(face)
        .ok_or(Error::Precondition {
            what: "coarse patch has no flux register on the requested face".into(),
            value: face.to_string(),
        })?
        .to_vec();

    for p in 0..PS {
        for q in 0..PS {
            let (i, j, k) = geometry::face_cell(face, boundary_i, p, q);
            let density_correction = sign * AREA_RATIO * flux[DENSITY * PS * PS + p * PS + q] * dt / cell_size;
            let corrected_density = patch.cell(sg, DENSITY, i, j, k) + density_correction;
            let density_update_allowed = match clamp {
                Some(floor) => corrected_density >= floor,
                None => true,
            };
            if density_update_allowed {
                patch.set_cell(sg, DENSITY, i, j, k, corrected_density);
            }
            for v in 0..NUM_FIELDS {
                if v == DENSITY {
                    continue; // handled above, under the clamp
                }
                let correction = sign * AREA_RATIO * flux[v * PS * PS + p * PS + q] * dt / cell_size;
                let updated = patch.cell(sg, v, i, j, k) + correction;
                patch.set_cell(sg, v, i, j, k, updated); // non-density variables update unconditionally
            }
        }
    }
    patch.free_flux(face); // consumed; the next substep starts its registers fresh
    Ok(())
}

/// Corrects a single patch's single face; called directly by single-step
/// demos and tests, and wrapped by [`correct_all_fluxes`] for a whole level.
pub fn correct_flux(
    hierarchy: &mut Hierarchy,
    coarse_level: u32,
    coarse_id: u32,
    face: usize,
    sg: Sandglass,
    dt: f64,
    cell_size: f64,
) -> Result<()> {
    correct_flux_on_patch(hierarchy.real_patch_mut(coarse_level, coarse_id)?, face, sg, dt, cell_size, None)
}

/// Level-wide flux correction sweep: every real patch's allocated flux
/// registers are corrected in parallel, one rayon task per patch — the
/// sweep never touches two patches' data in the same task, so there is
/// nothing to synchronize.
pub fn correct_all_fluxes(hierarchy: &mut Hierarchy, level: u32, sg: Sandglass, dt: f64, cell_size: f64, clamp: DensityClamp) -> Result<()> {
    hierarchy.par_real_patches_mut(level)?.try_for_each(|(_, patch)| -> Result<()> {
        for face in 0..NUM_FACES {
            if patch.has_flux(face) {
                correct_flux_on_patch(patch, face, sg, dt, cell_size, clamp)?;
            }
        }
        Ok(())
    })
}

/// Overwrites every cell of `father_id` that lies under a refined child with
/// the block average of that child's `PS/2`-scale sub-cube. A no-op if the
/// patch has no local children.
pub fn restrict(hierarchy: &mut Hierarchy, level: u32, father_id: u32, sg_parent: Sandglass, sg_child: Sandglass) -> Result<()> {
    let base = match hierarchy.real_patch(level, father_id)?.son() {
        SonLink::Local(base) => base,
        _ => return Ok(()),
    };
    debug_assert_eq!(PS % 2, 0, "restriction assumes an even patch size");
    let half = PS / 2;

    for c in 0..8u32 {
        let child_id = base + c;
        let octant = hierarchy.real_patch(level + 1, child_id)?.octant();
        let offset = [
            if octant & 1 != 0 { half } else { 0 },
            if octant & 2 != 0 { half } else { 0 },
            if octant & 4 != 0 { half } else { 0 },
        ];

        let child_cells: Vec<[f64; NUM_FIELDS]> = {
            let child = hierarchy.real_patch(level + 1, child_id)?;
            (0..PS * PS * PS)
                .map(|flat| {
                    let (fi, fj, fk) = (flat % PS, (flat / PS) % PS, flat / (PS * PS));
                    std::array::from_fn(|v| child.cell(sg_child, v, fi, fj, fk))
                })
                .collect()
        };

        let father = hierarchy.real_patch_mut(level, father_id)?;
        for fi in 0..PS {
            for fj in 0..PS {
                for fk in 0..PS {
                    let i = offset[0] + fi / 2;
                    let j = offset[1] + fj / 2;
                    let k = offset[2] + fk / 2;
                    let values = child_cells[fk * PS * PS + fj * PS + fi];
                    for v in 0..NUM_FIELDS {
                        let prev = father.cell(sg_parent, v, i, j, k);
                        let averaged = prev + values[v] / 8.0;
                        father.set_cell(sg_parent, v, i, j, k, averaged);
                    }
                }
            }
        }
        // Each of the eight fine cells sharing a coarse cell contributes
        // independently, so the parent cell must start from zero before the
        // loop over children; callers run restriction for all eight
        // siblings of an octet before reading the father's data back.
    }
    Ok(())
}

/// Zeroes out the region of `father_id` that restriction is about to
/// accumulate into. Call once before [`restrict`] iterates a patch's eight
/// children.
pub fn clear_for_restriction(hierarchy: &mut Hierarchy, level: u32, father_id: u32, sg_parent: Sandglass) -> Result<()> {
    if !matches!(hierarchy.real_patch(level, father_id)?.son(), SonLink::Local(_)) {
        return Ok(());
    }
    let father = hierarchy.real_patch_mut(level, father_id)?;
    for v in 0..NUM_FIELDS {
        for i in 0..PS {
            for j in 0..PS {
                for k in 0..PS {
                    father.set_cell(sg_parent, v, i, j, k, 0.0);
                }
            }
        }
    }
    Ok(())
}

/// Repairs negative density or pressure left by flux correction or
/// restriction: clamps density to a floor, and rescales momentum toward
/// zero (conserving direction, not magnitude) until pressure is
/// non-negative under the ideal-gas law the fluid collaborator uses.
pub fn enforce_positivity(hierarchy: &mut Hierarchy, level: u32, patch_id: u32, sg: Sandglass, floors: Floors) -> Result<()> {
    let patch = hierarchy.real_patch_mut(level, patch_id)?;
    for i in 0..PS {
        for j in 0..PS {
            for k in 0..PS {
                let mut rho = patch.cell(sg, DENSITY, i, j, k);
                if rho < floors.density {
                    rho = floors.density;
                    patch.set_cell(sg, DENSITY, i, j, k, rho);
                }
                let (px, py, pz) = (
                    patch.cell(sg, MOMENTUM_X, i, j, k),
                    patch.cell(sg, MOMENTUM_Y, i, j, k),
                    patch.cell(sg, MOMENTUM_Z, i, j, k),
                );
                let kinetic = 0.5 * (px * px + py * py + pz * pz) / rho;
                let energy = patch.cell(sg, ENERGY, i, j, k);
                let thermal = energy - kinetic;
                let pressure = thermal * (floors.gamma_law_index - 1.0);
                if pressure < floors.pressure {
                    // Shrink the kinetic contribution (not density, which is
                    // already floored) until the gas pressure implied by the
                    // ideal-gas law clears the floor, preserving flow
                    // direction.
                    let min_thermal = floors.pressure / (floors.gamma_law_index - 1.0);
                    let max_kinetic = (energy - min_thermal).max(0.0);
                    let scale = if kinetic > 0.0 { (max_kinetic / kinetic).sqrt() } else { 0.0 };
                    patch.set_cell(sg, MOMENTUM_X, i, j, k, px * scale);
                    patch.set_cell(sg, MOMENTUM_Y, i, j, k, py * scale);
                    patch.set_cell(sg, MOMENTUM_Z, i, j, k, pz * scale);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::DENSITY;

    #[test]
    fn flux_correction_applies_signed_area_weighted_update() {
        let mut h = Hierarchy::new(0);
        let p = h.alloc_root([0, 0, 0], 0).unwrap();
        h.set_flux_boundary(0, p, 1, true).unwrap(); // x-hi face
        h.real_patch_mut(0, p).unwrap().flux_mut(1).unwrap()[DENSITY * PS * PS] = 8.0;

        let before = h.real_patch(0, p).unwrap().cell(0, DENSITY, PS - 1, 0, 0);
        correct_flux(&mut h, 0, p, 1, 0, 1.0, 1.0).unwrap();
        let after = h.real_patch(0, p).unwrap().cell(0, DENSITY, PS - 1, 0, 0);

        assert_eq!(after - before, geometry::face_sign(1) * 0.25 * 8.0);
        assert!(!h.real_patch(0, p).unwrap().has_flux(1));
    }

    #[test]
    fn restriction_averages_refined_children_into_the_father() {
        let mut h = Hierarchy::new(1);
        let root = h.alloc_root([0, 0, 0], 0).unwrap();
        let base = h
            .refine(0, root, |c| [(c & 1) as i64, ((c >> 1) & 1) as i64, ((c >> 2) & 1) as i64])
            .unwrap();
        for c in 0..8u32 {
            for flat in 0..PS * PS * PS {
                let (i, j, k) = (flat % PS, (flat / PS) % PS, flat / (PS * PS));
                h.real_patch_mut(1, base + c).unwrap().set_cell(0, DENSITY, i, j, k, 2.0);
            }
        }
        clear_for_restriction(&mut h, 0, root, 0).unwrap();
        restrict(&mut h, 0, root, 0, 0).unwrap();
        for i in 0..PS {
            for j in 0..PS {
                for k in 0..PS {
                    assert_eq!(h.real_patch(0, root).unwrap().cell(0, DENSITY, i, j, k), 2.0);
                }
            }
        }
    }

    #[test]
    fn positivity_floors_density_and_rescales_momentum() {
        let mut h = Hierarchy::new(0);
        let p = h.alloc_root([0, 0, 0], 0).unwrap();
        {
            let patch = h.real_patch_mut(0, p).unwrap();
            patch.set_cell(0, DENSITY, 0, 0, 0, -1.0);
            patch.set_cell(0, MOMENTUM_X, 0, 0, 0, 10.0);
            patch.set_cell(0, ENERGY, 0, 0, 0, 1.0);
        }
        let floors = Floors {
            density: 1e-6,
            pressure: 1e-6,
            gamma_law_index: 5.0 / 3.0,
        };
        enforce_positivity(&mut h, 0, p, 0, floors).unwrap();
        let patch = h.real_patch(0, p).unwrap();
        assert_eq!(patch.cell(0, DENSITY, 0, 0, 0), 1e-6);
        let px = patch.cell(0, MOMENTUM_X, 0, 0, 0);
        let energy = patch.cell(0, ENERGY, 0, 0, 0);
        let kinetic = 0.5 * px * px / patch.cell(0, DENSITY, 0, 0, 0);
        let pressure = (energy - kinetic) * (floors.gamma_law_index - 1.0);
        assert!(pressure >= floors.pressure - 1e-6);
    }
}
