//! Buffer exchange engine.
//!
//! Moves ghost-zone data (and, in `COARSE_FINE_FLUX` mode, flux-register
//! corrections) between a real patch and the buffer patches that mirror its
//! neighbors, along an [`ExchangePlan`] or [`FluxPairing`] list produced by
//! [`crate::planner`]. Every transfer is split into a `begin` (pack +
//! non-blocking send) and `finish` (blocking recv + unpack) half so a caller
//! can overlap several directions, or several levels, before waiting on any
//! of them.
//!
//! Ghost slabs are packed as raw little-endian `f64` bytes, not through
//! `serde`: this is the hot loop of the whole engine, and the wire format is
//! always interpreted by the same crate version on both ends, so there is
//! nothing serde's self-description would buy here.

use std::collections::BTreeMap;

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::geometry::{self, NUM_DIRECTIONS};
use crate::hierarchy::Hierarchy;
use crate::patch::{Patch, PatchClass, PatchRef, Sandglass, NUM_FIELDS, PS};
use crate::planner::{ExchangePlan, FluxPairing};

/// Which of the six exchange modes a transfer performs. All but
/// [`Mode::CoarseFineFlux`] move ghost-zone data along an [`ExchangePlan`];
/// `CoarseFineFlux` instead sums flux-register contributions along a
/// [`FluxPairing`] list and is driven by the separate
/// `*_coarse_fine_flux` functions below rather than `begin`/`finish`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    General,
    AfterRefine,
    AfterFixup,
    PotForPoisson,
    PotAfterRefine,
    CoarseFineFlux,
}

/// Which cell-centered fields a GENERAL-family transfer carries. Passive
/// scalars always ride with the fluid variables in the same message, fluid
/// variable index order first; potential is its own selection since
/// several modes move it alone.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VariableMask {
    pub fluid: bool,
    pub potential: bool,
}

impl VariableMask {
    pub const FLUID_ONLY: VariableMask = VariableMask {
        fluid: true,
        potential: false,
    };
    pub const POTENTIAL_ONLY: VariableMask = VariableMask {
        fluid: false,
        potential: true,
    };
}

fn validate_mode(mode: Mode, mask: VariableMask, ghost_width: usize) -> Result<()> {
    if ghost_width == 0 || ghost_width > PS {
        return Err(Error::Precondition {
            what: "ghost width must be in 1..=PS".into(),
            value: ghost_width.to_string(),
        });
    }
    let compatible = match mode {
        Mode::General | Mode::AfterRefine | Mode::AfterFixup => mask.fluid,
        Mode::PotForPoisson | Mode::PotAfterRefine => mask.potential && !mask.fluid,
        Mode::CoarseFineFlux => true,
    };
    if !compatible {
        return Err(Error::Precondition {
            what: "variable mask is not valid for this mode".into(),
            value: format!("{:?} / {:?}", mode, mask),
        });
    }
    Ok(())
}

type AxisRanges = (
    std::ops::Range<usize>,
    std::ops::Range<usize>,
    std::ops::Range<usize>,
);

fn slab_ranges(d: usize, ghost_width: usize) -> AxisRanges {
    let (di, dj, dk) = geometry::offset(d);
    (
        geometry::axis_extent(di, PS, ghost_width),
        geometry::axis_extent(dj, PS, ghost_width),
        geometry::axis_extent(dk, PS, ghost_width),
    )
}

fn pack_slab(patch: &Patch, mask: VariableMask, sg: Sandglass, sg_pot: Sandglass, ranges: &AxisRanges, out: &mut Vec<u8>) {
    let (ir, jr, kr) = ranges;
    if mask.fluid {
        for v in 0..NUM_FIELDS {
            for k in kr.clone() {
                for j in jr.clone() {
                    for i in ir.clone() {
                        out.extend_from_slice(&patch.cell(sg, v, i, j, k).to_le_bytes());
                    }
                }
            }
        }
    }
    if mask.potential {
        let pot = patch.pot(sg_pot);
        for k in kr.clone() {
            for j in jr.clone() {
                for i in ir.clone() {
                    let value = pot.map(|p| p[(k * PS + j) * PS + i]).unwrap_or(0.0);
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
}

fn take_f64(data: &mut &[u8]) -> Result<f64> {
    if data.len() < 8 {
        return Err(Error::Transport("truncated ghost exchange message".into()));
    }
    let (head, rest) = data.split_at(8);
    *data = rest;
    Ok(f64::from_le_bytes(head.try_into().unwrap()))
}

fn take_u32(data: &mut &[u8]) -> Result<u32> {
    if data.len() < 4 {
        return Err(Error::Transport("truncated flux message".into()));
    }
    let (head, rest) = data.split_at(4);
    *data = rest;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

fn unpack_slab(
    patch: &mut Patch,
    mask: VariableMask,
    sg: Sandglass,
    sg_pot: Sandglass,
    ranges: &AxisRanges,
    data: &mut &[u8],
) -> Result<()> {
    let (ir, jr, kr) = ranges;
    if mask.fluid {
        for v in 0..NUM_FIELDS {
            for k in kr.clone() {
                for j in jr.clone() {
                    for i in ir.clone() {
                        let value = take_f64(data)?;
                        patch.set_cell(sg, v, i, j, k, value);
                    }
                }
            }
        }
    }
    if mask.potential {
        for k in kr.clone() {
            for j in jr.clone() {
                for i in ir.clone() {
                    let value = take_f64(data)?;
                    patch.pot_mut(sg_pot)[(k * PS + j) * PS + i] = value;
                }
            }
        }
    }
    Ok(())
}

/// Packs every direction's send list and issues one non-blocking message per
/// (direction, destination rank) pair.
pub fn begin(
    hierarchy: &Hierarchy,
    level: u32,
    mode: Mode,
    mask: VariableMask,
    ghost_width: usize,
    sg: Sandglass,
    sg_pot: Sandglass,
    plan: &ExchangePlan,
    comm: &impl Communicator,
) -> Result<()> {
    validate_mode(mode, mask, ghost_width)?;
    for d in 0..NUM_DIRECTIONS {
        if plan.send[d].is_empty() {
            continue;
        }
        let ranges = slab_ranges(d, ghost_width);
        let mut by_rank: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&id, &rank) in plan.send[d].iter().zip(plan.send_rank[d].iter()) {
            let patch = hierarchy.real_patch(level, id)?;
            pack_slab(patch, mask, sg, sg_pot, &ranges, by_rank.entry(rank).or_default());
        }
        for (rank, bytes) in by_rank {
            comm.send_to(rank, bytes);
        }
    }
    Ok(())
}

/// Blocks on every direction's recv list and unpacks into the corresponding
/// buffer patches, in the same per-rank order `begin` packed them in. Relies
/// on [`crate::planner::plan_sibling_exchange`]
/// iterating real patches in ascending id order on every rank, so that two
/// ranks independently planning the same pair of directions agree on
/// message order without needing to exchange sequence numbers.
pub fn finish(
    hierarchy: &mut Hierarchy,
    level: u32,
    mask: VariableMask,
    ghost_width: usize,
    sg: Sandglass,
    sg_pot: Sandglass,
    plan: &ExchangePlan,
    comm: &impl Communicator,
) -> Result<()> {
    for d in 0..NUM_DIRECTIONS {
        if plan.recv[d].is_empty() {
            continue;
        }
        // The remote sender packed using *its own* direction label, which
        // is the mirror of ours: the buffer patch mirrors the remote's
        // coordinate layout exactly, so we must unpack at the same slab
        // location the sender packed from, not at our own direction's
        // opposite endpoint.
        let ranges = slab_ranges(geometry::mirror(d), ghost_width);
        let mut by_rank: BTreeMap<usize, Vec<PatchRef>> = BTreeMap::new();
        for (&r, &rank) in plan.recv[d].iter().zip(plan.recv_rank[d].iter()) {
            by_rank.entry(rank).or_default().push(r);
        }
        for (rank, refs) in by_rank {
            let bytes = comm.recv_from(rank);
            let mut slice: &[u8] = &bytes;
            for r in refs {
                let patch = hierarchy.patch_mut(level, r)?;
                unpack_slab(patch, mask, sg, sg_pot, &ranges, &mut slice)?;
            }
        }
    }
    Ok(())
}

/// Convenience wrapper for a single-process caller (tests, the demo
/// binary): packs, sends, and immediately receives. A real multi-rank
/// deployment should call [`begin`] for every rank before [`finish`] for
/// any of them, so sends are in flight while other ranks are still packing.
pub fn exchange(
    hierarchy: &mut Hierarchy,
    level: u32,
    mode: Mode,
    mask: VariableMask,
    ghost_width: usize,
    sg: Sandglass,
    sg_pot: Sandglass,
    plan: &ExchangePlan,
    comm: &impl Communicator,
) -> Result<()> {
    begin(hierarchy, level, mode, mask, ghost_width, sg, sg_pot, plan, comm)?;
    finish(hierarchy, level, mask, ghost_width, sg, sg_pot, plan, comm)
}

/// Accumulates COARSE_FINE_FLUX contributions whose coarse side is a real
/// patch owned by this same rank: sums `fine.flux(face)` into
/// `coarse.flux_mut(mirror_face(face))`.
pub fn apply_local_coarse_fine_flux(hierarchy: &mut Hierarchy, fine_level: u32, pairings: &[FluxPairing]) -> Result<()> {
    let coarse_level = fine_level
        .checked_sub(1)
        .ok_or(Error::Precondition {
            what: "coarse-fine flux has no coarse level below level 0".into(),
            value: fine_level.to_string(),
        })?;
    for pairing in pairings {
        if pairing.coarse.class != PatchClass::Real {
            continue;
        }
        let contribution = hierarchy
            .real_patch(fine_level, pairing.fine_id)?
            .flux(pairing.face)
            .ok_or(Error::Precondition {
                what: "fine patch missing flux register for paired face".into(),
                value: pairing.fine_id.to_string(),
            })?
            .to_vec();
        let mirrored = geometry::mirror_face(pairing.face);
        let coarse = hierarchy.real_patch_mut(coarse_level, pairing.coarse.index)?;
        let slot = coarse.flux_mut(mirrored).ok_or(Error::Precondition {
            what: "coarse patch missing flux register for mirrored face".into(),
            value: pairing.coarse.index.to_string(),
        })?;
        for (dst, src) in slot.iter_mut().zip(contribution.iter()) {
            *dst += src;
        }
    }
    Ok(())
}

/// Ships COARSE_FINE_FLUX contributions whose coarse side is owned by a
/// remote rank: one message per destination, each payload a concatenation
/// of `(remote real id, mirrored face, flux register)` triples. Pairs with
/// [`recv_remote_coarse_fine_flux`] on the owning rank.
pub fn send_remote_coarse_fine_flux(
    hierarchy: &Hierarchy,
    fine_level: u32,
    pairings: &[FluxPairing],
    remote_real_id: &impl Fn(PatchRef) -> u32,
    coarse_owner: &impl Fn(PatchRef) -> usize,
    comm: &impl Communicator,
) -> Result<()> {
    let mut by_rank: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for pairing in pairings {
        if pairing.coarse.class == PatchClass::Real {
            continue;
        }
        let flux = hierarchy
            .real_patch(fine_level, pairing.fine_id)?
            .flux(pairing.face)
            .ok_or(Error::Precondition {
                what: "fine patch missing flux register for paired face".into(),
                value: pairing.fine_id.to_string(),
            })?;
        let buf = by_rank.entry(coarse_owner(pairing.coarse)).or_default();
        buf.extend_from_slice(&remote_real_id(pairing.coarse).to_le_bytes());
        buf.extend_from_slice(&(geometry::mirror_face(pairing.face) as u32).to_le_bytes());
        for x in flux {
            buf.extend_from_slice(&x.to_le_bytes());
        }
    }
    for (rank, bytes) in by_rank {
        comm.send_to(rank, bytes);
    }
    Ok(())
}

/// Receives and accumulates every message [`send_remote_coarse_fine_flux`]
/// addressed to this rank's coarse real patches, one [`comm.recv_from`] per
/// sender in `sender_ranks`.
pub fn recv_remote_coarse_fine_flux(
    hierarchy: &mut Hierarchy,
    coarse_level: u32,
    sender_ranks: &[usize],
    comm: &impl Communicator,
) -> Result<()> {
    let flux_len = NUM_FIELDS * PS * PS;
    for &rank in sender_ranks {
        let bytes = comm.recv_from(rank);
        let mut slice: &[u8] = &bytes;
        while !slice.is_empty() {
            let remote_id = take_u32(&mut slice)?;
            let face = take_u32(&mut slice)? as usize;
            let mut contribution = Vec::with_capacity(flux_len);
            for _ in 0..flux_len {
                contribution.push(take_f64(&mut slice)?);
            }
            let coarse = hierarchy.real_patch_mut(coarse_level, remote_id)?;
            let slot = coarse.flux_mut(face).ok_or(Error::Precondition {
                what: "coarse patch missing flux register for incoming face".into(),
                value: remote_id.to_string(),
            })?;
            for (dst, src) in slot.iter_mut().zip(contribution.iter()) {
                *dst += src;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::BufferClass;
    use crate::patch::{SiblingLink, DENSITY};
    use crate::planner::{plan_sibling_exchange, BufferOwners, StaticPartition};
    use crate::transport::loopback::LoopbackCommunicator;

    #[test]
    fn general_exchange_moves_boundary_slab_across_ranks() {
        let mut h_owner = Hierarchy::new(0);
        let a = h_owner.alloc_root([0, 0, 0], 0).unwrap();
        for k in 0..PS {
            for j in 0..PS {
                for i in 0..PS {
                    h_owner.real_patch_mut(0, a).unwrap().set_cell(0, DENSITY, i, j, k, (i + j + k) as f64);
                }
            }
        }

        let mut h_peer = Hierarchy::new(0);
        let b = h_peer.alloc_root([1, 0, 0], 1).unwrap();
        let d_ab = geometry::FACE_DIRS[1]; // +x: a's neighbor in +x is b
        let d_ba = geometry::mirror(d_ab);

        // Owner's rank 0 sees b only as a buffer; peer's rank 1 sees a only
        // as a buffer. Each hierarchy only models its own real + mirrored
        // buffer patches, as a single rank would see in a real deployment.
        let buf_b = h_owner.alloc_buffer(0, BufferClass::Sibling, [1, 0, 0], 1).unwrap();
        h_owner.real_patch_mut(0, a).unwrap().set_sibling(d_ab, SiblingLink::Patch(buf_b));

        let buf_a = h_peer.alloc_buffer(0, BufferClass::Sibling, [0, 0, 0], 0).unwrap();
        h_peer.real_patch_mut(0, b).unwrap().set_sibling(d_ba, SiblingLink::Patch(buf_a));

        let mut owners = StaticPartition::new();
        owners.assign(0, a, 0);
        owners.assign(0, b, 1);
        let mut buffer_owners_for_owner = BufferOwners::new();
        buffer_owners_for_owner.set(buf_b, 1);
        let mut buffer_owners_for_peer = BufferOwners::new();
        buffer_owners_for_peer.set(buf_a, 0);

        let plan_owner = plan_sibling_exchange(&h_owner, 0, 0, &owners, &|r| buffer_owners_for_owner.get(r)).unwrap();
        let plan_peer = plan_sibling_exchange(&h_peer, 0, 1, &owners, &|r| buffer_owners_for_peer.get(r)).unwrap();

        let group = LoopbackCommunicator::new_group(2);
        begin(&h_owner, 0, Mode::General, VariableMask::FLUID_ONLY, 2, 0, 0, &plan_owner, &group[0]).unwrap();
        begin(&h_peer, 0, Mode::General, VariableMask::FLUID_ONLY, 2, 0, 0, &plan_peer, &group[1]).unwrap();
        finish(&mut h_owner, 0, VariableMask::FLUID_ONLY, 2, 0, 0, &plan_owner, &group[0]).unwrap();
        finish(&mut h_peer, 0, VariableMask::FLUID_ONLY, 2, 0, 0, &plan_peer, &group[1]).unwrap();

        // Owner's buffer mirror of b now holds b's low-x boundary slab
        // (zeros, since peer's patch was never populated)...
        let mirrored_b = h_owner.buffer_patch(0, BufferClass::Sibling, buf_b.index).unwrap();
        assert_eq!(mirrored_b.cell(0, DENSITY, 0, 3, 3), 0.0);

        // ...and peer's buffer mirror of a holds a's high-x boundary slab.
        let mirrored_a = h_peer.buffer_patch(0, BufferClass::Sibling, buf_a.index).unwrap();
        for j in 0..PS {
            for k in 0..PS {
                for i in PS - 2..PS {
                    assert_eq!(mirrored_a.cell(0, DENSITY, i, j, k), (i + j + k) as f64);
                }
            }
        }
    }

    fn make_coarse_fine_pair() -> (Hierarchy, u32, u32, Vec<FluxPairing>) {
        let mut h = Hierarchy::new(1);
        let root = h.alloc_root([0, 0, 0], 0).unwrap();
        let base = h
            .refine(0, root, |c| [(c & 1) as i64, ((c >> 1) & 1) as i64, ((c >> 2) & 1) as i64])
            .unwrap();
        h.set_flux_boundary(1, base, 0, true).unwrap(); // fine's x-lo face
        h.set_flux_boundary(0, root, 1, true).unwrap(); // coarse's x-hi face (mirror)
        let pairings = vec![FluxPairing {
            fine_id: base,
            face: 0,
            coarse: PatchRef::real(root),
        }];
        (h, root, base, pairings)
    }

    #[test]
    fn local_coarse_fine_flux_accumulates_into_mirrored_face() {
        let (mut h, root, base, pairings) = make_coarse_fine_pair();
        h.real_patch_mut(1, base).unwrap().alloc_flux(0)[0] = 3.0;
        h.real_patch_mut(0, root).unwrap().alloc_flux(1)[0] = 1.0;

        apply_local_coarse_fine_flux(&mut h, 1, &pairings).unwrap();

        assert_eq!(h.real_patch(0, root).unwrap().flux(1).unwrap()[0], 4.0);
    }

    #[test]
    fn remote_coarse_fine_flux_round_trips_through_a_communicator() {
        let (mut h_fine, _root, base, mut pairings) = make_coarse_fine_pair();
        let coarse_buf = h_fine.alloc_buffer(0, BufferClass::CoarseGrid, [0, 0, 0], 0).unwrap();
        pairings[0].coarse = coarse_buf;
        h_fine.real_patch_mut(1, base).unwrap().alloc_flux(0)[5] = 7.0;

        let mut h_coarse = Hierarchy::new(0);
        let remote_root = h_coarse.alloc_root([0, 0, 0], 0).unwrap();
        h_coarse.real_patch_mut(0, remote_root).unwrap().alloc_flux(1)[5] = 2.0;

        let group = LoopbackCommunicator::new_group(2);
        send_remote_coarse_fine_flux(&h_fine, 1, &pairings, &|_| remote_root, &|_| 1, &group[0]).unwrap();
        recv_remote_coarse_fine_flux(&mut h_coarse, 0, &[0], &group[1]).unwrap();

        assert_eq!(h_coarse.real_patch(0, remote_root).unwrap().flux(1).unwrap()[5], 9.0);
    }
}
