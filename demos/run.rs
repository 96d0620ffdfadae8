//! A small runnable demo exercising the crate end to end: two in-process
//! ranks exchange a boundary slab, run a coarse-fine flux correction, form
//! a star, and dump/reload a checkpoint.

use clap::{AppSettings, Clap};

use sandglass::checkpoint::{self, Info, InputPara, KeyInfo, LevelInfo, Makefile, SymConst};
use sandglass::error::Result;
use sandglass::exchange::{begin, finish, Mode, VariableMask};
use sandglass::geometry;
use sandglass::hierarchy::{BufferClass, Hierarchy};
use sandglass::patch::{PatchRef, SiblingLink, DENSITY, ENERGY, MOMENTUM_X, PS};
use sandglass::planner::{plan_sibling_exchange, BufferOwners, StaticPartition};
use sandglass::rng::Lcg48;
use sandglass::star_formation::{form_stars_in_patch, StarFormationParams};
use sandglass::transport::loopback::LoopbackCommunicator;

#[derive(Debug, Clap)]
#[clap(version = "1.0")]
#[clap(setting = AppSettings::ColoredHelp)]
struct Opts {
    /// Base seed for the star-formation demo's RNG stream.
    #[clap(short = 's', long, default_value = "1234")]
    seed: u64,

    /// Directory the checkpoint demo writes its dump file into.
    #[clap(short = 'c', long, default_value = "")]
    checkpoint_dir: String,
}

fn build_two_rank_domain() -> (Hierarchy, Hierarchy, u32, u32, PatchRef, PatchRef) {
    let mut owner = Hierarchy::new(0);
    let a = owner.alloc_root([0, 0, 0], 0).unwrap();
    for k in 0..PS {
        for j in 0..PS {
            for i in 0..PS {
                owner.real_patch_mut(0, a).unwrap().set_cell(0, DENSITY, i, j, k, (i + j + k) as f64);
            }
        }
    }

    let mut peer = Hierarchy::new(0);
    let b = peer.alloc_root([1, 0, 0], 1).unwrap();

    let d_ab = geometry::FACE_DIRS[1]; // +x
    let d_ba = geometry::mirror(d_ab);

    let buf_b = owner.alloc_buffer(0, BufferClass::Sibling, [1, 0, 0], 1).unwrap();
    owner.real_patch_mut(0, a).unwrap().set_sibling(d_ab, SiblingLink::Patch(buf_b));

    let buf_a = peer.alloc_buffer(0, BufferClass::Sibling, [0, 0, 0], 0).unwrap();
    peer.real_patch_mut(0, b).unwrap().set_sibling(d_ba, SiblingLink::Patch(buf_a));

    (owner, peer, a, b, buf_b, buf_a)
}

fn run_ghost_exchange() -> Result<()> {
    let (mut owner, mut peer, a, b, buf_b, buf_a) = build_two_rank_domain();

    let mut owners = StaticPartition::new();
    owners.assign(0, a, 0);
    owners.assign(0, b, 1);
    let mut buffer_owners_for_owner = BufferOwners::new();
    buffer_owners_for_owner.set(buf_b, 1);
    let mut buffer_owners_for_peer = BufferOwners::new();
    buffer_owners_for_peer.set(buf_a, 0);

    let plan_owner = plan_sibling_exchange(&owner, 0, 0, &owners, &|r| buffer_owners_for_owner.get(r))?;
    let plan_peer = plan_sibling_exchange(&peer, 0, 1, &owners, &|r| buffer_owners_for_peer.get(r))?;

    let group = LoopbackCommunicator::new_group(2);
    begin(&owner, 0, Mode::General, VariableMask::FLUID_ONLY, 2, 0, 0, &plan_owner, &group[0])?;
    begin(&peer, 0, Mode::General, VariableMask::FLUID_ONLY, 2, 0, 0, &plan_peer, &group[1])?;
    finish(&mut owner, 0, VariableMask::FLUID_ONLY, 2, 0, 0, &plan_owner, &group[0])?;
    finish(&mut peer, 0, VariableMask::FLUID_ONLY, 2, 0, 0, &plan_peer, &group[1])?;

    let mirrored_a = peer.buffer_patch(0, BufferClass::Sibling, buf_a.index)?;
    log::info!(
        "peer's mirror of a's high-x boundary cell (7,0,0) reads {}",
        mirrored_a.cell(0, DENSITY, PS - 1, 0, 0)
    );
    Ok(())
}

fn run_star_formation_demo(seed: u64) -> Result<()> {
    let mut h = Hierarchy::new(0);
    let p = h.alloc_root([0, 0, 0], 0)?;
    h.real_patch_mut(0, p)?.set_cell(0, DENSITY, 0, 0, 0, 100.0);
    h.real_patch_mut(0, p)?.set_cell(0, ENERGY, 0, 0, 0, 50.0);
    h.real_patch_mut(0, p)?.set_cell(0, MOMENTUM_X, 0, 0, 0, 5.0);

    let params = StarFormationParams {
        density_threshold: 1.0,
        efficiency: 1.0,
        max_mass_fraction: 0.1,
        gravitational_constant: 1.0,
        m_min: 1.0,
    };
    let mut rng = Lcg48::new(seed, 0);
    let spawned = form_stars_in_patch(&mut h, 0, p, 0, 1e6, 0.0, 1.0, None, params, &mut rng)?;
    log::info!("star formation sweep spawned {} particle(s)", spawned.len());
    Ok(())
}

fn run_checkpoint_demo(checkpoint_dir: &str) -> Result<()> {
    let mut h = Hierarchy::new(0);
    let p = h.alloc_root([0, 0, 0], 0)?;
    h.real_patch_mut(0, p)?.set_cell(0, DENSITY, 1, 1, 1, 3.5);
    let gids = h.compute_gids()?;

    let info = Info {
        key_info: KeyInfo {
            format_version: checkpoint::FORMAT_VERSION,
            model: "sandglass-demo".into(),
            l_max: 0,
            patch_size: PS,
            dump_index: 0,
            step: 1,
            levels: vec![LevelInfo { time: 0.0, cell_size: 1.0, num_patches: 1 }],
            code_version: env!("CARGO_PKG_VERSION").into(),
            wall_clock_unix_seconds: 0,
        },
        makefile: Makefile::default(),
        sym_const: SymConst { domain_size: [8.0, 8.0, 8.0], periodic: [false; 3], gamma_law_index: 5.0 / 3.0 },
        input_para: InputPara::default(),
    };

    let comms = LoopbackCommunicator::new_group(1);
    let dir = if checkpoint_dir.is_empty() { std::env::temp_dir() } else { std::path::PathBuf::from(checkpoint_dir) };
    let path = dir.join("sandglass_demo_checkpoint");
    checkpoint::write_checkpoint(&path, &h, &info, &gids, 0, &comms[0])?;
    let loaded = checkpoint::read_checkpoint(&path)?;
    log::info!("checkpoint round trip: {} patch(es), format version {}", loaded.tree.len(), loaded.info.key_info.format_version);
    std::fs::remove_file(&path).ok();
    Ok(())
}

fn main() {
    let opts = Opts::parse();
    simple_logger::init_with_level(log::Level::Info).expect("logger already initialized");
    if let Err(e) = run_ghost_exchange() {
        log::error!("ghost exchange demo failed: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = run_star_formation_demo(opts.seed) {
        log::error!("star formation demo failed: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = run_checkpoint_demo(&opts.checkpoint_dir) {
        log::error!("checkpoint demo failed: {}", e);
        std::process::exit(1);
    }
}
