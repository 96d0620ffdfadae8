//! Reference collaborator implementations: the fluid integrator, Poisson
//! solver, and particle pusher are interface contracts — the core
//! hierarchy, exchange, and fix-up engine never call a concrete numerics
//! package directly. These modules supply minimal, self-contained
//! implementations of those three traits so the core is exercisable end
//! to end in tests, without growing into a real physics package.

pub mod fluid;
pub mod particle;
pub mod poisson;
