pub mod backoff;
pub mod checkpoint;
pub mod collaborators;
pub mod comm;
pub mod error;
pub mod exchange;
pub mod fixup;
pub mod geometry;
pub mod gravity;
pub mod hierarchy;
pub mod patch;
pub mod planner;
pub mod rng;
pub mod slab;
pub mod star_formation;
pub mod transport;
