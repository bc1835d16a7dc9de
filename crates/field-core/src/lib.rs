//! # Vector Field Core
//!
//! Device-free building blocks of the vector field particle engine: the float packing codec
//! used for particle-state textures, the pan-zoom to simulation-space mapper, and a host mirror
//! of the integration kernel.

pub mod bbox;
pub mod codec;
pub mod constants;
pub mod kernel;
pub mod stats;

pub use bbox::*;
pub use constants::*;
pub use kernel::*;
pub use stats::*;
