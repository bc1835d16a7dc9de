//! # Vector Field Simulation
//!
//! GPU-resident particle advection through a user-written vector field. Particle positions live
//! in packed float textures and advance by one render-to-texture pass per dimension each frame;
//! the CPU never reads them back on the hot path.

pub mod context;
pub mod device;
pub mod driver;
pub mod error;
pub mod events;
pub mod params;
pub mod program;
pub mod sampler;
pub mod scene;
pub mod scheduler;
pub mod settings;
pub mod textures;

pub use context::*;
pub use device::{
    DrawPass, KernelOptions, ProgramHandle, ProgramSource, ReferenceDevice, RenderDevice,
    TextureHandle, WgpuDevice,
};
pub use driver::*;
pub use error::*;
pub use events::*;
pub use params::*;
pub use program::*;
pub use sampler::*;
pub use scene::*;
pub use scheduler::*;
pub use settings::{JsonFileSettings, MemorySettings, SettingsStore};
pub use textures::*;
