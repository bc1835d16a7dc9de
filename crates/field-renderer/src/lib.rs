//! # Field Renderer
//!
//! Paints the particle state of a scene: fades the previous frame toward the background, draws
//! one point per particle on top, and presents the result.

pub mod painter;
pub mod palette;

pub use painter::*;
pub use palette::*;
