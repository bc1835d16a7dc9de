//! Error types surfaced by the engine

use thiserror::Error;

/// A synthesized program was rejected by the shader front-end or the driver.
///
/// `diagnostic` carries the compiler output verbatim so it can be shown to whoever wrote the
/// vector field expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to compile {label}:\n{diagnostic}")]
pub struct CompileError {
    pub label: String,
    pub diagnostic: String,
}

impl CompileError {
    pub fn new(label: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            diagnostic: diagnostic.into(),
        }
    }
}

/// Failures reported by a [`RenderDevice`](crate::device::RenderDevice)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("texture allocation failed: {0}")]
    Allocation(String),
    #[error("draw failed: {0}")]
    Draw(String),
    #[error("pixel readback failed: {0}")]
    Readback(String),
    #[error("timed out waiting for the device")]
    Timeout,
    #[error("unknown texture handle")]
    UnknownTexture,
    #[error("unknown program handle")]
    UnknownProgram,
    #[error("texture resolution mismatch: expected {expected}, got {actual}")]
    ResolutionMismatch { expected: u32, actual: u32 },
    #[error("no particle state allocated")]
    NoParticleState,
}

/// Top-level error for constructing and driving a scene
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("no suitable GPU adapter: {0}")]
    Adapter(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Failures while loading or flushing persisted settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings json: {0}")]
    Json(#[from] serde_json::Error),
}
