//! Machine configuration errors

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one frame must hold the kernel")]
    NoKernelFrames,

    #[error("{frames} frames leave nothing free after {kernel_frames} kernel frames")]
    NoFreeFrames { frames: usize, kernel_frames: usize },

    #[error("{0} frames do not fit in the kernel's physical memory window")]
    TooManyFrames(usize),

    #[error("environment slots must be between 1 and 1024, got {0}")]
    EnvSlots(usize),

    #[error("open file limit must be between 1 and 32, got {0}")]
    MaxOpen(usize),
}
