//! Renderer error types.

use ash::vk;
use thiserror::Error;

/// Errors surfaced by the rendering core.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Device memory, timestamp budget or descriptor capacity exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The device was lost; all in-flight work failed. The caller must
    /// re-create the context.
    #[error("device lost")]
    DeviceLost,

    /// The swapchain no longer matches the surface. Recoverable by
    /// rebuilding the renderer.
    #[error("swapchain out of date")]
    OutOfDateSwapchain,

    /// Shader compilation failed.
    #[error("failed to compile {path}: {log}")]
    Compile { path: String, log: String },

    /// Shader program linking failed.
    #[error("failed to link {path}: {log}")]
    Link { path: String, log: String },

    /// SPIR-V reflection failed.
    #[error("failed to reflect {path}: {detail}")]
    Reflect { path: String, detail: String },

    /// Two shader stages declare the same binding slot under different
    /// names. Fatal at pipeline construction.
    #[error("binding slot {slot} is named both \"{first}\" and \"{second}\"")]
    BindingNameMismatch {
        first: String,
        second: String,
        slot: u32,
    },

    /// A stage requires a device capability that is not available, e.g.
    /// ray tracing.
    #[error("missing device capability: {0}")]
    MissingCapability(String),

    /// A shader or texture file could not be opened.
    #[error("missing asset: {0}")]
    AssetMissing(String),

    /// No physical device meets the renderer's requirements.
    #[error("no suitable GPU found")]
    NoSuitableDevice,

    /// Uncategorized Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDateSwapchain,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::ResourceExhausted(result.to_string())
            }
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_result_classification() {
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            RenderError::OutOfDateSwapchain
        ));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_DEVICE_LOST),
            RenderError::DeviceLost
        ));
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RenderError::ResourceExhausted(_)
        ));
        assert!(matches!(
            RenderError::from(vk::Result::TIMEOUT),
            RenderError::Vulkan(vk::Result::TIMEOUT)
        ));
    }
}
