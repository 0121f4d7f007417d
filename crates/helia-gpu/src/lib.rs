//! Vulkan abstraction layer for the Helia renderer.
//!
//! This crate provides:
//! - Instance and device management with ray-tracing capability detection
//! - Memory allocation via gpu-allocator
//! - Command buffer and submission helpers with timeline dependencies
//! - Render targets, G-buffer bundles and GPU timers
//! - Compute and ray-tracing pipelines with push-descriptor state
//! - The frame orchestrator and the display backend protocol

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod placeholders;
pub mod slots;
pub mod sync;
pub mod target;
pub mod timer;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::CommandPool;
pub use context::{DeviceContext, DeviceContextBuilder, RenderDevice};
pub use descriptor::BindingValue;
pub use frame::{DisplayBackend, DisplayImages, FrameContext, HeadlessBackend};
pub use memory::{DeviceAllocator, DeviceBuffer, DeviceImage, UniformRing};
pub use pipeline::{ComputePipeline, PipelineBase, RayTracingPipeline, MAX_PUSH_CONSTANT_SIZE};
pub use placeholders::PlaceholderResources;
pub use sync::{Dependencies, Dependency};
pub use target::{GbufferTarget, RenderTarget};
pub use timer::{Timer, TimerPool};

/// Number of frames that may be in flight at once.
///
/// This should typically be _lower_ than the number of images in the display
/// targets. There really cannot be more frames in flight than swapchain
/// images, since their image views would clash.
pub const FRAMES_IN_FLIGHT: usize = 2;
