//! Stage base: pre-recorded per-in-flight-frame command buffers.
//!
//! A stage is a device-scoped work unit. Command buffers are recorded once
//! per `set_scene` and stay immutable between scene changes; per-frame
//! submission never re-records. Uniform updates go through staging rings
//! uploaded by the recorded buffers themselves.

use ash::vk;
use helia_core::{Result, TimingRecord};
use helia_gpu::command::{
    begin_command_buffer, end_command_buffer, submit_with_dependencies, CommandPool,
};
use helia_gpu::timer::Timer;
use helia_gpu::{Dependencies, RenderDevice, FRAMES_IN_FLIGHT};

use crate::scene::SceneView;

/// A per-device render stage with pre-recorded command buffers.
pub trait RenderStage {
    /// Re-record command buffers against current scene bindings. Called
    /// whenever scene topology changes.
    fn set_scene(&mut self, scene: &SceneView) -> Result<()>;

    /// Write per-frame CPU->GPU state for one frame slot.
    fn update(&mut self, scene: &SceneView, slot: usize) -> Result<()>;

    /// The recorded command buffers for one frame slot, in submission
    /// order.
    fn command_buffers(&self, slot: usize) -> &[vk::CommandBuffer];
}

/// Submit a stage's recorded buffers with its dependency edges.
///
/// # Safety
/// The stage's command buffers must have been recorded on `device`.
pub unsafe fn submit_stage(
    device: &RenderDevice,
    stage: &dyn RenderStage,
    slot: usize,
    wait: &Dependencies,
    signal: &Dependencies,
) -> Result<()> {
    submit_with_dependencies(
        device.device(),
        device.graphics_queue,
        stage.command_buffers(slot),
        wait,
        signal,
        vk::Fence::null(),
    )
}

/// Owns a stage's command pool and per-slot recorded buffers.
pub struct StageCommands {
    pool: CommandPool,
    buffers: Vec<Vec<vk::CommandBuffer>>,
}

impl StageCommands {
    pub fn new(device: &RenderDevice) -> Result<Self> {
        let pool = unsafe {
            CommandPool::new(
                device.device(),
                device.graphics_queue_family,
                vk::CommandPoolCreateFlags::empty(),
            )?
        };
        Ok(Self {
            pool,
            buffers: (0..FRAMES_IN_FLIGHT).map(|_| Vec::new()).collect(),
        })
    }

    /// Allocate and begin one command buffer.
    ///
    /// # Safety
    /// The device must be the one the pool was created on.
    pub unsafe fn begin(&mut self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let cmd = self.pool.allocate_command_buffer(device)?;
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::empty())?;
        Ok(cmd)
    }

    /// End recording and store the buffer for a frame slot.
    ///
    /// # Safety
    /// `cmd` must have been begun through [`StageCommands::begin`].
    pub unsafe fn end(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        slot: usize,
    ) -> Result<()> {
        end_command_buffer(device, cmd)?;
        self.buffers[slot].push(cmd);
        Ok(())
    }

    /// Free every recorded buffer; used before re-recording on scene
    /// change. Buffers must not be in flight.
    pub fn clear(&mut self, device: &ash::Device) -> Result<()> {
        let mut all: Vec<vk::CommandBuffer> = Vec::new();
        for slot in &mut self.buffers {
            all.append(slot);
        }
        unsafe {
            if !all.is_empty() {
                device.free_command_buffers(self.pool.handle(), &all);
            }
            self.pool.reset(device)?;
        }
        Ok(())
    }

    pub fn buffers(&self, slot: usize) -> &[vk::CommandBuffer] {
        &self.buffers[slot]
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// No recorded buffer may be in flight.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pool.destroy(device);
    }
}

/// A stage's labeled GPU timer; a no-op when the device was built without a
/// timestamp budget.
pub struct StageTimer {
    timer: Option<Timer>,
}

impl StageTimer {
    pub fn new(device: &RenderDevice, label: impl Into<String>) -> Result<Self> {
        let mut guard = device.timers.lock();
        let timer = match guard.as_mut() {
            Some(pool) => Some(pool.create_timer(label)?),
            None => None,
        };
        Ok(Self { timer })
    }

    /// # Safety
    /// The command buffer must be in recording state on `device`.
    pub unsafe fn begin(&self, device: &RenderDevice, cmd: vk::CommandBuffer, slot: usize) {
        if let Some(timer) = self.timer {
            if let Some(pool) = device.timers.lock().as_ref() {
                pool.begin(cmd, timer, slot);
            }
        }
    }

    /// # Safety
    /// The command buffer must be in recording state on `device`.
    pub unsafe fn end(&self, device: &RenderDevice, cmd: vk::CommandBuffer, slot: usize) {
        if let Some(timer) = self.timer {
            if let Some(pool) = device.timers.lock().as_ref() {
                pool.end(cmd, timer, slot);
            }
        }
    }

    /// Collect this device's timers for a slot into a record.
    pub fn collect(device: &RenderDevice, slot: usize, record: &mut TimingRecord) {
        if let Some(pool) = device.timers.lock().as_ref() {
            pool.collect(slot, record);
        }
    }
}

/// Record a compute-to-compute memory barrier: all shader writes visible to
/// subsequent shader reads within the frame's command buffer.
///
/// # Safety
/// The command buffer must be in recording state.
pub unsafe fn compute_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
        .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
        .dst_access_mask(vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE);
    let dependency_info =
        vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency_info);
}

/// Barrier between ray-tracing passes accumulating into the same targets.
///
/// # Safety
/// The command buffer must be in recording state.
pub unsafe fn ray_tracing_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
        .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
        .dst_access_mask(vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE);
    let dependency_info =
        vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency_info);
}
