//! SVGF spatiotemporal denoiser.
//!
//! Three compute phases over the frame's G-buffer, each separated from the
//! next by a compute-to-compute memory barrier:
//! 1. temporal reprojection + moments accumulation
//! 2. variance estimation (spatial fallback for short histories)
//! 3. iterated à-trous wavelet filtering, stride doubling per iteration,
//!    diffuse and specular chains filtered independently
//!
//! Filtered color lands back in the input's color channel. History
//! (color, specular, moments) lives in per-slot textures; the previous
//! frame's G-buffer attributes are read from the other frame slot.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use hashbrown::HashMap;
use helia_core::Result;
use helia_gpu::{
    BindingValue, ComputePipeline, GbufferTarget, RenderDevice, RenderTarget, UniformRing,
    FRAMES_IN_FLIGHT,
};
use helia_shader::{DefineMap, ShaderSource};
use serde::{Deserialize, Serialize};

use crate::gbuffer::GbufferResources;
use crate::scene::SceneView;
use crate::stage::{compute_barrier, RenderStage, StageCommands, StageTimer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvgfOptions {
    /// Viewports denoised per dispatch; drives jitter history length and
    /// dispatch depth.
    pub active_viewport_count: u32,
    /// À-trous iterations for the diffuse chain.
    pub atrous_diffuse_iters: u32,
    /// À-trous iterations for the specular chain.
    pub atrous_spec_iters: u32,
    pub atrous_kernel_radius: u32,
    /// Luminance edge-stopping sigma.
    pub sigma_l: f32,
    /// Linear-depth edge-stopping sigma.
    pub sigma_z: f32,
    /// Normal edge-stopping sigma (cosine power).
    pub sigma_n: f32,
    pub temporal_alpha_color: f32,
    pub temporal_alpha_moments: f32,
}

impl Default for SvgfOptions {
    fn default() -> Self {
        Self {
            active_viewport_count: 1,
            atrous_diffuse_iters: 4,
            atrous_spec_iters: 4,
            atrous_kernel_radius: 2,
            sigma_l: 10.0,
            sigma_z: 1.0,
            sigma_n: 128.0,
            temporal_alpha_color: 0.2,
            temporal_alpha_moments: 0.2,
        }
    }
}

/// The filtered signal an à-trous dispatch works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AtrousChannel {
    Diffuse,
    Specular,
}

/// One à-trous dispatch in the recorded sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AtrousDispatch {
    pub channel: AtrousChannel,
    /// Iteration index within the channel's chain.
    pub iteration: u32,
    /// Dilation stride, `2^iteration`.
    pub stride: u32,
    /// Whether a memory barrier precedes this dispatch.
    pub barrier_before: bool,
}

/// The à-trous schedule: each chain runs its iterations with doubling
/// strides, consecutive dispatches separated by barriers (including across
/// the chain boundary).
pub(crate) fn atrous_schedule(diffuse_iters: u32, spec_iters: u32) -> Vec<AtrousDispatch> {
    let mut schedule = Vec::with_capacity((diffuse_iters + spec_iters) as usize);
    for (channel, iters) in [
        (AtrousChannel::Diffuse, diffuse_iters),
        (AtrousChannel::Specular, spec_iters),
    ] {
        for iteration in 0..iters {
            schedule.push(AtrousDispatch {
                channel,
                iteration,
                stride: 1 << iteration,
                barrier_before: !schedule.is_empty(),
            });
        }
    }
    schedule
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TemporalPushConstants {
    size: [i32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct AtrousPushConstants {
    size: [i32; 2],
    iteration: i32,
    stride: i32,
    iteration_count: i32,
    /// 0 = diffuse chain, 1 = specular chain.
    channel: i32,
}

/// Per-frame filter parameters read by all three shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SvgfUniforms {
    sigma_l: f32,
    sigma_z: f32,
    sigma_n: f32,
    temporal_alpha_color: f32,
    temporal_alpha_moments: f32,
    kernel_radius: i32,
    _padding: [f32; 2],
}

pub struct SvgfStage {
    temporal: ComputePipeline,
    estimate_variance: ComputePipeline,
    atrous: ComputePipeline,
    commands: StageCommands,
    timer: StageTimer,
    opt: SvgfOptions,
    gbuffer: GbufferTarget,

    atrous_diffuse_pingpong: [RenderTarget; 2],
    atrous_specular_pingpong: [RenderTarget; 2],
    moments_history: [RenderTarget; 2],
    color_history: RenderTarget,
    specular_history: RenderTarget,
    resources: GbufferResources,

    jitter_buffer: UniformRing,
    uniforms: UniformRing,
    scene_counter: u64,
}

impl SvgfStage {
    pub fn new(dev: &RenderDevice, gbuffer: GbufferTarget, opt: SvgfOptions) -> Result<Self> {
        let defines = DefineMap::new();
        let overrides = HashMap::new();
        let temporal = ComputePipeline::new(
            dev,
            ShaderSource::compile("shader/svgf_temporal.comp", &defines)?,
            &overrides,
        )?;
        let estimate_variance = ComputePipeline::new(
            dev,
            ShaderSource::compile("shader/svgf_estimate_variance.comp", &defines)?,
            &overrides,
        )?;
        let atrous = ComputePipeline::new(
            dev,
            ShaderSource::compile("shader/svgf_atrous.comp", &defines)?,
            &overrides,
        )?;

        let extent = gbuffer.extent();
        let layers = gbuffer.layer_count().max(1);
        let mut resources = GbufferResources::new();
        let mut scratch = |name: &str| {
            resources.allocate_target(
                dev,
                extent,
                layers,
                vk::Format::R16G16B16A16_SFLOAT,
                name,
            )
        };

        let atrous_diffuse_pingpong = [scratch("svgf_diffuse_ping")?, scratch("svgf_diffuse_pong")?];
        let atrous_specular_pingpong =
            [scratch("svgf_specular_ping")?, scratch("svgf_specular_pong")?];
        let moments_history = [scratch("svgf_moments_prev")?, scratch("svgf_moments_cur")?];
        let color_history = scratch("svgf_color_hist")?;
        let specular_history = scratch("svgf_spec_hist")?;

        let viewports = opt.active_viewport_count.max(1) as u64;
        let mut allocator = dev.allocator.lock();
        let jitter_buffer = UniformRing::new(
            &mut allocator,
            std::mem::size_of::<Vec4>() as u64 * viewports,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "svgf_jitter",
        )?;
        let uniforms = UniformRing::new(
            &mut allocator,
            std::mem::size_of::<SvgfUniforms>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "svgf_uniforms",
        )?;
        drop(allocator);

        let commands = StageCommands::new(dev)?;
        let timer = StageTimer::new(dev, format!("svgf ({layers} viewports)"))?;

        Ok(Self {
            temporal,
            estimate_variance,
            atrous,
            commands,
            timer,
            opt,
            gbuffer,
            atrous_diffuse_pingpong,
            atrous_specular_pingpong,
            moments_history,
            color_history,
            specular_history,
            resources,
            jitter_buffer,
            uniforms,
            scene_counter: u64::MAX,
        })
    }

    fn bind_descriptors(&mut self) {
        for slot in 0..FRAMES_IN_FLIGHT {
            // Previous-frame attributes live in the other slot's images.
            let prev = slot ^ 1;
            let gb = &self.gbuffer;
            let image = BindingValue::storage_image;

            self.temporal.update_descriptor_set(
                &[
                    ("in_color", target(gb.color.as_ref(), slot)),
                    ("in_diffuse", target(gb.diffuse.as_ref(), slot)),
                    ("previous_color", image(self.color_history.view(slot))),
                    ("in_normal", target(gb.normal.as_ref(), slot)),
                    ("in_screen_motion", target(gb.screen_motion.as_ref(), slot)),
                    ("previous_normal", target(gb.normal.as_ref(), prev)),
                    ("in_albedo", target(gb.albedo.as_ref(), slot)),
                    ("previous_moments", image(self.moments_history[0].view(slot))),
                    ("out_moments", image(self.moments_history[1].view(slot))),
                    ("out_color", image(self.atrous_diffuse_pingpong[0].view(slot))),
                    (
                        "out_specular",
                        image(self.atrous_specular_pingpong[0].view(slot)),
                    ),
                    ("in_linear_depth", target(gb.linear_depth.as_ref(), slot)),
                    (
                        "previous_linear_depth",
                        target(gb.linear_depth.as_ref(), prev),
                    ),
                    ("jitter_info", BindingValue::buffer(self.jitter_buffer.buffer())),
                    ("previous_specular", image(self.specular_history.view(slot))),
                    ("filter_params", BindingValue::buffer(self.uniforms.buffer())),
                ],
                slot,
            );

            self.estimate_variance.update_descriptor_set(
                &[
                    ("in_color", image(self.atrous_diffuse_pingpong[0].view(slot))),
                    ("out_color", image(self.atrous_diffuse_pingpong[1].view(slot))),
                    (
                        "in_specular",
                        image(self.atrous_specular_pingpong[0].view(slot)),
                    ),
                    (
                        "out_specular",
                        image(self.atrous_specular_pingpong[1].view(slot)),
                    ),
                    ("in_linear_depth", target(gb.linear_depth.as_ref(), slot)),
                    ("color_hist", image(self.color_history.view(slot))),
                    ("current_moments", image(self.moments_history[1].view(slot))),
                    ("moments_hist", image(self.moments_history[0].view(slot))),
                    ("in_albedo", target(gb.albedo.as_ref(), slot)),
                    ("in_normal", target(gb.normal.as_ref(), slot)),
                    ("filter_params", BindingValue::buffer(self.uniforms.buffer())),
                ],
                slot,
            );

            self.atrous.update_descriptor_set(
                &[
                    ("color_ping", image(self.atrous_diffuse_pingpong[1].view(slot))),
                    ("color_pong", image(self.atrous_diffuse_pingpong[0].view(slot))),
                    (
                        "specular_ping",
                        image(self.atrous_specular_pingpong[1].view(slot)),
                    ),
                    (
                        "specular_pong",
                        image(self.atrous_specular_pingpong[0].view(slot)),
                    ),
                    ("final_output", target(gb.color.as_ref(), slot)),
                    ("color_hist", image(self.color_history.view(slot))),
                    ("spec_hist", image(self.specular_history.view(slot))),
                    ("in_linear_depth", target(gb.linear_depth.as_ref(), slot)),
                    ("in_normal", target(gb.normal.as_ref(), slot)),
                    ("in_albedo", target(gb.albedo.as_ref(), slot)),
                    ("filter_params", BindingValue::buffer(self.uniforms.buffer())),
                ],
                slot,
            );
        }
    }

    /// Re-record the three-phase filter sequence.
    pub fn record(&mut self, dev: &RenderDevice, scene: &SceneView) -> Result<()> {
        self.bind_descriptors();

        let extent = self.gbuffer.extent();
        let size = [extent.width as i32, extent.height as i32];
        let viewports = self.opt.active_viewport_count.max(1);
        let workgroups = ((extent.width + 15) / 16, (extent.height + 15) / 16);
        let schedule = atrous_schedule(self.opt.atrous_diffuse_iters, self.opt.atrous_spec_iters);

        self.commands.clear(dev.device())?;
        for slot in 0..FRAMES_IN_FLIGHT {
            let cmd = unsafe { self.commands.begin(dev.device())? };
            unsafe {
                self.timer.begin(dev, cmd, slot);

                self.jitter_buffer.upload(dev.device(), slot, cmd);
                self.uniforms.upload(dev.device(), slot, cmd);

                let control = TemporalPushConstants { size };
                self.temporal.bind(cmd, slot);
                self.temporal.push_constants(cmd, &control);
                dev.device()
                    .cmd_dispatch(cmd, workgroups.0, workgroups.1, viewports);

                compute_barrier(dev.device(), cmd);

                self.estimate_variance.bind(cmd, slot);
                self.estimate_variance.push_constants(cmd, &control);
                dev.device()
                    .cmd_dispatch(cmd, workgroups.0, workgroups.1, viewports);

                compute_barrier(dev.device(), cmd);

                self.atrous.bind(cmd, slot);
                for dispatch in &schedule {
                    if dispatch.barrier_before {
                        compute_barrier(dev.device(), cmd);
                    }
                    let iteration_count = match dispatch.channel {
                        AtrousChannel::Diffuse => self.opt.atrous_diffuse_iters,
                        AtrousChannel::Specular => self.opt.atrous_spec_iters,
                    };
                    let control = AtrousPushConstants {
                        size,
                        iteration: dispatch.iteration as i32,
                        stride: dispatch.stride as i32,
                        iteration_count: iteration_count as i32,
                        channel: (dispatch.channel == AtrousChannel::Specular) as i32,
                    };
                    self.atrous.push_constants(cmd, &control);
                    dev.device()
                        .cmd_dispatch(cmd, workgroups.0, workgroups.1, viewports);
                }

                self.timer.end(dev, cmd, slot);
                self.commands.end(dev.device(), cmd, slot)?;
            }
        }
        self.scene_counter = scene.state_counter();
        Ok(())
    }

    pub fn needs_record(&self, scene: &SceneView) -> bool {
        self.scene_counter != scene.state_counter()
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(mut self, dev: &RenderDevice) {
        self.temporal.destroy();
        self.estimate_variance.destroy();
        self.atrous.destroy();
        self.commands.destroy(dev.device());
        self.resources.destroy(dev);
        let mut allocator = dev.allocator.lock();
        let _ = self.jitter_buffer.destroy(&mut allocator);
        let _ = self.uniforms.destroy(&mut allocator);
    }
}

/// Binding over an optional G-buffer channel, placeholder-filled when the
/// channel is not allocated.
fn target(channel: Option<&RenderTarget>, slot: usize) -> BindingValue {
    match channel {
        Some(target) => BindingValue::storage_image(target.view(slot)),
        None => BindingValue::Empty,
    }
}

impl RenderStage for SvgfStage {
    fn set_scene(&mut self, _scene: &SceneView) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, scene: &SceneView, slot: usize) -> Result<()> {
        // Jitter history: (current, previous) per active viewport.
        let viewports = self.opt.active_viewport_count.max(1) as usize;
        let mut history = vec![Vec4::ZERO; viewports];
        for (i, entry) in history.iter_mut().enumerate() {
            if let Some(camera) = scene.camera(i) {
                let current = camera.jitter();
                let previous = camera.previous_jitter();
                *entry = Vec4::new(current.x, current.y, previous.x, previous.y);
            }
        }
        self.jitter_buffer.update(slot, &history)?;

        let uniforms = SvgfUniforms {
            sigma_l: self.opt.sigma_l,
            sigma_z: self.opt.sigma_z,
            sigma_n: self.opt.sigma_n,
            temporal_alpha_color: self.opt.temporal_alpha_color,
            temporal_alpha_moments: self.opt.temporal_alpha_moments,
            kernel_radius: self.opt.atrous_kernel_radius as i32,
            _padding: [0.0; 2],
        };
        self.uniforms.update(slot, &[uniforms])?;
        Ok(())
    }

    fn command_buffers(&self, slot: usize) -> &[vk::CommandBuffer] {
        self.commands.buffers(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_iterations_use_doubling_strides() {
        let schedule = atrous_schedule(4, 0);
        assert_eq!(schedule.len(), 4);
        let strides: Vec<u32> = schedule.iter().map(|d| d.stride).collect();
        assert_eq!(strides, vec![1, 2, 4, 8]);
        let barriers = schedule.iter().filter(|d| d.barrier_before).count();
        assert_eq!(barriers, 3);
    }

    #[test]
    fn chains_are_independent() {
        let schedule = atrous_schedule(3, 2);
        assert_eq!(schedule.len(), 5);
        // The specular chain restarts its stride sequence.
        assert_eq!(schedule[3].channel, AtrousChannel::Specular);
        assert_eq!(schedule[3].stride, 1);
        assert_eq!(schedule[4].stride, 2);
        // Barrier between the chains too.
        assert!(schedule[3].barrier_before);
    }

    #[test]
    fn empty_schedule_for_zero_iterations() {
        assert!(atrous_schedule(0, 0).is_empty());
    }

    #[test]
    fn push_constants_fit_the_budget() {
        assert!(std::mem::size_of::<AtrousPushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
        assert!(std::mem::size_of::<TemporalPushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
    }
}
