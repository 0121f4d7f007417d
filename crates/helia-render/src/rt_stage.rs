//! Shared machinery for ray-tracing camera stages.
//!
//! The path tracer, Whitted tracer, SH probe tracer and feature stage all
//! drive one ray-tracing pipeline over per-slot pre-recorded command
//! buffers; they differ in shader sources, push constants and pass counts.

use ash::vk;
use hashbrown::HashMap;
use helia_core::{RenderError, Result};
use helia_gpu::{BindingValue, GbufferTarget, RayTracingPipeline, RenderDevice, FRAMES_IN_FLIGHT};
use helia_shader::ShaderSet;

use crate::options::RtStageOptions;
use crate::scene::SceneView;
use crate::stage::{ray_tracing_barrier, StageCommands, StageTimer};

/// The storage-image binding name a G-buffer channel is written through.
pub(crate) fn target_binding_name(channel: &str) -> &'static str {
    match channel {
        "color" => "color_target",
        "diffuse" => "diffuse_target",
        "specular" => "specular_target",
        "albedo" => "albedo_target",
        "material" => "material_target",
        "normal" => "normal_target",
        "view_normal" => "view_normal_target",
        "world_pos" => "world_pos_target",
        "view_pos" => "view_pos_target",
        "screen_motion" => "screen_motion_target",
        "world_motion" => "world_motion_target",
        "view_motion" => "view_motion_target",
        "linear_depth" => "linear_depth_target",
        "depth" => "depth_target",
        "instance_id" => "instance_id_target",
        "emission" => "emission_target",
        _ => "color_target",
    }
}

/// Common core of a ray-tracing stage: the pipeline and the recorded
/// buffers.
pub struct RtStageCore {
    pipeline: RayTracingPipeline,
    commands: StageCommands,
    timer: StageTimer,
    scene_counter: u64,
}

impl RtStageCore {
    /// Build the pipeline. Fails with `MissingCapability` when the device
    /// cannot trace rays.
    pub fn new(
        dev: &RenderDevice,
        set: ShaderSet,
        opt: &RtStageOptions,
        label: &str,
    ) -> Result<Self> {
        if !dev.is_ray_tracing_supported() {
            return Err(RenderError::MissingCapability(format!(
                "{label} requires ray tracing"
            )));
        }

        let mut count_overrides = HashMap::new();
        count_overrides.insert("textures".to_string(), opt.max_textures);
        count_overrides.insert("textures3d".to_string(), opt.max_3d_textures);

        let pipeline = RayTracingPipeline::new(dev, set, opt.max_ray_depth, &count_overrides)?;
        let commands = StageCommands::new(dev)?;
        let timer = StageTimer::new(dev, label)?;

        Ok(Self {
            pipeline,
            commands,
            timer,
            scene_counter: u64::MAX,
        })
    }

    /// Whether the recorded buffers are stale for this scene.
    pub fn needs_record(&self, scene: &SceneView) -> bool {
        self.scene_counter != scene.state_counter()
    }

    /// Store scene bindings plus the stage's G-buffer output images in
    /// every slot's push-descriptor state.
    pub fn bind_scene(
        &mut self,
        scene: &SceneView,
        gbuffer: &GbufferTarget,
        camera_index: Option<usize>,
        extra: &[(&'static str, BindingValue)],
    ) {
        for slot in 0..FRAMES_IN_FLIGHT {
            let mut values = scene.descriptor_bindings(camera_index);
            for (channel, target) in gbuffer.entries() {
                values.push((
                    target_binding_name(channel),
                    BindingValue::storage_image(target.view(slot)),
                ));
            }
            values.extend_from_slice(extra);
            self.pipeline.update_descriptor_set(&values, slot);
        }
        self.scene_counter = scene.state_counter();
    }

    /// Re-record every slot's command buffer: bind, then `passes`
    /// trace-rays dispatches with barriers between accumulation passes.
    /// `push` records the pass's push constants.
    pub fn record<F>(
        &mut self,
        dev: &RenderDevice,
        width: u32,
        height: u32,
        depth: u32,
        passes: u32,
        push: F,
    ) -> Result<()>
    where
        F: Fn(&RayTracingPipeline, vk::CommandBuffer, u32),
    {
        self.commands.clear(dev.device())?;
        for slot in 0..FRAMES_IN_FLIGHT {
            let cmd = unsafe { self.commands.begin(dev.device())? };
            unsafe {
                self.timer.begin(dev, cmd, slot);
                self.pipeline.bind(cmd, slot);
                for pass in 0..passes.max(1) {
                    if pass > 0 {
                        ray_tracing_barrier(dev.device(), cmd);
                    }
                    push(&self.pipeline, cmd, pass);
                    self.pipeline.trace_rays(cmd, width, height, depth);
                }
                self.timer.end(dev, cmd, slot);
                self.commands.end(dev.device(), cmd, slot)?;
            }
        }
        Ok(())
    }

    pub fn command_buffers(&self, slot: usize) -> &[vk::CommandBuffer] {
        self.commands.buffers(slot)
    }

    /// Destroy pipeline and command pool.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, dev: &RenderDevice) {
        let mut allocator = dev.allocator.lock();
        self.pipeline.destroy(&mut allocator);
        drop(allocator);
        self.commands.destroy(dev.device());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_binding_names_follow_channels() {
        assert_eq!(target_binding_name("color"), "color_target");
        assert_eq!(target_binding_name("screen_motion"), "screen_motion_target");
        assert_eq!(target_binding_name("linear_depth"), "linear_depth_target");
    }
}
