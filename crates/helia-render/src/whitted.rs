//! Whitted-style ray-tracing stage.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use helia_core::Result;
use helia_gpu::{GbufferTarget, RenderDevice};
use helia_shader::{DefineMap, HitGroup, ShaderSet, ShaderSource};
use serde::{Deserialize, Serialize};

use crate::options::RtStageOptions;
use crate::rt_stage::RtStageCore;
use crate::scene::SceneView;
use crate::stage::RenderStage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhittedOptions {
    pub rt: RtStageOptions,
    /// Flat ambient term.
    pub ambient: [f32; 3],
}

impl Default for WhittedOptions {
    fn default() -> Self {
        Self {
            rt: RtStageOptions::default(),
            ambient: [0.0; 3],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PushConstants {
    directional_light_count: u32,
    point_light_count: u32,
    max_depth: u32,
    /// -1 for no environment map.
    environment_proj: i32,
    environment_factor: Vec4,
    ambient: Vec4,
    min_ray_dist: f32,
    _padding: [f32; 3],
}

fn load_sources(opt: &WhittedOptions) -> Result<ShaderSet> {
    let mut defines = DefineMap::new();
    opt.rt.common_defines(&mut defines);

    Ok(ShaderSet::ray_tracing(
        ShaderSource::compile("shader/whitted.rgen", &defines)?,
        vec![
            HitGroup::triangles(
                ShaderSource::load("shader/whitted.rchit")?,
                ShaderSource::load("shader/whitted.rahit")?,
            ),
            HitGroup::triangles(
                ShaderSource::load("shader/transmission_shadow.rchit")?,
                ShaderSource::load("shader/transmission_shadow.rahit")?,
            ),
        ],
        vec![
            ShaderSource::load("shader/whitted.rmiss")?,
            ShaderSource::load("shader/transmission_shadow.rmiss")?,
        ],
    ))
}

pub struct WhittedStage {
    core: RtStageCore,
    opt: WhittedOptions,
    gbuffer: GbufferTarget,
}

impl WhittedStage {
    pub fn new(dev: &RenderDevice, gbuffer: GbufferTarget, opt: WhittedOptions) -> Result<Self> {
        let set = load_sources(&opt)?;
        let core = RtStageCore::new(dev, set, &opt.rt, "whitted")?;
        Ok(Self { core, opt, gbuffer })
    }

    /// Re-record against the current scene.
    pub fn record(&mut self, dev: &RenderDevice, scene: &SceneView) -> Result<()> {
        self.core.bind_scene(scene, &self.gbuffer, Some(0), &[]);

        let (environment_proj, environment_factor) = match &scene.environment_map {
            Some(envmap) => (envmap.projection as i32, envmap.factor),
            None => (-1, Vec4::ZERO),
        };
        let control = PushConstants {
            directional_light_count: scene.directional_light_count,
            point_light_count: scene.point_light_count + scene.spot_light_count,
            max_depth: self.opt.rt.max_ray_depth,
            environment_proj,
            environment_factor,
            ambient: Vec4::new(self.opt.ambient[0], self.opt.ambient[1], self.opt.ambient[2], 1.0),
            min_ray_dist: self.opt.rt.min_ray_dist,
            _padding: [0.0; 3],
        };

        let extent = self.gbuffer.extent();
        let layers = self.gbuffer.layer_count().max(1);
        self.core.record(
            dev,
            extent.width,
            extent.height,
            layers,
            1,
            move |pipeline, cmd, _pass| unsafe {
                pipeline.push_constants(cmd, &control);
            },
        )
    }

    pub fn needs_record(&self, scene: &SceneView) -> bool {
        self.core.needs_record(scene)
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, dev: &RenderDevice) {
        self.core.destroy(dev);
    }
}

impl RenderStage for WhittedStage {
    fn set_scene(&mut self, _scene: &SceneView) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, _scene: &SceneView, _slot: usize) -> Result<()> {
        Ok(())
    }

    fn command_buffers(&self, slot: usize) -> &[vk::CommandBuffer] {
        self.core.command_buffers(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_fit_the_budget() {
        assert!(std::mem::size_of::<PushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
    }
}
