//! Feature stage: renders a single G-buffer attribute per pixel.

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

/// The attribute written by the stage. The integer values select the
/// shader path at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feature {
    Albedo = 0,
    WorldNormal,
    ViewNormal,
    WorldPos,
    ViewPos,
    Distance,
    WorldMotion,
    ViewMotion,
    ScreenMotion,
    InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStageOptions {
    pub rt: RtStageOptions,
    pub feature: Feature,
    /// Missed rays are filled with this value.
    pub default_value: [f32; 4],
}

impl Default for FeatureStageOptions {
    fn default() -> Self {
        Self {
            rt: RtStageOptions::default(),
            feature: Feature::Albedo,
            default_value: [f32::NAN; 4],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PushConstants {
    default_value: Vec4,
    min_ray_dist: f32,
    _padding: [f32; 3],
}

fn load_sources(opt: &FeatureStageOptions) -> Result<ShaderSet> {
    let mut defines = DefineMap::new();
    defines.insert("FEATURE".to_string(), (opt.feature as i32).to_string());
    opt.rt.common_defines(&mut defines);

    Ok(ShaderSet::ray_tracing(
        ShaderSource::compile("shader/feature.rgen", &defines)?,
        vec![HitGroup::triangles(
            ShaderSource::compile("shader/feature.rchit", &defines)?,
            ShaderSource::compile("shader/feature.rahit", &defines)?,
        )],
        vec![ShaderSource::compile("shader/feature.rmiss", &defines)?],
    ))
}

pub struct FeatureStage {
    core: RtStageCore,
    opt: FeatureStageOptions,
    gbuffer: GbufferTarget,
}

impl FeatureStage {
    pub fn new(
        dev: &RenderDevice,
        gbuffer: GbufferTarget,
        opt: FeatureStageOptions,
    ) -> Result<Self> {
        let set = load_sources(&opt)?;
        let core = RtStageCore::new(dev, set, &opt.rt, "feature")?;
        Ok(Self { core, opt, gbuffer })
    }

    /// Re-record against the current scene.
    pub fn record(&mut self, dev: &RenderDevice, scene: &SceneView) -> Result<()> {
        self.core.bind_scene(scene, &self.gbuffer, Some(0), &[]);

        let control = PushConstants {
            default_value: Vec4::from_array(self.opt.default_value),
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

impl RenderStage for FeatureStage {
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
    fn feature_indices_are_stable() {
        assert_eq!(Feature::Albedo as i32, 0);
        assert_eq!(Feature::ScreenMotion as i32, 8);
        assert_eq!(Feature::InstanceId as i32, 9);
    }

    #[test]
    fn push_constants_fit_the_budget() {
        assert!(std::mem::size_of::<PushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
    }
}
