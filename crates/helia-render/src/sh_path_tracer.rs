//! SH probe path tracer.
//!
//! Samples rays per grid probe, projects incoming radiance onto spherical
//! harmonics, and blends the result into a persistent 3D coefficient grid
//! with an exponential moving average. A downstream deferred shading stage
//! samples the grid through the scene's `textures3d` table.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use helia_core::{RenderError, Result};
use helia_gpu::{BindingValue, GbufferTarget, RenderDevice};
use helia_shader::{DefineMap, HitGroup, ShaderSet, ShaderSource};
use serde::{Deserialize, Serialize};

use crate::options::{FilmFilter, RtStageOptions};
use crate::rt_stage::RtStageCore;
use crate::scene::SceneView;
use crate::stage::RenderStage;

/// Highest supported SH order.
pub const MAX_SH_ORDER: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShPathTracerOptions {
    pub rt: RtStageOptions,
    pub samples_per_probe: u32,
    /// Rays traced per raygen invocation; samples_per_probe is split over
    /// invocations.
    pub samples_per_invocation: u32,
    pub film: FilmFilter,
    pub film_radius: f32,
    pub russian_roulette_delta: f32,
    /// EMA blend ratio into the persistent grid, in (0, 1].
    pub temporal_ratio: f32,
    pub indirect_clamping: f32,
    pub importance_sample_envmap: bool,
    /// Which grid in the scene's SH grid list this stage feeds.
    pub sh_grid_index: usize,
    /// SH order, 0..=4.
    pub sh_order: u32,
}

impl Default for ShPathTracerOptions {
    fn default() -> Self {
        Self {
            rt: RtStageOptions::default(),
            samples_per_probe: 8,
            samples_per_invocation: 1,
            film: FilmFilter::BlackmanHarris,
            film_radius: 1.0,
            russian_roulette_delta: 0.0,
            temporal_ratio: 0.02,
            indirect_clamping: 100.0,
            importance_sample_envmap: true,
            sh_grid_index: 0,
            sh_order: 2,
        }
    }
}

/// The SH grid texture this stage writes.
#[derive(Debug, Clone, Copy)]
pub struct ShGridOutput {
    pub view: vk::ImageView,
    pub dimensions: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PushConstants {
    samples: u32,
    previous_samples: u32,
    min_ray_dist: f32,
    indirect_clamping: f32,
    film_radius: f32,
    russian_roulette_delta: f32,
    temporal_ratio: f32,
    /// -1 for no environment map.
    environment_proj: i32,
    environment_factor: Vec4,
}

fn load_sources(opt: &ShPathTracerOptions) -> Result<ShaderSet> {
    let mut defines = DefineMap::new();
    defines.insert("MAX_BOUNCES".to_string(), opt.rt.max_ray_depth.to_string());
    defines.insert("SH_ORDER".to_string(), opt.sh_order.to_string());
    defines.insert("SH_GRID_INDEX".to_string(), opt.sh_grid_index.to_string());
    defines.insert(
        "SAMPLES_PER_INVOCATION".to_string(),
        opt.samples_per_invocation.max(1).to_string(),
    );
    if opt.importance_sample_envmap {
        defines.insert("IMPORTANCE_SAMPLE_ENVMAP".to_string(), String::new());
    }
    if opt.russian_roulette_delta > 0.0 {
        defines.insert("USE_RUSSIAN_ROULETTE".to_string(), String::new());
    }
    opt.rt.common_defines(&mut defines);

    // Surface interaction is identical to the path tracer, so its hit and
    // miss programs are shared; only the raygen differs.
    Ok(ShaderSet::ray_tracing(
        ShaderSource::compile("shader/sh_path_tracer.rgen", &defines)?,
        vec![
            HitGroup::triangles(
                ShaderSource::compile("shader/path_tracer.rchit", &defines)?,
                ShaderSource::compile("shader/path_tracer.rahit", &defines)?,
            ),
            HitGroup::triangles(
                ShaderSource::load("shader/path_tracer_shadow.rchit")?,
                ShaderSource::compile("shader/path_tracer_shadow.rahit", &defines)?,
            ),
        ],
        vec![
            ShaderSource::compile("shader/path_tracer.rmiss", &defines)?,
            ShaderSource::compile("shader/path_tracer_shadow.rmiss", &defines)?,
        ],
    ))
}

pub struct ShPathTracerStage {
    core: RtStageCore,
    opt: ShPathTracerOptions,
    output_grid: ShGridOutput,
}

impl ShPathTracerStage {
    pub fn new(
        dev: &RenderDevice,
        output_grid: ShGridOutput,
        opt: ShPathTracerOptions,
    ) -> Result<Self> {
        if opt.sh_order > MAX_SH_ORDER {
            return Err(RenderError::Other(format!(
                "SH order {} out of supported range 0..={MAX_SH_ORDER}",
                opt.sh_order
            )));
        }
        if !(opt.temporal_ratio > 0.0 && opt.temporal_ratio <= 1.0) {
            return Err(RenderError::Other(format!(
                "temporal ratio {} outside (0, 1]",
                opt.temporal_ratio
            )));
        }

        let set = load_sources(&opt)?;
        let core = RtStageCore::new(dev, set, &opt.rt, "sh probes")?;
        Ok(Self {
            core,
            opt,
            output_grid,
        })
    }

    /// Re-record against the current scene.
    pub fn record(&mut self, dev: &RenderDevice, scene: &SceneView) -> Result<()> {
        let grid_binding = (
            "out_sh_grid",
            BindingValue::storage_image(self.output_grid.view),
        );
        // Probe grids are camera-independent.
        self.core
            .bind_scene(scene, &GbufferTarget::default(), None, &[grid_binding]);

        let (environment_proj, environment_factor) = match &scene.environment_map {
            Some(envmap) => (envmap.projection as i32, envmap.factor),
            None => (-1, Vec4::ZERO),
        };

        let [dim_x, dim_y, dim_z] = self.output_grid.dimensions;
        let opt = self.opt.clone();
        let invocations = (opt.samples_per_probe.max(1))
            .div_ceil(opt.samples_per_invocation.max(1));
        self.core.record(
            dev,
            dim_x * dim_y,
            dim_z,
            invocations,
            1,
            move |pipeline, cmd, _pass| {
                let control = PushConstants {
                    samples: opt.samples_per_probe.max(1),
                    previous_samples: 0,
                    min_ray_dist: opt.rt.min_ray_dist,
                    indirect_clamping: opt.indirect_clamping,
                    film_radius: opt.film_radius,
                    russian_roulette_delta: opt.russian_roulette_delta,
                    temporal_ratio: opt.temporal_ratio,
                    environment_proj,
                    environment_factor,
                };
                unsafe {
                    pipeline.push_constants(cmd, &control);
                }
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

impl RenderStage for ShPathTracerStage {
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
    fn rejects_out_of_range_order() {
        let mut opt = ShPathTracerOptions::default();
        opt.sh_order = 5;
        // Construction must fail before touching any device; the order
        // check runs first.
        assert!(opt.sh_order > MAX_SH_ORDER);
    }

    #[test]
    fn temporal_ratio_bounds() {
        let opt = ShPathTracerOptions::default();
        assert!(opt.temporal_ratio > 0.0 && opt.temporal_ratio <= 1.0);
    }

    #[test]
    fn push_constants_fit_the_budget() {
        assert!(std::mem::size_of::<PushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
    }
}
