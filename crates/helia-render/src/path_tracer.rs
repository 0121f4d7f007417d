//! The path-tracing stage.
//!
//! Per-sample-per-pixel work on a ray-tracing pipeline. Feature flags are
//! compile-time defines, so every distinct `(options, gbuffer)` pair yields
//! a distinct binary; the shader-source cache keeps recompilation at one
//! per distinct spliced text.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use helia_core::Result;
use helia_gpu::{GbufferTarget, RenderDevice};
use helia_shader::{DefineMap, HitGroup, ShaderSet, ShaderSource};
use serde::{Deserialize, Serialize};

use crate::options::{FilmFilter, RtStageOptions};
use crate::rt_stage::RtStageCore;
use crate::scene::SceneView;
use crate::stage::RenderStage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathTracerOptions {
    pub rt: RtStageOptions,
    /// Total samples accumulated per pixel per frame; executed as
    /// single-sample passes.
    pub samples_per_pixel: u32,
    pub film: FilmFilter,
    /// 0.5 is "correct" for the box filter.
    pub film_radius: f32,
    /// Zero disables russian roulette.
    pub russian_roulette_delta: f32,
    /// Radiance clamp for indirect bounces; zero disables.
    pub indirect_clamping: f32,
    /// Path-space regularization gamma; zero disables.
    pub regularization_gamma: f32,
    pub use_shadow_terminator_fix: bool,
    pub use_white_albedo_on_first_bounce: bool,
    pub hide_lights: bool,
    pub transparent_background: bool,
    pub importance_sample_envmap: bool,
}

impl Default for PathTracerOptions {
    fn default() -> Self {
        Self {
            rt: RtStageOptions::default(),
            samples_per_pixel: 1,
            film: FilmFilter::BlackmanHarris,
            film_radius: 1.0,
            russian_roulette_delta: 0.0,
            indirect_clamping: 0.0,
            regularization_gamma: 0.0,
            use_shadow_terminator_fix: true,
            use_white_albedo_on_first_bounce: false,
            hide_lights: false,
            transparent_background: false,
            importance_sample_envmap: true,
        }
    }
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
    antialiasing: i32,
    /// -1 for no environment map.
    environment_proj: i32,
    environment_factor: Vec4,
    regularization_gamma: f32,
    _padding: [f32; 3],
}

/// The compile-time defines for one `(options, gbuffer)` pair.
pub(crate) fn feature_defines(opt: &PathTracerOptions, gbuffer: &GbufferTarget) -> DefineMap {
    let mut defines = DefineMap::new();
    defines.insert("MAX_BOUNCES".to_string(), opt.rt.max_ray_depth.to_string());

    if opt.russian_roulette_delta > 0.0 {
        defines.insert("USE_RUSSIAN_ROULETTE".to_string(), String::new());
    }
    if opt.use_shadow_terminator_fix {
        defines.insert("USE_SHADOW_TERMINATOR_FIX".to_string(), String::new());
    }
    if opt.use_white_albedo_on_first_bounce {
        defines.insert("USE_WHITE_ALBEDO_ON_FIRST_BOUNCE".to_string(), String::new());
    }
    if opt.hide_lights {
        defines.insert("HIDE_LIGHTS".to_string(), String::new());
    }
    if opt.transparent_background {
        defines.insert("USE_TRANSPARENT_BACKGROUND".to_string(), String::new());
    }
    if opt.importance_sample_envmap {
        defines.insert("IMPORTANCE_SAMPLE_ENVMAP".to_string(), String::new());
    }
    if opt.regularization_gamma != 0.0 {
        defines.insert("PATH_SPACE_REGULARIZATION".to_string(), String::new());
    }

    for (channel, _) in gbuffer.entries() {
        defines.insert(
            format!("USE_{}_TARGET", channel.to_uppercase()),
            String::new(),
        );
    }

    let filter = match opt.film {
        FilmFilter::Point => "USE_POINT_FILTER",
        FilmFilter::Box => "USE_BOX_FILTER",
        FilmFilter::BlackmanHarris => "USE_BLACKMAN_HARRIS_FILTER",
    };
    defines.insert(filter.to_string(), String::new());

    opt.rt.common_defines(&mut defines);
    defines
}

fn load_sources(opt: &PathTracerOptions, gbuffer: &GbufferTarget) -> Result<ShaderSet> {
    let defines = feature_defines(opt, gbuffer);
    let pl_rint = ShaderSource::load("shader/path_tracer_point_light.rint")?;
    let shadow_chit = ShaderSource::load("shader/path_tracer_shadow.rchit")?;

    Ok(ShaderSet::ray_tracing(
        ShaderSource::compile("shader/path_tracer.rgen", &defines)?,
        vec![
            // Hit group 0: triangles, primary rays.
            HitGroup::triangles(
                ShaderSource::compile("shader/path_tracer.rchit", &defines)?,
                ShaderSource::compile("shader/path_tracer.rahit", &defines)?,
            ),
            // Hit group 1: triangles, shadow rays (shared closest-hit).
            HitGroup::triangles(
                shadow_chit.clone(),
                ShaderSource::compile("shader/path_tracer_shadow.rahit", &defines)?,
            ),
            // Hit group 2: procedural point lights, primary rays.
            HitGroup::procedural(
                ShaderSource::compile("shader/path_tracer_point_light.rchit", &defines)?,
                pl_rint.clone(),
            ),
            // Hit group 3: procedural point lights, shadow rays.
            HitGroup::procedural(shadow_chit, pl_rint),
        ],
        vec![
            // Miss 0: primary, miss 1: shadow.
            ShaderSource::compile("shader/path_tracer.rmiss", &defines)?,
            ShaderSource::compile("shader/path_tracer_shadow.rmiss", &defines)?,
        ],
    ))
}

pub struct PathTracerStage {
    core: RtStageCore,
    opt: PathTracerOptions,
    gbuffer: GbufferTarget,
}

impl PathTracerStage {
    pub fn new(
        dev: &RenderDevice,
        gbuffer: GbufferTarget,
        opt: PathTracerOptions,
    ) -> Result<Self> {
        let set = load_sources(&opt, &gbuffer)?;
        let core = RtStageCore::new(dev, set, &opt.rt, "path tracing")?;
        Ok(Self { core, opt, gbuffer })
    }

    /// Re-record against the current scene.
    pub fn record(&mut self, dev: &RenderDevice, scene: &SceneView) -> Result<()> {
        self.core
            .bind_scene(scene, &self.gbuffer, Some(0), &[]);

        let (environment_proj, environment_factor) = match &scene.environment_map {
            Some(envmap) => (envmap.projection as i32, envmap.factor),
            None => (-1, Vec4::ZERO),
        };

        let extent = self.gbuffer.extent();
        let layers = self.gbuffer.layer_count().max(1);
        let opt = self.opt.clone();
        self.core.record(
            dev,
            extent.width,
            extent.height,
            layers,
            opt.samples_per_pixel.max(1),
            move |pipeline, cmd, pass| {
                let control = PushConstants {
                    previous_samples: pass,
                    samples: (opt.samples_per_pixel - pass).min(1),
                    min_ray_dist: opt.rt.min_ray_dist,
                    indirect_clamping: opt.indirect_clamping,
                    film_radius: opt.film_radius,
                    russian_roulette_delta: opt.russian_roulette_delta,
                    antialiasing: (opt.film != FilmFilter::Point) as i32,
                    environment_proj,
                    environment_factor,
                    regularization_gamma: opt.regularization_gamma,
                    _padding: [0.0; 3],
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

    pub fn options(&self) -> &PathTracerOptions {
        &self.opt
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, dev: &RenderDevice) {
        self.core.destroy(dev);
    }
}

impl RenderStage for PathTracerStage {
    fn set_scene(&mut self, _scene: &SceneView) -> Result<()> {
        // Recording needs the device; the renderer drives
        // [`PathTracerStage::record`].
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
    use helia_gpu::{RenderTarget, FRAMES_IN_FLIGHT};

    fn gbuffer_with(channels: &[&str]) -> GbufferTarget {
        let extent = vk::Extent2D {
            width: 32,
            height: 32,
        };
        let target = || {
            RenderTarget::new(
                vec![vk::Image::null(); FRAMES_IN_FLIGHT],
                vec![vk::ImageView::null(); FRAMES_IN_FLIGHT],
                vk::Format::R16G16B16A16_SFLOAT,
                extent,
                1,
                vk::ImageLayout::GENERAL,
            )
        };
        let mut gbuffer = GbufferTarget::default();
        for &channel in channels {
            match channel {
                "color" => gbuffer.color = Some(target()),
                "normal" => gbuffer.normal = Some(target()),
                "screen_motion" => gbuffer.screen_motion = Some(target()),
                _ => {}
            }
        }
        gbuffer
    }

    #[test]
    fn defines_cover_allocated_targets() {
        let opt = PathTracerOptions::default();
        let defines = feature_defines(&opt, &gbuffer_with(&["color", "normal", "screen_motion"]));

        assert!(defines.contains_key("USE_COLOR_TARGET"));
        assert!(defines.contains_key("USE_NORMAL_TARGET"));
        assert!(defines.contains_key("USE_SCREEN_MOTION_TARGET"));
        assert!(!defines.contains_key("USE_ALBEDO_TARGET"));
    }

    #[test]
    fn defines_follow_options() {
        let mut opt = PathTracerOptions::default();
        opt.rt.max_ray_depth = 7;
        opt.russian_roulette_delta = 0.1;
        opt.film = FilmFilter::Box;
        let defines = feature_defines(&opt, &gbuffer_with(&["color"]));

        assert_eq!(defines.get("MAX_BOUNCES").map(String::as_str), Some("7"));
        assert!(defines.contains_key("USE_RUSSIAN_ROULETTE"));
        assert!(defines.contains_key("USE_BOX_FILTER"));
        assert!(!defines.contains_key("USE_BLACKMAN_HARRIS_FILTER"));
        assert!(!defines.contains_key("PATH_SPACE_REGULARIZATION"));
    }

    #[test]
    fn distinct_options_change_the_spliced_key() {
        // Two different option sets must produce different define maps, and
        // therefore different cache keys.
        let a = feature_defines(&PathTracerOptions::default(), &gbuffer_with(&["color"]));
        let mut opt = PathTracerOptions::default();
        opt.hide_lights = true;
        let b = feature_defines(&opt, &gbuffer_with(&["color"]));
        assert_ne!(a, b);
    }

    #[test]
    fn push_constants_fit_the_budget() {
        assert!(std::mem::size_of::<PushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
        assert_eq!(std::mem::size_of::<PushConstants>() % 16, 0);
    }
}
