//! Renderer assembly: concrete stage graphs on the frame orchestrator.

use ash::vk;
use helia_core::Result;
use helia_gpu::command::{begin_command_buffer, end_command_buffer, submit_with_dependencies, CommandPool};
use helia_gpu::sync::create_timeline_semaphore;
use helia_gpu::target::record_transition;
use helia_gpu::{
    Dependencies, Dependency, FrameContext, GbufferTarget, RenderDevice, RenderTarget,
    FRAMES_IN_FLIGHT,
};
use serde::{Deserialize, Serialize};

use crate::bmfr::{BmfrOptions, BmfrStage};
use crate::gbuffer::GbufferResources;
use crate::path_tracer::{PathTracerOptions, PathTracerStage};
use crate::scene::SceneView;
use crate::spatial_reprojection::{SpatialReprojectionOptions, SpatialReprojectionStage};
use crate::stage::{submit_stage, RenderStage};
use crate::svgf::{SvgfOptions, SvgfStage};
use crate::tonemap::{TonemapOptions, TonemapStage};

/// A renderer drives a set of stages over the frame orchestrator.
pub trait Renderer {
    /// Re-record stages against a changed scene.
    fn set_scene(&mut self, ctx: &FrameContext, scene: &SceneView) -> Result<()>;

    /// Restart temporal accumulation.
    fn reset_accumulation(&mut self, reset_sample_counter: bool);

    /// Render one frame. An `OutOfDateSwapchain` error propagates to the
    /// caller, which drops the renderer, lets the backend rebuild its
    /// swapchain, and builds a fresh renderer; the frame counter does not
    /// advance across the failed frame.
    fn render(&mut self, ctx: &mut FrameContext, scene: &mut SceneView) -> Result<()>;
}

/// Which denoiser follows the path tracer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum DenoiserOptions {
    #[default]
    None,
    Svgf(SvgfOptions),
    Bmfr(BmfrOptions),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathTracerRendererOptions {
    pub path_tracer: PathTracerOptions,
    pub denoiser: DenoiserOptions,
    pub spatial_reprojection: Option<SpatialReprojectionOptions>,
    pub tonemap: TonemapOptions,
}

enum Denoiser {
    Svgf(SvgfStage),
    Bmfr(BmfrStage),
}

/// Path tracing -> denoise -> spatial reprojection -> tonemap, chained on
/// a timeline semaphore, blitted into the acquired display image.
pub struct PathTracerRenderer {
    options: PathTracerRendererOptions,
    gbuffer: GbufferTarget,
    gbuffer_resources: GbufferResources,

    path_tracer: PathTracerStage,
    denoiser: Option<Denoiser>,
    spatial_reprojection: Option<SpatialReprojectionStage>,
    tonemap: TonemapStage,

    output: RenderTarget,
    output_resources: GbufferResources,

    blit_pool: CommandPool,
    blit_cmds: Vec<vk::CommandBuffer>,

    timeline: vk::Semaphore,
    timeline_value: u64,
    last_frame_value: u64,
    accumulated_samples: u32,
}

/// The G-buffer channels a configuration needs.
fn required_channels(options: &PathTracerRendererOptions) -> Vec<&'static str> {
    let mut channels = vec!["color"];
    match options.denoiser {
        DenoiserOptions::None => {}
        DenoiserOptions::Svgf(_) => channels.extend([
            "diffuse",
            "specular",
            "albedo",
            "normal",
            "screen_motion",
            "linear_depth",
        ]),
        DenoiserOptions::Bmfr(_) => channels.extend([
            "diffuse",
            "specular",
            "albedo",
            "normal",
            "world_pos",
            "screen_motion",
            "linear_depth",
        ]),
    }
    if options.spatial_reprojection.is_some() {
        for channel in ["normal", "world_pos"] {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
    }
    channels
}

impl PathTracerRenderer {
    pub fn new(ctx: &FrameContext, options: PathTracerRendererOptions) -> Result<Self> {
        let dev = ctx.display_device();
        let images = ctx.display_images();
        let extent = images.extent;
        let layers = images.layer_count.max(1);

        let spec = crate::gbuffer::GbufferSpec::new(
            extent.width,
            extent.height,
            layers,
            &required_channels(&options),
        );
        let (gbuffer, gbuffer_resources) = crate::gbuffer::allocate_gbuffer(dev, &spec)?;

        let path_tracer =
            PathTracerStage::new(dev, gbuffer.clone(), options.path_tracer.clone())?;
        let denoiser = match &options.denoiser {
            DenoiserOptions::None => None,
            DenoiserOptions::Svgf(opt) => Some(Denoiser::Svgf(SvgfStage::new(
                dev,
                gbuffer.clone(),
                opt.clone(),
            )?)),
            DenoiserOptions::Bmfr(opt) => Some(Denoiser::Bmfr(BmfrStage::new(
                dev,
                gbuffer.clone(),
                opt.clone(),
            )?)),
        };
        let spatial_reprojection = match &options.spatial_reprojection {
            Some(opt) => Some(SpatialReprojectionStage::new(
                dev,
                gbuffer.clone(),
                opt.clone(),
            )?),
            None => None,
        };
        let tonemap = TonemapStage::new(dev, gbuffer.clone(), options.tonemap.clone())?;

        let mut output_resources = GbufferResources::new();
        let output = output_resources.allocate_target(
            dev,
            extent,
            layers,
            images.format,
            "tonemap_output",
        )?;

        let blit_pool = unsafe {
            CommandPool::new(
                dev.device(),
                dev.graphics_queue_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        let mut blit_cmds = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            blit_cmds.push(unsafe { blit_pool.allocate_command_buffer(dev.device())? });
        }

        let timeline = unsafe { create_timeline_semaphore(dev.device(), 0)? };

        Ok(Self {
            options,
            gbuffer,
            gbuffer_resources,
            path_tracer,
            denoiser,
            spatial_reprojection,
            tonemap,
            output,
            output_resources,
            blit_pool,
            blit_cmds,
            timeline,
            timeline_value: 0,
            last_frame_value: 0,
            accumulated_samples: 0,
        })
    }

    pub fn accumulated_samples(&self) -> u32 {
        self.accumulated_samples
    }

    /// The G-buffer shared by this renderer's stages.
    pub fn gbuffer(&self) -> &GbufferTarget {
        &self.gbuffer
    }

    /// Clear the shader binary cache and rebuild every pipeline from
    /// source. A failing rebuild is logged and the previous pipelines stay
    /// live, so an edit-compile cycle cannot take the renderer down.
    pub fn reload_shaders(&mut self, ctx: &mut FrameContext, scene: &SceneView) -> Result<()> {
        helia_shader::clear_binary_cache();
        match Self::new(ctx, self.options.clone()) {
            Ok(mut fresh) => {
                fresh.set_scene(ctx, scene)?;
                ctx.sync()?;
                let old = std::mem::replace(self, fresh);
                unsafe {
                    old.destroy_resources(ctx.display_device());
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("shader reload failed, keeping previous pipelines: {e}");
                Ok(())
            }
        }
    }

    /// Record the per-frame blit from the tonemap output into the acquired
    /// display image.
    unsafe fn record_blit(&mut self, ctx: &FrameContext, slot: usize) -> Result<vk::CommandBuffer> {
        let dev = ctx.display_device();
        let device = dev.device();
        let images = ctx.display_images();
        let (swapchain_index, _) = ctx.indices();
        let display_image = images.images[swapchain_index as usize];
        let layers = images.layer_count.max(1);

        let subresource = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: layers,
        };

        let cmd = self.blit_cmds[slot];
        device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        record_transition(
            device,
            cmd,
            display_image,
            subresource,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        let extent = images.extent;
        let blit = vk::ImageBlit::default()
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: layers,
            })
            .src_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: extent.width as i32,
                    y: extent.height as i32,
                    z: 1,
                },
            ])
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: layers,
            })
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: extent.width as i32,
                    y: extent.height as i32,
                    z: 1,
                },
            ]);

        device.cmd_blit_image(
            cmd,
            self.output.image(slot),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            display_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&blit),
            vk::Filter::NEAREST,
        );

        record_transition(
            device,
            cmd,
            display_image,
            subresource,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            images.expected_layout,
        );

        end_command_buffer(device, cmd)?;
        Ok(cmd)
    }

    /// Destroy all GPU resources. The device must be idle.
    unsafe fn destroy_resources(mut self, dev: &RenderDevice) {
        self.path_tracer.destroy(dev);
        match self.denoiser.take() {
            Some(Denoiser::Svgf(stage)) => stage.destroy(dev),
            Some(Denoiser::Bmfr(stage)) => stage.destroy(dev),
            None => {}
        }
        if let Some(stage) = self.spatial_reprojection.take() {
            stage.destroy(dev);
        }
        self.tonemap.destroy(dev);
        self.gbuffer_resources.destroy(dev);
        self.output_resources.destroy(dev);
        self.blit_pool.destroy(dev.device());
        dev.device().destroy_semaphore(self.timeline, None);
    }

    /// Tear down explicitly; syncs the context first.
    pub fn destroy(self, ctx: &mut FrameContext) -> Result<()> {
        ctx.sync()?;
        unsafe {
            self.destroy_resources(ctx.display_device());
        }
        Ok(())
    }
}

impl Renderer for PathTracerRenderer {
    fn set_scene(&mut self, ctx: &FrameContext, scene: &SceneView) -> Result<()> {
        let dev = ctx.display_device();
        self.path_tracer.record(dev, scene)?;
        match &mut self.denoiser {
            Some(Denoiser::Svgf(stage)) => stage.record(dev, scene)?,
            Some(Denoiser::Bmfr(stage)) => stage.record(dev, scene)?,
            None => {}
        }
        if let Some(stage) = &mut self.spatial_reprojection {
            stage.record(dev, scene)?;
        }
        let expected = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        self.tonemap.record(dev, scene, &mut self.output, expected)?;
        Ok(())
    }

    fn reset_accumulation(&mut self, reset_sample_counter: bool) {
        if reset_sample_counter {
            self.accumulated_samples = 0;
        }
    }

    fn render(&mut self, ctx: &mut FrameContext, scene: &mut SceneView) -> Result<()> {
        let image_dep = ctx.begin_frame()?;
        let (_, slot) = ctx.indices();

        scene.step_jitter();
        self.path_tracer.update(scene, slot)?;
        match &mut self.denoiser {
            Some(Denoiser::Svgf(stage)) => stage.update(scene, slot)?,
            Some(Denoiser::Bmfr(stage)) => stage.update(scene, slot)?,
            None => {}
        }
        if let Some(stage) = &mut self.spatial_reprojection {
            stage.update(scene, slot)?;
        }
        self.tonemap.update(scene, slot)?;

        let trace_stages =
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags::COMPUTE_SHADER;
        let mut value = self.timeline_value;
        let timeline = self.timeline;
        let mut next = |value: &mut u64| {
            *value += 1;
            *value
        };

        unsafe {
            let dev = ctx.display_device();

            // The first stage of this frame waits for the previous frame's
            // final stage; slots double-buffer resources, but history reads
            // cross slots.
            let pt_value = next(&mut value);
            submit_stage(
                dev,
                &self.path_tracer,
                slot,
                &Dependencies::new().with(Dependency::timeline(
                    timeline,
                    self.last_frame_value,
                    trace_stages,
                )),
                &Dependencies::new().with(Dependency::timeline(timeline, pt_value, trace_stages)),
            )?;
            let mut tail_value = pt_value;

            if let Some(denoiser) = &self.denoiser {
                let stage: &dyn RenderStage = match denoiser {
                    Denoiser::Svgf(stage) => stage,
                    Denoiser::Bmfr(stage) => stage,
                };
                let signal_value = next(&mut value);
                submit_stage(
                    dev,
                    stage,
                    slot,
                    &Dependencies::new().with(Dependency::timeline(
                        timeline,
                        tail_value,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                    )),
                    &Dependencies::new().with(Dependency::timeline(
                        timeline,
                        signal_value,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                    )),
                )?;
                tail_value = signal_value;
            }

            if let Some(stage) = &self.spatial_reprojection {
                let signal_value = next(&mut value);
                submit_stage(
                    dev,
                    stage,
                    slot,
                    &Dependencies::new().with(Dependency::timeline(
                        timeline,
                        tail_value,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                    )),
                    &Dependencies::new().with(Dependency::timeline(
                        timeline,
                        signal_value,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                    )),
                )?;
                tail_value = signal_value;
            }

            let tonemap_value = next(&mut value);
            submit_stage(
                dev,
                &self.tonemap,
                slot,
                &Dependencies::new().with(Dependency::timeline(
                    timeline,
                    tail_value,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                )),
                &Dependencies::new().with(Dependency::timeline(
                    timeline,
                    tonemap_value,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                )),
            )?;

            // Per-frame blit into the acquired image; this is the only
            // submission that touches the display image, so it alone waits
            // on image availability.
            let blit_value = next(&mut value);
            let blit_cmd = self.record_blit(ctx, slot)?;
            let dev = ctx.display_device();
            let mut wait = Dependencies::new().with(Dependency::timeline(
                timeline,
                tonemap_value,
                vk::PipelineStageFlags::TRANSFER,
            ));
            wait.push(Dependency {
                stage_mask: vk::PipelineStageFlags::TRANSFER,
                ..image_dep
            });
            submit_with_dependencies(
                dev.device(),
                dev.graphics_queue,
                &[blit_cmd],
                &wait,
                &Dependencies::new().with(Dependency::timeline(
                    timeline,
                    blit_value,
                    vk::PipelineStageFlags::TRANSFER,
                )),
                vk::Fence::null(),
            )?;

            self.timeline_value = blit_value;
            self.last_frame_value = tonemap_value;

            ctx.end_frame(Dependencies::new().with(Dependency::timeline(
                timeline,
                blit_value,
                vk::PipelineStageFlags::ALL_COMMANDS,
            )))?;
        }

        self.accumulated_samples += self.options.path_tracer.samples_per_pixel.max(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_selection_matches_denoiser() {
        let mut options = PathTracerRendererOptions::default();
        assert_eq!(required_channels(&options), vec!["color"]);

        options.denoiser = DenoiserOptions::Svgf(SvgfOptions::default());
        let channels = required_channels(&options);
        assert!(channels.contains(&"screen_motion"));
        assert!(channels.contains(&"linear_depth"));
        assert!(!channels.contains(&"world_pos"));

        options.denoiser = DenoiserOptions::Bmfr(BmfrOptions::default());
        assert!(required_channels(&options).contains(&"world_pos"));

        options.denoiser = DenoiserOptions::None;
        options.spatial_reprojection = Some(SpatialReprojectionOptions::default());
        let channels = required_channels(&options);
        assert!(channels.contains(&"normal"));
        assert!(channels.contains(&"world_pos"));
    }
}
