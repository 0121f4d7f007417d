//! BMFR block-based denoiser.
//!
//! Blockwise Multi-order Feature Regression: per 32x32 block, fit the noisy
//! color against a feature basis (constant, normals, world positions and
//! their squares) with a QR-style least-squares solve, evaluate the fit,
//! and accumulate temporally. Four compute phases per frame:
//! preprocess -> fit -> weighted sum -> accumulate, with the fit and
//! weighted-sum pair run per filtered signal.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use hashbrown::HashMap;
use helia_core::Result;
use helia_gpu::{
    BindingValue, ComputePipeline, DeviceBuffer, GbufferTarget, RenderDevice, RenderTarget,
    UniformRing, FRAMES_IN_FLIGHT,
};
use helia_shader::{DefineMap, ShaderSource};
use gpu_allocator::MemoryLocation;
use serde::{Deserialize, Serialize};

use crate::gbuffer::GbufferResources;
use crate::scene::SceneView;
use crate::stage::{compute_barrier, RenderStage, StageCommands, StageTimer};

/// Block edge length in pixels.
pub(crate) const BLOCK_EDGE: u32 = 32;
/// Pixels per block.
pub(crate) const BLOCK_PIXELS: u32 = BLOCK_EDGE * BLOCK_EDGE;
/// Feature basis size: 1, nx, ny, nz, px, py, pz, px^2, py^2, pz^2.
pub(crate) const FEATURE_COUNT: u32 = 10;
/// Features plus the three noisy color channels carried through the fit.
pub(crate) const BUFFER_COUNT: u32 = FEATURE_COUNT + 3;

/// Which signals get the regression treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BmfrSettings {
    DiffuseOnly,
    DiffuseSpecular,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmfrOptions {
    pub settings: BmfrSettings,
    pub active_viewport_count: u32,
    /// Upper clamp applied to noisy input during preprocessing.
    pub hdr_max_value: f32,
    /// Temporal accumulation ratio for the filtered output.
    pub temporal_alpha: f32,
}

impl Default for BmfrOptions {
    fn default() -> Self {
        Self {
            settings: BmfrSettings::DiffuseOnly,
            active_viewport_count: 1,
            hdr_max_value: 10_000.0,
            temporal_alpha: 0.1,
        }
    }
}

/// The fit grid is offset by half a block per frame to hide block seams,
/// so it carries a one-block margin in each dimension.
pub(crate) fn block_grid(extent: vk::Extent2D) -> (u32, u32) {
    (
        extent.width.div_ceil(BLOCK_EDGE) + 1,
        extent.height.div_ceil(BLOCK_EDGE) + 1,
    )
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PushConstants {
    size: [i32; 2],
    /// Frame parity selects the half-block grid offset.
    frame_parity: i32,
    /// 0 = diffuse pass, 1 = specular pass.
    channel: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BmfrUniforms {
    hdr_max_value: f32,
    temporal_alpha: f32,
    block_count: [u32; 2],
}

pub struct BmfrStage {
    preprocess: ComputePipeline,
    fit: ComputePipeline,
    weighted_sum: ComputePipeline,
    accumulate: ComputePipeline,
    commands: StageCommands,
    timer: StageTimer,
    opt: BmfrOptions,
    gbuffer: GbufferTarget,

    tmp_noisy: [RenderTarget; 2],
    tmp_filtered: [RenderTarget; 2],
    diffuse_history: RenderTarget,
    specular_history: RenderTarget,
    accept_history: RenderTarget,
    resources: GbufferResources,

    min_max_buffers: Vec<DeviceBuffer>,
    tmp_data_buffers: Vec<DeviceBuffer>,
    weight_buffers: Vec<DeviceBuffer>,

    uniforms: UniformRing,
    jitter_buffer: UniformRing,
    scene_counter: u64,
}

impl BmfrStage {
    pub fn new(dev: &RenderDevice, gbuffer: GbufferTarget, opt: BmfrOptions) -> Result<Self> {
        let mut defines = DefineMap::new();
        defines.insert("BLOCK_EDGE_LENGTH".to_string(), BLOCK_EDGE.to_string());
        defines.insert("FEATURE_COUNT".to_string(), FEATURE_COUNT.to_string());
        defines.insert("BUFFER_COUNT".to_string(), BUFFER_COUNT.to_string());
        if opt.settings == BmfrSettings::DiffuseSpecular {
            defines.insert("FILTER_SPECULAR".to_string(), String::new());
        }

        let overrides = HashMap::new();
        let compile = |path: &str| -> Result<ComputePipeline> {
            ComputePipeline::new(dev, ShaderSource::compile(path, &defines)?, &overrides)
        };
        let preprocess = compile("shader/bmfr_preprocess.comp")?;
        let fit = compile("shader/bmfr_fit.comp")?;
        let weighted_sum = compile("shader/bmfr_weighted_sum.comp")?;
        let accumulate = compile("shader/bmfr_accumulate_output.comp")?;

        let extent = gbuffer.extent();
        let layers = gbuffer.layer_count().max(1);
        let mut resources = GbufferResources::new();
        let mut scratch = |name: &str, format: vk::Format| {
            resources.allocate_target(dev, extent, layers, format, name)
        };

        let rgba = vk::Format::R16G16B16A16_SFLOAT;
        let tmp_noisy = [
            scratch("bmfr_noisy_diffuse", rgba)?,
            scratch("bmfr_noisy_specular", rgba)?,
        ];
        let tmp_filtered = [
            scratch("bmfr_filtered_diffuse", rgba)?,
            scratch("bmfr_filtered_specular", rgba)?,
        ];
        let diffuse_history = scratch("bmfr_diffuse_hist", rgba)?;
        let specular_history = scratch("bmfr_specular_hist", rgba)?;
        let accept_history = scratch("bmfr_accepts", vk::Format::R32_SINT)?;

        let (blocks_x, blocks_y) = block_grid(extent);
        let block_count = blocks_x as u64 * blocks_y as u64 * layers as u64;
        let min_max_size = block_count * FEATURE_COUNT as u64 * 2 * 4;
        let tmp_data_size = block_count * BLOCK_PIXELS as u64 * BUFFER_COUNT as u64 * 4;
        let weights_size = block_count * FEATURE_COUNT as u64 * 3 * 4;

        let mut allocator = dev.allocator.lock();
        let mut per_slot_buffer = |size: u64, name: &str| -> Result<Vec<DeviceBuffer>> {
            (0..FRAMES_IN_FLIGHT)
                .map(|slot| {
                    allocator.create_buffer(
                        size,
                        vk::BufferUsageFlags::STORAGE_BUFFER,
                        MemoryLocation::GpuOnly,
                        &format!("{name}_{slot}"),
                    )
                })
                .collect()
        };
        let min_max_buffers = per_slot_buffer(min_max_size, "bmfr_min_max")?;
        let tmp_data_buffers = per_slot_buffer(tmp_data_size, "bmfr_tmp_data")?;
        let weight_buffers = per_slot_buffer(weights_size, "bmfr_weights")?;

        let uniforms = UniformRing::new(
            &mut allocator,
            std::mem::size_of::<BmfrUniforms>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "bmfr_uniforms",
        )?;
        let jitter_buffer = UniformRing::new(
            &mut allocator,
            std::mem::size_of::<Vec4>() as u64 * opt.active_viewport_count.max(1) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "bmfr_jitter",
        )?;
        drop(allocator);

        let commands = StageCommands::new(dev)?;
        let timer = StageTimer::new(dev, format!("bmfr ({layers} viewports)"))?;

        Ok(Self {
            preprocess,
            fit,
            weighted_sum,
            accumulate,
            commands,
            timer,
            opt,
            gbuffer,
            tmp_noisy,
            tmp_filtered,
            diffuse_history,
            specular_history,
            accept_history,
            resources,
            min_max_buffers,
            tmp_data_buffers,
            weight_buffers,
            uniforms,
            jitter_buffer,
            scene_counter: u64::MAX,
        })
    }

    fn bind_descriptors(&mut self) {
        for slot in 0..FRAMES_IN_FLIGHT {
            let prev = slot ^ 1;
            let gb = &self.gbuffer;
            let image = BindingValue::storage_image;
            let buffer = BindingValue::buffer;

            self.preprocess.update_descriptor_set(
                &[
                    ("in_color", channel(gb.color.as_ref(), slot)),
                    ("in_diffuse", channel(gb.diffuse.as_ref(), slot)),
                    ("in_specular", channel(gb.specular.as_ref(), slot)),
                    ("in_albedo", channel(gb.albedo.as_ref(), slot)),
                    ("in_normal", channel(gb.normal.as_ref(), slot)),
                    ("in_world_pos", channel(gb.world_pos.as_ref(), slot)),
                    ("in_screen_motion", channel(gb.screen_motion.as_ref(), slot)),
                    ("previous_normal", channel(gb.normal.as_ref(), prev)),
                    ("previous_linear_depth", channel(gb.linear_depth.as_ref(), prev)),
                    ("in_linear_depth", channel(gb.linear_depth.as_ref(), slot)),
                    ("out_noisy_diffuse", image(self.tmp_noisy[0].view(slot))),
                    ("out_noisy_specular", image(self.tmp_noisy[1].view(slot))),
                    ("out_accepts", image(self.accept_history.view(slot))),
                    ("min_max_buffer", buffer(self.min_max_buffers[slot].buffer)),
                    ("tmp_data", buffer(self.tmp_data_buffers[slot].buffer)),
                    ("jitter_info", buffer(self.jitter_buffer.buffer())),
                    ("params", buffer(self.uniforms.buffer())),
                ],
                slot,
            );

            self.fit.update_descriptor_set(
                &[
                    ("min_max_buffer", buffer(self.min_max_buffers[slot].buffer)),
                    ("tmp_data", buffer(self.tmp_data_buffers[slot].buffer)),
                    ("weights", buffer(self.weight_buffers[slot].buffer)),
                    ("params", buffer(self.uniforms.buffer())),
                ],
                slot,
            );

            self.weighted_sum.update_descriptor_set(
                &[
                    ("in_normal", channel(gb.normal.as_ref(), slot)),
                    ("in_world_pos", channel(gb.world_pos.as_ref(), slot)),
                    ("in_noisy_diffuse", image(self.tmp_noisy[0].view(slot))),
                    ("in_noisy_specular", image(self.tmp_noisy[1].view(slot))),
                    ("weights", buffer(self.weight_buffers[slot].buffer)),
                    ("min_max_buffer", buffer(self.min_max_buffers[slot].buffer)),
                    ("out_filtered_diffuse", image(self.tmp_filtered[0].view(slot))),
                    ("out_filtered_specular", image(self.tmp_filtered[1].view(slot))),
                    ("params", buffer(self.uniforms.buffer())),
                ],
                slot,
            );

            self.accumulate.update_descriptor_set(
                &[
                    ("in_filtered_diffuse", image(self.tmp_filtered[0].view(slot))),
                    ("in_filtered_specular", image(self.tmp_filtered[1].view(slot))),
                    ("in_albedo", channel(gb.albedo.as_ref(), slot)),
                    ("in_accepts", image(self.accept_history.view(slot))),
                    ("diffuse_hist", image(self.diffuse_history.view(slot))),
                    ("specular_hist", image(self.specular_history.view(slot))),
                    ("previous_diffuse_hist", image(self.diffuse_history.view(prev))),
                    (
                        "previous_specular_hist",
                        image(self.specular_history.view(prev)),
                    ),
                    ("final_output", channel(gb.color.as_ref(), slot)),
                    ("params", buffer(self.uniforms.buffer())),
                ],
                slot,
            );
        }
    }

    /// Re-record the preprocess -> fit -> weighted-sum -> accumulate
    /// sequence.
    pub fn record(&mut self, dev: &RenderDevice, scene: &SceneView) -> Result<()> {
        self.bind_descriptors();

        let extent = self.gbuffer.extent();
        let size = [extent.width as i32, extent.height as i32];
        let viewports = self.opt.active_viewport_count.max(1);
        let pixel_wg = ((extent.width + 15) / 16, (extent.height + 15) / 16);
        let (blocks_x, blocks_y) = block_grid(extent);
        let channels: &[i32] = match self.opt.settings {
            BmfrSettings::DiffuseOnly => &[0],
            BmfrSettings::DiffuseSpecular => &[0, 1],
        };

        self.commands.clear(dev.device())?;
        for slot in 0..FRAMES_IN_FLIGHT {
            let cmd = unsafe { self.commands.begin(dev.device())? };
            unsafe {
                self.timer.begin(dev, cmd, slot);

                self.uniforms.upload(dev.device(), slot, cmd);
                self.jitter_buffer.upload(dev.device(), slot, cmd);

                let control = PushConstants {
                    size,
                    frame_parity: (slot & 1) as i32,
                    channel: 0,
                };
                self.preprocess.bind(cmd, slot);
                self.preprocess.push_constants(cmd, &control);
                dev.device()
                    .cmd_dispatch(cmd, pixel_wg.0, pixel_wg.1, viewports);

                for &channel in channels {
                    let control = PushConstants {
                        size,
                        frame_parity: (slot & 1) as i32,
                        channel,
                    };

                    compute_barrier(dev.device(), cmd);
                    self.fit.bind(cmd, slot);
                    self.fit.push_constants(cmd, &control);
                    // One workgroup per block; the solve runs entirely in
                    // shared memory.
                    dev.device().cmd_dispatch(cmd, blocks_x, blocks_y, viewports);

                    compute_barrier(dev.device(), cmd);
                    self.weighted_sum.bind(cmd, slot);
                    self.weighted_sum.push_constants(cmd, &control);
                    dev.device()
                        .cmd_dispatch(cmd, pixel_wg.0, pixel_wg.1, viewports);
                }

                compute_barrier(dev.device(), cmd);
                self.accumulate.bind(cmd, slot);
                self.accumulate.push_constants(cmd, &control);
                dev.device()
                    .cmd_dispatch(cmd, pixel_wg.0, pixel_wg.1, viewports);

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
        self.preprocess.destroy();
        self.fit.destroy();
        self.weighted_sum.destroy();
        self.accumulate.destroy();
        self.commands.destroy(dev.device());
        self.resources.destroy(dev);
        let mut allocator = dev.allocator.lock();
        for mut buffer in self.min_max_buffers.drain(..) {
            let _ = allocator.free_buffer(&mut buffer);
        }
        for mut buffer in self.tmp_data_buffers.drain(..) {
            let _ = allocator.free_buffer(&mut buffer);
        }
        for mut buffer in self.weight_buffers.drain(..) {
            let _ = allocator.free_buffer(&mut buffer);
        }
        let _ = self.uniforms.destroy(&mut allocator);
        let _ = self.jitter_buffer.destroy(&mut allocator);
    }
}

fn channel(channel: Option<&RenderTarget>, slot: usize) -> BindingValue {
    match channel {
        Some(target) => BindingValue::storage_image(target.view(slot)),
        None => BindingValue::Empty,
    }
}

impl RenderStage for BmfrStage {
    fn set_scene(&mut self, _scene: &SceneView) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, scene: &SceneView, slot: usize) -> Result<()> {
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

        let (blocks_x, blocks_y) = block_grid(self.gbuffer.extent());
        let uniforms = BmfrUniforms {
            hdr_max_value: self.opt.hdr_max_value,
            temporal_alpha: self.opt.temporal_alpha,
            block_count: [blocks_x, blocks_y],
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
    fn block_grid_carries_margin() {
        let extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        // 1920/32 = 60, 1080/32 = 33.75 -> 34; plus the margin block.
        assert_eq!(block_grid(extent), (61, 35));
    }

    #[test]
    fn block_grid_exact_multiple() {
        let extent = vk::Extent2D {
            width: 64,
            height: 32,
        };
        assert_eq!(block_grid(extent), (3, 2));
    }

    #[test]
    fn push_constants_fit_the_budget() {
        assert!(std::mem::size_of::<PushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
    }
}
