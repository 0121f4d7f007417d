//! Tonemapping stage.
//!
//! Converts the HDR color channel to display-ready output, applying
//! exposure, the selected operator and gamma, optionally reordering
//! viewports (spatial reprojection renders active viewports first) and
//! compositing an alpha grid behind transparent backgrounds. The output
//! target is left in the layout downstream consumers expect.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use helia_core::Result;
use helia_gpu::{
    BindingValue, ComputePipeline, GbufferTarget, RenderDevice, RenderTarget, UniformRing,
    FRAMES_IN_FLIGHT,
};
use helia_shader::{DefineMap, ShaderSource};
use serde::{Deserialize, Serialize};

use crate::scene::SceneView;
use crate::stage::{RenderStage, StageCommands, StageTimer};

/// Tonemapping operator; values match the shader's switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TonemapOperator {
    Filmic = 0,
    GammaCorrection = 1,
    Reinhard = 2,
    ReinhardLuminance = 3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TonemapOptions {
    pub operator: TonemapOperator,
    pub exposure: f32,
    pub gamma: f32,
    /// Composite a checkerboard behind transparent pixels (window output).
    pub alpha_grid_background: bool,
    /// Output viewport order; identity when empty. Spatial reprojection
    /// renders active viewports first, so display order is restored here.
    pub reorder: Vec<u32>,
}

impl Default for TonemapOptions {
    fn default() -> Self {
        Self {
            operator: TonemapOperator::Filmic,
            exposure: 1.0,
            gamma: 2.2,
            alpha_grid_background: false,
            reorder: Vec::new(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PushConstants {
    size: [i32; 2],
    operator: i32,
    exposure: f32,
    gamma: f32,
    alpha_grid_background: i32,
    _padding: [i32; 2],
}

pub struct TonemapStage {
    comp: ComputePipeline,
    commands: StageCommands,
    timer: StageTimer,
    opt: TonemapOptions,
    input: GbufferTarget,
    reorder_buffer: UniformRing,
    scene_counter: u64,
}

impl TonemapStage {
    pub fn new(dev: &RenderDevice, input: GbufferTarget, opt: TonemapOptions) -> Result<Self> {
        let comp = ComputePipeline::new(
            dev,
            ShaderSource::compile("shader/tonemap.comp", &DefineMap::new())?,
            &HashMap::new(),
        )?;

        let layers = input.layer_count().max(1) as u64;
        let mut allocator = dev.allocator.lock();
        let reorder_buffer = UniformRing::new(
            &mut allocator,
            4 * layers,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "tonemap_reorder",
        )?;
        drop(allocator);

        let commands = StageCommands::new(dev)?;
        let timer = StageTimer::new(dev, "tonemap")?;

        Ok(Self {
            comp,
            commands,
            timer,
            opt,
            input,
            reorder_buffer,
            scene_counter: u64::MAX,
        })
    }

    /// Re-record the tonemap dispatch writing into `output`. The output
    /// target ends every recorded buffer in `expected_layout`.
    pub fn record(
        &mut self,
        dev: &RenderDevice,
        scene: &SceneView,
        output: &mut RenderTarget,
        expected_layout: vk::ImageLayout,
    ) -> Result<()> {
        for slot in 0..FRAMES_IN_FLIGHT {
            let input_color = match self.input.color.as_ref() {
                Some(color) => BindingValue::storage_image(color.view(slot)),
                None => BindingValue::Empty,
            };
            self.comp.update_descriptor_set(
                &[
                    ("in_color", input_color),
                    ("out_color", BindingValue::storage_image(output.view(slot))),
                    ("reorder", BindingValue::buffer(self.reorder_buffer.buffer())),
                ],
                slot,
            );
        }

        let extent = self.input.extent();
        let layers = self.input.layer_count().max(1);
        let control = PushConstants {
            size: [extent.width as i32, extent.height as i32],
            operator: self.opt.operator as i32,
            exposure: self.opt.exposure,
            gamma: self.opt.gamma,
            alpha_grid_background: self.opt.alpha_grid_background as i32,
            _padding: [0; 2],
        };

        self.commands.clear(dev.device())?;
        for slot in 0..FRAMES_IN_FLIGHT {
            let cmd = unsafe { self.commands.begin(dev.device())? };
            unsafe {
                self.timer.begin(dev, cmd, slot);
                self.reorder_buffer.upload(dev.device(), slot, cmd);
                output.transition_discard(dev.device(), cmd, slot, vk::ImageLayout::GENERAL);
                self.comp.bind(cmd, slot);
                self.comp.push_constants(cmd, &control);
                dev.device().cmd_dispatch(
                    cmd,
                    (extent.width + 15) / 16,
                    (extent.height + 15) / 16,
                    layers,
                );
                output.transition(dev.device(), cmd, slot, expected_layout);
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
        self.comp.destroy();
        self.commands.destroy(dev.device());
        let mut allocator = dev.allocator.lock();
        let _ = self.reorder_buffer.destroy(&mut allocator);
    }
}

impl RenderStage for TonemapStage {
    fn set_scene(&mut self, _scene: &SceneView) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, _scene: &SceneView, slot: usize) -> Result<()> {
        let layers = self.input.layer_count().max(1) as usize;
        let mut reorder: Vec<u32> = (0..layers as u32).collect();
        for (i, &mapped) in self.opt.reorder.iter().enumerate().take(layers) {
            reorder[i] = mapped;
        }
        self.reorder_buffer.update(slot, &reorder)
    }

    fn command_buffers(&self, slot: usize) -> &[vk::CommandBuffer] {
        self.commands.buffers(slot)
    }
}

/// The viewport order after spatial reprojection: active viewports keep
/// their rendered slots, the rest follow in display order.
pub fn viewport_reorder_mask(active_indices: &[u32], viewport_count: u32) -> Vec<u32> {
    let mut reorder = Vec::with_capacity(viewport_count as usize);
    for i in 0..viewport_count {
        if active_indices.contains(&i) {
            reorder.push(i);
        }
    }
    for i in 0..viewport_count {
        if !active_indices.contains(&i) {
            reorder.push(i);
        }
    }
    reorder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_mask_puts_active_first() {
        assert_eq!(viewport_reorder_mask(&[2, 4], 6), vec![2, 4, 0, 1, 3, 5]);
        assert_eq!(viewport_reorder_mask(&[], 3), vec![0, 1, 2]);
    }

    #[test]
    fn operator_values_are_stable() {
        assert_eq!(TonemapOperator::Filmic as i32, 0);
        assert_eq!(TonemapOperator::ReinhardLuminance as i32, 3);
    }

    #[test]
    fn push_constants_fit_the_budget() {
        assert!(std::mem::size_of::<PushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
    }
}
