//! Spatial reprojection for multi-viewport outputs.
//!
//! When fewer viewports are rendered than displayed (lightfield, HMD,
//! camera grids), the remaining target layers are reconstructed from the
//! rendered ones: each target pixel is projected into every source
//! viewport through its position texture, scored by normal and depth
//! consistency, and the best valid sample wins, else the default value is
//! written.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use hashbrown::HashMap;
use helia_core::Result;
use helia_gpu::{
    BindingValue, ComputePipeline, GbufferTarget, RenderDevice, UniformRing, FRAMES_IN_FLIGHT,
};
use helia_shader::{DefineMap, ShaderSource};
use serde::{Deserialize, Serialize};

use crate::scene::SceneView;
use crate::stage::{RenderStage, StageCommands, StageTimer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialReprojectionOptions {
    /// Source viewports actually rendered; target layers beyond these are
    /// reconstructed.
    pub active_viewport_count: u32,
}

impl Default for SpatialReprojectionOptions {
    fn default() -> Self {
        Self {
            active_viewport_count: 1,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PushConstants {
    default_value: Vec4,
    size: [i32; 2],
    source_count: u32,
    _padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CameraData {
    view_proj: Mat4,
}

/// Workgroup counts for one dispatch: 16x16 pixel tiles over each
/// reconstructed layer.
pub(crate) fn dispatch_size(
    extent: vk::Extent2D,
    layer_count: u32,
    source_count: u32,
) -> (u32, u32, u32) {
    (
        (extent.width + 15) / 16,
        (extent.height + 15) / 16,
        layer_count.saturating_sub(source_count),
    )
}

pub struct SpatialReprojectionStage {
    comp: ComputePipeline,
    commands: StageCommands,
    timer: StageTimer,
    opt: SpatialReprojectionOptions,
    target: GbufferTarget,
    camera_data: UniformRing,
    scene_counter: u64,
}

impl SpatialReprojectionStage {
    pub fn new(
        dev: &RenderDevice,
        target: GbufferTarget,
        opt: SpatialReprojectionOptions,
    ) -> Result<Self> {
        let comp = ComputePipeline::new(
            dev,
            ShaderSource::compile("shader/spatial_reprojection.comp", &DefineMap::new())?,
            &HashMap::new(),
        )?;

        let mut allocator = dev.allocator.lock();
        let camera_data = UniformRing::new(
            &mut allocator,
            std::mem::size_of::<CameraData>() as u64 * opt.active_viewport_count.max(1) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "spatial_reprojection_cameras",
        )?;
        drop(allocator);

        let commands = StageCommands::new(dev)?;
        let timer = StageTimer::new(
            dev,
            format!(
                "spatial reprojection (from {} to {} viewports)",
                opt.active_viewport_count,
                target.layer_count().saturating_sub(opt.active_viewport_count)
            ),
        )?;

        Ok(Self {
            comp,
            commands,
            timer,
            opt,
            target,
            camera_data,
            scene_counter: u64::MAX,
        })
    }

    /// Re-record the reconstruction dispatch.
    pub fn record(&mut self, dev: &RenderDevice, scene: &SceneView) -> Result<()> {
        for slot in 0..FRAMES_IN_FLIGHT {
            let color = self.target.color.as_ref();
            let normal = self.target.normal.as_ref();
            let position = self.target.world_pos.as_ref();
            let bind = |target: Option<&helia_gpu::RenderTarget>| match target {
                Some(t) => BindingValue::storage_image(t.view(slot)),
                None => BindingValue::Empty,
            };
            self.comp.update_descriptor_set(
                &[
                    ("camera_data", BindingValue::buffer(self.camera_data.buffer())),
                    ("color_tex", bind(color)),
                    ("normal_tex", bind(normal)),
                    ("position_tex", bind(position)),
                ],
                slot,
            );
        }

        let extent = self.target.extent();
        let control = PushConstants {
            default_value: Vec4::splat(f32::NAN),
            size: [extent.width as i32, extent.height as i32],
            source_count: self.opt.active_viewport_count,
            _padding: 0,
        };
        let (wg_x, wg_y, wg_z) = dispatch_size(
            extent,
            self.target.layer_count(),
            self.opt.active_viewport_count,
        );

        self.commands.clear(dev.device())?;
        for slot in 0..FRAMES_IN_FLIGHT {
            let cmd = unsafe { self.commands.begin(dev.device())? };
            unsafe {
                self.timer.begin(dev, cmd, slot);
                self.camera_data.upload(dev.device(), slot, cmd);
                self.comp.bind(cmd, slot);
                self.comp.push_constants(cmd, &control);
                dev.device().cmd_dispatch(cmd, wg_x, wg_y, wg_z);
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
        let _ = self.camera_data.destroy(&mut allocator);
    }
}

impl RenderStage for SpatialReprojectionStage {
    fn set_scene(&mut self, _scene: &SceneView) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, scene: &SceneView, slot: usize) -> Result<()> {
        let count = self.opt.active_viewport_count.max(1) as usize;
        self.camera_data
            .update_foreach::<CameraData, _>(slot, count, |data, i| {
                if let Some(camera) = scene.camera(i) {
                    data.view_proj = camera.view_projection();
                }
            })
    }

    fn command_buffers(&self, slot: usize) -> &[vk::CommandBuffer] {
        self.commands.buffers(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lightfield_dispatch_covers_reconstructed_layers() {
        // 2 rendered viewports of a 45-layer lightfield: 43 layers to fill.
        let extent = vk::Extent2D {
            width: 512,
            height: 256,
        };
        assert_eq!(dispatch_size(extent, 45, 2), (32, 16, 43));
    }

    #[test]
    fn rounding_up_partial_tiles() {
        let extent = vk::Extent2D {
            width: 17,
            height: 16,
        };
        assert_eq!(dispatch_size(extent, 4, 1), (2, 1, 3));
    }

    #[test]
    fn no_layers_left_means_empty_dispatch() {
        let extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        assert_eq!(dispatch_size(extent, 2, 2).2, 0);
    }

    #[test]
    fn push_constants_fit_the_budget() {
        assert!(std::mem::size_of::<PushConstants>() <= helia_gpu::MAX_PUSH_CONSTANT_SIZE);
    }
}
