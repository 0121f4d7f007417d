//! G-buffer allocation.
//!
//! Channels are allocated with one image per in-flight frame slot, so the
//! previous frame's attributes survive in the other slot's images. Stages
//! needing history (SVGF temporal reprojection) read slot `s ^ 1`.

use ash::vk;
use gpu_allocator::MemoryLocation;
use helia_core::Result;
use helia_gpu::command::{execute_single_time_commands, CommandPool};
use helia_gpu::target::record_transition;
use helia_gpu::{DeviceImage, GbufferTarget, RenderDevice, RenderTarget, FRAMES_IN_FLIGHT};
use serde::{Deserialize, Serialize};

/// Which channels to allocate, plus shared geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbufferSpec {
    pub width: u32,
    pub height: u32,
    pub layer_count: u32,
    pub channels: Vec<String>,
}

impl GbufferSpec {
    pub fn new(width: u32, height: u32, layer_count: u32, channels: &[&str]) -> Self {
        Self {
            width,
            height,
            layer_count,
            channels: channels.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

/// Format for one named channel.
fn channel_format(name: &str) -> vk::Format {
    match name {
        "linear_depth" => vk::Format::R32G32_SFLOAT,
        "depth" => vk::Format::R32_SFLOAT,
        "instance_id" => vk::Format::R32_SINT,
        "material" => vk::Format::R8G8B8A8_UNORM,
        "screen_motion" => vk::Format::R32G32_SFLOAT,
        _ => vk::Format::R16G16B16A16_SFLOAT,
    }
}

/// Owns the images and views behind a [`GbufferTarget`] (or any loose
/// render targets).
pub struct GbufferResources {
    images: Vec<DeviceImage>,
    views: Vec<vk::ImageView>,
}

impl GbufferResources {
    pub fn new() -> Self {
        Self {
            images: Vec::new(),
            views: Vec::new(),
        }
    }

    /// Allocate one render target: an image + array view per frame slot,
    /// left in `GENERAL` layout.
    pub fn allocate_target(
        &mut self,
        device: &RenderDevice,
        extent: vk::Extent2D,
        layer_count: u32,
        format: vk::Format,
        name: &str,
    ) -> Result<RenderTarget> {
        let mut images = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut views = Vec::with_capacity(FRAMES_IN_FLIGHT);

        let mut allocator = device.allocator.lock();
        for slot in 0..FRAMES_IN_FLIGHT {
            let image = allocator.create_image(
                &vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(format)
                    .extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(layer_count)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(
                        vk::ImageUsageFlags::STORAGE
                            | vk::ImageUsageFlags::SAMPLED
                            | vk::ImageUsageFlags::TRANSFER_SRC,
                    )
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                MemoryLocation::GpuOnly,
                &format!("{name}_{slot}"),
            )?;
            let view = unsafe {
                device.device().create_image_view(
                    &vk::ImageViewCreateInfo::default()
                        .image(image.image)
                        .view_type(if layer_count > 1 {
                            vk::ImageViewType::TYPE_2D_ARRAY
                        } else {
                            vk::ImageViewType::TYPE_2D
                        })
                        .format(format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count,
                        }),
                    None,
                )?
            };
            images.push(image);
            views.push(view);
        }
        drop(allocator);

        let image_handles: Vec<vk::Image> = images.iter().map(|img| img.image).collect();
        let subresource = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count,
        };

        // Move every slot's image to GENERAL once, so the recorded command
        // buffers never need an initial transition.
        unsafe {
            let pool = CommandPool::new(
                device.device(),
                device.graphics_queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?;
            let result = execute_single_time_commands(
                device.device(),
                &pool,
                device.graphics_queue,
                |cmd| {
                    for &image in &image_handles {
                        record_transition(
                            device.device(),
                            cmd,
                            image,
                            subresource,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::GENERAL,
                        );
                    }
                },
            );
            pool.destroy(device.device());
            result?;
        }

        let target = RenderTarget::new(
            image_handles,
            views.clone(),
            format,
            extent,
            layer_count,
            vk::ImageLayout::GENERAL,
        );

        self.images.append(&mut images);
        self.views.append(&mut views);
        Ok(target)
    }

    /// Free everything allocated through this bundle.
    ///
    /// # Safety
    /// The device must be idle; no recorded buffer may reference these
    /// resources afterwards.
    pub unsafe fn destroy(&mut self, device: &RenderDevice) {
        let mut allocator = device.allocator.lock();
        for view in self.views.drain(..) {
            device.device().destroy_image_view(view, None);
        }
        for image in &mut self.images {
            let _ = allocator.free_image(image);
        }
        self.images.clear();
    }
}

impl Default for GbufferResources {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a G-buffer with the channels the spec names.
pub fn allocate_gbuffer(
    device: &RenderDevice,
    spec: &GbufferSpec,
) -> Result<(GbufferTarget, GbufferResources)> {
    let mut resources = GbufferResources::new();
    let mut gbuffer = GbufferTarget::default();
    let extent = spec.extent();

    for channel in &spec.channels {
        let name = channel.as_str();
        let target = resources.allocate_target(
            device,
            extent,
            spec.layer_count,
            channel_format(name),
            &format!("gbuffer_{name}"),
        )?;
        match name {
            "color" => gbuffer.color = Some(target),
            "diffuse" => gbuffer.diffuse = Some(target),
            "specular" => gbuffer.specular = Some(target),
            "albedo" => gbuffer.albedo = Some(target),
            "material" => gbuffer.material = Some(target),
            "normal" => gbuffer.normal = Some(target),
            "view_normal" => gbuffer.view_normal = Some(target),
            "world_pos" => gbuffer.world_pos = Some(target),
            "view_pos" => gbuffer.view_pos = Some(target),
            "screen_motion" => gbuffer.screen_motion = Some(target),
            "world_motion" => gbuffer.world_motion = Some(target),
            "view_motion" => gbuffer.view_motion = Some(target),
            "linear_depth" => gbuffer.linear_depth = Some(target),
            "depth" => gbuffer.depth = Some(target),
            "instance_id" => gbuffer.instance_id = Some(target),
            "emission" => gbuffer.emission = Some(target),
            other => {
                tracing::warn!("unknown G-buffer channel {other}, skipping");
            }
        }
    }

    Ok((gbuffer, resources))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_formats() {
        assert_eq!(channel_format("color"), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(channel_format("linear_depth"), vk::Format::R32G32_SFLOAT);
        assert_eq!(channel_format("instance_id"), vk::Format::R32_SINT);
    }

    #[test]
    fn spec_lists_channels() {
        let spec = GbufferSpec::new(1920, 1080, 1, &["color", "normal", "screen_motion"]);
        assert_eq!(spec.channels.len(), 3);
        assert_eq!(spec.extent().width, 1920);
    }
}
