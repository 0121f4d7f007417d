//! Placeholder resources for missing optional bindings.
//!
//! Stages always write every named binding a pipeline declares; when the
//! scene has no data for an optional binding (no shadow maps, no 3D
//! textures), 1x1 textures and a tiny buffer stand in.

use crate::command::{execute_single_time_commands, CommandPool};
use crate::memory::{DeviceAllocator, DeviceBuffer, DeviceImage};
use crate::target::record_transition;
use ash::vk;
use gpu_allocator::MemoryLocation;
use helia_core::Result;

/// Per-device placeholder resources.
pub struct PlaceholderResources {
    pub default_sampler: vk::Sampler,
    pub depth_test_sampler: vk::Sampler,
    texture_2d: DeviceImage,
    texture_2d_view: vk::ImageView,
    texture_3d: DeviceImage,
    texture_3d_view: vk::ImageView,
    buffer: DeviceBuffer,
}

impl PlaceholderResources {
    /// Create the placeholder set, transitioning the textures to their
    /// shader layouts with a one-time submission.
    pub fn new(
        device: &ash::Device,
        allocator: &mut DeviceAllocator,
        queue_family: u32,
        queue: vk::Queue,
    ) -> Result<Self> {
        let texture_2d = allocator.create_image(
            &vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(vk::Format::R8G8B8A8_UNORM)
                .extent(vk::Extent3D {
                    width: 1,
                    height: 1,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(
                    vk::ImageUsageFlags::SAMPLED
                        | vk::ImageUsageFlags::STORAGE
                        | vk::ImageUsageFlags::TRANSFER_DST,
                )
                .initial_layout(vk::ImageLayout::UNDEFINED),
            MemoryLocation::GpuOnly,
            "placeholder_2d",
        )?;

        let texture_3d = allocator.create_image(
            &vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_3D)
                .format(vk::Format::R8G8B8A8_UNORM)
                .extent(vk::Extent3D {
                    width: 1,
                    height: 1,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
                .initial_layout(vk::ImageLayout::UNDEFINED),
            MemoryLocation::GpuOnly,
            "placeholder_3d",
        )?;

        let subresource = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        let texture_2d_view = unsafe {
            device.create_image_view(
                &vk::ImageViewCreateInfo::default()
                    .image(texture_2d.image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(vk::Format::R8G8B8A8_UNORM)
                    .subresource_range(subresource),
                None,
            )?
        };
        let texture_3d_view = unsafe {
            device.create_image_view(
                &vk::ImageViewCreateInfo::default()
                    .image(texture_3d.image)
                    .view_type(vk::ImageViewType::TYPE_3D)
                    .format(vk::Format::R8G8B8A8_UNORM)
                    .subresource_range(subresource),
                None,
            )?
        };

        let buffer = allocator.create_buffer(
            16,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            "placeholder_buffer",
        )?;
        buffer.write_bytes(0, &[0u8; 16])?;

        let default_sampler = unsafe {
            device.create_sampler(
                &vk::SamplerCreateInfo::default()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE),
                None,
            )?
        };
        let depth_test_sampler = unsafe {
            device.create_sampler(
                &vk::SamplerCreateInfo::default()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .compare_enable(true)
                    .compare_op(vk::CompareOp::LESS_OR_EQUAL),
                None,
            )?
        };

        // Clear the textures and move them to their resting layouts.
        unsafe {
            let pool = CommandPool::new(
                device,
                queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?;
            // The 2D texture rests in GENERAL so it can stand in for both
            // sampled and storage bindings.
            let resting = [
                (texture_2d.image, vk::ImageLayout::GENERAL),
                (texture_3d.image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            ];
            let result = execute_single_time_commands(device, &pool, queue, |cmd| {
                for (image, layout) in resting {
                    record_transition(
                        device,
                        cmd,
                        image,
                        subresource,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    );
                    device.cmd_clear_color_image(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &vk::ClearColorValue {
                            float32: [0.0; 4],
                        },
                        std::slice::from_ref(&subresource),
                    );
                    record_transition(
                        device,
                        cmd,
                        image,
                        subresource,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        layout,
                    );
                }
            });
            pool.destroy(device);
            result?;
        }

        Ok(Self {
            default_sampler,
            depth_test_sampler,
            texture_2d,
            texture_2d_view,
            texture_3d,
            texture_3d_view,
            buffer,
        })
    }

    /// Sampled-image descriptor over the 1x1 2D texture.
    pub fn sampled_image_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .sampler(self.default_sampler)
            .image_view(self.texture_2d_view)
            .image_layout(vk::ImageLayout::GENERAL)
    }

    /// Sampled-image descriptor over the 1x1x1 3D texture.
    pub fn sampled_image_3d_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .sampler(self.default_sampler)
            .image_view(self.texture_3d_view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    }

    /// Storage-image descriptor over the 1x1 2D texture.
    pub fn storage_image_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .image_view(self.texture_2d_view)
            .image_layout(vk::ImageLayout::GENERAL)
    }

    /// Descriptor over the tiny zero-filled buffer.
    pub fn buffer_info(&self) -> vk::DescriptorBufferInfo {
        self.buffer.descriptor_info()
    }

    /// Destroy all placeholder resources.
    ///
    /// # Safety
    /// The device must be valid and no submitted work may reference these
    /// resources.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut DeviceAllocator) {
        device.destroy_sampler(self.default_sampler, None);
        device.destroy_sampler(self.depth_test_sampler, None);
        device.destroy_image_view(self.texture_2d_view, None);
        device.destroy_image_view(self.texture_3d_view, None);
        let _ = allocator.free_image(&mut self.texture_2d);
        let _ = allocator.free_image(&mut self.texture_3d);
        let _ = allocator.free_buffer(&mut self.buffer);
    }
}
