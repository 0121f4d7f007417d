//! GPU memory management.

use crate::FRAMES_IN_FLIGHT;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use helia_core::{RenderError, Result};
use std::sync::Arc;

/// GPU memory allocator wrapper.
pub struct DeviceAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl DeviceAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::ResourceExhausted(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| RenderError::Other("allocator already shut down".to_string()))
    }

    /// Allocate a buffer.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<DeviceBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::ResourceExhausted(e.to_string()))?;

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        Ok(DeviceBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut DeviceBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| RenderError::Other(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate an image.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<DeviceImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::ResourceExhausted(e.to_string()))?;

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        Ok(DeviceImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
            layer_count: create_info.array_layers,
        })
    }

    /// Free an image allocation.
    pub fn free_image(&mut self, image: &mut DeviceImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| RenderError::Other(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed. Any
    /// remaining allocations are freed and logged as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl DeviceBuffer {
    /// Get the device address of this buffer.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr() as *mut u8)
    }

    /// Write raw bytes to the buffer at the given offset (must be
    /// host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| RenderError::Other("buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| RenderError::Other("offset overflow".to_string()))?;
        if end > self.size {
            return Err(RenderError::Other(
                "data range too large for buffer".to_string(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Write typed data to the buffer (must be host-visible).
    pub fn write<T: bytemuck::NoUninit>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Descriptor covering the whole buffer.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
    }
}

/// A GPU image with its allocation.
pub struct DeviceImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub layer_count: u32,
}

/// A per-in-flight-frame uniform/storage region with a recorded upload.
///
/// CPU writes go to a host-visible staging region indexed by frame slot;
/// the recorded copy into the device-local buffer runs inside the stage's
/// command buffer, so pre-recorded buffers pick up fresh per-frame data
/// without re-recording.
pub struct UniformRing {
    staging: DeviceBuffer,
    device_local: DeviceBuffer,
    slot_size: u64,
}

impl UniformRing {
    pub fn new(
        allocator: &mut DeviceAllocator,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let slot_size = size.max(1);
        let staging = allocator.create_buffer(
            slot_size * FRAMES_IN_FLIGHT as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &format!("{name}_staging"),
        )?;
        let device_local = allocator.create_buffer(
            slot_size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        )?;
        Ok(Self {
            staging,
            device_local,
            slot_size,
        })
    }

    /// Write this frame slot's staging region.
    pub fn update<T: bytemuck::NoUninit>(&self, slot: usize, data: &[T]) -> Result<()> {
        debug_assert!(slot < FRAMES_IN_FLIGHT);
        self.staging
            .write_bytes(slot as u64 * self.slot_size, bytemuck::cast_slice(data))
    }

    /// Fill `count` records through a callback, then write them to the slot.
    pub fn update_foreach<T, F>(&self, slot: usize, count: usize, mut f: F) -> Result<()>
    where
        T: bytemuck::NoUninit + bytemuck::Zeroable + Copy,
        F: FnMut(&mut T, usize),
    {
        let mut records = vec![T::zeroed(); count];
        for (i, record) in records.iter_mut().enumerate() {
            f(record, i);
        }
        self.update(slot, &records)
    }

    /// Record the staging → device copy for a frame slot, with a barrier
    /// making the data visible to subsequent compute/ray-tracing reads.
    ///
    /// # Safety
    /// The command buffer must be in recording state on this buffer's device.
    pub unsafe fn upload(&self, device: &ash::Device, slot: usize, cmd: vk::CommandBuffer) {
        let region = vk::BufferCopy::default()
            .src_offset(slot as u64 * self.slot_size)
            .dst_offset(0)
            .size(self.slot_size);
        device.cmd_copy_buffer(
            cmd,
            self.staging.buffer,
            self.device_local.buffer,
            std::slice::from_ref(&region),
        );

        let barrier = vk::BufferMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COPY)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(
                vk::PipelineStageFlags2::COMPUTE_SHADER
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            )
            .dst_access_mask(vk::AccessFlags2::SHADER_READ)
            .buffer(self.device_local.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        let dependency_info =
            vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));
        device.cmd_pipeline_barrier2(cmd, &dependency_info);
    }

    /// The device-local buffer bound to shaders.
    pub fn buffer(&self) -> vk::Buffer {
        self.device_local.buffer
    }

    /// Descriptor covering the device-local buffer.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        self.device_local.descriptor_info()
    }

    /// Free both buffers.
    pub fn destroy(mut self, allocator: &mut DeviceAllocator) -> Result<()> {
        allocator.free_buffer(&mut self.staging)?;
        allocator.free_buffer(&mut self.device_local)?;
        Ok(())
    }
}
