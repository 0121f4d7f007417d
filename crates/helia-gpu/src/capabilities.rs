//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Ray-tracing pipeline limits needed for shader binding tables.
#[derive(Debug, Clone, Copy)]
pub struct RayTracingCapabilities {
    pub shader_group_handle_size: u32,
    pub shader_group_base_alignment: u32,
    pub shader_group_handle_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Ray-tracing pipeline limits, present when the full extension chain
    /// (acceleration structure + ray tracing pipeline + deferred host
    /// operations) is available.
    pub ray_tracing: Option<RayTracingCapabilities>,
    /// Push descriptor support (required).
    pub supports_push_descriptors: bool,
    /// Maximum push descriptors in one set.
    pub max_push_descriptors: u32,

    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
    /// Whether compute and graphics queues support timestamps.
    pub timestamp_compute_and_graphics: bool,

    /// Guaranteed push constant budget in bytes.
    pub max_push_constants_size: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum compute workgroup invocations.
    pub max_compute_workgroup_invocations: u32,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let has = |name: &CStr| available_extensions.contains(name.to_str().unwrap_or_default());

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut push_descriptor_props = vk::PhysicalDevicePushDescriptorPropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut push_descriptor_props);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let supports_ray_tracing = has(ash::khr::acceleration_structure::NAME)
            && has(ash::khr::ray_tracing_pipeline::NAME)
            && has(ash::khr::deferred_host_operations::NAME);

        let ray_tracing = supports_ray_tracing.then_some(RayTracingCapabilities {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
        });

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            ray_tracing,
            supports_push_descriptors: has(ash::khr::push_descriptor::NAME),
            max_push_descriptors: push_descriptor_props.max_push_descriptors,

            timestamp_period: properties.limits.timestamp_period,
            timestamp_compute_and_graphics: properties.limits.timestamp_compute_and_graphics
                == vk::TRUE,

            max_push_constants_size: properties.limits.max_push_constants_size,
            device_local_memory_mb,
            max_compute_workgroup_invocations: properties.limits.max_compute_work_group_invocations,

            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements for the renderer.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 2) {
            return false;
        }

        // Stages bind everything through push descriptors.
        if !self.supports_push_descriptors {
            return false;
        }

        true
    }

    /// Whether the ray-tracing extension chain is available.
    pub fn is_ray_tracing_supported(&self) -> bool {
        self.ray_tracing.is_some()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.is_ray_tracing_supported() {
                "on"
            } else {
                "off"
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }
}
