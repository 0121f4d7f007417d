//! Device context management.
//!
//! The renderer treats the GPU as `D >= 1` asynchronous devices, each with
//! its own queues and semaphore space. The first compatible device is the
//! display device; the frame orchestrator owns the whole context.

use crate::capabilities::GpuCapabilities;
use crate::instance::{compatible_physical_devices, create_instance};
use crate::memory::DeviceAllocator;
use crate::placeholders::PlaceholderResources;
use crate::timer::TimerPool;
use ash::vk;
use helia_core::{RenderError, Result};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Ray-tracing extension entry points for one device.
pub struct RayTracingLoaders {
    pub pipeline: ash::khr::ray_tracing_pipeline::Device,
    pub acceleration_structure: ash::khr::acceleration_structure::Device,
}

/// One logical device with its queues and per-device services.
pub struct RenderDevice {
    pub index: usize,
    pub physical_device: vk::PhysicalDevice,
    pub device: Arc<ash::Device>,
    pub capabilities: GpuCapabilities,
    pub allocator: Mutex<DeviceAllocator>,

    pub graphics_queue_family: u32,
    pub compute_queue_family: u32,
    pub graphics_queue: vk::Queue,
    pub compute_queue: vk::Queue,

    pub push_descriptor: ash::khr::push_descriptor::Device,
    pub ray_tracing: Option<RayTracingLoaders>,
    pub timers: Mutex<Option<TimerPool>>,
    pub placeholders: Arc<PlaceholderResources>,
}

impl RenderDevice {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Whether ray-tracing pipelines can be created on this device.
    pub fn is_ray_tracing_supported(&self) -> bool {
        self.ray_tracing.is_some()
    }

    /// Ray-tracing loaders, or `MissingCapability`.
    pub fn ray_tracing(&self) -> Result<&RayTracingLoaders> {
        self.ray_tracing
            .as_ref()
            .ok_or_else(|| RenderError::MissingCapability("ray tracing".to_string()))
    }

    /// Wait for this device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

/// All devices driven by the renderer.
pub struct DeviceContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    devices: Vec<RenderDevice>,
    display_device_index: usize,
}

impl DeviceContext {
    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// All devices, display device first.
    pub fn devices(&self) -> &[RenderDevice] {
        &self.devices
    }

    /// The device that owns the display images.
    pub fn display_device(&self) -> &RenderDevice {
        &self.devices[self.display_device_index]
    }

    /// Wait until every device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        for device in &self.devices {
            device.wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        for dev in &mut self.devices {
            unsafe {
                let _ = dev.device.device_wait_idle();

                if let Some(pool) = dev.timers.lock().take() {
                    pool.destroy(&dev.device);
                }

                let mut allocator = dev.allocator.lock();
                match Arc::get_mut(&mut dev.placeholders) {
                    Some(placeholders) => placeholders.destroy(&dev.device, &mut allocator),
                    None => tracing::warn!(
                        "placeholder resources still referenced at context teardown"
                    ),
                }

                // Free all device memory before the device goes away.
                allocator.shutdown();
                drop(allocator);

                dev.device.destroy_device(None);
            }
        }
        self.devices.clear();
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a device context.
pub struct DeviceContextBuilder {
    app_name: String,
    enable_validation: bool,
    disable_ray_tracing: bool,
    /// Empty: use all compatible devices. Otherwise filter to these
    /// enumeration indices.
    physical_device_indices: Vec<usize>,
    /// If zero, stage timers are no-ops. Otherwise the number of timestamps
    /// that can be measured during one frame.
    max_timestamps: u32,
}

impl Default for DeviceContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Helia".to_string(),
            enable_validation: cfg!(debug_assertions),
            disable_ray_tracing: false,
            physical_device_indices: Vec::new(),
            max_timestamps: 0,
        }
    }
}

impl DeviceContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Skip the ray-tracing extension chain even on capable devices.
    pub fn disable_ray_tracing(mut self, disable: bool) -> Self {
        self.disable_ray_tracing = disable;
        self
    }

    /// Restrict to specific physical device enumeration indices.
    pub fn physical_devices(mut self, indices: Vec<usize>) -> Self {
        self.physical_device_indices = indices;
        self
    }

    /// Set the per-frame timestamp budget (0 disables timers).
    pub fn max_timestamps(mut self, count: u32) -> Self {
        self.max_timestamps = count;
        self
    }

    /// Build the device context.
    pub fn build(self) -> Result<DeviceContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RenderError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let physical_devices =
            unsafe { compatible_physical_devices(&instance, &self.physical_device_indices) }?;

        let mut devices = Vec::with_capacity(physical_devices.len());
        for (index, physical_device) in physical_devices.into_iter().enumerate() {
            let device = unsafe {
                create_render_device(
                    &instance,
                    physical_device,
                    index,
                    self.disable_ray_tracing,
                    self.max_timestamps,
                )
            }?;
            tracing::info!("Device {index}: {}", device.capabilities.summary());
            devices.push(device);
        }

        Ok(DeviceContext {
            entry,
            instance,
            devices,
            display_device_index: 0,
        })
    }
}

/// Queue family indices.
struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
}

/// Find queue families for graphics and compute work.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics_family = None;
    let mut compute_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        // Dedicated compute queue (no graphics)
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    let graphics = graphics_family.ok_or(RenderError::NoSuitableDevice)?;
    let compute = compute_family.unwrap_or(graphics);

    Ok(QueueFamilyIndices { graphics, compute })
}

/// Device extensions required on every device.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::push_descriptor::NAME]
}

/// The ray-tracing extension chain.
fn ray_tracing_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::deferred_host_operations::NAME,
    ]
}

/// Create one logical device with its services.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_render_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    index: usize,
    disable_ray_tracing: bool,
    max_timestamps: u32,
) -> Result<RenderDevice> {
    let capabilities = GpuCapabilities::query(instance, physical_device);
    if !capabilities.meets_requirements() {
        return Err(RenderError::NoSuitableDevice);
    }

    let queue_families = find_queue_families(instance, physical_device)?;
    let enable_ray_tracing = capabilities.is_ray_tracing_supported() && !disable_ray_tracing;

    // Collect unique queue families
    let mut unique_families = vec![queue_families.graphics];
    if queue_families.compute != queue_families.graphics {
        unique_families.push(queue_families.compute);
    }

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let mut extensions = required_device_extensions();
    if enable_ray_tracing {
        extensions.extend(ray_tracing_extensions());
    }
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    // Vulkan 1.2 features: timeline semaphores for cross-device ordering,
    // descriptor indexing for the bindless texture table, host query reset
    // for timers.
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .host_query_reset(true);

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    let mut rt_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
    let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        .acceleration_structure(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut vulkan_1_3_features);
    if enable_ray_tracing {
        features2 = features2
            .push_next(&mut rt_pipeline_features)
            .push_next(&mut accel_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance.create_device(physical_device, &device_create_info, None)?;
    let device = Arc::new(device);

    let graphics_queue = device.get_device_queue(queue_families.graphics, 0);
    let compute_queue = device.get_device_queue(queue_families.compute, 0);

    let push_descriptor = ash::khr::push_descriptor::Device::new(instance, &device);
    let ray_tracing = enable_ray_tracing.then(|| RayTracingLoaders {
        pipeline: ash::khr::ray_tracing_pipeline::Device::new(instance, &device),
        acceleration_structure: ash::khr::acceleration_structure::Device::new(instance, &device),
    });

    let mut allocator = DeviceAllocator::new(instance, device.clone(), physical_device)?;

    let timers = if max_timestamps > 0 {
        Some(TimerPool::new(
            device.clone(),
            max_timestamps,
            capabilities.timestamp_period,
        )?)
    } else {
        None
    };

    let placeholders = PlaceholderResources::new(
        &device,
        &mut allocator,
        queue_families.graphics,
        graphics_queue,
    )?;

    Ok(RenderDevice {
        index,
        physical_device,
        device,
        capabilities,
        allocator: Mutex::new(allocator),
        graphics_queue_family: queue_families.graphics,
        compute_queue_family: queue_families.compute,
        graphics_queue,
        compute_queue,
        push_descriptor,
        ray_tracing,
        timers: Mutex::new(timers),
        placeholders: Arc::new(placeholders),
    })
}
