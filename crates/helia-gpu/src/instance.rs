//! Vulkan instance creation.

use ash::vk;
use helia_core::{RenderError, Result};
use std::ffi::{CStr, CString};

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| RenderError::Other("application name contains NUL".to_string()))?;
    let engine_name = CString::new("Helia").unwrap();

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    // Collect layer names, dropping requested layers that are unavailable.
    let mut layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    let available_layers = entry.enumerate_instance_layer_properties()?;
    layers.retain(|layer| {
        let found = available_layers.iter().any(|props| {
            let name = CStr::from_ptr(props.layer_name.as_ptr());
            name == *layer
        });
        if !found {
            tracing::warn!("Validation layer {:?} not available", layer);
        }
        found
    });
    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layer_names);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Enumerate physical devices compatible with the renderer, best first.
///
/// An empty `index_filter` keeps every compatible device; otherwise only the
/// listed enumeration indices are kept.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn compatible_physical_devices(
    instance: &ash::Instance,
    index_filter: &[usize],
) -> Result<Vec<vk::PhysicalDevice>> {
    let devices = instance.enumerate_physical_devices()?;

    let mut scored: Vec<(i32, vk::PhysicalDevice)> = devices
        .iter()
        .enumerate()
        .filter(|(i, _)| index_filter.is_empty() || index_filter.contains(i))
        .filter_map(|(_, &device)| {
            let score = score_physical_device(instance, device);
            (score >= 0).then_some((score, device))
        })
        .collect();

    if scored.is_empty() {
        return Err(RenderError::NoSuitableDevice);
    }

    scored.sort_by_key(|(score, _)| -score);
    Ok(scored.into_iter().map(|(_, device)| device).collect())
}

/// Score a physical device for selection. Negative means incompatible.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    // Vulkan 1.2 is the floor for timeline semaphores and descriptor
    // indexing.
    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 2)
    {
        return -1;
    }

    let mut score = 0;

    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // Prefer ray-tracing capable devices.
    let extensions = instance
        .enumerate_device_extension_properties(device)
        .unwrap_or_default();
    let has_rt = extensions.iter().any(|ext| {
        CStr::from_ptr(ext.extension_name.as_ptr()) == ash::khr::ray_tracing_pipeline::NAME
    });
    if has_rt {
        score += 500;
    }

    // Prefer more VRAM.
    let memory = instance.get_physical_device_memory_properties(device);
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32;

    score
}
