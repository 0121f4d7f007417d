//! Compute and ray-tracing pipeline wrappers.
//!
//! Both kinds share a base holding the descriptor-set layout built from
//! merged shader reflection, the push-constant range, and one
//! push-descriptor state per in-flight frame slot.

use crate::context::RenderDevice;
use crate::descriptor::{push_resolved, resolve_bindings, BindingValue, ResolvedBinding};
use crate::memory::DeviceBuffer;
use crate::placeholders::PlaceholderResources;
use crate::FRAMES_IN_FLIGHT;
use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use helia_core::{RenderError, Result};
use helia_shader::{HitGroupKind, MergedBinding, ShaderSet, ShaderSource};
use std::sync::Arc;

/// The minimum maximum size for push constant buffers in Vulkan.
pub const MAX_PUSH_CONSTANT_SIZE: usize = 128;

/// State shared by compute and ray-tracing pipelines.
pub struct PipelineBase {
    device: Arc<ash::Device>,
    push_loader: ash::khr::push_descriptor::Device,
    placeholders: Arc<PlaceholderResources>,
    bind_point: vk::PipelineBindPoint,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    bindings: Vec<MergedBinding>,
    binding_names: HashMap<String, u32>,
    push_constant_stages: vk::ShaderStageFlags,
    /// One stored push-descriptor state per in-flight slot.
    states: Vec<Vec<ResolvedBinding>>,
}

impl PipelineBase {
    fn new_layout(
        dev: &RenderDevice,
        set: &ShaderSet,
        count_overrides: &HashMap<String, u32>,
        bind_point: vk::PipelineBindPoint,
    ) -> Result<Self> {
        let device = dev.device.clone();
        let bindings = set.merged_bindings(count_overrides)?;
        let binding_names = set.binding_names()?;
        let push_constant_ranges = set.push_constant_ranges();

        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count.max(1))
                    .stage_flags(b.stages)
            })
            .collect();

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&layout_bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&set_layout_info, None)? };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout))
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe {
            device
                .create_pipeline_layout(&layout_info, None)
                .map_err(RenderError::from)?
        };

        let push_constant_stages = push_constant_ranges
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |acc, r| acc | r.stage_flags);

        Ok(Self {
            device,
            push_loader: dev.push_descriptor.clone(),
            placeholders: dev.placeholders.clone(),
            bind_point,
            pipeline: vk::Pipeline::null(),
            layout,
            set_layout,
            bindings,
            binding_names,
            push_constant_stages,
            states: vec![Vec::new(); FRAMES_IN_FLIGHT],
        })
    }

    /// Slot index of a named binding, if this pipeline uses it.
    pub fn binding_slot(&self, name: &str) -> Option<u32> {
        self.binding_names.get(name).copied()
    }

    /// Store named bindings in the per-slot state used by later `bind`.
    pub fn update_descriptor_set(&mut self, values: &[(&str, BindingValue)], slot: usize) {
        self.states[slot] = resolve_bindings(
            &self.bindings,
            &self.binding_names,
            values,
            &self.placeholders,
        );
    }

    /// Bind the pipeline and push the stored per-slot descriptor state.
    ///
    /// # Safety
    /// The command buffer must be in recording state on the owning device.
    pub unsafe fn bind(&self, cmd: vk::CommandBuffer, slot: usize) {
        self.device
            .cmd_bind_pipeline(cmd, self.bind_point, self.pipeline);
        push_resolved(
            &self.push_loader,
            cmd,
            self.bind_point,
            self.layout,
            &self.states[slot],
        );
    }

    /// Write named descriptors inline, bypassing the stored state.
    ///
    /// # Safety
    /// The command buffer must be in recording state on the owning device.
    pub unsafe fn push_descriptors(&self, cmd: vk::CommandBuffer, values: &[(&str, BindingValue)]) {
        let resolved = resolve_bindings(
            &self.bindings,
            &self.binding_names,
            values,
            &self.placeholders,
        );
        push_resolved(&self.push_loader, cmd, self.bind_point, self.layout, &resolved);
    }

    /// Push a fixed-layout constant record.
    ///
    /// # Safety
    /// The command buffer must be in recording state; `T` must match the
    /// shader's push-constant block layout.
    pub unsafe fn push_constants<T: bytemuck::NoUninit>(&self, cmd: vk::CommandBuffer, value: &T) {
        const { assert!(std::mem::size_of::<T>() <= MAX_PUSH_CONSTANT_SIZE) };
        self.device.cmd_push_constants(
            cmd,
            self.layout,
            self.push_constant_stages,
            0,
            bytemuck::bytes_of(value),
        );
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    unsafe fn destroy(&mut self) {
        self.device.destroy_pipeline(self.pipeline, None);
        self.device.destroy_pipeline_layout(self.layout, None);
        self.device
            .destroy_descriptor_set_layout(self.set_layout, None);
        self.pipeline = vk::Pipeline::null();
    }
}

unsafe fn create_shader_module(
    device: &ash::Device,
    source: &ShaderSource,
) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(&source.spirv);
    let module = device.create_shader_module(&info, None)?;
    Ok(module)
}

/// Compute pipeline with push-descriptor state.
pub struct ComputePipeline {
    base: PipelineBase,
}

impl ComputePipeline {
    /// Build a compute pipeline from a compiled shader.
    pub fn new(
        dev: &RenderDevice,
        source: ShaderSource,
        count_overrides: &HashMap<String, u32>,
    ) -> Result<Self> {
        let set = ShaderSet::compute(source);
        let mut base =
            PipelineBase::new_layout(dev, &set, count_overrides, vk::PipelineBindPoint::COMPUTE)?;

        let module = unsafe { create_shader_module(&base.device, &set.compute)? };
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(base.layout);

        let pipelines = unsafe {
            base.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| RenderError::from(e))?
        };
        base.pipeline = pipelines[0];

        unsafe {
            base.device.destroy_shader_module(module, None);
        }

        Ok(Self { base })
    }

    pub fn base(&self) -> &PipelineBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut PipelineBase {
        &mut self.base
    }

    pub fn update_descriptor_set(&mut self, values: &[(&str, BindingValue)], slot: usize) {
        self.base.update_descriptor_set(values, slot);
    }

    /// # Safety
    /// See [`PipelineBase::bind`].
    pub unsafe fn bind(&self, cmd: vk::CommandBuffer, slot: usize) {
        self.base.bind(cmd, slot);
    }

    /// # Safety
    /// See [`PipelineBase::push_descriptors`].
    pub unsafe fn push_descriptors(&self, cmd: vk::CommandBuffer, values: &[(&str, BindingValue)]) {
        self.base.push_descriptors(cmd, values);
    }

    /// # Safety
    /// See [`PipelineBase::push_constants`].
    pub unsafe fn push_constants<T: bytemuck::NoUninit>(&self, cmd: vk::CommandBuffer, value: &T) {
        self.base.push_constants(cmd, value);
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&mut self) {
        self.base.destroy();
    }
}

/// Ray-tracing pipeline with its shader binding table.
///
/// Group layout is fixed: group 0 is the raygen program, groups 1..=M the
/// miss programs in declaration order, and the hit groups follow in
/// declaration order.
pub struct RayTracingPipeline {
    base: PipelineBase,
    rt_loader: ash::khr::ray_tracing_pipeline::Device,
    sbt_buffer: DeviceBuffer,
    raygen_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,
    callable_region: vk::StridedDeviceAddressRegionKHR,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

impl RayTracingPipeline {
    /// Build a ray-tracing pipeline and its shader binding table.
    ///
    /// Fails with `MissingCapability` when the device lacks ray tracing.
    pub fn new(
        dev: &RenderDevice,
        set: ShaderSet,
        max_recursion_depth: u32,
        count_overrides: &HashMap<String, u32>,
    ) -> Result<Self> {
        let loaders = dev.ray_tracing()?;
        let caps = dev
            .capabilities
            .ray_tracing
            .ok_or_else(|| RenderError::MissingCapability("ray tracing".to_string()))?;

        let mut base = PipelineBase::new_layout(
            dev,
            &set,
            count_overrides,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
        )?;
        let device = base.device.clone();

        // Assemble stages: raygen, miss programs, then hit group programs.
        let mut modules: Vec<vk::ShaderModule> = Vec::new();
        let mut stages: Vec<vk::PipelineShaderStageCreateInfo> = Vec::new();
        let mut add_stage = |source: &ShaderSource,
                             stage: vk::ShaderStageFlags|
         -> Result<u32> {
            let module = unsafe { create_shader_module(&device, source)? };
            modules.push(module);
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(c"main"),
            );
            Ok(stages.len() as u32 - 1)
        };

        let mut groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = Vec::new();

        let raygen_index = add_stage(&set.raygen, vk::ShaderStageFlags::RAYGEN_KHR)?;
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(raygen_index)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        );

        let miss_count = set.miss.len() as u32;
        for miss in &set.miss {
            let index = add_stage(miss, vk::ShaderStageFlags::MISS_KHR)?;
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(index)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR),
            );
        }

        let hit_count = set.hit_groups.len() as u32;
        for group in &set.hit_groups {
            let ty = match group.kind {
                Some(HitGroupKind::Procedural) => {
                    vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
                }
                _ => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            };
            let closest_hit = if group.closest_hit.is_empty() {
                vk::SHADER_UNUSED_KHR
            } else {
                add_stage(&group.closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?
            };
            let any_hit = if group.any_hit.is_empty() {
                vk::SHADER_UNUSED_KHR
            } else {
                add_stage(&group.any_hit, vk::ShaderStageFlags::ANY_HIT_KHR)?
            };
            let intersection = if group.intersection.is_empty() {
                vk::SHADER_UNUSED_KHR
            } else {
                add_stage(&group.intersection, vk::ShaderStageFlags::INTERSECTION_KHR)?
            };
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(ty)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit)
                    .any_hit_shader(any_hit)
                    .intersection_shader(intersection),
            );
        }

        let max_recursion = max_recursion_depth
            .max(1)
            .min(caps.max_ray_recursion_depth);
        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(max_recursion)
            .layout(base.layout);

        let pipelines = unsafe {
            loaders
                .pipeline
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[pipeline_info],
                    None,
                )
                .map_err(|(_, e)| RenderError::from(e))?
        };
        base.pipeline = pipelines[0];

        for module in modules {
            unsafe {
                device.destroy_shader_module(module, None);
            }
        }

        // Shader binding table. Region order: raygen, miss, hit. The raygen
        // region's stride must equal its size.
        let handle_size = caps.shader_group_handle_size as u64;
        let handle_stride = align_up(handle_size, caps.shader_group_handle_alignment as u64);
        let base_alignment = caps.shader_group_base_alignment as u64;

        let raygen_size = align_up(handle_stride, base_alignment);
        let miss_size = align_up(miss_count as u64 * handle_stride, base_alignment);
        let hit_size = align_up(hit_count as u64 * handle_stride, base_alignment);

        let group_count = 1 + miss_count + hit_count;
        let handles = unsafe {
            loaders.pipeline.get_ray_tracing_shader_group_handles(
                base.pipeline,
                0,
                group_count,
                group_count as usize * caps.shader_group_handle_size as usize,
            )?
        };

        let mut allocator = dev.allocator.lock();
        let sbt_buffer = allocator.create_buffer(
            raygen_size + miss_size + hit_size,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "shader_binding_table",
        )?;
        drop(allocator);

        let handle = |group: u64| {
            let offset = group as usize * handle_size as usize;
            &handles[offset..offset + handle_size as usize]
        };
        sbt_buffer.write_bytes(0, handle(0))?;
        for i in 0..miss_count as u64 {
            sbt_buffer.write_bytes(raygen_size + i * handle_stride, handle(1 + i))?;
        }
        for i in 0..hit_count as u64 {
            sbt_buffer.write_bytes(
                raygen_size + miss_size + i * handle_stride,
                handle(1 + miss_count as u64 + i),
            )?;
        }

        let base_address = sbt_buffer.device_address(&device);
        let raygen_region = vk::StridedDeviceAddressRegionKHR::default()
            .device_address(base_address)
            .stride(raygen_size)
            .size(raygen_size);
        let miss_region = vk::StridedDeviceAddressRegionKHR::default()
            .device_address(base_address + raygen_size)
            .stride(handle_stride)
            .size(miss_size);
        let hit_region = vk::StridedDeviceAddressRegionKHR::default()
            .device_address(base_address + raygen_size + miss_size)
            .stride(handle_stride)
            .size(hit_size);

        Ok(Self {
            base,
            rt_loader: loaders.pipeline.clone(),
            sbt_buffer,
            raygen_region,
            miss_region,
            hit_region,
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }

    pub fn base(&self) -> &PipelineBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut PipelineBase {
        &mut self.base
    }

    pub fn update_descriptor_set(&mut self, values: &[(&str, BindingValue)], slot: usize) {
        self.base.update_descriptor_set(values, slot);
    }

    /// # Safety
    /// See [`PipelineBase::bind`].
    pub unsafe fn bind(&self, cmd: vk::CommandBuffer, slot: usize) {
        self.base.bind(cmd, slot);
    }

    /// # Safety
    /// See [`PipelineBase::push_descriptors`].
    pub unsafe fn push_descriptors(&self, cmd: vk::CommandBuffer, values: &[(&str, BindingValue)]) {
        self.base.push_descriptors(cmd, values);
    }

    /// # Safety
    /// See [`PipelineBase::push_constants`].
    pub unsafe fn push_constants<T: bytemuck::NoUninit>(&self, cmd: vk::CommandBuffer, value: &T) {
        self.base.push_constants(cmd, value);
    }

    /// Record the trace-rays dispatch.
    ///
    /// # Safety
    /// The pipeline must be bound on `cmd`.
    pub unsafe fn trace_rays(&self, cmd: vk::CommandBuffer, width: u32, height: u32, depth: u32) {
        self.rt_loader.cmd_trace_rays(
            cmd,
            &self.raygen_region,
            &self.miss_region,
            &self.hit_region,
            &self.callable_region,
            width,
            height,
            depth,
        );
    }

    /// Destroy the pipeline and its shader binding table.
    ///
    /// # Safety
    /// The pipeline must not be in use; the allocator must belong to the
    /// owning device.
    pub unsafe fn destroy(&mut self, allocator: &mut crate::memory::DeviceAllocator) {
        let _ = allocator.free_buffer(&mut self.sbt_buffer);
        self.base.destroy();
    }
}
