//! Descriptor binding values and per-slot push-descriptor state.
//!
//! Pipelines bind everything through `VK_KHR_push_descriptor`: no pools, no
//! set allocation, a fresh write in every command buffer. Stages store the
//! bindings for each in-flight slot by name; the pipeline resolves names to
//! slots via reflection.

use crate::placeholders::PlaceholderResources;
use ash::vk;
use hashbrown::HashMap;
use helia_shader::MergedBinding;

/// One named binding value supplied by a stage or the scene.
#[derive(Clone, Debug, Default)]
pub enum BindingValue {
    /// Fill from placeholder resources (1x1 texture / tiny buffer).
    #[default]
    Empty,
    /// Placeholder-filled array of the given length.
    EmptyArray(u32),
    /// Placeholder-filled 3D texture array of the given length.
    EmptyTexture3dArray(u32),
    Buffer(vk::DescriptorBufferInfo),
    BufferArray(Vec<vk::DescriptorBufferInfo>),
    Image(vk::DescriptorImageInfo),
    ImageArray(Vec<vk::DescriptorImageInfo>),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl BindingValue {
    /// A storage image in `GENERAL` layout.
    pub fn storage_image(view: vk::ImageView) -> Self {
        Self::Image(
            vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL),
        )
    }

    /// A combined image sampler.
    pub fn sampled_image(
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) -> Self {
        Self::Image(
            vk::DescriptorImageInfo::default()
                .sampler(sampler)
                .image_view(view)
                .image_layout(layout),
        )
    }

    /// A whole-buffer binding.
    pub fn buffer(buffer: vk::Buffer) -> Self {
        Self::Buffer(
            vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE),
        )
    }

    /// A buffer slice binding.
    pub fn buffer_range(buffer: vk::Buffer, offset: u64, range: u64) -> Self {
        Self::Buffer(
            vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .offset(offset)
                .range(range),
        )
    }
}

/// A binding resolved against a pipeline's layout, ready to be written.
#[derive(Clone, Debug, Default)]
pub(crate) struct ResolvedBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffers: Vec<vk::DescriptorBufferInfo>,
    pub images: Vec<vk::DescriptorImageInfo>,
    pub acceleration_structures: Vec<vk::AccelerationStructureKHR>,
}

/// Resolve named values against a pipeline's merged bindings. Names the
/// pipeline does not use are skipped; `Empty` values are filled from the
/// device's placeholder resources.
pub(crate) fn resolve_bindings(
    bindings: &[MergedBinding],
    binding_names: &HashMap<String, u32>,
    values: &[(&str, BindingValue)],
    placeholders: &PlaceholderResources,
) -> Vec<ResolvedBinding> {
    let mut resolved = Vec::with_capacity(values.len());
    for (name, value) in values {
        let Some(&slot) = binding_names.get(*name) else {
            tracing::trace!("binding {name} not used by pipeline, skipping");
            continue;
        };
        let Some(merged) = bindings.iter().find(|b| b.binding == slot) else {
            continue;
        };
        let ty = merged.descriptor_type;

        let mut out = ResolvedBinding {
            binding: slot,
            descriptor_type: ty,
            ..Default::default()
        };
        match value {
            BindingValue::Empty => fill_placeholder(&mut out, ty, 1, placeholders),
            BindingValue::EmptyArray(count) => {
                fill_placeholder(&mut out, ty, *count, placeholders)
            }
            BindingValue::EmptyTexture3dArray(count) => {
                out.images = vec![placeholders.sampled_image_3d_info(); (*count).max(1) as usize];
            }
            BindingValue::Buffer(info) => out.buffers.push(*info),
            BindingValue::BufferArray(infos) => out.buffers.extend_from_slice(infos),
            BindingValue::Image(info) => out.images.push(*info),
            BindingValue::ImageArray(infos) => out.images.extend_from_slice(infos),
            BindingValue::AccelerationStructure(tlas) => {
                out.acceleration_structures.push(*tlas)
            }
        }
        // Empty arrays cannot be written.
        if out.buffers.is_empty()
            && out.images.is_empty()
            && out.acceleration_structures.is_empty()
        {
            continue;
        }
        resolved.push(out);
    }
    resolved
}

fn fill_placeholder(
    out: &mut ResolvedBinding,
    ty: vk::DescriptorType,
    count: u32,
    placeholders: &PlaceholderResources,
) {
    let count = count.max(1) as usize;
    match ty {
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER | vk::DescriptorType::SAMPLED_IMAGE => {
            out.images = vec![placeholders.sampled_image_info(); count];
        }
        vk::DescriptorType::STORAGE_IMAGE => {
            out.images = vec![placeholders.storage_image_info(); count];
        }
        _ => {
            out.buffers = vec![placeholders.buffer_info(); count];
        }
    }
}

/// Build `WriteDescriptorSet`s over resolved bindings and push them.
///
/// # Safety
/// The command buffer must be in recording state; the pipeline layout must
/// have been created with the push-descriptor flag.
pub(crate) unsafe fn push_resolved(
    loader: &ash::khr::push_descriptor::Device,
    cmd: vk::CommandBuffer,
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
    resolved: &[ResolvedBinding],
) {
    if resolved.is_empty() {
        return;
    }

    // Acceleration-structure writes chain an extension struct. They are all
    // built up front so their addresses are stable when the writes refer to
    // them through p_next.
    let tlas_writes: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = resolved
        .iter()
        .filter(|r| !r.acceleration_structures.is_empty())
        .map(|r| {
            vk::WriteDescriptorSetAccelerationStructureKHR::default()
                .acceleration_structures(&r.acceleration_structures)
        })
        .collect();

    let mut tlas_cursor = 0;
    let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(resolved.len());
    for binding in resolved {
        let mut write = vk::WriteDescriptorSet::default()
            .dst_binding(binding.binding)
            .descriptor_type(binding.descriptor_type);

        if !binding.acceleration_structures.is_empty() {
            write.p_next = &tlas_writes[tlas_cursor]
                as *const vk::WriteDescriptorSetAccelerationStructureKHR
                as *const std::ffi::c_void;
            write.descriptor_count = binding.acceleration_structures.len() as u32;
            tlas_cursor += 1;
        } else if !binding.images.is_empty() {
            write = write.image_info(&binding.images);
        } else {
            write = write.buffer_info(&binding.buffers);
        }
        writes.push(write);
    }

    loader.cmd_push_descriptor_set(cmd, bind_point, layout, 0, &writes);
}
