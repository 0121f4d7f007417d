//! Synchronization primitives and submission dependencies.

use ash::vk;
use helia_core::Result;

/// Create a binary semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a timeline semaphore with the given initial value.
///
/// # Safety
/// The device must be valid and support timeline semaphores.
pub unsafe fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout_ns)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// One wait or signal edge of a queue submission.
///
/// Binary semaphores carry no value; timeline semaphores carry the
/// monotonically increasing value used for cross-device ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub semaphore: vk::Semaphore,
    pub timeline_value: Option<u64>,
    pub stage_mask: vk::PipelineStageFlags,
}

impl Dependency {
    pub fn binary(semaphore: vk::Semaphore, stage_mask: vk::PipelineStageFlags) -> Self {
        Self {
            semaphore,
            timeline_value: None,
            stage_mask,
        }
    }

    pub fn timeline(
        semaphore: vk::Semaphore,
        value: u64,
        stage_mask: vk::PipelineStageFlags,
    ) -> Self {
        Self {
            semaphore,
            timeline_value: Some(value),
            stage_mask,
        }
    }
}

/// A list of submission dependencies.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    deps: Vec<Dependency>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dep: Dependency) {
        self.deps.push(dep);
    }

    pub fn with(mut self, dep: Dependency) -> Self {
        self.push(dep);
        self
    }

    pub fn extend(&mut self, other: &Dependencies) {
        self.deps.extend_from_slice(&other.deps);
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.deps.iter()
    }

    pub fn semaphores(&self) -> Vec<vk::Semaphore> {
        self.deps.iter().map(|d| d.semaphore).collect()
    }

    pub fn stage_masks(&self) -> Vec<vk::PipelineStageFlags> {
        self.deps.iter().map(|d| d.stage_mask).collect()
    }

    /// Timeline values, zero-filled for binary semaphores (the value is
    /// ignored for those).
    pub fn timeline_values(&self) -> Vec<u64> {
        self.deps
            .iter()
            .map(|d| d.timeline_value.unwrap_or(0))
            .collect()
    }

    pub fn has_timeline(&self) -> bool {
        self.deps.iter().any(|d| d.timeline_value.is_some())
    }
}

impl From<Dependency> for Dependencies {
    fn from(dep: Dependency) -> Self {
        Self { deps: vec![dep] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_lists() {
        let sem = vk::Semaphore::null();
        let mut deps = Dependencies::new();
        assert!(deps.is_empty());
        deps.push(Dependency::binary(
            sem,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        ));
        deps.push(Dependency::timeline(
            sem,
            7,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ));

        assert_eq!(deps.len(), 2);
        assert!(deps.has_timeline());
        assert_eq!(deps.timeline_values(), vec![0, 7]);
    }
}
