//! Merging reflected shader stages into one pipeline layout.

use ash::vk;
use hashbrown::HashMap;
use helia_core::{RenderError, Result};

use crate::source::{ShaderBinding, ShaderSource};

/// Ray-tracing hit group kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitGroupKind {
    Triangles,
    Procedural,
}

/// One ray-tracing hit group: closest-hit plus optional any-hit and
/// intersection programs.
#[derive(Debug, Clone, Default)]
pub struct HitGroup {
    pub kind: Option<HitGroupKind>,
    pub closest_hit: ShaderSource,
    pub any_hit: ShaderSource,
    pub intersection: ShaderSource,
}

impl HitGroup {
    pub fn triangles(closest_hit: ShaderSource, any_hit: ShaderSource) -> Self {
        Self {
            kind: Some(HitGroupKind::Triangles),
            closest_hit,
            any_hit,
            intersection: ShaderSource::default(),
        }
    }

    pub fn procedural(closest_hit: ShaderSource, intersection: ShaderSource) -> Self {
        Self {
            kind: Some(HitGroupKind::Procedural),
            closest_hit,
            any_hit: ShaderSource::default(),
            intersection,
        }
    }
}

/// The shader stages of one pipeline. Unused slots stay empty.
#[derive(Debug, Clone, Default)]
pub struct ShaderSet {
    pub vertex: ShaderSource,
    pub fragment: ShaderSource,
    pub compute: ShaderSource,
    pub raygen: ShaderSource,
    pub hit_groups: Vec<HitGroup>,
    pub miss: Vec<ShaderSource>,
}

/// A descriptor binding merged across stages.
pub type MergedBinding = ShaderBinding;

impl ShaderSet {
    pub fn compute(source: ShaderSource) -> Self {
        Self {
            compute: source,
            ..Default::default()
        }
    }

    pub fn ray_tracing(
        raygen: ShaderSource,
        hit_groups: Vec<HitGroup>,
        miss: Vec<ShaderSource>,
    ) -> Self {
        Self {
            raygen,
            hit_groups,
            miss,
            ..Default::default()
        }
    }

    fn for_each_stage<'a>(&'a self, mut f: impl FnMut(&'a ShaderSource)) {
        f(&self.vertex);
        f(&self.fragment);
        f(&self.raygen);
        for group in &self.hit_groups {
            f(&group.closest_hit);
            f(&group.any_hit);
            f(&group.intersection);
        }
        for miss in &self.miss {
            f(miss);
        }
        f(&self.compute);
    }

    /// Union of binding names across all stages. Fails when the same slot is
    /// declared under two different names.
    pub fn binding_names(&self) -> Result<HashMap<String, u32>> {
        let mut names: HashMap<String, u32> = HashMap::new();
        let mut slots: HashMap<u32, String> = HashMap::new();
        let mut conflict = None;
        self.for_each_stage(|src| {
            for (name, &slot) in &src.binding_names {
                match slots.get(&slot) {
                    Some(existing) if existing != name && conflict.is_none() => {
                        conflict = Some(RenderError::BindingNameMismatch {
                            first: existing.clone(),
                            second: name.clone(),
                            slot,
                        });
                    }
                    Some(_) => {}
                    None => {
                        slots.insert(slot, name.clone());
                    }
                }
                names.insert(name.clone(), slot);
            }
        });
        match conflict {
            Some(err) => Err(err),
            None => Ok(names),
        }
    }

    /// Merge descriptor bindings across stages: identical slots OR their
    /// stage flags and take the maximum descriptor count. Count overrides
    /// (by binding name) size unsized arrays afterwards.
    pub fn merged_bindings(
        &self,
        count_overrides: &HashMap<String, u32>,
    ) -> Result<Vec<MergedBinding>> {
        let mut bindings: Vec<MergedBinding> = Vec::new();
        self.for_each_stage(|src| {
            for binding in &src.bindings {
                match bindings.iter_mut().find(|b| b.binding == binding.binding) {
                    Some(existing) => {
                        existing.stages |= binding.stages;
                        existing.count = existing.count.max(binding.count);
                    }
                    None => bindings.push(binding.clone()),
                }
            }
        });

        let names = self.binding_names()?;
        for (name, &count) in count_overrides {
            let Some(&slot) = names.get(name) else {
                continue;
            };
            if let Some(binding) = bindings.iter_mut().find(|b| b.binding == slot) {
                binding.count = count;
            }
        }

        bindings.sort_by_key(|b| b.binding);
        Ok(bindings)
    }

    /// Union of push-constant ranges, merged positionally with OR'd stage
    /// flags. Only correct with a single range per program, which is all the
    /// pipelines here use.
    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        let mut ranges: Vec<vk::PushConstantRange> = Vec::new();
        self.for_each_stage(|src| {
            let mut i = 0;
            while i < src.push_constant_ranges.len() && i < ranges.len() {
                ranges[i].stage_flags |= src.push_constant_ranges[i].stage_flags;
                ranges[i].size = ranges[i].size.max(src.push_constant_ranges[i].size);
                i += 1;
            }
            while i < src.push_constant_ranges.len() {
                ranges.push(src.push_constant_ranges[i]);
                i += 1;
            }
        });
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(
        stages: vk::ShaderStageFlags,
        bindings: &[(u32, vk::DescriptorType, u32, &str)],
    ) -> ShaderSource {
        let mut source = ShaderSource {
            stages,
            spirv: vec![0x0723_0203],
            ..Default::default()
        };
        for &(slot, ty, count, name) in bindings {
            source.bindings.push(ShaderBinding {
                binding: slot,
                descriptor_type: ty,
                count,
                stages,
            });
            source.binding_names.insert(name.to_string(), slot);
        }
        source
    }

    #[test]
    fn merge_ors_stages_and_takes_max_count() {
        let rgen = stage(
            vk::ShaderStageFlags::RAYGEN_KHR,
            &[(0, vk::DescriptorType::STORAGE_BUFFER, 1, "scene")],
        );
        let miss = stage(
            vk::ShaderStageFlags::MISS_KHR,
            &[(0, vk::DescriptorType::STORAGE_BUFFER, 4, "scene")],
        );

        let set = ShaderSet::ray_tracing(rgen, vec![], vec![miss]);
        let merged = set.merged_bindings(&HashMap::new()).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].count, 4);
        assert_eq!(
            merged[0].stages,
            vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::MISS_KHR
        );
    }

    #[test]
    fn merge_is_commutative() {
        let a = stage(
            vk::ShaderStageFlags::COMPUTE,
            &[
                (0, vk::DescriptorType::STORAGE_IMAGE, 1, "in_color"),
                (2, vk::DescriptorType::STORAGE_BUFFER, 3, "lights"),
            ],
        );
        let b = stage(
            vk::ShaderStageFlags::RAYGEN_KHR,
            &[
                (0, vk::DescriptorType::STORAGE_IMAGE, 2, "in_color"),
                (1, vk::DescriptorType::UNIFORM_BUFFER, 1, "camera"),
            ],
        );

        let mut ab = ShaderSet::default();
        ab.compute = a.clone();
        ab.raygen = b.clone();
        let mut ba = ShaderSet::default();
        ba.compute = a;
        ba.raygen = b;
        std::mem::swap(&mut ba.compute, &mut ba.raygen);

        // Stage slots differ but the merged layout must not.
        let overrides = HashMap::new();
        assert_eq!(
            ab.merged_bindings(&overrides).unwrap(),
            ba.merged_bindings(&overrides).unwrap()
        );
    }

    #[test]
    fn binding_name_conflict_is_fatal() {
        let a = stage(
            vk::ShaderStageFlags::COMPUTE,
            &[(0, vk::DescriptorType::STORAGE_BUFFER, 1, "x")],
        );
        let b = stage(
            vk::ShaderStageFlags::RAYGEN_KHR,
            &[(0, vk::DescriptorType::STORAGE_BUFFER, 1, "y")],
        );

        let mut set = ShaderSet::default();
        set.compute = a;
        set.raygen = b;

        match set.merged_bindings(&HashMap::new()) {
            Err(RenderError::BindingNameMismatch { first, second, slot }) => {
                assert_eq!(slot, 0);
                let mut names = [first, second];
                names.sort();
                assert_eq!(names, ["x".to_string(), "y".to_string()]);
            }
            other => panic!("expected BindingNameMismatch, got {other:?}"),
        }
    }

    #[test]
    fn count_overrides_size_unsized_arrays() {
        let mut source = stage(
            vk::ShaderStageFlags::RAYGEN_KHR,
            &[(3, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 0, "textures")],
        );
        source.binding_names.insert("textures".to_string(), 3);
        let set = ShaderSet::ray_tracing(source, vec![], vec![]);

        let mut overrides = HashMap::new();
        overrides.insert("textures".to_string(), 512);
        let merged = set.merged_bindings(&overrides).unwrap();
        assert_eq!(merged[0].count, 512);
    }

    #[test]
    fn push_constant_union_ors_stages() {
        let mut a = stage(vk::ShaderStageFlags::RAYGEN_KHR, &[]);
        a.push_constant_ranges.push(
            vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
                .size(64),
        );
        let mut b = stage(vk::ShaderStageFlags::MISS_KHR, &[]);
        b.push_constant_ranges.push(
            vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::MISS_KHR)
                .size(48),
        );

        let set = ShaderSet::ray_tracing(a, vec![], vec![b]);
        let ranges = set.push_constant_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].size, 64);
        assert_eq!(
            ranges[0].stage_flags,
            vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::MISS_KHR
        );
    }
}
