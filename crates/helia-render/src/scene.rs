//! The scene view: a read-only projection of scene resources that stages
//! bind against.
//!
//! Asset loading and GPU upload live outside this crate; the view gathers
//! already-uploaded resources into the named descriptor bindings stages
//! consume. Stages borrow the view immutably for the duration of a frame
//! and must not retain references between frames. A change counter lets
//! stages detect when re-recording is required without a back-edge from
//! scene to stage.

use ash::vk;
use glam::Vec4;
use helia_gpu::{BindingValue, PipelineBase};

use crate::camera::Camera;
use crate::envmap::EnvironmentProjection;

/// Environment map bindings plus sampling metadata.
#[derive(Clone)]
pub struct EnvironmentMapView {
    pub texture: vk::DescriptorImageInfo,
    pub alias_table: vk::DescriptorBufferInfo,
    /// RGB gain plus alpha, fed to stages as `environment_factor`.
    pub factor: Vec4,
    pub projection: EnvironmentProjection,
}

/// One spherical-harmonic probe grid.
#[derive(Clone)]
pub struct ShGridDesc {
    /// SH order; supported orders are 0..=4.
    pub order: u32,
    /// Probe counts along each axis.
    pub dimensions: [u32; 3],
    /// The grid's 3D coefficient texture.
    pub texture: vk::DescriptorImageInfo,
}

/// Shadow-map bindings (atlas plus metadata buffers).
#[derive(Clone)]
pub struct ShadowMapView {
    pub shadow_maps: vk::DescriptorBufferInfo,
    pub shadow_map_cascades: vk::DescriptorBufferInfo,
    pub atlas: vk::DescriptorImageInfo,
    pub atlas_test: vk::DescriptorImageInfo,
}

/// The read-only projection of the scene consumed by stages.
#[derive(Default)]
pub struct SceneView {
    pub scene_data: Option<vk::DescriptorBufferInfo>,
    pub scene_metadata: Option<vk::DescriptorBufferInfo>,
    pub vertex_buffers: Vec<vk::DescriptorBufferInfo>,
    pub index_buffers: Vec<vk::DescriptorBufferInfo>,
    pub textures: Vec<vk::DescriptorImageInfo>,
    pub directional_lights: Option<vk::DescriptorBufferInfo>,
    pub point_lights: Option<vk::DescriptorBufferInfo>,
    pub tri_lights: Option<vk::DescriptorBufferInfo>,
    pub environment_map: Option<EnvironmentMapView>,
    pub sh_grids: Vec<ShGridDesc>,
    pub sh_grid_data: Option<vk::DescriptorBufferInfo>,
    pub tlas: Option<vk::AccelerationStructureKHR>,
    pub shadow_maps: Option<ShadowMapView>,

    /// Camera uniform buffer; per-camera slices at `camera_offsets`.
    pub camera_data: Option<vk::DescriptorBufferInfo>,
    /// (offset, size) per active camera into `camera_data`.
    pub camera_offsets: Vec<(u64, u64)>,
    /// Host-side cameras, one per viewport, jitter state included.
    pub cameras: Vec<Camera>,

    pub directional_light_count: u32,
    pub point_light_count: u32,
    pub spot_light_count: u32,
    pub tri_light_count: u32,

    state_counter: u64,
}

impl SceneView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter stages compare to decide whether to re-record.
    pub fn state_counter(&self) -> u64 {
        self.state_counter
    }

    /// Mark a topology change (meshes or lights added/removed, streaming
    /// reload). Stages re-record on the next `set_scene`.
    pub fn mark_changed(&mut self) {
        self.state_counter += 1;
    }

    /// Camera for one viewport.
    pub fn camera(&self, index: usize) -> Option<&Camera> {
        self.cameras.get(index)
    }

    /// Advance every camera's jitter sequence; once per frame.
    pub fn step_jitter(&mut self) {
        for camera in &mut self.cameras {
            camera.step_jitter();
        }
    }

    /// The named bindings stages consume, in the scene->stage protocol
    /// order. Missing optional resources come back as `Empty` and are
    /// filled with placeholders at resolve time.
    pub fn descriptor_bindings(&self, camera_index: Option<usize>) -> Vec<(&'static str, BindingValue)> {
        let buffer =
            |info: &Option<vk::DescriptorBufferInfo>| match info {
                Some(info) => BindingValue::Buffer(*info),
                None => BindingValue::Empty,
            };

        let mut bindings: Vec<(&'static str, BindingValue)> = vec![
            ("scene", buffer(&self.scene_data)),
            ("scene_metadata", buffer(&self.scene_metadata)),
            (
                "vertices",
                if self.vertex_buffers.is_empty() {
                    BindingValue::Empty
                } else {
                    BindingValue::BufferArray(self.vertex_buffers.clone())
                },
            ),
            (
                "indices",
                if self.index_buffers.is_empty() {
                    BindingValue::Empty
                } else {
                    BindingValue::BufferArray(self.index_buffers.clone())
                },
            ),
            (
                "textures",
                if self.textures.is_empty() {
                    BindingValue::Empty
                } else {
                    BindingValue::ImageArray(self.textures.clone())
                },
            ),
            ("directional_lights", buffer(&self.directional_lights)),
            ("point_lights", buffer(&self.point_lights)),
            ("tri_lights", buffer(&self.tri_lights)),
            (
                "environment_map_tex",
                match &self.environment_map {
                    Some(envmap) => BindingValue::Image(envmap.texture),
                    None => BindingValue::Empty,
                },
            ),
            (
                "environment_map_alias_table",
                match &self.environment_map {
                    Some(envmap) => BindingValue::Buffer(envmap.alias_table),
                    None => BindingValue::Empty,
                },
            ),
            (
                "textures3d",
                if self.sh_grids.is_empty() {
                    BindingValue::EmptyTexture3dArray(1)
                } else {
                    BindingValue::ImageArray(
                        self.sh_grids.iter().map(|grid| grid.texture).collect(),
                    )
                },
            ),
            ("sh_grids", buffer(&self.sh_grid_data)),
        ];

        if let Some(index) = camera_index {
            let value = match (self.camera_data, self.camera_offsets.get(index)) {
                (Some(info), Some(&(offset, size))) => BindingValue::Buffer(
                    vk::DescriptorBufferInfo::default()
                        .buffer(info.buffer)
                        .offset(info.offset + offset)
                        .range(size),
                ),
                _ => BindingValue::Empty,
            };
            bindings.push(("camera", value));
        }

        if let Some(tlas) = self.tlas {
            bindings.push(("tlas", BindingValue::AccelerationStructure(tlas)));
        }

        match &self.shadow_maps {
            Some(shadow) => {
                bindings.push(("shadow_maps", BindingValue::Buffer(shadow.shadow_maps)));
                bindings.push((
                    "shadow_map_cascades",
                    BindingValue::Buffer(shadow.shadow_map_cascades),
                ));
                bindings.push(("shadow_map_atlas", BindingValue::Image(shadow.atlas)));
                bindings.push((
                    "shadow_map_atlas_test",
                    BindingValue::Image(shadow.atlas_test),
                ));
            }
            None => {
                bindings.push(("shadow_maps", BindingValue::Empty));
                bindings.push(("shadow_map_cascades", BindingValue::Empty));
                bindings.push(("shadow_map_atlas", BindingValue::Empty));
                bindings.push(("shadow_map_atlas_test", BindingValue::Empty));
            }
        }

        bindings
    }

    /// Store the scene bindings in a pipeline's per-slot state.
    pub fn bind(&self, pipeline: &mut PipelineBase, slot: usize, camera_index: Option<usize>) {
        let bindings = self.descriptor_bindings(camera_index);
        pipeline.update_descriptor_set(&bindings, slot);
    }

    /// Write the scene bindings inline into a command buffer.
    ///
    /// # Safety
    /// The pipeline must be bound on `cmd`.
    pub unsafe fn push(
        &self,
        pipeline: &PipelineBase,
        cmd: vk::CommandBuffer,
        camera_index: Option<usize>,
    ) {
        let bindings = self.descriptor_bindings(camera_index);
        pipeline.push_descriptors(cmd, &bindings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    fn buffer_info() -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(vk::Buffer::null())
            .offset(0)
            .range(vk::WHOLE_SIZE)
    }

    #[test]
    fn binding_list_covers_protocol() {
        let scene = SceneView::new();
        let names: Vec<&str> = scene
            .descriptor_bindings(Some(0))
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        for required in [
            "scene",
            "scene_metadata",
            "vertices",
            "indices",
            "textures",
            "directional_lights",
            "point_lights",
            "tri_lights",
            "environment_map_tex",
            "environment_map_alias_table",
            "textures3d",
            "sh_grids",
            "camera",
            "shadow_maps",
            "shadow_map_cascades",
            "shadow_map_atlas",
            "shadow_map_atlas_test",
        ] {
            assert!(names.contains(&required), "missing binding {required}");
        }
        // TLAS is optional and absent on an empty scene.
        assert!(!names.contains(&"tlas"));
    }

    #[test]
    fn tlas_binding_appears_when_present(){
        let mut scene = SceneView::new();
        scene.tlas = Some(vk::AccelerationStructureKHR::null());
        let names: Vec<&str> = scene
            .descriptor_bindings(None)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert!(names.contains(&"tlas"));
        assert!(!names.contains(&"camera"));
    }

    #[test]
    fn camera_slice_offsets() {
        let mut scene = SceneView::new();
        scene.camera_data = Some(buffer_info());
        scene.camera_offsets = vec![(0, 256), (256, 256)];
        scene.cameras = vec![
            Camera::new(Mat4::IDENTITY, Mat4::IDENTITY),
            Camera::new(Mat4::IDENTITY, Mat4::IDENTITY),
        ];

        let bindings = scene.descriptor_bindings(Some(1));
        let camera = bindings
            .iter()
            .find(|(name, _)| *name == "camera")
            .expect("camera binding");
        match &camera.1 {
            BindingValue::Buffer(info) => {
                assert_eq!(info.offset, 256);
                assert_eq!(info.range, 256);
            }
            other => panic!("expected buffer, got {other:?}"),
        }
    }

    #[test]
    fn change_counter_increments() {
        let mut scene = SceneView::new();
        assert_eq!(scene.state_counter(), 0);
        scene.mark_changed();
        scene.mark_changed();
        assert_eq!(scene.state_counter(), 2);
    }
}
