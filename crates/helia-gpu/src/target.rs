//! Render targets and G-buffer bundles.

use crate::FRAMES_IN_FLIGHT;
use ash::vk;

/// A render target: one (image, view) pair per in-flight frame slot, with
/// the layout that recorded commands have left each slot's image in.
///
/// The layout fields are mutated only while recording on the owning device;
/// they describe what the recorded command buffers do, not live GPU state.
#[derive(Clone)]
pub struct RenderTarget {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    layouts: Vec<vk::ImageLayout>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layer_count: u32,
}

impl RenderTarget {
    pub fn new(
        images: Vec<vk::Image>,
        views: Vec<vk::ImageView>,
        format: vk::Format,
        extent: vk::Extent2D,
        layer_count: u32,
        initial_layout: vk::ImageLayout,
    ) -> Self {
        debug_assert_eq!(images.len(), views.len());
        let layouts = vec![initial_layout; images.len()];
        Self {
            images,
            views,
            layouts,
            format,
            extent,
            layer_count,
        }
    }

    /// A target backed by the same image in every frame slot (persistent
    /// history textures).
    pub fn from_shared(
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
        layer_count: u32,
        initial_layout: vk::ImageLayout,
    ) -> Self {
        Self::new(
            vec![image; FRAMES_IN_FLIGHT],
            vec![view; FRAMES_IN_FLIGHT],
            format,
            extent,
            layer_count,
            initial_layout,
        )
    }

    pub fn slot_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, slot: usize) -> vk::Image {
        self.images[slot]
    }

    pub fn view(&self, slot: usize) -> vk::ImageView {
        self.views[slot]
    }

    pub fn layout(&self, slot: usize) -> vk::ImageLayout {
        self.layouts[slot]
    }

    /// Declare the layout of every slot, e.g. after external initialization.
    pub fn set_layout(&mut self, layout: vk::ImageLayout) {
        for slot_layout in &mut self.layouts {
            *slot_layout = layout;
        }
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.layer_count,
        }
    }

    /// Record a layout transition for one frame slot and track the result.
    ///
    /// # Safety
    /// The command buffer must be in recording state on the owning device.
    pub unsafe fn transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        slot: usize,
        new_layout: vk::ImageLayout,
    ) {
        let old_layout = self.layouts[slot];
        if old_layout == new_layout {
            return;
        }
        record_transition(
            device,
            cmd,
            self.images[slot],
            self.subresource_range(),
            old_layout,
            new_layout,
        );
        self.layouts[slot] = new_layout;
    }

    /// Record a transition that discards previous contents.
    ///
    /// # Safety
    /// The command buffer must be in recording state on the owning device.
    pub unsafe fn transition_discard(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        slot: usize,
        new_layout: vk::ImageLayout,
    ) {
        record_transition(
            device,
            cmd,
            self.images[slot],
            self.subresource_range(),
            vk::ImageLayout::UNDEFINED,
            new_layout,
        );
        self.layouts[slot] = new_layout;
    }
}

/// Record a full-subresource layout transition.
///
/// # Safety
/// The command buffer must be in recording state.
pub unsafe fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    subresource_range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .image(image)
        .subresource_range(subresource_range);

    let dependency_info =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));

    device.cmd_pipeline_barrier2(cmd, &dependency_info);
}

macro_rules! gbuffer_channels {
    ($macro:ident) => {
        $macro! {
            color,
            diffuse,
            specular,
            albedo,
            material,
            normal,
            view_normal,
            world_pos,
            view_pos,
            screen_motion,
            world_motion,
            view_motion,
            linear_depth,
            depth,
            instance_id,
            emission
        }
    };
}

macro_rules! define_gbuffer {
    ($($channel:ident),+) => {
        /// A named bundle of per-frame-slot render targets.
        ///
        /// Any subset of channels may be allocated; stages enable shader
        /// paths per present channel.
        #[derive(Default, Clone)]
        pub struct GbufferTarget {
            $(pub $channel: Option<RenderTarget>,)+
        }

        impl GbufferTarget {
            /// Channel names in declaration order.
            pub const CHANNEL_NAMES: &'static [&'static str] = &[$(stringify!($channel),)+];

            /// Allocated channels with their names.
            pub fn entries(&self) -> Vec<(&'static str, &RenderTarget)> {
                let mut entries = Vec::new();
                $(
                    if let Some(target) = &self.$channel {
                        entries.push((stringify!($channel), target));
                    }
                )+
                entries
            }

            /// Allocated channels, mutable.
            pub fn entries_mut(&mut self) -> Vec<(&'static str, &mut RenderTarget)> {
                let mut entries = Vec::new();
                $(
                    if let Some(target) = &mut self.$channel {
                        entries.push((stringify!($channel), target));
                    }
                )+
                entries
            }
        }
    };
}

gbuffer_channels!(define_gbuffer);

impl GbufferTarget {
    /// Extent shared by all channels.
    pub fn extent(&self) -> vk::Extent2D {
        self.entries()
            .first()
            .map(|(_, target)| target.extent)
            .unwrap_or_default()
    }

    /// Layer count shared by all channels (viewport count for multi-view
    /// outputs).
    pub fn layer_count(&self) -> u32 {
        self.entries()
            .first()
            .map(|(_, target)| target.layer_count)
            .unwrap_or(0)
    }

    /// Declare the layout of every allocated channel.
    pub fn set_layout(&mut self, layout: vk::ImageLayout) {
        for (_, target) in self.entries_mut() {
            target.set_layout(layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_target(extent: vk::Extent2D, layers: u32) -> RenderTarget {
        RenderTarget::new(
            vec![vk::Image::null(); FRAMES_IN_FLIGHT],
            vec![vk::ImageView::null(); FRAMES_IN_FLIGHT],
            vk::Format::R16G16B16A16_SFLOAT,
            extent,
            layers,
            vk::ImageLayout::UNDEFINED,
        )
    }

    #[test]
    fn entries_report_allocated_channels() {
        let extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        let mut gbuffer = GbufferTarget::default();
        gbuffer.color = Some(dummy_target(extent, 2));
        gbuffer.normal = Some(dummy_target(extent, 2));

        let names: Vec<_> = gbuffer.entries().iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["color", "normal"]);
        assert_eq!(gbuffer.extent().width, 64);
        assert_eq!(gbuffer.layer_count(), 2);
    }

    #[test]
    fn channel_names_cover_all_channels() {
        assert!(GbufferTarget::CHANNEL_NAMES.contains(&"screen_motion"));
        assert!(GbufferTarget::CHANNEL_NAMES.contains(&"linear_depth"));
        assert_eq!(GbufferTarget::CHANNEL_NAMES.len(), 16);
    }

    #[test]
    fn layout_tracking_per_slot() {
        let mut target = dummy_target(
            vk::Extent2D {
                width: 8,
                height: 8,
            },
            1,
        );
        assert_eq!(target.layout(0), vk::ImageLayout::UNDEFINED);
        target.set_layout(vk::ImageLayout::GENERAL);
        assert_eq!(target.layout(0), vk::ImageLayout::GENERAL);
        assert_eq!(target.layout(1), vk::ImageLayout::GENERAL);
    }
}
