//! The frame orchestrator and display backend protocol.
//!
//! The orchestrator coordinates image acquisition, cross-frame fencing,
//! frame-end callbacks and presentation over a pluggable display backend
//! (window, headless, HMD, lightfield, frame server). Backends only supply
//! the image lifecycle; fences and callbacks are centralized here.

use crate::command::{begin_command_buffer, end_command_buffer, submit_with_dependencies, CommandPool};
use crate::context::{DeviceContext, RenderDevice};
use crate::memory::DeviceImage;
use crate::slots::{FrameSlots, ImageFences};
use crate::sync::{
    create_fence, create_semaphore, reset_fence, wait_for_fence, Dependencies, Dependency,
};
use crate::target::RenderTarget;
use crate::FRAMES_IN_FLIGHT;
use ash::vk;
use gpu_allocator::MemoryLocation;
use helia_core::{RenderError, Result, TimingRecord};

/// The display images a backend renders into.
pub struct DisplayImages {
    pub images: Vec<vk::Image>,
    /// One array view per image, covering every layer.
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Layer count when one image holds multiple viewports (lightfield,
    /// HMD); 1 otherwise.
    pub layer_count: u32,
    /// The layout downstream consumers expect the final image in.
    pub expected_layout: vk::ImageLayout,
}

/// The uniform protocol every display backend implements.
///
/// Acquire/present semantics differ per backend (blocking swapchain
/// acquire, throttled headless pacing, HMD runtime poses); the orchestrator
/// only relies on these hooks.
pub trait DisplayBackend {
    /// The image set rendered into.
    fn display_images(&self) -> &DisplayImages;

    /// Whether a queue family of a physical device can present to this
    /// backend.
    fn queue_can_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        props: &vk::QueueFamilyProperties,
    ) -> bool;

    /// Pick the next image to render into and arrange for `available` to be
    /// signalled when it can be written. May block.
    ///
    /// # Safety
    /// Must be called between frames on the display device.
    unsafe fn prepare_next_image(
        &mut self,
        device: &RenderDevice,
        slot: usize,
        available: vk::Semaphore,
    ) -> Result<u32>;

    /// Add present-specific signal dependencies for the end-of-frame
    /// submission.
    fn fill_end_frame_dependencies(&mut self, _slot: usize, _deps: &mut Dependencies) {}

    /// Present or otherwise consume the finished image. When `display` is
    /// false the image must not be output in any way.
    ///
    /// # Safety
    /// All GPU work targeting the image must be covered by `finished`.
    unsafe fn finish_image(
        &mut self,
        device: &RenderDevice,
        slot: usize,
        swapchain_index: u32,
        display: bool,
        finished: vk::Semaphore,
    ) -> Result<()>;

    /// Release backend-owned GPU resources.
    ///
    /// # Safety
    /// The device must be idle.
    unsafe fn destroy(&mut self, _device: &RenderDevice) {}
}

/// Double-buffered in-flight frame manager over a display backend.
///
/// Per-slot state machine: Idle -> Acquired -> Submitted -> Presented ->
/// Idle. `begin_frame` waits on the slot's fence and drains its callbacks;
/// `end_frame` submits the fence signal and hands the image to the backend.
pub struct FrameContext {
    devices: DeviceContext,
    backend: Box<dyn DisplayBackend>,

    frame_fences: Vec<vk::Fence>,
    // These have to be binary semaphores for present and acquire.
    frame_available: Vec<vk::Semaphore>,
    frame_finished: Vec<vk::Semaphore>,
    image_fences: ImageFences,
    slots: FrameSlots,

    empty_pool: CommandPool,
    empty_cmds: Vec<vk::CommandBuffer>,

    swapchain_index: u32,
    is_displaying: bool,
    timing: TimingRecord,
}

impl FrameContext {
    /// Create the orchestrator over a device context and a backend.
    ///
    /// The in-flight frame count must be strictly less than the backend's
    /// image count, otherwise image views would alias across frames.
    pub fn new(devices: DeviceContext, backend: Box<dyn DisplayBackend>) -> Result<Self> {
        let image_count = backend.display_images().images.len();
        if image_count <= FRAMES_IN_FLIGHT {
            return Err(RenderError::Other(format!(
                "display backend must provide more than {FRAMES_IN_FLIGHT} images, got {image_count}"
            )));
        }

        let display = devices.display_device();
        let device = display.device();

        // The display device's graphics queue must be able to present to
        // this backend.
        let queue_props = unsafe {
            devices
                .instance()
                .get_physical_device_queue_family_properties(display.physical_device)
        };
        let family = display.graphics_queue_family as usize;
        if !backend.queue_can_present(
            display.physical_device,
            display.graphics_queue_family,
            &queue_props[family],
        ) {
            return Err(RenderError::MissingCapability(
                "display device queue cannot present to this backend".to_string(),
            ));
        }

        let mut frame_fences = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut frame_available = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let mut frame_finished = Vec::with_capacity(FRAMES_IN_FLIGHT);
        let empty_pool;
        let mut empty_cmds = Vec::with_capacity(FRAMES_IN_FLIGHT);
        unsafe {
            for _ in 0..FRAMES_IN_FLIGHT {
                frame_fences.push(create_fence(device, true)?);
                frame_available.push(create_semaphore(device)?);
                frame_finished.push(create_semaphore(device)?);
            }

            // Pre-recorded empty command buffers for the end-of-frame
            // fence/semaphore hop.
            empty_pool = CommandPool::new(
                device,
                display.graphics_queue_family,
                vk::CommandPoolCreateFlags::empty(),
            )?;
            for _ in 0..FRAMES_IN_FLIGHT {
                let cmd = empty_pool.allocate_command_buffer(device)?;
                begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::empty())?;
                end_command_buffer(device, cmd)?;
                empty_cmds.push(cmd);
            }
        }

        Ok(Self {
            devices,
            backend,
            frame_fences,
            frame_available,
            frame_finished,
            image_fences: ImageFences::new(image_count),
            slots: FrameSlots::new(),
            empty_pool,
            empty_cmds,
            swapchain_index: 0,
            is_displaying: true,
            timing: TimingRecord::default(),
        })
    }

    pub fn devices(&self) -> &[RenderDevice] {
        self.devices.devices()
    }

    pub fn display_device(&self) -> &RenderDevice {
        self.devices.display_device()
    }

    pub fn display_images(&self) -> &DisplayImages {
        self.backend.display_images()
    }

    /// The display images as a render target, one slot per in-flight frame
    /// mapping to the acquired image. Only valid for the current frame's
    /// swapchain index.
    pub fn display_target(&self) -> RenderTarget {
        let images = self.backend.display_images();
        let index = self.swapchain_index as usize;
        RenderTarget::from_shared(
            images.images[index],
            images.views[index],
            images.format,
            images.extent,
            images.layer_count,
            vk::ImageLayout::UNDEFINED,
        )
    }

    /// Whether finished frames are shown.
    pub fn displaying(&self) -> bool {
        self.is_displaying
    }

    /// Gate presentation; hidden frames still render but are not output and
    /// do not advance the displayed-frame counter.
    pub fn set_displaying(&mut self, displaying: bool) {
        self.is_displaying = displaying;
    }

    /// The frame counter rendering should rely on.
    pub fn frame_counter(&self) -> u64 {
        self.slots.frame_counter()
    }

    /// Counts only displayed frames. Only useful for numbering frames that
    /// were actually shown.
    pub fn displayed_frame_counter(&self) -> u64 {
        self.slots.displayed_frame_counter()
    }

    /// Current swapchain index and in-flight slot.
    pub fn indices(&self) -> (u32, usize) {
        (self.swapchain_index, self.slots.current_slot())
    }

    /// Aggregated stage timings.
    pub fn timing(&self) -> &TimingRecord {
        &self.timing
    }

    /// Queue a function to run when the current frame is guaranteed to be
    /// finished on the GPU side.
    pub fn queue_frame_finish_callback(&mut self, callback: impl FnOnce() + 'static) {
        self.slots.queue_callback(Box::new(callback));
    }

    /// Begin the next frame.
    ///
    /// The returned dependency covers only the acquired display image;
    /// rendering into internal buffers may start immediately.
    ///
    /// On failure (e.g. `OutOfDateSwapchain`) the frame counter does not
    /// advance and the slot's fence is left signalled, so the next
    /// `begin_frame` after a reset succeeds.
    pub fn begin_frame(&mut self) -> Result<Dependency> {
        let slot = self.slots.current_slot();

        unsafe {
            wait_for_fence(
                self.devices.display_device().device(),
                self.frame_fences[slot],
                u64::MAX,
            )?;
        }
        self.run_frame_end_actions(slot);

        let display = self.devices.display_device();
        let device = display.device();
        if let Some(pool) = display.timers.lock().as_ref() {
            pool.collect(slot, &mut self.timing);
        }

        let swapchain_index = unsafe {
            self.backend
                .prepare_next_image(display, slot, self.frame_available[slot])?
        };

        // Another in-flight frame may still target this image; its fence
        // must retire first.
        if let Some(prior_slot) = self.image_fences.claim(swapchain_index as usize, slot) {
            if prior_slot != slot {
                unsafe {
                    wait_for_fence(device, self.frame_fences[prior_slot], u64::MAX)?;
                }
            }
        }

        self.swapchain_index = swapchain_index;
        Ok(Dependency::binary(
            self.frame_available[slot],
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
        ))
    }

    /// End the current frame: submit the fence/semaphore hop waiting on
    /// `deps`, hand the image to the backend, and advance the counters.
    pub fn end_frame(&mut self, deps: Dependencies) -> Result<()> {
        let slot = self.slots.current_slot();
        let display = self.devices.display_device();
        let device = display.device();

        let mut signal = Dependencies::new().with(Dependency::binary(
            self.frame_finished[slot],
            vk::PipelineStageFlags::ALL_COMMANDS,
        ));
        self.backend.fill_end_frame_dependencies(slot, &mut signal);

        unsafe {
            reset_fence(device, self.frame_fences[slot])?;
            submit_with_dependencies(
                device,
                display.graphics_queue,
                &[self.empty_cmds[slot]],
                &deps,
                &signal,
                self.frame_fences[slot],
            )?;

            self.backend.finish_image(
                display,
                slot,
                self.swapchain_index,
                self.is_displaying,
                self.frame_finished[slot],
            )?;
        }

        self.slots.advance(self.is_displaying);
        Ok(())
    }

    fn run_frame_end_actions(&mut self, slot: usize) {
        for callback in self.slots.take_callbacks(slot) {
            callback();
        }
    }

    /// Wait until all devices are idle and drain every slot's pending
    /// callbacks. Required before dropping stages or the context.
    pub fn sync(&mut self) -> Result<()> {
        self.devices.wait_idle()?;
        for slot in 0..FRAMES_IN_FLIGHT {
            self.run_frame_end_actions(slot);
        }
        Ok(())
    }

    /// Forget per-image fence associations, e.g. after the backend rebuilt
    /// its swapchain.
    pub fn reset_image_fences(&mut self) {
        self.image_fences.reset();
    }
}

impl Drop for FrameContext {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            tracing::error!("frame context sync failed during teardown: {e}");
        }
        if self.slots.has_pending_callbacks() {
            tracing::warn!("frame-end callbacks dropped at teardown");
        }

        let display = self.devices.display_device();
        let device = display.device();
        unsafe {
            self.backend.destroy(display);
            for i in 0..FRAMES_IN_FLIGHT {
                device.destroy_fence(self.frame_fences[i], None);
                device.destroy_semaphore(self.frame_available[i], None);
                device.destroy_semaphore(self.frame_finished[i], None);
            }
            self.empty_pool.destroy(device);
        }
    }
}

/// Offscreen display backend: a fixed array of storage images, round-robin
/// acquired, never presented. Used headless (tests, benchmarks, file
/// output pipelines).
pub struct HeadlessBackend {
    images: Vec<DeviceImage>,
    display: DisplayImages,
    next_image: u32,
}

impl HeadlessBackend {
    pub const DEFAULT_IMAGE_COUNT: usize = FRAMES_IN_FLIGHT + 1;

    /// Create offscreen images on the display device.
    pub fn new(
        device: &RenderDevice,
        extent: vk::Extent2D,
        layer_count: u32,
        image_count: usize,
    ) -> Result<Self> {
        let format = vk::Format::R8G8B8A8_UNORM;
        let mut allocator = device.allocator.lock();
        let mut images = Vec::with_capacity(image_count);
        let mut views = Vec::with_capacity(image_count);
        for i in 0..image_count {
            let image = allocator.create_image(
                &vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(format)
                    .extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(layer_count)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(
                        vk::ImageUsageFlags::STORAGE
                            | vk::ImageUsageFlags::TRANSFER_SRC
                            | vk::ImageUsageFlags::TRANSFER_DST,
                    )
                    .initial_layout(vk::ImageLayout::UNDEFINED),
                MemoryLocation::GpuOnly,
                &format!("headless_display_{i}"),
            )?;
            let view = unsafe {
                device.device().create_image_view(
                    &vk::ImageViewCreateInfo::default()
                        .image(image.image)
                        .view_type(if layer_count > 1 {
                            vk::ImageViewType::TYPE_2D_ARRAY
                        } else {
                            vk::ImageViewType::TYPE_2D
                        })
                        .format(format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count,
                        }),
                    None,
                )?
            };
            images.push(image);
            views.push(view);
        }

        let display = DisplayImages {
            images: images.iter().map(|img| img.image).collect(),
            views,
            format,
            extent,
            layer_count,
            expected_layout: vk::ImageLayout::GENERAL,
        };

        Ok(Self {
            images,
            display,
            next_image: 0,
        })
    }
}

impl DisplayBackend for HeadlessBackend {
    fn display_images(&self) -> &DisplayImages {
        &self.display
    }

    fn queue_can_present(
        &self,
        _physical_device: vk::PhysicalDevice,
        _queue_family: u32,
        _props: &vk::QueueFamilyProperties,
    ) -> bool {
        // No surface involved; any queue works.
        true
    }

    unsafe fn prepare_next_image(
        &mut self,
        device: &RenderDevice,
        _slot: usize,
        available: vk::Semaphore,
    ) -> Result<u32> {
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.display.images.len() as u32;

        // No acquire to wait for; signal availability with an empty
        // submission so the binary semaphore wait does not deadlock.
        let signal =
            Dependencies::new().with(Dependency::binary(available, vk::PipelineStageFlags::empty()));
        submit_with_dependencies(
            device.device(),
            device.graphics_queue,
            &[],
            &Dependencies::new(),
            &signal,
            vk::Fence::null(),
        )?;

        Ok(index)
    }

    unsafe fn finish_image(
        &mut self,
        device: &RenderDevice,
        _slot: usize,
        _swapchain_index: u32,
        _display: bool,
        finished: vk::Semaphore,
    ) -> Result<()> {
        // Nothing presents here, but the finished binary semaphore must be
        // consumed before its slot signals it again.
        let wait = Dependencies::new().with(Dependency::binary(
            finished,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ));
        submit_with_dependencies(
            device.device(),
            device.graphics_queue,
            &[],
            &wait,
            &Dependencies::new(),
            vk::Fence::null(),
        )?;
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &RenderDevice) {
        let mut allocator = device.allocator.lock();
        for view in self.display.views.drain(..) {
            device.device().destroy_image_view(view, None);
        }
        for image in &mut self.images {
            let _ = allocator.free_image(image);
        }
        self.images.clear();
    }
}
