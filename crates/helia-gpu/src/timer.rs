//! GPU timestamp timers.
//!
//! Each timer is a begin/end timestamp pair per in-flight frame slot,
//! written inside a stage's recorded command buffer. Readback for the work
//! submitted on slot `s` happens when slot `s` comes around again, i.e.
//! `FRAMES_IN_FLIGHT + 1` frames after submission at the earliest, right
//! after the slot's fence wait guarantees the values have landed.

use crate::FRAMES_IN_FLIGHT;
use ash::vk;
use helia_core::{RenderError, Result, TimingRecord};
use std::sync::Arc;

/// A labeled begin/end timestamp pair. Obtained from [`TimerPool`].
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    index: usize,
}

struct TimerEntry {
    label: String,
}

/// Per-device timestamp query pool.
pub struct TimerPool {
    device: Arc<ash::Device>,
    query_pool: vk::QueryPool,
    /// Timestamps available per frame slot.
    capacity: u32,
    /// Timestamps handed out per frame slot.
    allocated: u32,
    timestamp_period: f32,
    entries: Vec<TimerEntry>,
}

impl TimerPool {
    /// Create a pool with `max_timestamps` timestamps per frame.
    pub fn new(
        device: Arc<ash::Device>,
        max_timestamps: u32,
        timestamp_period: f32,
    ) -> Result<Self> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(max_timestamps * FRAMES_IN_FLIGHT as u32);
        let query_pool = unsafe { device.create_query_pool(&create_info, None)? };
        unsafe {
            // Queries must be reset before first use.
            device.reset_query_pool(query_pool, 0, max_timestamps * FRAMES_IN_FLIGHT as u32);
        }

        Ok(Self {
            device,
            query_pool,
            capacity: max_timestamps,
            allocated: 0,
            timestamp_period,
            entries: Vec::new(),
        })
    }

    /// Reserve a labeled begin/end pair.
    pub fn create_timer(&mut self, label: impl Into<String>) -> Result<Timer> {
        if self.allocated + 2 > self.capacity {
            return Err(RenderError::ResourceExhausted(format!(
                "timestamp budget of {} exceeded",
                self.capacity
            )));
        }
        self.allocated += 2;
        self.entries.push(TimerEntry {
            label: label.into(),
        });
        Ok(Timer {
            index: self.entries.len() - 1,
        })
    }

    fn query_base(&self, timer: Timer, slot: usize) -> u32 {
        slot as u32 * self.capacity + timer.index as u32 * 2
    }

    /// Record the begin timestamp for a frame slot.
    ///
    /// # Safety
    /// The command buffer must be in recording state on this pool's device.
    pub unsafe fn begin(&self, cmd: vk::CommandBuffer, timer: Timer, slot: usize) {
        let base = self.query_base(timer, slot);
        self.device.cmd_reset_query_pool(cmd, self.query_pool, base, 2);
        self.device.cmd_write_timestamp(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            self.query_pool,
            base,
        );
    }

    /// Record the end timestamp for a frame slot.
    ///
    /// # Safety
    /// The command buffer must be in recording state on this pool's device.
    pub unsafe fn end(&self, cmd: vk::CommandBuffer, timer: Timer, slot: usize) {
        let base = self.query_base(timer, slot);
        self.device.cmd_write_timestamp(
            cmd,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            self.query_pool,
            base + 1,
        );
    }

    /// Read back every timer's pair for one frame slot into the timing
    /// record. Pairs whose results are not yet available are skipped.
    pub fn collect(&self, slot: usize, record: &mut TimingRecord) {
        for (index, entry) in self.entries.iter().enumerate() {
            let base = slot as u32 * self.capacity + index as u32 * 2;
            let mut data = [0u64; 2];
            let result = unsafe {
                self.device.get_query_pool_results(
                    self.query_pool,
                    base,
                    &mut data,
                    vk::QueryResultFlags::TYPE_64,
                )
            };
            if result.is_err() {
                continue;
            }
            let [begin, end] = data;
            if end <= begin {
                continue;
            }
            let millis = (end - begin) as f64 * self.timestamp_period as f64 / 1.0e6;
            record.push(&entry.label, millis);
        }
    }

    /// Destroy the query pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_query_pool(self.query_pool, None);
    }
}
