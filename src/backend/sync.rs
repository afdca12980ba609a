// Synchronization primitives
//
// A ring of frame slots paired with one timeline semaphore. Each slot
// remembers the timeline value its last submission signals; a slot is only
// reused once the device has reached that value.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Fence value bookkeeping for the frame ring, independent of the GPU
#[derive(Debug, Clone)]
pub struct FenceLedger {
    fence_values: Vec<u64>,
    frame_index: usize,
    /// Highest value handed to the queue so far
    last_signal: u64,
}

/// What the CPU has to do when moving to the next slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// Value signalled by the submission that just finished recording
    pub signal: u64,
    /// Block until the timeline reaches this value before reusing the slot
    pub wait: Option<u64>,
}

impl FenceLedger {
    /// The timeline starts at 0; the first slot expects value 1
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "frame ring needs at least one slot");
        let mut fence_values = vec![0; slots];
        fence_values[0] += 1;
        Self {
            fence_values,
            frame_index: 0,
            last_signal: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.fence_values.len()
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Value the current slot's submission signals
    pub fn signal_value(&self) -> u64 {
        self.fence_values[self.frame_index]
    }

    /// Record that the current slot's submission signalled `signal_value()`
    pub fn submitted(&mut self) {
        self.last_signal = self.last_signal.max(self.signal_value());
    }

    /// Value to signal and wait on for a full queue flush. Stays above
    /// anything already submitted, also when the ring was not advanced.
    pub fn flush_value(&self) -> u64 {
        self.signal_value().max(self.last_signal + 1)
    }

    /// Record that a flush on `flush_value()` completed
    pub fn flushed(&mut self) {
        let value = self.flush_value();
        self.last_signal = value;
        self.fence_values[self.frame_index] = value + 1;
    }

    /// Move to the next slot after the current slot signalled `signal_value()`
    pub fn advance(&mut self, completed: u64) -> Advance {
        let signal = self.fence_values[self.frame_index];
        self.last_signal = self.last_signal.max(signal);

        self.frame_index = (self.frame_index + 1) % self.fence_values.len();

        let pending = self.fence_values[self.frame_index];
        let wait = (completed < pending).then_some(pending);

        self.fence_values[self.frame_index] = signal + 1;

        Advance { signal, wait }
    }
}

/// Per-slot binary semaphores for swapchain acquire / present
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        unsafe {
            Ok(Self {
                image_available: device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create semaphore")?,
                render_finished: device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create semaphore")?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
        }
    }
}

/// The frame ring: command buffers, semaphores and the timeline fence
pub struct FrameQueue {
    device: Arc<VulkanDevice>,
    ledger: FenceLedger,
    timeline: vk::Semaphore,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    upload_command_buffer: vk::CommandBuffer,
    sync: Vec<FrameSync>,
}

impl FrameQueue {
    pub fn new(device: Arc<VulkanDevice>, slots: usize) -> Result<Self> {
        let ledger = FenceLedger::new(slots);

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info);
        let timeline = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create timeline semaphore")?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            // RESET: every slot re-records its buffer each frame
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slots as u32 + 1);
        let mut command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;
        let upload_command_buffer = command_buffers.pop().context("Missing upload command buffer")?;

        let sync = (0..slots)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Frame queue with {} slots", slots);

        Ok(Self {
            device,
            ledger,
            timeline,
            command_pool,
            command_buffers,
            upload_command_buffer,
            sync,
        })
    }

    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    pub fn frame_index(&self) -> usize {
        self.ledger.frame_index()
    }

    pub fn current_sync(&self) -> &FrameSync {
        &self.sync[self.ledger.frame_index()]
    }

    /// Reset and begin the current slot's command buffer
    pub fn begin_frame(&self) -> Result<vk::CommandBuffer> {
        let cmd = self.command_buffers[self.ledger.frame_index()];
        begin_one_time(&self.device.device, cmd)?;
        Ok(cmd)
    }

    /// Submit the current slot's commands, waiting on image acquisition and
    /// signalling both the present semaphore and the timeline
    pub fn submit_frame(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        let device = &self.device.device;
        let sync = self.current_sync();

        unsafe { device.end_command_buffer(cmd) }.context("Failed to end command buffer")?;

        let wait_semaphores = [sync.image_available];
        let wait_stages =
            [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER];
        let signal_semaphores = [sync.render_finished, self.timeline];
        // Binary semaphores ignore their value
        let signal_values = [0, self.ledger.signal_value()];
        let command_buffers = [cmd];

        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe { device.queue_submit(self.device.queue, &[submit_info.build()], vk::Fence::null()) }
            .context("Failed to submit frame")?;
        self.ledger.submitted();

        Ok(())
    }

    /// Advance the ring, blocking if the next slot is still in flight
    pub fn move_to_next_frame(&mut self) -> Result<()> {
        let completed = self.completed_value()?;
        let advance = self.ledger.advance(completed);

        if let Some(value) = advance.wait {
            log::trace!("Waiting for timeline value {} (completed {})", value, completed);
            self.wait_value(value)?;
        }

        Ok(())
    }

    /// Signal the timeline from the queue and block until it is reached
    pub fn wait_for_queue(&mut self) -> Result<()> {
        let value = self.ledger.flush_value();
        self.signal(value, &[])?;
        self.wait_value(value)?;
        self.ledger.flushed();
        Ok(())
    }

    /// Record commands into the upload buffer, submit them and wait
    pub fn submit_and_wait<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let cmd = self.upload_command_buffer;
        let device = &self.device.device;

        begin_one_time(device, cmd)?;
        record(device, cmd);
        unsafe { device.end_command_buffer(cmd) }.context("Failed to end upload command buffer")?;

        let value = self.ledger.flush_value();
        self.signal(value, &[cmd])?;
        self.wait_value(value)?;
        self.ledger.flushed();
        Ok(())
    }

    fn signal(&self, value: u64, command_buffers: &[vk::CommandBuffer]) -> Result<()> {
        let signal_semaphores = [self.timeline];
        let signal_values = [value];

        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.queue, &[submit_info.build()], vk::Fence::null())
        }
        .context("Failed to signal timeline")?;

        Ok(())
    }

    fn completed_value(&self) -> Result<u64> {
        unsafe { self.device.device.get_semaphore_counter_value(self.timeline) }
            .context("Failed to read timeline value")
    }

    fn wait_value(&self, value: u64) -> Result<()> {
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        unsafe { self.device.device.wait_semaphores(&wait_info, u64::MAX) }
            .context("Failed to wait for timeline")
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_queue() {
            log::error!("Failed to flush frame queue: {:#}", e);
        }

        let device = &self.device.device;
        unsafe {
            for sync in &self.sync {
                sync.destroy(device);
            }
            // Also frees the command buffers
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_semaphore(self.timeline, None);
        }
    }
}

fn begin_one_time(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("Failed to reset command buffer")?;
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin command buffer")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_slot_expects_one() {
        let ledger = FenceLedger::new(2);
        assert_eq!(ledger.frame_index(), 0);
        assert_eq!(ledger.signal_value(), 1);
    }

    #[test]
    fn flush_increments_current_slot() {
        let mut ledger = FenceLedger::new(2);
        assert_eq!(ledger.flush_value(), 1);
        ledger.flushed();
        assert_eq!(ledger.flush_value(), 2);
        assert_eq!(ledger.frame_index(), 0);
    }

    #[test]
    fn flush_after_unadvanced_submit_signals_a_newer_value() {
        let mut ledger = FenceLedger::new(2);
        // Frame submitted on value 1, presenting failed before the ring moved on
        assert_eq!(ledger.signal_value(), 1);
        ledger.submitted();

        assert_eq!(ledger.flush_value(), 2);
        ledger.flushed();
        assert_eq!(ledger.frame_index(), 0);
        assert_eq!(ledger.signal_value(), 3);

        let advance = ledger.advance(2);
        assert_eq!(advance, Advance { signal: 3, wait: None });
        assert!(ledger.flush_value() > 3);
    }

    #[test]
    fn advance_waits_for_the_slot_being_reused() {
        let mut ledger = FenceLedger::new(2);

        // Slot 0 signals 1, slot 1 was never used
        let first = ledger.advance(0);
        assert_eq!(first, Advance { signal: 1, wait: None });
        assert_eq!(ledger.frame_index(), 1);

        // Slot 1 signals 2, slot 0 still owes value 1
        let second = ledger.advance(0);
        assert_eq!(second, Advance { signal: 2, wait: Some(1) });
        assert_eq!(ledger.frame_index(), 0);

        // GPU caught up with everything
        let third = ledger.advance(3);
        assert_eq!(third, Advance { signal: 3, wait: None });
    }

    #[test]
    fn signals_are_strictly_increasing() {
        for slots in 1..=4 {
            let mut ledger = FenceLedger::new(slots);
            let mut last = 0;
            for frame in 0..32u64 {
                if frame % 7 == 3 {
                    let value = ledger.flush_value();
                    assert!(value > last);
                    last = value;
                    ledger.flushed();
                }
                let advance = ledger.advance(last.saturating_sub(1));
                assert!(advance.signal > last, "slots={} frame={}", slots, frame);
                last = advance.signal;
            }
        }
    }

    #[test]
    fn single_slot_always_waits_for_previous_frame() {
        let mut ledger = FenceLedger::new(1);
        assert_eq!(ledger.advance(0), Advance { signal: 1, wait: Some(1) });
        assert_eq!(ledger.advance(1), Advance { signal: 2, wait: Some(2) });
        assert_eq!(ledger.advance(2), Advance { signal: 3, wait: Some(3) });
    }

    #[test]
    fn wait_is_skipped_once_completed() {
        let mut ledger = FenceLedger::new(3);
        ledger.advance(0);
        ledger.advance(0);

        // Back at slot 0, which signalled 1
        let back_to_zero = ledger.advance(0);
        assert_eq!(ledger.frame_index(), 0);
        assert_eq!(back_to_zero.wait, Some(1));

        // Slot 1 signalled 2 and the GPU is there already
        let advance = ledger.advance(2);
        assert_eq!(ledger.frame_index(), 1);
        assert_eq!(advance.wait, None);
    }
}
