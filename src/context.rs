// Render context - everything a demo needs to build and record GPU work
//
// Owns the device, the window surface, the swapchain and the frame ring.
// Field order is drop order: the frame queue flushes the GPU first, the
// device goes last.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::{surface, FrameQueue, Surface, Swapchain, VulkanDevice};
use crate::config::Config;

/// The swapchain image a frame is being recorded for
pub struct FrameTarget {
    pub cmd: vk::CommandBuffer,
    pub image_index: u32,
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Frame ring slot; indexes per-slot resources
    pub slot: usize,
}

pub struct RenderContext {
    pub frames: FrameQueue,
    pub swapchain: Swapchain,
    pub surface: Surface,
    pub device: Arc<VulkanDevice>,
    vsync: bool,
}

impl RenderContext {
    pub fn new(config: &Config, window: &Window) -> Result<Self> {
        let display = window.display_handle().context("No display handle")?.as_raw();
        let window_handle = window.window_handle().context("No window handle")?.as_raw();

        let extensions = surface::required_extensions(display)?;
        let device = VulkanDevice::new(
            &config.window.title,
            cfg!(debug_assertions) && config.debug.validation_layers,
            config.graphics.adapter,
            &extensions,
        )?;

        let surface = Surface::new(&device, display, window_handle)?;

        let slots = config.graphics.frame_queue_length();
        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            &surface,
            size.width,
            size.height,
            config.graphics.vsync,
            slots as u32,
            vk::SwapchainKHR::null(),
        )?;

        let frames = FrameQueue::new(device.clone(), slots)?;

        Ok(Self {
            frames,
            swapchain,
            surface,
            device,
            vsync: config.graphics.vsync,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Drain the GPU and rebuild the swapchain at the new size
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.frames.wait_for_queue()?;

        // The old swapchain is retired by the new one and destroyed on assignment
        self.swapchain = Swapchain::new(
            self.device.clone(),
            &self.surface,
            width,
            height,
            self.vsync,
            self.frames.len() as u32,
            self.swapchain.swapchain,
        )
        .context("Failed to recreate swapchain")?;

        log::info!(
            "Swapchain recreated at {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }

    /// Acquire a swapchain image and begin the current slot's command buffer.
    /// `None` means the swapchain is out of date and must be recreated.
    pub fn begin_frame(&mut self) -> Result<Option<FrameTarget>> {
        let semaphore = self.frames.current_sync().image_available;
        let Some((image_index, _suboptimal)) = self.swapchain.acquire_next_image(semaphore)? else {
            return Ok(None);
        };

        let cmd = self.frames.begin_frame()?;
        Ok(Some(FrameTarget {
            cmd,
            image_index,
            image: self.swapchain.images[image_index as usize],
            format: self.swapchain.format,
            extent: self.swapchain.extent,
            slot: self.frames.frame_index(),
        }))
    }

    /// Submit, present and advance the ring; returns `true` if the swapchain needs recreating
    pub fn end_frame(&mut self, target: FrameTarget) -> Result<bool> {
        self.frames.submit_frame(target.cmd)?;

        let render_finished = [self.frames.current_sync().render_finished];
        let needs_resize =
            self.swapchain
                .present(self.device.queue, target.image_index, &render_finished)?;

        self.frames.move_to_next_frame()?;
        Ok(needs_resize)
    }
}
