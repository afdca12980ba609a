// Images, views, samplers and layout transitions

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::{Buffer, FrameQueue, VulkanDevice};

pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(COLOR_RANGE);

    unsafe { device.device.create_image_view(&view_info, None) }
        .context("Failed to create image view")
}

/// Access mask and pipeline stages that touch an image in `layout`
pub fn layout_usage(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        }
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Record a full-image layout transition
pub fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, src_stage) = layout_usage(old_layout);
    let (dst_access, dst_stage) = layout_usage(new_layout);

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Transition a freshly acquired swapchain image. The source stage matches
/// the stage the acquire semaphore is waited at, so the barrier chains after it.
pub fn transition_acquired_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    new_layout: vk::ImageLayout,
) {
    let (dst_access, dst_stage) = layout_usage(new_layout);

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(dst_access)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            dst_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Row pitch for buffer/image copies; always a whole number of RGBA8 texels
pub fn aligned_row_pitch(row_bytes: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(4);
    row_bytes.div_ceil(alignment) * alignment
}

/// Copy tightly packed rows from `src` into `dst` rows spaced `pitch` apart
pub fn pack_rows(src: &[u8], row_bytes: usize, pitch: usize, dst: &mut [u8]) {
    if row_bytes == 0 {
        return;
    }
    for (src_row, dst_row) in src.chunks_exact(row_bytes).zip(dst.chunks_mut(pitch)) {
        dst_row[..row_bytes].copy_from_slice(src_row);
    }
}

/// A single-mip 2D image with its own view and memory
pub struct Image {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Image {
    pub fn new(
        device: &Arc<VulkanDevice>,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        let mut result = Self {
            image,
            view: vk::ImageView::null(),
            extent,
            allocation: Some(allocation),
            device: device.clone(),
        };

        if let Some(allocation) = &result.allocation {
            unsafe {
                device
                    .device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
            }
            .with_context(|| format!("Failed to bind memory for '{}'", name))?;
        }

        result.view = create_image_view(device, image, format)?;

        Ok(result)
    }

    /// Sampled RGBA8 texture uploaded through a pitched staging buffer
    pub fn texture_rgba8(
        device: &Arc<VulkanDevice>,
        frames: &mut FrameQueue,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self> {
        let row_bytes = width as usize * 4;
        anyhow::ensure!(
            pixels.len() == row_bytes * height as usize,
            "Texture '{}' has {} bytes, expected {}",
            name,
            pixels.len(),
            row_bytes * height as usize
        );

        let alignment = device.properties.limits.optimal_buffer_copy_row_pitch_alignment;
        let pitch = aligned_row_pitch(row_bytes as u64, alignment);

        let mut staging = Buffer::new(
            device,
            &format!("{} (staging)", name),
            pitch * height as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        pack_rows(pixels, row_bytes, pitch as usize, staging.mapped_mut()?);

        let extent = vk::Extent2D { width, height };
        let texture = Self::new(
            device,
            name,
            extent,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )?;

        frames.submit_and_wait(|device, cmd| {
            transition_image(
                device,
                cmd,
                texture.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            copy_buffer_to_image(device, cmd, staging.buffer, texture.image, extent, pitch);
            transition_image(
                device,
                cmd,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        })?;

        log::info!("Uploaded texture '{}' ({}x{}, pitch {})", name, width, height, pitch);
        Ok(texture)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free image memory: {}", e);
            }
        }
    }
}

/// Record a copy of a pitched RGBA8 buffer into an image in TRANSFER_DST layout
pub fn copy_buffer_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    image: vk::Image,
    extent: vk::Extent2D,
    pitch: u64,
) {
    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: (pitch / 4) as u32,
        buffer_image_height: extent.height,
        image_subresource: COLOR_LAYERS,
        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    };

    unsafe {
        device.cmd_copy_buffer_to_image(
            cmd,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}

/// Linear filtering with wrap addressing on every axis
pub struct Sampler {
    pub sampler: vk::Sampler,
    device: Arc<VulkanDevice>,
}

impl Sampler {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(device.sampler_anisotropy)
            .max_anisotropy(16.0f32.min(device.properties.limits.max_sampler_anisotropy))
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(1.0)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;

        Ok(Self {
            sampler,
            device: device.clone(),
        })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_sampler(self.sampler, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_pitch_rounds_up_to_alignment() {
        assert_eq!(aligned_row_pitch(256 * 4, 256), 1024);
        assert_eq!(aligned_row_pitch(100 * 4, 256), 512);
        assert_eq!(aligned_row_pitch(3 * 4, 1), 12);
        assert_eq!(aligned_row_pitch(0, 256), 0);
    }

    #[test]
    fn row_pitch_never_splits_a_texel() {
        for alignment in [1, 2, 4, 8, 64, 256] {
            for width in 1..40u64 {
                assert_eq!(aligned_row_pitch(width * 4, alignment) % 4, 0);
            }
        }
    }

    #[test]
    fn pack_rows_pads_each_row() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 12];
        pack_rows(&src, 4, 6, &mut dst);
        assert_eq!(dst, [1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0]);
    }

    #[test]
    fn sampling_layouts_are_visible_to_shaders() {
        let (access, stages) = layout_usage(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(access, vk::AccessFlags::SHADER_READ);
        assert!(stages.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));

        let (access, stages) = layout_usage(vk::ImageLayout::UNDEFINED);
        assert!(access.is_empty());
        assert_eq!(stages, vk::PipelineStageFlags::TOP_OF_PIPE);
    }
}
