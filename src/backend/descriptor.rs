// Descriptor set layouts, pools and writes

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

impl Binding {
    pub const fn new(binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        Self { binding, ty, stages }
    }
}

/// Pool sizes that fit `sets` copies of a layout
pub fn pool_sizes(bindings: &[Binding], sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        match sizes.iter_mut().find(|size| size.ty == binding.ty) {
            Some(size) => size.descriptor_count += sets,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.ty,
                descriptor_count: sets,
            }),
        }
    }
    sizes
}

/// A set layout plus a pool holding a fixed number of sets of it
pub struct DescriptorSets {
    pub layout: vk::DescriptorSetLayout,
    pub sets: Vec<vk::DescriptorSet>,
    pool: vk::DescriptorPool,
    device: Arc<VulkanDevice>,
}

impl DescriptorSets {
    pub fn new(device: &Arc<VulkanDevice>, bindings: &[Binding], count: u32) -> Result<Self> {
        let layout_bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        let sizes = pool_sizes(bindings, count);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(count)
            .pool_sizes(&sizes);
        let pool = match unsafe { device.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
                return Err(e).context("Failed to create descriptor pool");
            }
        };

        let mut result = Self {
            layout,
            sets: Vec::new(),
            pool,
            device: device.clone(),
        };

        let layouts = vec![layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        result.sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        Ok(result)
    }

    pub fn write_buffer(
        &self,
        set: usize,
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    ) {
        let infos = [info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.sets[set])
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(&infos)
            .build();
        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn write_image(
        &self,
        set: usize,
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    ) {
        let infos = [info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.sets[set])
            .dst_binding(binding)
            .descriptor_type(ty)
            .image_info(&infos)
            .build();
        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }
}

impl Drop for DescriptorSets {
    fn drop(&mut self) {
        unsafe {
            // Sets are freed with their pool
            self.device.device.destroy_descriptor_pool(self.pool, None);
            self.device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_merge_types() {
        let bindings = [
            Binding::new(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::COMPUTE),
            Binding::new(1, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
            Binding::new(2, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
            Binding::new(3, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE),
        ];
        let sizes = pool_sizes(&bindings, 3);
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes[0].descriptor_count, 3);
        assert_eq!(sizes[1].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[1].descriptor_count, 6);
        assert_eq!(sizes[2].descriptor_count, 3);
    }

    #[test]
    fn empty_layout_needs_no_pool_entries() {
        assert!(pool_sizes(&[], 2).is_empty());
    }
}
