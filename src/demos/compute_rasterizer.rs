// Demo 003: the triangle rasterized three ways
//
// Hardware draws with the graphics pipeline. Compute runs raster.comp and
// fragment_shading.comp into a storage image that is copied to the swapchain.
// Cpu runs the same stages from `raster` and copies the result from a staging
// buffer. Tab cycles between them.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::Arc;
use winit::keyboard::KeyCode;

use super::{Demo, MeshPass};
use crate::backend::descriptor::{Binding, DescriptorSets};
use crate::backend::pipeline::{Pipeline, PipelineLayout, ShaderModules};
use crate::backend::texture::{self, Image, COLOR_LAYERS};
use crate::backend::{Buffer, VulkanDevice};
use crate::config::{Config, RasterPath};
use crate::context::{FrameTarget, RenderContext};
use crate::mesh::Mesh;
use crate::raster::{
    self, CpuRasterizer, Fragment, FrameUniforms, ModelUniform, PixelOrder, RasterParams,
    ViewUniform,
};

/// Radians per second
const ROTATION_SPEED: f32 = 0.5;

const UNIFORMS: u32 = 0;
const VERTICES: u32 = 1;
const INDICES: u32 = 2;
const FRAGMENTS: u32 = 3;
const FRAME_IMAGE: u32 = 4;

const RASTER_BINDINGS: [Binding; 5] = [
    Binding::new(UNIFORMS, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::COMPUTE),
    Binding::new(VERTICES, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
    Binding::new(INDICES, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
    Binding::new(FRAGMENTS, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
    Binding::new(FRAME_IMAGE, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE),
];

/// Per frame slot targets, sized to the swapchain
struct SlotTargets {
    uniforms: Buffer,
    fragments: Buffer,
    frame: Image,
    /// CPU path output, rows `pitch` bytes apart
    staging: Buffer,
    pitch: u64,
}

impl SlotTargets {
    fn new(ctx: &mut RenderContext, slot: usize) -> Result<Self> {
        let device = ctx.device.clone();
        let extent = ctx.extent();
        let pixels = extent.width as u64 * extent.height as u64;

        let uniforms = Buffer::new(
            &device,
            &format!("raster uniforms {}", slot),
            size_of::<FrameUniforms>() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;

        let fragments = Buffer::new(
            &device,
            &format!("fragments {}", slot),
            pixels * size_of::<Fragment>() as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
        )?;

        let frame = Image::new(
            &device,
            &format!("frame buffer {}", slot),
            extent,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        )?;

        let alignment = device.properties.limits.optimal_buffer_copy_row_pitch_alignment;
        let pitch = texture::aligned_row_pitch(extent.width as u64 * 4, alignment);
        let staging = Buffer::new(
            &device,
            &format!("cpu frame {}", slot),
            pitch * extent.height as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        // The storage image lives in GENERAL between frames
        let image = frame.image;
        ctx.frames.submit_and_wait(|device, cmd| {
            texture::transition_image(
                device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            );
        })?;

        Ok(Self {
            uniforms,
            fragments,
            frame,
            staging,
            pitch,
        })
    }
}

// Drop order: pipelines and sets before the buffers they reference
struct Resources {
    raster: Pipeline,
    shading: Pipeline,
    layout: PipelineLayout,
    descriptors: DescriptorSets,
    slots: Vec<SlotTargets>,
    pass: MeshPass,
    cpu: CpuRasterizer,
    device: Arc<VulkanDevice>,
}

impl Resources {
    fn build_pipelines(
        device: &Arc<VulkanDevice>,
        layout: &PipelineLayout,
        raster_path: &std::path::Path,
        shading_path: &std::path::Path,
    ) -> Result<(Pipeline, Pipeline)> {
        let mut shaders = ShaderModules::new(device);
        let raster = Pipeline::compute(device, layout, shaders.load(raster_path)?)?;
        let shading = Pipeline::compute(device, layout, shaders.load(shading_path)?)?;
        Ok((raster, shading))
    }

    /// (Re)create slot targets and point every descriptor set at them
    fn rebuild_slots(&mut self, ctx: &mut RenderContext) -> Result<()> {
        self.slots.clear();
        for slot in 0..ctx.frames.len() {
            self.slots.push(SlotTargets::new(ctx, slot)?);
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let sets = &self.descriptors;
            sets.write_buffer(
                index,
                UNIFORMS,
                vk::DescriptorType::UNIFORM_BUFFER,
                slot.uniforms.descriptor_info(),
            );
            sets.write_buffer(
                index,
                VERTICES,
                vk::DescriptorType::STORAGE_BUFFER,
                self.pass.vertex_buffer().descriptor_info(),
            );
            sets.write_buffer(
                index,
                INDICES,
                vk::DescriptorType::STORAGE_BUFFER,
                self.pass.index_buffer().descriptor_info(),
            );
            sets.write_buffer(
                index,
                FRAGMENTS,
                vk::DescriptorType::STORAGE_BUFFER,
                slot.fragments.descriptor_info(),
            );
            sets.write_image(
                index,
                FRAME_IMAGE,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: slot.frame.view,
                    image_layout: vk::ImageLayout::GENERAL,
                },
            );
        }

        log::debug!("Raster targets rebuilt for {} slots", self.slots.len());
        Ok(())
    }

    fn record_compute(&self, target: &FrameTarget) {
        let device = &self.device.device;
        let cmd = target.cmd;
        let slot = &self.slots[target.slot];
        let set = self.descriptors.sets[target.slot];
        let (groups_x, groups_y) = raster::dispatch_groups(target.extent.width, target.extent.height);

        unsafe {
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.layout.layout,
                0,
                &[set],
                &[],
            );

            // Vertex transform, primitive assembly, rasterization
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.raster.pipeline);
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);

            let fragments_written = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(slot.fragments.buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build();
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[fragments_written],
                &[],
            );

            // Fragment shading
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.shading.pipeline);
            device.cmd_dispatch(cmd, groups_x, groups_y, 1);
        }

        texture::transition_image(
            device,
            cmd,
            slot.frame.image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        texture::transition_acquired_image(
            device,
            cmd,
            target.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        let region = vk::ImageCopy {
            src_subresource: COLOR_LAYERS,
            src_offset: vk::Offset3D::default(),
            dst_subresource: COLOR_LAYERS,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: target.extent.width.min(slot.frame.extent.width),
                height: target.extent.height.min(slot.frame.extent.height),
                depth: 1,
            },
        };
        unsafe {
            device.cmd_copy_image(
                cmd,
                slot.frame.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        texture::transition_image(
            device,
            cmd,
            slot.frame.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );
        texture::transition_image(
            device,
            cmd,
            target.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
    }

    fn record_cpu(&mut self, mesh: &Mesh, uniforms: &FrameUniforms, target: &FrameTarget) -> Result<()> {
        let slot = &mut self.slots[target.slot];
        let order = PixelOrder::from_format(target.format);
        let pitch = slot.pitch;

        self.cpu
            .render(mesh, uniforms, order, slot.staging.mapped_mut()?, pitch as usize)?;

        let device = &self.device.device;
        texture::transition_acquired_image(
            device,
            target.cmd,
            target.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        texture::copy_buffer_to_image(
            device,
            target.cmd,
            slot.staging.buffer,
            target.image,
            target.extent,
            pitch,
        );
        texture::transition_image(
            device,
            target.cmd,
            target.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        Ok(())
    }
}

pub struct ComputeRasterizer {
    clear_color: [f32; 4],
    path: RasterPath,
    angle: f32,
    mesh: Mesh,
    vert: PathBuf,
    frag: PathBuf,
    raster_shader: PathBuf,
    shading_shader: PathBuf,
    resources: Option<Resources>,
}

impl ComputeRasterizer {
    pub fn create(config: &Config) -> Box<dyn Demo> {
        let demos = &config.demos;
        Box::new(Self {
            clear_color: config.graphics.clear_color,
            path: demos.raster_path,
            angle: 0.0,
            mesh: Mesh::triangle(),
            vert: demos.shader_path("mesh.vert"),
            frag: demos.shader_path("mesh.frag"),
            raster_shader: demos.shader_path("raster.comp"),
            shading_shader: demos.shader_path("fragment_shading.comp"),
            resources: None,
        })
    }

    fn frame_uniforms(&self, extent: vk::Extent2D, format: vk::Format) -> FrameUniforms {
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        FrameUniforms {
            model: ModelUniform::rotation_z(self.angle),
            view: ViewUniform::orthographic(aspect),
            params: RasterParams {
                clear_color: self.clear_color,
                width: extent.width,
                height: extent.height,
                index_count: self.mesh.indices.len() as u32,
                swizzle_bgra: (PixelOrder::from_format(format) == PixelOrder::Bgra) as u32,
            },
        }
    }
}

impl Demo for ComputeRasterizer {
    fn name(&self) -> &'static str {
        "Compute Rasterizer"
    }

    fn init(&mut self, ctx: &mut RenderContext) -> Result<()> {
        let device = ctx.device.clone();

        let pass = MeshPass::new(ctx, &self.mesh, self.vert.clone(), self.frag.clone(), &[])?;

        let descriptors = DescriptorSets::new(&device, &RASTER_BINDINGS, ctx.frames.len() as u32)?;
        let layout = PipelineLayout::new(&device, &[descriptors.layout], &[])?;
        let (raster, shading) =
            Resources::build_pipelines(&device, &layout, &self.raster_shader, &self.shading_shader)?;

        let mut resources = Resources {
            raster,
            shading,
            layout,
            descriptors,
            slots: Vec::new(),
            pass,
            cpu: CpuRasterizer::default(),
            device,
        };
        resources.rebuild_slots(ctx)?;

        log::info!("Raster path: {:?}", self.path);
        self.resources = Some(resources);
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut RenderContext) -> Result<()> {
        let Some(resources) = &mut self.resources else {
            return Ok(());
        };
        resources.pass.resize(ctx)?;
        resources.rebuild_slots(ctx)
    }

    fn on_update(&mut self, dt: f32) {
        self.angle = (self.angle + dt * ROTATION_SPEED) % std::f32::consts::TAU;
    }

    fn on_key(&mut self, key: KeyCode) {
        if key == KeyCode::Tab {
            self.path = self.path.next();
            log::info!("Raster path: {:?}", self.path);
        }
    }

    fn record(&mut self, _ctx: &RenderContext, target: &FrameTarget) -> Result<()> {
        let uniforms = self.frame_uniforms(target.extent, target.format);
        let resources = self
            .resources
            .as_mut()
            .context("Compute rasterizer demo not initialised")?;

        match self.path {
            RasterPath::Hardware => {
                let mvp = uniforms.view.view_proj() * uniforms.model.model;
                resources
                    .pass
                    .record(&resources.device.device, target, self.clear_color, mvp, None);
            }
            RasterPath::Compute => {
                resources.slots[target.slot].uniforms.write(&[uniforms])?;
                resources.record_compute(target);
            }
            RasterPath::Cpu => {
                resources.record_cpu(&self.mesh, &uniforms, target)?;
            }
        }
        Ok(())
    }

    fn reload_shaders(&mut self, ctx: &mut RenderContext) -> Result<()> {
        let Some(resources) = &mut self.resources else {
            return Ok(());
        };
        resources.pass.reload(ctx)?;

        let (raster, shading) = Resources::build_pipelines(
            &resources.device,
            &resources.layout,
            &self.raster_shader,
            &self.shading_shader,
        )?;
        resources.raster = raster;
        resources.shading = shading;
        log::info!("Reloaded compute rasterizer shaders");
        Ok(())
    }

    fn status(&self) -> Option<String> {
        Some(format!("{:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo() -> ComputeRasterizer {
        let config = Config::default();
        ComputeRasterizer {
            clear_color: config.graphics.clear_color,
            path: RasterPath::Compute,
            angle: 0.0,
            mesh: Mesh::triangle(),
            vert: PathBuf::new(),
            frag: PathBuf::new(),
            raster_shader: PathBuf::new(),
            shading_shader: PathBuf::new(),
            resources: None,
        }
    }

    #[test]
    fn tab_cycles_render_path() {
        let mut demo = demo();
        demo.on_key(KeyCode::Tab);
        assert_eq!(demo.path, RasterPath::Cpu);
        demo.on_key(KeyCode::Space);
        assert_eq!(demo.path, RasterPath::Cpu);
        demo.on_key(KeyCode::Tab);
        assert_eq!(demo.path, RasterPath::Hardware);
    }

    #[test]
    fn rotation_wraps_around() {
        let mut demo = demo();
        demo.on_update(2.0 * std::f32::consts::TAU / ROTATION_SPEED + 1.0);
        assert!(demo.angle >= 0.0 && demo.angle < std::f32::consts::TAU);
    }

    #[test]
    fn uniforms_follow_target() {
        let demo = demo();
        let extent = vk::Extent2D {
            width: 800,
            height: 400,
        };
        let uniforms = demo.frame_uniforms(extent, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(uniforms.params.width, 800);
        assert_eq!(uniforms.params.height, 400);
        assert_eq!(uniforms.params.index_count, 3);
        assert_eq!(uniforms.params.swizzle_bgra, 1);

        let rgba = demo.frame_uniforms(extent, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(rgba.params.swizzle_bgra, 0);
    }
}
