// Forward pass drawing one indexed mesh straight into the swapchain image

use anyhow::Result;
use ash::vk;
use glam::Mat4;
use std::path::PathBuf;

use crate::backend::pipeline::{self, Pipeline, PipelineLayout, RenderTargets, ShaderModules};
use crate::backend::Buffer;
use crate::context::{FrameTarget, RenderContext};
use crate::mesh::{Mesh, INDEX_TYPE};

pub struct MeshPass {
    pipeline: Pipeline,
    layout: PipelineLayout,
    targets: RenderTargets,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
    vert: PathBuf,
    frag: PathBuf,
}

impl MeshPass {
    /// Upload `mesh` and build the pipeline. Mesh buffers are also usable as
    /// storage buffers so compute stages can read the same data.
    pub fn new(
        ctx: &mut RenderContext,
        mesh: &Mesh,
        vert: PathBuf,
        frag: PathBuf,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        let device = ctx.device.clone();

        let vertex_buffer = Buffer::device_local_with_data(
            &device,
            &mut ctx.frames,
            "mesh vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            &mesh.vertices,
        )?;
        let index_buffer = Buffer::device_local_with_data(
            &device,
            &mut ctx.frames,
            "mesh indices",
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            &mesh.indices,
        )?;

        let push_constants = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<Mat4>() as u32,
        }];
        let layout = PipelineLayout::new(&device, set_layouts, &push_constants)?;

        let swapchain = &ctx.swapchain;
        let targets =
            RenderTargets::new(&device, swapchain.format, &swapchain.image_views, swapchain.extent)?;

        let pipeline = Self::build_pipeline(ctx, &targets, &layout, &vert, &frag)?;

        Ok(Self {
            pipeline,
            layout,
            targets,
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            vert,
            frag,
        })
    }

    fn build_pipeline(
        ctx: &RenderContext,
        targets: &RenderTargets,
        layout: &PipelineLayout,
        vert: &std::path::Path,
        frag: &std::path::Path,
    ) -> Result<Pipeline> {
        let mut shaders = ShaderModules::new(&ctx.device);
        let vert = shaders.load(vert)?;
        let frag = shaders.load(frag)?;
        Pipeline::graphics(&ctx.device, targets.render_pass, layout, vert, frag)
    }

    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }

    pub fn resize(&mut self, ctx: &RenderContext) -> Result<()> {
        self.targets
            .resize(&ctx.swapchain.image_views, ctx.swapchain.extent)
    }

    /// Rebuild the pipeline from the shader files; the old one stays on failure
    pub fn reload(&mut self, ctx: &RenderContext) -> Result<()> {
        self.pipeline = Self::build_pipeline(ctx, &self.targets, &self.layout, &self.vert, &self.frag)?;
        log::info!("Reloaded {} / {}", self.vert.display(), self.frag.display());
        Ok(())
    }

    pub fn record(
        &self,
        device: &ash::Device,
        target: &FrameTarget,
        clear_color: [f32; 4],
        mvp: Mat4,
        descriptor_set: Option<vk::DescriptorSet>,
    ) {
        let cmd = target.cmd;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.targets.render_pass)
            .framebuffer(self.targets.framebuffers[target.image_index as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: target.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
        }

        pipeline::set_viewport(device, cmd, target.extent);

        unsafe {
            if let Some(set) = descriptor_set {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.layout.layout,
                    0,
                    &[set],
                    &[],
                );
            }
            device.cmd_push_constants(
                cmd,
                self.layout.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&mvp),
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, INDEX_TYPE);
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);
        }
    }
}
