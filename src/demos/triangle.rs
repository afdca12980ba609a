// Demo 001: one vertex-coloured triangle through the graphics pipeline

use anyhow::{Context, Result};
use glam::Mat4;

use super::{Demo, MeshPass};
use crate::config::Config;
use crate::context::{FrameTarget, RenderContext};
use crate::mesh::Mesh;

pub struct Triangle {
    clear_color: [f32; 4],
    vert: std::path::PathBuf,
    frag: std::path::PathBuf,
    pass: Option<MeshPass>,
}

impl Triangle {
    pub fn create(config: &Config) -> Box<dyn Demo> {
        Box::new(Self {
            clear_color: config.graphics.clear_color,
            vert: config.demos.shader_path("mesh.vert"),
            frag: config.demos.shader_path("mesh.frag"),
            pass: None,
        })
    }
}

impl Demo for Triangle {
    fn name(&self) -> &'static str {
        "Triangle"
    }

    fn init(&mut self, ctx: &mut RenderContext) -> Result<()> {
        let pass = MeshPass::new(ctx, &Mesh::triangle(), self.vert.clone(), self.frag.clone(), &[])?;
        self.pass = Some(pass);
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut RenderContext) -> Result<()> {
        match &mut self.pass {
            Some(pass) => pass.resize(ctx),
            None => Ok(()),
        }
    }

    fn record(&mut self, ctx: &RenderContext, target: &FrameTarget) -> Result<()> {
        let pass = self.pass.as_ref().context("Triangle demo not initialised")?;
        pass.record(&ctx.device.device, target, self.clear_color, Mat4::IDENTITY, None);
        Ok(())
    }

    fn reload_shaders(&mut self, ctx: &mut RenderContext) -> Result<()> {
        match &mut self.pass {
            Some(pass) => pass.reload(ctx),
            None => Ok(()),
        }
    }
}
