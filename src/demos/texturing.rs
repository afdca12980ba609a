// Demo 002: a quad sampling a texture loaded from disk

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use std::path::{Path, PathBuf};

use super::{Demo, MeshPass};
use crate::backend::descriptor::{Binding, DescriptorSets};
use crate::backend::texture::{Image, Sampler};
use crate::config::Config;
use crate::context::{FrameTarget, RenderContext};
use crate::mesh::Mesh;

const TEXTURE_BINDINGS: [Binding; 1] = [Binding::new(
    0,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::ShaderStageFlags::FRAGMENT,
)];

// Drop order: the pass and set go before what they reference
struct Resources {
    pass: MeshPass,
    descriptors: DescriptorSets,
    _sampler: Sampler,
    _texture: Image,
}

pub struct Texturing {
    clear_color: [f32; 4],
    texture_path: PathBuf,
    vert: PathBuf,
    frag: PathBuf,
    resources: Option<Resources>,
}

impl Texturing {
    pub fn create(config: &Config) -> Box<dyn Demo> {
        Box::new(Self {
            clear_color: config.graphics.clear_color,
            texture_path: config.demos.texture_path.clone(),
            vert: config.demos.shader_path("textured.vert"),
            frag: config.demos.shader_path("textured.frag"),
            resources: None,
        })
    }
}

/// Decode an image file into tightly packed RGBA8 rows
pub fn load_rgba8(path: &Path) -> Result<(u32, u32, Vec<u8>)> {
    let image = image::open(path)
        .with_context(|| format!("Failed to load texture {}", path.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    Ok((width, height, image.into_raw()))
}

impl Demo for Texturing {
    fn name(&self) -> &'static str {
        "Texturing"
    }

    fn init(&mut self, ctx: &mut RenderContext) -> Result<()> {
        let device = ctx.device.clone();

        let (width, height, pixels) = load_rgba8(&self.texture_path)?;
        let texture = Image::texture_rgba8(
            &device,
            &mut ctx.frames,
            "checker texture",
            width,
            height,
            &pixels,
        )?;

        let sampler = Sampler::new(&device)?;
        let descriptors = DescriptorSets::new(&device, &TEXTURE_BINDINGS, 1)?;
        descriptors.write_image(
            0,
            0,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorImageInfo {
                sampler: sampler.sampler,
                image_view: texture.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        );

        let pass = MeshPass::new(
            ctx,
            &Mesh::quad(),
            self.vert.clone(),
            self.frag.clone(),
            &[descriptors.layout],
        )?;

        self.resources = Some(Resources {
            pass,
            descriptors,
            _sampler: sampler,
            _texture: texture,
        });
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut RenderContext) -> Result<()> {
        match &mut self.resources {
            Some(resources) => resources.pass.resize(ctx),
            None => Ok(()),
        }
    }

    fn record(&mut self, ctx: &RenderContext, target: &FrameTarget) -> Result<()> {
        let resources = self.resources.as_ref().context("Texturing demo not initialised")?;
        resources.pass.record(
            &ctx.device.device,
            target,
            self.clear_color,
            Mat4::IDENTITY,
            Some(resources.descriptors.sets[0]),
        );
        Ok(())
    }

    fn reload_shaders(&mut self, ctx: &mut RenderContext) -> Result<()> {
        match &mut self.resources {
            Some(resources) => resources.pass.reload(ctx),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_checker_texture_decodes() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/checker.png");
        let (width, height, pixels) = load_rgba8(&path).unwrap();
        assert!(width > 0 && height > 0);
        assert_eq!(pixels.len(), (width * height * 4) as usize);
    }

    #[test]
    fn missing_texture_is_an_error() {
        assert!(load_rgba8(Path::new("does/not/exist.png")).is_err());
    }
}
