// Demo registry and the trait every demo implements

mod compute_rasterizer;
mod mesh_pass;
mod nothing;
mod texturing;
mod triangle;

use anyhow::Result;
use std::io::{self, BufRead, Write};
use winit::keyboard::KeyCode;

use crate::config::Config;
use crate::context::{FrameTarget, RenderContext};

pub use mesh_pass::MeshPass;

/// One self-contained demo hosted by the app.
///
/// Resources are released on drop; the app flushes the frame queue before a
/// demo is dropped and before `on_resize` / `reload_shaders` are called.
pub trait Demo {
    fn name(&self) -> &'static str;

    /// Create GPU resources
    fn init(&mut self, _ctx: &mut RenderContext) -> Result<()> {
        Ok(())
    }

    /// Demos that never draw leave the swapchain alone
    fn renders(&self) -> bool {
        true
    }

    fn on_resize(&mut self, _ctx: &mut RenderContext) -> Result<()> {
        Ok(())
    }

    fn on_update(&mut self, _dt: f32) {}

    fn on_key(&mut self, _key: KeyCode) {}

    /// Record this frame's commands into `target.cmd`
    fn record(&mut self, _ctx: &RenderContext, _target: &FrameTarget) -> Result<()> {
        Ok(())
    }

    fn reload_shaders(&mut self, _ctx: &mut RenderContext) -> Result<()> {
        Ok(())
    }

    /// Extra text for the window title
    fn status(&self) -> Option<String> {
        None
    }
}

pub struct DemoEntry {
    pub name: &'static str,
    pub factory: fn(&Config) -> Box<dyn Demo>,
}

pub static DEMOS: &[DemoEntry] = &[
    DemoEntry {
        name: "Nothing",
        factory: nothing::Nothing::create,
    },
    DemoEntry {
        name: "Triangle",
        factory: triangle::Triangle::create,
    },
    DemoEntry {
        name: "Texturing",
        factory: texturing::Texturing::create,
    },
    DemoEntry {
        name: "Compute Rasterizer",
        factory: compute_rasterizer::ComputeRasterizer::create,
    },
];

pub fn list_demos(out: &mut impl Write) -> io::Result<()> {
    for (index, entry) in DEMOS.iter().enumerate() {
        writeln!(out, "{:<3}: {}", index, entry.name)?;
    }
    Ok(())
}

/// Registry index for user input, `None` if it is not a listed demo
pub fn parse_selection(input: &str) -> Option<usize> {
    input
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|&index| index < DEMOS.len())
}

/// List the demos and read a choice from `input`
pub fn prompt(input: &mut impl BufRead, out: &mut impl Write) -> io::Result<Option<usize>> {
    list_demos(out)?;
    write!(out, "Select Demo to Run: ")?;
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(parse_selection(&line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn registry_order_is_stable() {
        let names: Vec<_> = DEMOS.iter().map(|d| d.name).collect();
        assert_eq!(names, ["Nothing", "Triangle", "Texturing", "Compute Rasterizer"]);
    }

    #[test]
    fn factories_build_matching_demos() {
        let config = Config::default();
        for entry in DEMOS {
            assert_eq!((entry.factory)(&config).name(), entry.name);
        }
    }

    #[test]
    fn listing_pads_indices() {
        let mut out = Vec::new();
        list_demos(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("0  : Nothing\n1  : Triangle\n"));
        assert!(text.ends_with("3  : Compute Rasterizer\n"));
    }

    #[test]
    fn selection_rejects_out_of_range_and_garbage() {
        assert_eq!(parse_selection("1\n"), Some(1));
        assert_eq!(parse_selection("  3 "), Some(3));
        assert_eq!(parse_selection("4"), None);
        assert_eq!(parse_selection("-1"), None);
        assert_eq!(parse_selection("two"), None);
        assert_eq!(parse_selection(""), None);
    }

    #[test]
    fn prompt_reads_one_line() {
        let mut input = Cursor::new("2\n0\n");
        let mut out = Vec::new();
        assert_eq!(prompt(&mut input, &mut out).unwrap(), Some(2));
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("Select Demo to Run: "));
    }

    #[test]
    fn prompt_at_end_of_input_is_invalid() {
        let mut out = Vec::new();
        assert_eq!(prompt(&mut Cursor::new(""), &mut out).unwrap(), None);
    }
}
