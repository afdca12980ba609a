// =============================================================================
// RASTER DEMOS - Incremental Vulkan learning demos
// =============================================================================
//
// Each demo is one self-contained program selected at start-up:
//
//   0  Nothing             empty window
//   1  Triangle            vertex and index buffers, graphics pipeline
//   2  Texturing           texture upload, sampler, descriptor set
//   3  Compute Rasterizer  the triangle rasterized in compute shaders
//                          (or on the CPU) and copied to the swapchain
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, input, FPS)                             │
// │    └── Demo (resources, per-frame command recording)            │
// │          └── RenderContext (device, swapchain, frame ring)      │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

mod app;
mod backend;
mod config;
mod context;
mod demos;
mod mesh;
mod raster;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, RasterPath};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use winit::event_loop::EventLoop;

#[derive(Parser, Debug)]
#[command(name = "raster-demos", about = "Vulkan learning demos and a compute-shader rasterizer")]
struct Args {
    /// Demo index; prompts on stdin when omitted
    demo: Option<usize>,

    /// Configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Print the available demos and exit
    #[arg(long)]
    list: bool,

    /// Initial render path of the compute rasterizer demo
    #[arg(long, value_enum)]
    raster_path: Option<RasterPath>,

    /// Force vsync on
    #[arg(long)]
    vsync: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, load_error) = Config::load(&args.config);
    if let Some(path) = args.raster_path {
        config.demos.raster_path = path;
    }
    if args.vsync {
        config.graphics.vsync = true;
    }

    init_logging(&config)?;

    match load_error {
        Some(e) => log::warn!("Failed to load {:?}: {:#}. Using defaults.", args.config, e),
        None if args.config.exists() => log::info!("Loaded configuration from {:?}", args.config),
        None => log::info!("Config file not found at {:?}, using defaults", args.config),
    }
    log::debug!("Config: {:?}", config);

    let stdout = io::stdout();
    if args.list {
        demos::list_demos(&mut stdout.lock())?;
        return Ok(());
    }

    let selection = match args.demo {
        Some(index) => Some(index).filter(|&i| i < demos::DEMOS.len()),
        None => demos::prompt(&mut io::stdin().lock(), &mut stdout.lock())?,
    };

    let Some(index) = selection else {
        println!("Invalid Selection.");
        return Ok(());
    };

    let entry = &demos::DEMOS[index];
    log::info!("Selected Demo is {} (#{})", entry.name, index);
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let demo = (entry.factory)(&config);
    let event_loop = EventLoop::new()?;
    let mut app = app::App::new(config, demo);
    event_loop.run_app(&mut app)?;

    match app.take_error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging; with `debug.log_to_file` records also go to the log file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;

        writeln!(file, "=== Raster Demos Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;

        builder.target(Target::Pipe(Box::new(Tee { file })));
    }

    builder.init();
    Ok(())
}

/// Writes log output to stderr and the log file
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}
