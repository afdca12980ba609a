// Shader module loading and hot reload
//
// Shaders are compiled to SPIR-V by build.rs and loaded from disk at run
// time, so an edited-and-recompiled shader can be picked up without a restart.

use anyhow::{Context, Result};
use ash::vk;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::VulkanDevice;

/// Load a SPIR-V file and create a shader module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open shader {}", path.display()))?;
    // read_spv checks the magic number and realigns the words
    let code = ash::util::read_spv(&mut file)
        .with_context(|| format!("Invalid SPIR-V in {}", path.display()))?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    log::debug!("Loaded shader {} ({} words)", path.display(), code.len());

    unsafe { device.device.create_shader_module(&create_info, None) }
        .with_context(|| format!("Failed to create shader module from {}", path.display()))
}

/// Compiled shader binaries are the only files worth reloading for
pub fn is_shader_binary(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "spv")
}

/// Watches the shader directory and collects changed SPIR-V files
pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    changed: Arc<Mutex<Vec<PathBuf>>>,
}

impl ShaderWatcher {
    pub fn new(dir: &Path) -> Result<Self> {
        let changed = Arc::new(Mutex::new(Vec::new()));
        let sink = changed.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
                    let mut changed = sink.lock();
                    for path in event.paths.into_iter().filter(|p| is_shader_binary(p)) {
                        if !changed.contains(&path) {
                            changed.push(path);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Shader watch error: {}", e),
            }
        })
        .context("Failed to create shader watcher")?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        log::info!("Watching {} for shader changes", dir.display());

        Ok(Self {
            _watcher: watcher,
            changed,
        })
    }

    /// Drain the files changed since the last call
    pub fn take_changes(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.changed.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_spirv_files_trigger_reload() {
        assert!(is_shader_binary(Path::new("shaders/raster.comp.spv")));
        assert!(!is_shader_binary(Path::new("shaders/raster.comp")));
        assert!(!is_shader_binary(Path::new("shaders/.raster.comp.spv.swp")));
        assert!(!is_shader_binary(Path::new("shaders")));
    }
}
