// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. Shaders are compiled by build.rs
// (when glslc is available) and read from disk at runtime.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use super::VulkanDevice;

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);

    unsafe {
        device.device.create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Read a `.spv` file and create a shader module from it.
/// `read_spv` takes care of alignment and the magic number check.
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?}", path))?;
    let words = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
        .with_context(|| format!("Invalid SPIR-V in {:?}", path))?;

    log::debug!("Loaded shader {:?} ({} words)", path, words.len());
    create_shader_module(device, &words)
}

/// Vertex + fragment module pair, destroyed together once a pipeline is built
pub struct ShaderPair {
    pub vert: vk::ShaderModule,
    pub frag: vk::ShaderModule,
}

impl ShaderPair {
    pub fn load(device: &VulkanDevice, dir: &Path, vert: &str, frag: &str) -> Result<Self> {
        let vert = load_shader_module(device, &dir.join(vert))?;
        let frag = match load_shader_module(device, &dir.join(frag)) {
            Ok(frag) => frag,
            Err(e) => {
                unsafe { device.device.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };
        Ok(Self { vert, frag })
    }

    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_shader_module(self.vert, None);
            device.destroy_shader_module(self.frag, None);
        }
    }
}
