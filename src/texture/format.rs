// Texture formats the loader produces and the renderer targets

use ash::vk;

use crate::backend::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Color images decoded from LDR files
    Rgba8Srgb,
    /// Data textures (normal maps, procedural volumes)
    Rgba8Unorm,
    /// HDR render targets
    Rgba16Float,
    /// Decoded HDR files
    Rgba32Float,
    Depth32,
    Depth24Stencil8,
}

impl TextureFormat {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::Depth32 => vk::Format::D32_SFLOAT,
            Self::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
        }
    }

    pub fn from_vk(format: vk::Format) -> Option<Self> {
        match format {
            vk::Format::R8G8B8A8_SRGB => Some(Self::Rgba8Srgb),
            vk::Format::R8G8B8A8_UNORM => Some(Self::Rgba8Unorm),
            vk::Format::R16G16B16A16_SFLOAT => Some(Self::Rgba16Float),
            vk::Format::R32G32B32A32_SFLOAT => Some(Self::Rgba32Float),
            vk::Format::D32_SFLOAT => Some(Self::Depth32),
            vk::Format::D24_UNORM_S8_UINT => Some(Self::Depth24Stencil8),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8Srgb | Self::Rgba8Unorm => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
            Self::Depth32 | Self::Depth24Stencil8 => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32 | Self::Depth24Stencil8)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24Stencil8)
    }
}

/// Depth formats in order of preference
const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First depth format the device can use as an optimal-tiling attachment
pub fn select_depth_format(device: &VulkanDevice) -> Option<vk::Format> {
    pick_first_supported(&DEPTH_CANDIDATES, |format| {
        device.format_supports(format, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

fn pick_first_supported(
    candidates: &[vk::Format],
    supported: impl Fn(vk::Format) -> bool,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| supported(format))
}
