// GPU textures - image + memory + view + sampler, with layout tracking
//
// Upload path for file / procedural data:
//   validate -> create image -> staging buffer -> one-time submit {
//       all levels UNDEFINED -> TRANSFER_DST
//       copy buffer -> level 0 (one region per layer)
//       blit mip chain, or TRANSFER_DST -> SHADER_READ_ONLY
//   } -> staging buffer dropped after the fence

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::layout::aspect_for_format;
use crate::backend::{BarrierBatch, GpuBuffer, ImageLayoutState, SubresourceLayouts, VulkanDevice};
use crate::config::TexturesConfig;

use super::mip::{mip_level_count, record_mip_chain};
use super::source::{FallbackKind, TextureData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Texture2D,
    Texture3D,
    Cubemap,
    /// Color or depth attachment, optionally sampled by a later pass
    RenderTarget,
}

/// Everything needed to create the image and its view
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub kind: TextureKind,
    pub size: [u32; 3],
    pub layers: u32,
    pub format: vk::Format,
    pub mip_levels: u32,
    /// Usage on top of what the kind implies
    pub extra_usage: vk::ImageUsageFlags,
    pub label: String,
}

impl TextureDesc {
    pub fn texture_2d(width: u32, height: u32, format: vk::Format, mip_levels: u32) -> Self {
        Self {
            kind: TextureKind::Texture2D,
            size: [width, height, 1],
            layers: 1,
            format,
            mip_levels,
            extra_usage: vk::ImageUsageFlags::empty(),
            label: String::from("texture_2d"),
        }
    }

    pub fn texture_3d(width: u32, height: u32, depth: u32, format: vk::Format, mip_levels: u32) -> Self {
        Self {
            kind: TextureKind::Texture3D,
            size: [width, height, depth],
            layers: 1,
            format,
            mip_levels,
            extra_usage: vk::ImageUsageFlags::empty(),
            label: String::from("texture_3d"),
        }
    }

    pub fn cubemap(size: u32, format: vk::Format, mip_levels: u32) -> Self {
        Self {
            kind: TextureKind::Cubemap,
            size: [size, size, 1],
            layers: 6,
            format,
            mip_levels,
            extra_usage: vk::ImageUsageFlags::empty(),
            label: String::from("cubemap"),
        }
    }

    pub fn render_target(width: u32, height: u32, format: vk::Format, sampled: bool) -> Self {
        Self {
            kind: TextureKind::RenderTarget,
            size: [width, height, 1],
            layers: 1,
            format,
            mip_levels: 1,
            extra_usage: if sampled {
                vk::ImageUsageFlags::SAMPLED
            } else {
                vk::ImageUsageFlags::empty()
            },
            label: String::from("render_target"),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_depth(&self) -> bool {
        aspect_for_format(self.format).contains(vk::ImageAspectFlags::DEPTH)
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }

    pub fn image_type(&self) -> vk::ImageType {
        match self.kind {
            TextureKind::Texture3D => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        }
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        match self.kind {
            TextureKind::Texture3D => vk::ImageViewType::TYPE_3D,
            TextureKind::Cubemap => vk::ImageViewType::CUBE,
            TextureKind::Texture2D | TextureKind::RenderTarget => vk::ImageViewType::TYPE_2D,
        }
    }

    pub fn create_flags(&self) -> vk::ImageCreateFlags {
        match self.kind {
            TextureKind::Cubemap => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            _ => vk::ImageCreateFlags::empty(),
        }
    }

    pub fn vk_usage(&self) -> vk::ImageUsageFlags {
        let base = match self.kind {
            TextureKind::RenderTarget if self.is_depth() => {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            }
            TextureKind::RenderTarget => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            _ => vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        };
        // Mip generation reads the upper levels
        let mips = if self.mip_levels > 1 {
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST
        } else {
            vk::ImageUsageFlags::empty()
        };
        base | mips | self.extra_usage
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.size[0],
            height: self.size[1],
            depth: self.size[2],
        }
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.layers,
        }
    }
}

/// Sampler state derived from the texture kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// `None` disables anisotropic filtering
    pub anisotropy: Option<f32>,
    pub max_lod: f32,
}

impl SamplerDesc {
    pub fn for_texture(desc: &TextureDesc, max_anisotropy: f32) -> Self {
        let address_mode = match desc.kind {
            // Seams between faces and edges of render targets must not wrap
            TextureKind::Cubemap | TextureKind::RenderTarget => {
                vk::SamplerAddressMode::CLAMP_TO_EDGE
            }
            TextureKind::Texture2D | TextureKind::Texture3D => vk::SamplerAddressMode::REPEAT,
        };
        let filter = if desc.is_depth() {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        };
        let anisotropy = (max_anisotropy > 1.0 && !desc.is_depth()).then_some(max_anisotropy);
        Self {
            filter,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode,
            anisotropy,
            max_lod: desc.mip_levels as f32,
        }
    }

    pub fn to_create_info(&self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.filter)
            .min_filter(self.filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .anisotropy_enable(self.anisotropy.is_some())
            .max_anisotropy(self.anisotropy.unwrap_or(1.0))
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(self.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
    }
}

/// Loader settings shared by every texture created from data
#[derive(Debug, Clone, Copy)]
pub struct TextureOptions {
    pub generate_mipmaps: bool,
    pub max_anisotropy: f32,
    pub fallback: FallbackKind,
}

impl Default for TextureOptions {
    fn default() -> Self {
        Self {
            generate_mipmaps: true,
            max_anisotropy: 16.0,
            fallback: FallbackKind::Checkerboard,
        }
    }
}

impl From<&TexturesConfig> for TextureOptions {
    fn from(config: &TexturesConfig) -> Self {
        Self {
            generate_mipmaps: config.generate_mipmaps,
            max_anisotropy: config.max_anisotropy,
            fallback: config.fallback_kind(),
        }
    }
}

/// One buffer -> image copy per layer, all into mip 0
pub fn copy_regions(data: &TextureData) -> Vec<vk::BufferImageCopy> {
    let layer_bytes = data.layer_bytes() as vk::DeviceSize;
    (0..data.layers)
        .map(|layer| vk::BufferImageCopy {
            buffer_offset: layer as vk::DeviceSize * layer_bytes,
            buffer_row_length: 0, // Tightly packed
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: data.width,
                height: data.height,
                depth: data.depth,
            },
        })
        .collect()
}

/// Check that data has the shape a texture kind needs
pub fn check_shape(data: &TextureData, kind: TextureKind) -> Result<()> {
    let ok = match kind {
        TextureKind::Texture2D => data.depth == 1 && data.layers == 1,
        TextureKind::Texture3D => data.layers == 1,
        TextureKind::Cubemap => data.depth == 1 && data.layers == 6 && data.width == data.height,
        TextureKind::RenderTarget => false,
    };
    if !ok {
        anyhow::bail!(
            "{}x{}x{} data with {} layers cannot back a {:?}",
            data.width,
            data.height,
            data.depth,
            data.layers,
            kind
        );
    }
    Ok(())
}

/// A GPU image with its memory, view and (optional) sampler
pub struct Texture {
    image: vk::Image,
    view: vk::ImageView,
    sampler: Option<vk::Sampler>,
    allocation: Option<Allocation>,
    desc: TextureDesc,
    /// Shared textures are recorded from several places
    layouts: Mutex<SubresourceLayouts>,
    device: Arc<VulkanDevice>,
}

impl Texture {
    /// Create the image, bind GPU-only memory, and create view + sampler.
    /// All levels start UNDEFINED.
    pub fn new(
        device: &Arc<VulkanDevice>,
        desc: TextureDesc,
        sampler: Option<SamplerDesc>,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .flags(desc.create_flags())
            .image_type(desc.image_type())
            .extent(desc.extent())
            .mip_levels(desc.mip_levels)
            .array_layers(desc.layers)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.vk_usage())
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device.device.create_image(&image_info, None)
                .with_context(|| format!("Failed to create image {}", desc.label))?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = match device.allocate(&desc.label, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        // From here on Drop cleans up whatever was created
        let mut texture = Self {
            image,
            view: vk::ImageView::null(),
            sampler: None,
            layouts: Mutex::new(SubresourceLayouts::new(desc.mip_levels)),
            allocation: Some(allocation),
            desc,
            device: device.clone(),
        };

        let allocation = texture.allocation.as_ref().context("Texture allocation missing")?;
        unsafe {
            device.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(texture.desc.view_type())
            .format(texture.desc.format)
            .subresource_range(texture.desc.subresource_range());
        texture.view = unsafe {
            device.device.create_image_view(&view_info, None)
                .context("Failed to create image view")?
        };

        if let Some(sampler) = sampler {
            let sampler_info = sampler.to_create_info();
            texture.sampler = Some(unsafe {
                device.device.create_sampler(&sampler_info, None)
                    .context("Failed to create sampler")?
            });
        }

        log::debug!(
            "Created {:?} '{}' {:?} {:?} mips={} layers={}",
            texture.desc.kind,
            texture.desc.label,
            texture.desc.size,
            texture.desc.format,
            texture.desc.mip_levels,
            texture.desc.layers
        );

        Ok(texture)
    }

    /// Create a sampled texture from CPU data via a staging upload
    pub fn from_data(
        device: &Arc<VulkanDevice>,
        data: &TextureData,
        kind: TextureKind,
        options: &TextureOptions,
    ) -> Result<Self> {
        data.validate()?;
        check_shape(data, kind)?;

        let format = data.format.to_vk();
        let blit_features = vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
            | vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::BLIT_DST;
        let mip_levels = if !options.generate_mipmaps {
            1
        } else if device.format_supports(format, blit_features) {
            mip_level_count(data.width, data.height, data.depth)
        } else {
            log::warn!("{:?} cannot be linearly blitted, skipping mip generation", format);
            1
        };

        let desc = match kind {
            TextureKind::Texture2D => TextureDesc::texture_2d(data.width, data.height, format, mip_levels),
            TextureKind::Texture3D => {
                TextureDesc::texture_3d(data.width, data.height, data.depth, format, mip_levels)
            }
            TextureKind::Cubemap => TextureDesc::cubemap(data.width, format, mip_levels),
            TextureKind::RenderTarget => unreachable!("rejected by check_shape"),
        };
        let anisotropy = options.max_anisotropy.min(device.max_sampler_anisotropy());
        let sampler = SamplerDesc::for_texture(&desc, anisotropy);

        let texture = Self::new(device, desc, Some(sampler))?;
        let staging = GpuBuffer::staging(device, &data.pixels)?;
        let regions = copy_regions(data);

        device.one_time_submit(|cmd| {
            texture.record_upload(cmd, staging.buffer, &regions);
            Ok(())
        })?;
        drop(staging);

        log::info!(
            "Uploaded {:?} {}x{}x{} ({} layers, {} mips)",
            kind,
            data.width,
            data.height,
            data.depth,
            data.layers,
            mip_levels
        );
        Ok(texture)
    }

    fn record_upload(&self, cmd: vk::CommandBuffer, staging: vk::Buffer, regions: &[vk::BufferImageCopy]) {
        let device = &self.device.device;
        let mut layouts = self.layouts.lock();
        let mut batch = BarrierBatch::new();

        let transitions = layouts.transition_all(ImageLayoutState::TransferDst);
        batch.extend(self.image, self.desc.aspect(), self.desc.layers, &transitions);
        batch.record(device, cmd);

        unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                staging,
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            );
        }

        if self.desc.mip_levels > 1 {
            record_mip_chain(device, cmd, self.image, self.desc.size, self.desc.layers, &mut layouts);
        } else {
            batch.clear();
            let transitions = layouts.transition_all(ImageLayoutState::ShaderReadOnly);
            batch.extend(self.image, self.desc.aspect(), self.desc.layers, &transitions);
            batch.record(device, cmd);
        }
    }

    /// Color (or depth, judging by the format) attachment
    pub fn render_target(
        device: &Arc<VulkanDevice>,
        width: u32,
        height: u32,
        format: vk::Format,
        sampled: bool,
    ) -> Result<Self> {
        let desc = TextureDesc::render_target(width, height, format, sampled);
        let sampler = sampled.then(|| SamplerDesc::for_texture(&desc, 1.0));
        Self::new(device, desc, sampler)
    }

    pub fn depth_target(device: &Arc<VulkanDevice>, width: u32, height: u32, format: vk::Format) -> Result<Self> {
        let desc = TextureDesc::render_target(width, height, format, false).with_label("depth");
        Self::new(device, desc, None)
    }

    /// Record a barrier moving every level to `to`
    pub fn transition(&self, cmd: vk::CommandBuffer, to: ImageLayoutState) {
        let mut layouts = self.layouts.lock();
        let transitions = layouts.transition_all(to);
        let mut batch = BarrierBatch::new();
        batch.extend(self.image, self.desc.aspect(), self.desc.layers, &transitions);
        batch.record(&self.device.device, cmd);
    }

    /// Record a layout reached implicitly (render pass final layout)
    pub fn assume_layout(&self, state: ImageLayoutState) {
        self.layouts.lock().set_all(state);
    }

    pub fn layout(&self, level: u32) -> Option<ImageLayoutState> {
        self.layouts.lock().get(level)
    }

    /// Image info for a combined image sampler write
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.unwrap_or_default(),
            image_view: self.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn kind(&self) -> TextureKind {
        self.desc.kind
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            if let Some(sampler) = self.sampler.take() {
                self.device.device.destroy_sampler(sampler, None);
            }
            // Destroying a null view is a no-op
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cubemap_desc() {
        let desc = TextureDesc::cubemap(512, vk::Format::R8G8B8A8_SRGB, 10);
        assert_eq!(desc.layers, 6);
        assert_eq!(desc.view_type(), vk::ImageViewType::CUBE);
        assert_eq!(desc.image_type(), vk::ImageType::TYPE_2D);
        assert!(desc.create_flags().contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
    }

    #[test]
    fn test_volume_desc() {
        let desc = TextureDesc::texture_3d(32, 32, 32, vk::Format::R8G8B8A8_UNORM, 1);
        assert_eq!(desc.image_type(), vk::ImageType::TYPE_3D);
        assert_eq!(desc.view_type(), vk::ImageViewType::TYPE_3D);
        assert_eq!(desc.extent().depth, 32);
        assert!(desc.create_flags().is_empty());
    }

    #[test]
    fn test_uploaded_usage_with_and_without_mips() {
        let single = TextureDesc::texture_2d(64, 64, vk::Format::R8G8B8A8_SRGB, 1);
        let usage = single.vk_usage();
        assert!(usage.contains(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST));
        assert!(!usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));

        let mipped = TextureDesc::texture_2d(64, 64, vk::Format::R8G8B8A8_SRGB, 7);
        assert!(mipped.vk_usage().contains(vk::ImageUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn test_render_target_usage() {
        let color = TextureDesc::render_target(800, 600, vk::Format::R16G16B16A16_SFLOAT, true);
        assert_eq!(
            color.vk_usage(),
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        );

        let depth = TextureDesc::render_target(800, 600, vk::Format::D32_SFLOAT, false);
        assert!(depth.is_depth());
        assert_eq!(depth.vk_usage(), vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
        assert_eq!(depth.aspect(), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn test_sampler_per_kind() {
        let cube = TextureDesc::cubemap(64, vk::Format::R8G8B8A8_SRGB, 7);
        let sampler = SamplerDesc::for_texture(&cube, 8.0);
        assert_eq!(sampler.address_mode, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(sampler.anisotropy, Some(8.0));
        assert_eq!(sampler.max_lod, 7.0);

        let tex = TextureDesc::texture_2d(64, 64, vk::Format::R8G8B8A8_SRGB, 1);
        let sampler = SamplerDesc::for_texture(&tex, 1.0);
        assert_eq!(sampler.address_mode, vk::SamplerAddressMode::REPEAT);
        assert_eq!(sampler.anisotropy, None);

        let info = sampler.to_create_info();
        assert_eq!(info.anisotropy_enable, vk::FALSE);
        assert_eq!(info.max_anisotropy, 1.0);
    }

    #[test]
    fn test_copy_regions_one_per_layer() {
        let cube = TextureData::solid_cubemap([0, 0, 0, 255], 16);
        let regions = copy_regions(&cube);
        assert_eq!(regions.len(), 6);
        assert_eq!(regions[0].buffer_offset, 0);
        assert_eq!(regions[5].buffer_offset, 5 * 16 * 16 * 4);
        assert_eq!(regions[5].image_subresource.base_array_layer, 5);
        assert_eq!(regions[5].image_extent.width, 16);

        let volume = TextureData::gradient_volume(8);
        let regions = copy_regions(&volume);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].image_extent.depth, 8);
    }

    #[test]
    fn test_shape_checks() {
        let flat = TextureData::solid([1, 2, 3, 4], 8, 8);
        assert!(check_shape(&flat, TextureKind::Texture2D).is_ok());
        assert!(check_shape(&flat, TextureKind::Cubemap).is_err());
        assert!(check_shape(&flat, TextureKind::RenderTarget).is_err());

        let cube = TextureData::solid_cubemap([1, 2, 3, 4], 8);
        assert!(check_shape(&cube, TextureKind::Cubemap).is_ok());
        assert!(check_shape(&cube, TextureKind::Texture2D).is_err());

        let volume = TextureData::gradient_volume(4);
        assert!(check_shape(&volume, TextureKind::Texture3D).is_ok());
        assert!(check_shape(&volume, TextureKind::Texture2D).is_err());
    }
}
