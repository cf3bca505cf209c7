// Render pass and graphics pipeline creation
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Viewport and scissor are dynamic so pipelines survive swapchain resizes.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

/// Attachments of a single-subpass render pass
#[derive(Debug, Clone, Copy)]
pub struct RenderPassDesc {
    pub color_format: Option<vk::Format>,
    pub depth_format: Option<vk::Format>,
    /// Layout the color attachment ends in (PRESENT_SRC for the swapchain,
    /// SHADER_READ_ONLY for offscreen targets that get sampled later)
    pub color_final_layout: vk::ImageLayout,
    pub clear: bool,
}

impl RenderPassDesc {
    /// Swapchain pass: color is presented, depth is thrown away
    pub fn present(color_format: vk::Format, depth_format: vk::Format) -> Self {
        Self {
            color_format: Some(color_format),
            depth_format: Some(depth_format),
            color_final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            clear: true,
        }
    }

    /// Offscreen pass whose color target is sampled by a later pass
    pub fn offscreen(color_format: vk::Format, depth_format: Option<vk::Format>) -> Self {
        Self {
            color_format: Some(color_format),
            depth_format,
            color_final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            clear: true,
        }
    }

    fn samples_color_afterwards(&self) -> bool {
        self.color_final_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }
}

/// Create a render pass with one subpass for the described attachments
pub fn create_render_pass(device: &VulkanDevice, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
    let load_op = if desc.clear {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::DONT_CARE
    };

    let mut attachments = Vec::with_capacity(2);
    let mut color_refs = Vec::with_capacity(1);
    let mut depth_ref = None;

    if let Some(format) = desc.color_format {
        color_refs.push(
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(desc.color_final_layout),
        );
    }

    if let Some(format) = desc.depth_format {
        depth_ref = Some(
            vk::AttachmentReference::default()
                .attachment(attachments.len() as u32)
                .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
        attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }

    // Attachments are shared by the frames in flight: wait for the previous
    // frame's depth writes and, for sampled targets, its shader reads
    let mut src_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    if desc.samples_color_afterwards() {
        src_stage |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    let src_access = if desc.depth_format.is_some() {
        vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
    } else {
        vk::AccessFlags::empty()
    };

    let mut dependencies = vec![vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];

    // Later passes sample what this one wrote
    if desc.samples_color_afterwards() {
        dependencies.push(
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .dst_access_mask(vk::AccessFlags::SHADER_READ),
        );
    }

    let subpasses = [subpass];
    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        device.device.create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

/// Create one framebuffer per color view, all sharing the depth view
pub fn create_framebuffers(
    device: &VulkanDevice,
    color_views: &[vk::ImageView],
    depth_view: Option<vk::ImageView>,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    color_views.iter().map(|&color_view| {
        let mut attachments = vec![color_view];
        attachments.extend(depth_view);

        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        unsafe {
            device.device.create_framebuffer(&framebuffer_info, None)
                .context("Failed to create framebuffer")
        }
    }).collect()
}

/// Interleaved vertex buffer layout (single binding)
#[derive(Debug, Clone)]
pub struct VertexLayout {
    pub stride: u32,
    /// (location, format, offset)
    pub attributes: Vec<(u32, vk::Format, u32)>,
}

impl VertexLayout {
    pub fn bindings(&self) -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(self.stride)
            .input_rate(vk::VertexInputRate::VERTEX)]
    }

    pub fn attributes(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|&(location, format, offset)| {
                vk::VertexInputAttributeDescription::default()
                    .binding(0)
                    .location(location)
                    .format(format)
                    .offset(offset)
            })
            .collect()
    }
}

/// Fixed-function state that differs between materials and passes
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub vertex_layout: VertexLayout,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    /// Vertex + fragment push constant block size in bytes
    pub push_constant_size: u32,
}

impl GraphicsPipelineDesc {
    /// Opaque geometry: back-face culling, depth test + write
    pub fn opaque(vertex_layout: VertexLayout) -> Self {
        Self {
            vertex_layout,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            set_layouts: Vec::new(),
            push_constant_size: 128,
        }
    }
}

/// Create a graphics pipeline and its layout
pub fn create_graphics_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
    desc: &GraphicsPipelineDesc,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let entry_point = c"main";

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_shader)
            .name(entry_point),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_shader)
            .name(entry_point),
    ];

    let bindings = desc.vertex_layout.bindings();
    let attributes = desc.vertex_layout.attributes();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Counts only; the actual rectangles are set per frame
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(desc.depth_compare)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let push_constant_ranges = [vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .offset(0)
        .size(desc.push_constant_size)];
    let push_constant_ranges: &[vk::PushConstantRange] = if desc.push_constant_size > 0 {
        &push_constant_ranges
    } else {
        &[]
    };

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&desc.set_layouts)
        .push_constant_ranges(push_constant_ranges);

    let pipeline_layout = unsafe {
        device.device.create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")?
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device.device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    };

    match pipelines {
        Ok(pipelines) => Ok((pipelines[0], pipeline_layout)),
        Err((_, e)) => {
            unsafe { device.device.destroy_pipeline_layout(pipeline_layout, None) };
            Err(e).context("Failed to create graphics pipeline")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_conversion() {
        let layout = VertexLayout {
            stride: 32,
            attributes: vec![
                (0, vk::Format::R32G32B32_SFLOAT, 0),
                (1, vk::Format::R32G32B32_SFLOAT, 12),
                (2, vk::Format::R32G32_SFLOAT, 24),
            ],
        };

        let bindings = layout.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 32);

        let attributes = layout.attributes();
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[2].location, 2);
        assert_eq!(attributes[2].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[2].offset, 24);
    }

    #[test]
    fn test_offscreen_pass_ends_sampled() {
        let desc = RenderPassDesc::offscreen(vk::Format::R16G16B16A16_SFLOAT, None);
        assert!(desc.samples_color_afterwards());
        let desc = RenderPassDesc::present(vk::Format::B8G8R8A8_SRGB, vk::Format::D32_SFLOAT);
        assert!(!desc.samples_color_afterwards());
    }
}
