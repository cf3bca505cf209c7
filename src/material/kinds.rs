// Material kinds shipped with the viewer

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

use crate::backend::pipeline::GraphicsPipelineDesc;
use crate::mesh::Vertex;
use crate::texture::{Texture, TextureKind};

use super::layout::{DescriptorBinding, DescriptorTable, VERTEX_FRAGMENT};
use super::pipelines::RenderPassId;
use super::MaterialKind;

/// Fail unless `texture` is one of the kinds a binding slot accepts
pub fn expect_kind(actual: TextureKind, accepted: &[TextureKind], slot: &str) -> Result<()> {
    if !accepted.contains(&actual) {
        anyhow::bail!("{} expects one of {:?}, got {:?}", slot, accepted, actual);
    }
    Ok(())
}

// =============================================================================
// CUBEMAP REFLECTION
// =============================================================================

pub struct CubemapReflectionMaterial;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ReflectionUniform {
    pub tint: [f32; 4],
    /// 0 = plain tint, 1 = perfect mirror
    pub reflectivity: f32,
    pub _pad: [f32; 3],
}

impl ReflectionUniform {
    pub fn new(tint: [f32; 4], reflectivity: f32) -> Self {
        Self {
            tint,
            reflectivity: reflectivity.clamp(0.0, 1.0),
            _pad: [0.0; 3],
        }
    }
}

#[derive(Clone)]
pub struct ReflectionBindings {
    pub environment: Arc<Texture>,
}

const REFLECTION_TABLE: DescriptorTable = &[
    DescriptorBinding::uniform(0, VERTEX_FRAGMENT),
    DescriptorBinding::sampler(1, vk::ShaderStageFlags::FRAGMENT),
];

impl MaterialKind for CubemapReflectionMaterial {
    const NAME: &'static str = "cubemap_reflection";
    const VERTEX_SHADER: &'static str = "reflect.vert.spv";
    const FRAGMENT_SHADER: &'static str = "reflect.frag.spv";
    const UNIFORM_BINDING: u32 = 0;

    type Uniform = ReflectionUniform;
    type Bindings = ReflectionBindings;

    fn descriptor_table() -> DescriptorTable {
        REFLECTION_TABLE
    }

    fn pipeline_desc(pass: RenderPassId) -> Option<GraphicsPipelineDesc> {
        match pass {
            RenderPassId::MAIN | RenderPassId::REFLECTION_CAPTURE => {
                Some(GraphicsPipelineDesc::opaque(Vertex::vertex_layout()))
            }
            _ => None,
        }
    }

    fn image_descriptors(bindings: &Self::Bindings) -> Result<Vec<(u32, vk::DescriptorImageInfo)>> {
        expect_kind(bindings.environment.kind(), &[TextureKind::Cubemap], "environment")?;
        Ok(vec![(1, bindings.environment.descriptor_info())])
    }
}

// =============================================================================
// TEXTURED
// =============================================================================

pub struct TexturedMaterial;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TexturedUniform {
    pub tint: [f32; 4],
    pub uv_scale: [f32; 2],
    pub _pad: [f32; 2],
}

impl Default for TexturedUniform {
    fn default() -> Self {
        Self {
            tint: [1.0; 4],
            uv_scale: [1.0, 1.0],
            _pad: [0.0; 2],
        }
    }
}

#[derive(Clone)]
pub struct TexturedBindings {
    pub albedo: Arc<Texture>,
}

const TEXTURED_TABLE: DescriptorTable = &[
    DescriptorBinding::uniform(0, VERTEX_FRAGMENT),
    DescriptorBinding::sampler(1, vk::ShaderStageFlags::FRAGMENT),
];

impl MaterialKind for TexturedMaterial {
    const NAME: &'static str = "textured";
    const VERTEX_SHADER: &'static str = "textured.vert.spv";
    const FRAGMENT_SHADER: &'static str = "textured.frag.spv";
    const UNIFORM_BINDING: u32 = 0;

    type Uniform = TexturedUniform;
    type Bindings = TexturedBindings;

    fn descriptor_table() -> DescriptorTable {
        TEXTURED_TABLE
    }

    fn pipeline_desc(pass: RenderPassId) -> Option<GraphicsPipelineDesc> {
        (pass == RenderPassId::MAIN).then(|| GraphicsPipelineDesc::opaque(Vertex::vertex_layout()))
    }

    fn image_descriptors(bindings: &Self::Bindings) -> Result<Vec<(u32, vk::DescriptorImageInfo)>> {
        // Sampled render targets work as albedo too
        expect_kind(
            bindings.albedo.kind(),
            &[TextureKind::Texture2D, TextureKind::RenderTarget],
            "albedo",
        )?;
        if bindings.albedo.sampler().is_none() {
            anyhow::bail!("albedo render target was created without a sampler");
        }
        Ok(vec![(1, bindings.albedo.descriptor_info())])
    }
}

// =============================================================================
// SKYBOX
// =============================================================================

pub struct SkyboxMaterial;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SkyboxUniform {
    pub exposure: f32,
    pub _pad: [f32; 3],
}

impl Default for SkyboxUniform {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            _pad: [0.0; 3],
        }
    }
}

#[derive(Clone)]
pub struct SkyboxBindings {
    pub environment: Arc<Texture>,
}

const SKYBOX_TABLE: DescriptorTable = &[
    DescriptorBinding::sampler(0, vk::ShaderStageFlags::FRAGMENT),
    DescriptorBinding::uniform(1, vk::ShaderStageFlags::FRAGMENT),
];

/// Drawn inside the cube at the far plane: cull front faces, test but
/// never write depth
pub fn skybox_pipeline_desc() -> GraphicsPipelineDesc {
    GraphicsPipelineDesc {
        cull_mode: vk::CullModeFlags::FRONT,
        depth_write: false,
        depth_compare: vk::CompareOp::LESS_OR_EQUAL,
        ..GraphicsPipelineDesc::opaque(Vertex::vertex_layout())
    }
}

impl MaterialKind for SkyboxMaterial {
    const NAME: &'static str = "skybox";
    const VERTEX_SHADER: &'static str = "skybox.vert.spv";
    const FRAGMENT_SHADER: &'static str = "skybox.frag.spv";
    const UNIFORM_BINDING: u32 = 1;

    type Uniform = SkyboxUniform;
    type Bindings = SkyboxBindings;

    fn descriptor_table() -> DescriptorTable {
        SKYBOX_TABLE
    }

    fn pipeline_desc(pass: RenderPassId) -> Option<GraphicsPipelineDesc> {
        match pass {
            RenderPassId::MAIN | RenderPassId::REFLECTION_CAPTURE => Some(skybox_pipeline_desc()),
            _ => None,
        }
    }

    fn image_descriptors(bindings: &Self::Bindings) -> Result<Vec<(u32, vk::DescriptorImageInfo)>> {
        expect_kind(bindings.environment.kind(), &[TextureKind::Cubemap], "skybox")?;
        Ok(vec![(0, bindings.environment.descriptor_info())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_slot<M: MaterialKind>() -> Option<DescriptorBinding> {
        M::descriptor_table()
            .iter()
            .copied()
            .find(|b| b.binding == M::UNIFORM_BINDING)
    }

    #[test]
    fn test_uniform_binding_is_declared() {
        use super::super::layout::DescriptorKind;
        for slot in [
            uniform_slot::<CubemapReflectionMaterial>(),
            uniform_slot::<TexturedMaterial>(),
            uniform_slot::<SkyboxMaterial>(),
        ] {
            assert_eq!(slot.map(|b| b.kind), Some(DescriptorKind::UniformBuffer));
        }
    }

    #[test]
    fn test_pass_coverage() {
        let capture = RenderPassId::REFLECTION_CAPTURE;
        assert!(CubemapReflectionMaterial::pipeline_desc(RenderPassId::MAIN).is_some());
        assert!(CubemapReflectionMaterial::pipeline_desc(capture).is_some());
        assert!(TexturedMaterial::pipeline_desc(RenderPassId::MAIN).is_some());
        assert!(TexturedMaterial::pipeline_desc(capture).is_none());
        assert!(SkyboxMaterial::pipeline_desc(RenderPassId(7)).is_none());
    }

    #[test]
    fn test_skybox_state() {
        let desc = SkyboxMaterial::pipeline_desc(RenderPassId::MAIN).unwrap();
        assert_eq!(desc.cull_mode, vk::CullModeFlags::FRONT);
        assert!(desc.depth_test);
        assert!(!desc.depth_write);
        assert_eq!(desc.depth_compare, vk::CompareOp::LESS_OR_EQUAL);
    }

    #[test]
    fn test_uniform_layouts_are_vec4_aligned() {
        assert_eq!(std::mem::size_of::<ReflectionUniform>() % 16, 0);
        assert_eq!(std::mem::size_of::<TexturedUniform>() % 16, 0);
        assert_eq!(std::mem::size_of::<SkyboxUniform>() % 16, 0);
        assert_eq!(ReflectionUniform::new([1.0; 4], 3.0).reflectivity, 1.0);
    }

    #[test]
    fn test_expect_kind() {
        assert!(expect_kind(TextureKind::Cubemap, &[TextureKind::Cubemap], "env").is_ok());
        let err = expect_kind(TextureKind::Texture3D, &[TextureKind::Cubemap], "env").unwrap_err();
        assert!(err.to_string().contains("env"));
    }
}
