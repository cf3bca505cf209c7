// Materials - descriptor layouts, per-scene sets, per-pass pipelines
//
// A material kind only declares what differs (binding table, shaders,
// fixed-function state per pass, which textures go where). `Material<M>`
// owns the Vulkan objects and the bookkeeping shared by every kind.

pub mod kinds;
pub mod layout;
pub mod pipelines;
pub mod scene_sets;

pub use kinds::{
    CubemapReflectionMaterial, ReflectionBindings, ReflectionUniform, SkyboxBindings,
    SkyboxMaterial, SkyboxUniform, TexturedBindings, TexturedMaterial, TexturedUniform,
};
pub use layout::{DescriptorBinding, DescriptorKind, DescriptorTable};
pub use pipelines::{MaterialPipeline, PipelineVariants, RenderPassId, RenderPassMask};
pub use scene_sets::{SceneDescriptorSets, SceneId};

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use crate::backend::pipeline::{create_graphics_pipeline, GraphicsPipelineDesc};
use crate::backend::shader::ShaderPair;
use crate::backend::{GpuBuffer, VulkanDevice};
use crate::mesh::GpuMesh;

/// Name-based id so draw items can be sorted and dispatched per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaterialKindId(pub &'static str);

/// Push constants shared by every material (exactly 128 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DrawPush {
    pub mvp: [[f32; 4]; 4],
    /// Top three rows of the model matrix
    pub model_rows: [[f32; 4]; 3],
    pub camera_position: [f32; 4],
}

impl DrawPush {
    pub fn new(view_proj: Mat4, model: Mat4, camera_position: Vec3) -> Self {
        Self {
            mvp: (view_proj * model).to_cols_array_2d(),
            model_rows: [
                model.row(0).to_array(),
                model.row(1).to_array(),
                model.row(2).to_array(),
            ],
            camera_position: camera_position.extend(1.0).to_array(),
        }
    }
}

pub trait MaterialKind: Send + Sync + 'static {
    const NAME: &'static str;
    const VERTEX_SHADER: &'static str;
    const FRAGMENT_SHADER: &'static str;
    const UNIFORM_BINDING: u32;

    type Uniform: Pod;
    /// Textures referenced by a scene's descriptor set; kept alive with it
    type Bindings: Clone + Send + Sync;

    fn descriptor_table() -> DescriptorTable;

    /// `None` when the material does not draw in `pass`
    fn pipeline_desc(pass: RenderPassId) -> Option<GraphicsPipelineDesc>;

    /// Image descriptors per binding slot
    fn image_descriptors(bindings: &Self::Bindings) -> Result<Vec<(u32, vk::DescriptorImageInfo)>>;

    fn kind_id() -> MaterialKindId {
        MaterialKindId(Self::NAME)
    }
}

struct SceneBinding<M: MaterialKind> {
    set: vk::DescriptorSet,
    uniform: GpuBuffer,
    bindings: M::Bindings,
}

pub struct Material<M: MaterialKind> {
    device: Arc<VulkanDevice>,
    set_layout: vk::DescriptorSetLayout,
    shaders: Option<ShaderPair>,
    variants: PipelineVariants<MaterialPipeline>,
    scene_sets: SceneDescriptorSets,
    scenes: HashMap<SceneId, SceneBinding<M>>,
    _kind: PhantomData<M>,
}

impl<M: MaterialKind> Material<M> {
    pub fn new(device: &Arc<VulkanDevice>, shader_dir: &Path) -> Result<Self> {
        let set_layout = layout::create_set_layout(device, M::descriptor_table())
            .with_context(|| format!("{} set layout", M::NAME))?;
        let shaders = match ShaderPair::load(device, shader_dir, M::VERTEX_SHADER, M::FRAGMENT_SHADER) {
            Ok(shaders) => shaders,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e).with_context(|| format!("{} shaders", M::NAME));
            }
        };

        log::info!("Created material {}", M::NAME);

        Ok(Self {
            device: device.clone(),
            set_layout,
            shaders: Some(shaders),
            variants: PipelineVariants::new(),
            scene_sets: SceneDescriptorSets::new(M::descriptor_table(), set_layout, 1),
            scenes: HashMap::new(),
            _kind: PhantomData,
        })
    }

    /// Pipeline for `pass`, built on first use against `render_pass`
    pub fn pipeline_for(
        &mut self,
        pass: RenderPassId,
        render_pass: vk::RenderPass,
    ) -> Result<Option<MaterialPipeline>> {
        let Some(mut desc) = M::pipeline_desc(pass) else {
            return Ok(None);
        };
        if let Some(pipeline) = self.variants.get(pass) {
            return Ok(Some(*pipeline));
        }

        let shaders = self.shaders.as_ref().context("Material already destroyed")?;
        desc.set_layouts = vec![self.set_layout];
        let device = &self.device;
        let pipeline = self.variants.get_or_try_insert_with(pass, || {
            let (pipeline, layout) =
                create_graphics_pipeline(device, render_pass, shaders.vert, shaders.frag, &desc)?;
            log::debug!("Built {} pipeline for {:?}", M::NAME, pass);
            Ok(MaterialPipeline { pipeline, layout })
        })?;
        Ok(Some(*pipeline))
    }

    /// Create or rewrite the descriptor set of `scene`. Rewriting a set the
    /// GPU may still be reading is the caller's problem (wait idle first).
    pub fn bind_scene(&mut self, scene: SceneId, bindings: &M::Bindings, uniform: &M::Uniform) -> Result<()> {
        let images = M::image_descriptors(bindings)
            .with_context(|| format!("{} bindings for {:?}", M::NAME, scene))?;

        if !self.scenes.contains_key(&scene) {
            // The buffer goes first: a set taken from the scene's pool must
            // always end up in `scenes`
            let uniform_buffer = GpuBuffer::with_data(
                &self.device,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                std::slice::from_ref(uniform),
                &format!("{} uniform {:?}", M::NAME, scene),
            )?;
            let set = self
                .scene_sets
                .allocate(&self.device.device, scene, 1)?
                .first()
                .copied()
                .context("No descriptor set allocated")?;
            self.scenes.insert(
                scene,
                SceneBinding {
                    set,
                    uniform: uniform_buffer,
                    bindings: bindings.clone(),
                },
            );
        }

        let entry = self.scenes.get_mut(&scene).context("Scene binding missing")?;
        entry.bindings = bindings.clone();
        entry.uniform.write(std::slice::from_ref(uniform))?;

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: entry.uniform.buffer,
            offset: 0,
            range: std::mem::size_of::<M::Uniform>() as vk::DeviceSize,
        }];
        let mut writes = vec![vk::WriteDescriptorSet::default()
            .dst_set(entry.set)
            .dst_binding(M::UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)];
        for (binding, info) in &images {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(entry.set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info)),
            );
        }
        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };

        log::debug!("Bound {} for {:?}", M::NAME, scene);
        Ok(())
    }

    pub fn update_uniform(&mut self, scene: SceneId, uniform: &M::Uniform) -> Result<()> {
        let entry = self
            .scenes
            .get_mut(&scene)
            .with_context(|| format!("{} has no binding for {:?}", M::NAME, scene))?;
        entry.uniform.write(std::slice::from_ref(uniform))
    }

    pub fn bindings(&self, scene: SceneId) -> Option<&M::Bindings> {
        self.scenes.get(&scene).map(|entry| &entry.bindings)
    }

    pub fn is_bound(&self, scene: SceneId) -> bool {
        self.scenes.contains_key(&scene)
    }

    /// Bind pipeline + set, push constants, draw. Returns false when the
    /// material skips this pass or the scene was never bound.
    pub fn record_draw(
        &mut self,
        cmd: vk::CommandBuffer,
        pass: RenderPassId,
        render_pass: vk::RenderPass,
        scene: SceneId,
        mesh: &GpuMesh,
        push: &DrawPush,
    ) -> Result<bool> {
        let Some(pipeline) = self.pipeline_for(pass, render_pass)? else {
            return Ok(false);
        };
        let Some(entry) = self.scenes.get(&scene) else {
            log::trace!("{} has no binding for {:?}, skipping draw", M::NAME, scene);
            return Ok(false);
        };

        let device = &self.device.device;
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &[entry.set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                pipeline.layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(push),
            );
        }
        mesh.draw(device, cmd);
        Ok(true)
    }

    /// Free the scene's set, uniform buffer and texture references
    pub fn release_scene(&mut self, scene: SceneId) {
        self.scenes.remove(&scene);
        self.scene_sets.release(&self.device.device, scene);
    }

    /// Drop pipeline variants for passes that no longer exist
    pub fn release_pass(&mut self, pass: RenderPassId) {
        if let Some(pipeline) = self.variants.remove(pass) {
            pipeline.destroy(&self.device.device);
        }
    }

    pub fn destroy(&mut self) {
        let device = &self.device.device;
        for pipeline in self.variants.drain() {
            pipeline.destroy(device);
        }
        self.scenes.clear();
        self.scene_sets.destroy(device);
        if let Some(shaders) = self.shaders.take() {
            shaders.destroy(device);
            unsafe { device.destroy_descriptor_set_layout(self.set_layout, None) };
        }
    }
}

impl<M: MaterialKind> Drop for Material<M> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Object-safe view of a material so the renderer can dispatch by kind
pub trait DrawMaterial {
    fn kind_id(&self) -> MaterialKindId;

    fn record_draw(
        &mut self,
        cmd: vk::CommandBuffer,
        pass: RenderPassId,
        render_pass: vk::RenderPass,
        scene: SceneId,
        mesh: &GpuMesh,
        push: &DrawPush,
    ) -> Result<bool>;
}

impl<M: MaterialKind> DrawMaterial for Material<M> {
    fn kind_id(&self) -> MaterialKindId {
        M::kind_id()
    }

    fn record_draw(
        &mut self,
        cmd: vk::CommandBuffer,
        pass: RenderPassId,
        render_pass: vk::RenderPass,
        scene: SceneId,
        mesh: &GpuMesh,
        push: &DrawPush,
    ) -> Result<bool> {
        Material::record_draw(self, cmd, pass, render_pass, scene, mesh, push)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_block_fits_guaranteed_limit() {
        assert_eq!(std::mem::size_of::<DrawPush>(), 128);
    }

    #[test]
    fn test_push_from_matrices() {
        let model = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let push = DrawPush::new(Mat4::IDENTITY, model, Vec3::new(0.0, 0.0, 5.0));
        assert_eq!(push.mvp, model.to_cols_array_2d());
        // Translation lives in the last column, i.e. the w of each row
        assert_eq!(push.model_rows[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(push.model_rows[2], [0.0, 0.0, 1.0, 3.0]);
        assert_eq!(push.camera_position, [0.0, 0.0, 5.0, 1.0]);
    }

    #[test]
    fn test_kind_ids_order_by_name() {
        assert!(MaterialKindId("reflect") > MaterialKindId("pbr"));
        assert_eq!(SkyboxMaterial::kind_id(), MaterialKindId(SkyboxMaterial::NAME));
    }
}
