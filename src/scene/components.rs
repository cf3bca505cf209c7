//! ECS components describing what to draw and how

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};
use std::path::PathBuf;
use std::sync::Arc;

use crate::material::{MaterialKind, MaterialKindId, RenderPassId, RenderPassMask, SceneId};
use crate::mesh::MeshId;
use crate::texture::Procedural;

/// Transform component for positioning objects in 3D space
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Turn so that local -Z points at `target`
    pub fn looking_at(mut self, target: Vec3, up: Vec3) -> Self {
        let view = Mat4::look_at_rh(self.position, target, up);
        self.rotation = Quat::from_mat4(&view.inverse());
        self
    }

    /// Model matrix
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Local -Z in world space
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }
}

#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRenderer {
    pub mesh: MeshId,
}

/// Which material draws the entity, and with which scene's bindings.
/// `scene: None` follows `ActiveScene`.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialRef {
    pub kind: MaterialKindId,
    pub scene: Option<SceneId>,
}

impl MaterialRef {
    pub fn of<M: MaterialKind>() -> Self {
        Self {
            kind: M::kind_id(),
            scene: None,
        }
    }

    pub fn pinned(mut self, scene: SceneId) -> Self {
        self.scene = Some(scene);
        self
    }
}

/// Passes the entity is drawn in; entities without it draw in the main pass
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPasses(pub RenderPassMask);

impl Default for RenderPasses {
    fn default() -> Self {
        Self(RenderPassMask::only(RenderPassId::MAIN))
    }
}

/// Where a texture comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureSourceDesc {
    File(PathBuf),
    /// Faces in +X, -X, +Y, -Y, +Z, -Z order
    Cubemap([PathBuf; 6]),
    Procedural(Procedural),
    /// Registered by name (render targets)
    Named(String),
}

/// Ask for a texture; replaced by `TextureHandle` once it is loaded
#[derive(Component, Debug, Clone, PartialEq)]
pub struct TextureRequest {
    pub source: TextureSourceDesc,
}

impl TextureRequest {
    pub fn new(source: TextureSourceDesc) -> Self {
        Self { source }
    }
}

/// A loaded texture shared with the cache. Generic so systems can be tested
/// without a GPU.
#[derive(Component, Debug)]
pub struct TextureHandle<T: Send + Sync + 'static> {
    pub texture: Arc<T>,
    pub source: TextureSourceDesc,
}

impl<T: Send + Sync + 'static> Clone for TextureHandle<T> {
    fn clone(&self) -> Self {
        Self {
            texture: self.texture.clone(),
            source: self.source.clone(),
        }
    }
}

/// Marks the entity carrying a scene's environment cubemap request
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneEnvironment(pub SceneId);

#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Vertical field of view in radians
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
    /// Pass this camera renders
    pub pass: RenderPassId,
    /// `None` follows the window
    pub aspect: Option<f32>,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            fov_y: 60f32.to_radians(),
            near: 0.1,
            far: 100.0,
            pass: RenderPassId::MAIN,
            aspect: None,
        }
    }
}

impl Camera {
    /// Right handed, depth 0..1, Y flipped for Vulkan clip space
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y, aspect.max(1e-4), self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn view(transform: &Transform) -> Mat4 {
        Mat4::from_rotation_translation(transform.rotation, transform.position).inverse()
    }

    pub fn view_proj(&self, transform: &Transform, aspect: f32) -> Mat4 {
        self.projection(aspect) * Self::view(transform)
    }

    /// View-projection without translation, for geometry at infinity
    pub fn sky_view_proj(&self, transform: &Transform, aspect: f32) -> Mat4 {
        self.projection(aspect) * Mat4::from_quat(transform.rotation.inverse())
    }
}

/// Constant rotation, applied by `apply_spin`
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Spin {
    pub axis: Vec3,
    pub radians_per_second: f32,
}
