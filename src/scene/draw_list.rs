//! Flatten the world into sorted draw items, one per (entity, pass)

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};
use std::collections::BTreeMap;

use crate::material::{MaterialKindId, RenderPassId, SceneId};
use crate::mesh::MeshId;

use super::components::{Camera, MaterialRef, MeshRenderer, RenderPasses, Spin, Transform};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    pub pass: RenderPassId,
    pub material: MaterialKindId,
    pub scene: SceneId,
    pub mesh: MeshId,
    pub model: Mat4,
    pub entity: Entity,
}

impl DrawItem {
    fn sort_key(&self) -> (RenderPassId, MaterialKindId, SceneId, MeshId, Entity) {
        (self.pass, self.material, self.scene, self.mesh, self.entity)
    }
}

/// Camera matrices for one pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraView {
    pub view_proj: Mat4,
    pub sky_view_proj: Mat4,
    pub position: Vec3,
}

#[derive(Resource, Debug, Default)]
pub struct DrawList {
    /// Sorted by pass, material, scene, mesh
    pub items: Vec<DrawItem>,
    pub views: BTreeMap<RenderPassId, CameraView>,
}

impl DrawList {
    pub fn pass_items(&self, pass: RenderPassId) -> impl Iterator<Item = &DrawItem> {
        self.items.iter().filter(move |item| item.pass == pass)
    }
}

/// Scene used by entities whose `MaterialRef` is not pinned
#[derive(Resource, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveScene(pub SceneId);

/// Width / height of the window, for cameras without a fixed aspect
#[derive(Resource, Debug, Clone, Copy, PartialEq)]
pub struct SurfaceAspect(pub f32);

impl Default for SurfaceAspect {
    fn default() -> Self {
        Self(16.0 / 9.0)
    }
}

#[derive(Resource, Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameTime {
    pub delta_seconds: f32,
}

pub fn apply_spin(time: Res<FrameTime>, mut spinning: Query<(&mut Transform, &Spin)>) {
    for (mut transform, spin) in &mut spinning {
        let axis = spin.axis.normalize_or_zero();
        if axis == Vec3::ZERO {
            continue;
        }
        let step = Quat::from_axis_angle(axis, spin.radians_per_second * time.delta_seconds);
        transform.rotation = (step * transform.rotation).normalize();
    }
}

pub fn build_draw_list(
    mut draw_list: ResMut<DrawList>,
    active: Res<ActiveScene>,
    aspect: Res<SurfaceAspect>,
    cameras: Query<(Entity, &Camera, &Transform)>,
    renderables: Query<(Entity, &Transform, &MeshRenderer, &MaterialRef, Option<&RenderPasses>)>,
) {
    let draw_list = &mut *draw_list;
    draw_list.items.clear();
    draw_list.views.clear();

    for (entity, camera, transform) in &cameras {
        let aspect = camera.aspect.unwrap_or(aspect.0);
        let view = CameraView {
            view_proj: camera.view_proj(transform, aspect),
            sky_view_proj: camera.sky_view_proj(transform, aspect),
            position: transform.position,
        };
        if draw_list.views.insert(camera.pass, view).is_some() {
            log::warn!("Several cameras render {:?}; using {:?}", camera.pass, entity);
        }
    }

    for (entity, transform, renderer, material, passes) in &renderables {
        let mask = passes.copied().unwrap_or_default().0;
        for pass in mask.iter() {
            if !draw_list.views.contains_key(&pass) {
                continue;
            }
            draw_list.items.push(DrawItem {
                pass,
                material: material.kind,
                scene: material.scene.unwrap_or(active.0),
                mesh: renderer.mesh,
                model: transform.matrix(),
                entity,
            });
        }
    }

    draw_list.items.sort_by_key(DrawItem::sort_key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{
        CubemapReflectionMaterial, MaterialKind, RenderPassMask, SkyboxMaterial, TexturedMaterial,
    };
    use crate::scene::components::MaterialRef;

    fn world() -> World {
        let mut world = World::new();
        world.init_resource::<DrawList>();
        world.init_resource::<ActiveScene>();
        world.init_resource::<SurfaceAspect>();
        world.init_resource::<FrameTime>();
        world
    }

    fn run(world: &mut World) {
        let mut schedule = Schedule::default();
        schedule.add_systems((apply_spin, build_draw_list).chain());
        schedule.run(world);
    }

    fn spawn_camera(world: &mut World, pass: RenderPassId) -> Entity {
        world
            .spawn((
                Camera {
                    pass,
                    ..Default::default()
                },
                Transform::from_position(Vec3::new(0.0, 0.0, 5.0)),
            ))
            .id()
    }

    #[test]
    fn test_items_sorted_and_split_per_pass() {
        let mut world = world();
        spawn_camera(&mut world, RenderPassId::MAIN);
        spawn_camera(&mut world, RenderPassId::REFLECTION_CAPTURE);

        let both = RenderPasses(
            RenderPassMask::only(RenderPassId::MAIN).with(RenderPassId::REFLECTION_CAPTURE),
        );
        world.spawn((
            Transform::default(),
            MeshRenderer { mesh: MeshId(1) },
            MaterialRef::of::<TexturedMaterial>(),
        ));
        world.spawn((
            Transform::default(),
            MeshRenderer { mesh: MeshId(0) },
            MaterialRef::of::<SkyboxMaterial>(),
            both,
        ));
        world.spawn((
            Transform::default(),
            MeshRenderer { mesh: MeshId(2) },
            MaterialRef::of::<CubemapReflectionMaterial>(),
            both,
        ));

        run(&mut world);

        let list = world.resource::<DrawList>();
        assert_eq!(list.items.len(), 5);
        assert_eq!(list.views.len(), 2);

        let main: Vec<&str> = list.pass_items(RenderPassId::MAIN).map(|i| i.material.0).collect();
        assert_eq!(
            main,
            vec![CubemapReflectionMaterial::NAME, SkyboxMaterial::NAME, TexturedMaterial::NAME]
        );
        let capture: Vec<&str> = list
            .pass_items(RenderPassId::REFLECTION_CAPTURE)
            .map(|i| i.material.0)
            .collect();
        assert_eq!(capture, vec![CubemapReflectionMaterial::NAME, SkyboxMaterial::NAME]);
        // Pass is the outermost sort key
        assert!(list.items.windows(2).all(|w| w[0].pass <= w[1].pass));
    }

    #[test]
    fn test_passes_without_camera_are_skipped() {
        let mut world = world();
        spawn_camera(&mut world, RenderPassId::MAIN);
        world.spawn((
            Transform::default(),
            MeshRenderer { mesh: MeshId(0) },
            MaterialRef::of::<SkyboxMaterial>(),
            RenderPasses(RenderPassMask::only(RenderPassId::REFLECTION_CAPTURE)),
        ));

        run(&mut world);
        assert!(world.resource::<DrawList>().items.is_empty());
    }

    #[test]
    fn test_scene_follows_active_unless_pinned() {
        let mut world = world();
        spawn_camera(&mut world, RenderPassId::MAIN);
        let follower = world
            .spawn((
                Transform::default(),
                MeshRenderer { mesh: MeshId(0) },
                MaterialRef::of::<TexturedMaterial>(),
            ))
            .id();
        let pinned = world
            .spawn((
                Transform::default(),
                MeshRenderer { mesh: MeshId(0) },
                MaterialRef::of::<TexturedMaterial>().pinned(SceneId(9)),
            ))
            .id();

        world.insert_resource(ActiveScene(SceneId(2)));
        run(&mut world);

        let list = world.resource::<DrawList>();
        let scene_of = |e: Entity| list.items.iter().find(|i| i.entity == e).map(|i| i.scene);
        assert_eq!(scene_of(follower), Some(SceneId(2)));
        assert_eq!(scene_of(pinned), Some(SceneId(9)));
    }

    #[test]
    fn test_model_matrix_and_spin() {
        let mut world = world();
        spawn_camera(&mut world, RenderPassId::MAIN);
        world.insert_resource(FrameTime { delta_seconds: 0.5 });
        let entity = world
            .spawn((
                Transform::from_position(Vec3::new(1.0, 0.0, 0.0)),
                MeshRenderer { mesh: MeshId(0) },
                MaterialRef::of::<TexturedMaterial>(),
                Spin {
                    axis: Vec3::Y,
                    radians_per_second: std::f32::consts::PI,
                },
            ))
            .id();

        run(&mut world);

        let rotation = world.get::<Transform>(entity).unwrap().rotation;
        let turned = rotation * Vec3::X;
        // A quarter turn about +Y takes +X to -Z
        assert!((turned - Vec3::NEG_Z).length() < 1e-4);

        let item = world.resource::<DrawList>().items[0];
        assert!((item.model.w_axis.truncate() - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
    }
}
