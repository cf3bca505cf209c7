// Scene - bevy_ecs components and the systems that feed the renderer
//
// Per frame:
//   apply_spin -> resolve_texture_requests -> collect_unused_textures -> build_draw_list
//
// The renderer then drains `ResolvedTextures` to (re)bind materials and
// records `DrawList` pass by pass.

pub mod components;
pub mod draw_list;
pub mod textures;

pub use components::{
    Camera, MaterialRef, MeshRenderer, RenderPasses, SceneEnvironment, Spin, TextureHandle,
    TextureRequest, TextureSourceDesc, Transform,
};
pub use draw_list::{
    apply_spin, build_draw_list, ActiveScene, CameraView, DrawItem, DrawList, FrameTime,
    SurfaceAspect,
};
pub use textures::{
    collect_unused_textures, invalidate_textures, resolve_texture_requests, texture_key,
    ResolvedTextures, TextureProvider, TextureProviderRes,
};

use bevy_ecs::prelude::*;

/// Insert every resource the render systems read, with `provider` as the
/// texture source
pub fn init_render_resources<P: TextureProvider>(world: &mut World, provider: P) {
    world.insert_resource(TextureProviderRes(provider));
    world.init_resource::<ResolvedTextures>();
    world.init_resource::<DrawList>();
    world.init_resource::<ActiveScene>();
    world.init_resource::<SurfaceAspect>();
    world.init_resource::<FrameTime>();
}

pub fn register_render_systems<P: TextureProvider>(schedule: &mut Schedule) {
    schedule.add_systems(
        (
            apply_spin,
            resolve_texture_requests::<P>,
            collect_unused_textures::<P>,
            build_draw_list,
        )
            .chain(),
    );
}
