//! Texture requests: resolve them through a provider, evict what nobody uses

use anyhow::{Context, Result};
use bevy_ecs::prelude::*;
use std::sync::Arc;

use crate::texture::{Texture, TextureCache, TextureKey};

use super::components::{TextureHandle, TextureRequest, TextureSourceDesc};

/// Something that turns texture descriptions into shared textures.
/// `TextureCache` is the GPU implementation.
pub trait TextureProvider: Send + Sync + 'static {
    type Texture: Send + Sync + 'static;

    fn provide(&mut self, source: &TextureSourceDesc) -> Result<Arc<Self::Texture>>;

    /// Evict textures nobody holds; returns how many went away
    fn collect_unused(&mut self) -> usize;
}

#[derive(Resource)]
pub struct TextureProviderRes<P: TextureProvider>(pub P);

/// Entities whose `TextureHandle` was (re)created since the last drain
#[derive(Resource, Debug, Default)]
pub struct ResolvedTextures {
    pub entities: Vec<Entity>,
}

impl ResolvedTextures {
    pub fn drain(&mut self) -> Vec<Entity> {
        std::mem::take(&mut self.entities)
    }
}

/// Swap each `TextureRequest` for a `TextureHandle`. Failed requests stay
/// and are retried next run.
pub fn resolve_texture_requests<P: TextureProvider>(
    mut commands: Commands,
    mut provider: ResMut<TextureProviderRes<P>>,
    mut resolved: ResMut<ResolvedTextures>,
    requests: Query<(Entity, &TextureRequest)>,
) {
    for (entity, request) in &requests {
        match provider.0.provide(&request.source) {
            Ok(texture) => {
                commands
                    .entity(entity)
                    .insert(TextureHandle::<P::Texture> {
                        texture,
                        source: request.source.clone(),
                    })
                    .remove::<TextureRequest>();
                resolved.entities.push(entity);
            }
            Err(e) => {
                log::warn!("Texture {:?} for {:?} failed: {:#}", request.source, entity, e);
            }
        }
    }
}

pub fn collect_unused_textures<P: TextureProvider>(mut provider: ResMut<TextureProviderRes<P>>) {
    let evicted = provider.0.collect_unused();
    if evicted > 0 {
        log::debug!("Evicted {} unused textures", evicted);
    }
}

/// Turn handles matching `stale` back into requests so they get resolved
/// again (after a hot reload replaced the cached texture)
pub fn invalidate_textures<T, F>(world: &mut World, mut stale: F) -> usize
where
    T: Send + Sync + 'static,
    F: FnMut(&TextureSourceDesc) -> bool,
{
    let mut query = world.query::<(Entity, &TextureHandle<T>)>();
    let invalidated: Vec<(Entity, TextureSourceDesc)> = query
        .iter(world)
        .filter(|(_, handle)| stale(&handle.source))
        .map(|(entity, handle)| (entity, handle.source.clone()))
        .collect();

    for (entity, source) in &invalidated {
        world
            .entity_mut(*entity)
            .remove::<TextureHandle<T>>()
            .insert(TextureRequest::new(source.clone()));
    }
    invalidated.len()
}

/// Cache key a source resolves to
pub fn texture_key(cache: &TextureCache, source: &TextureSourceDesc) -> TextureKey {
    match source {
        TextureSourceDesc::File(path) => TextureKey::File(cache.resolve(path)),
        TextureSourceDesc::Cubemap(faces) => {
            TextureKey::Cubemap(faces.clone().map(|face| cache.resolve(&face)))
        }
        TextureSourceDesc::Procedural(procedural) => TextureKey::Procedural(*procedural),
        TextureSourceDesc::Named(name) => TextureKey::Named(name.clone()),
    }
}

impl TextureProvider for TextureCache {
    type Texture = Texture;

    fn provide(&mut self, source: &TextureSourceDesc) -> Result<Arc<Texture>> {
        match source {
            TextureSourceDesc::File(path) => self.load_2d(path),
            TextureSourceDesc::Cubemap(faces) => self.load_cubemap(faces),
            TextureSourceDesc::Procedural(procedural) => self.load_procedural(*procedural),
            TextureSourceDesc::Named(name) => self
                .get_named(name)
                .with_context(|| format!("No texture registered as '{}'", name)),
        }
    }

    fn collect_unused(&mut self) -> usize {
        TextureCache::collect_unused(self).len()
    }
}
