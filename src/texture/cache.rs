// Reference counted asset sharing
//
// The cache holds one `Arc` per asset. Anyone else holding a clone counts as
// a user; entries nobody uses are evicted by `collect_unused`.

use anyhow::Result;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::VulkanDevice;
use crate::config::TexturesConfig;

use super::gpu_texture::{Texture, TextureKind, TextureOptions};
use super::source::{Procedural, TextureData};

pub struct AssetCache<K, V> {
    entries: HashMap<K, Arc<V>>,
}

impl<K, V> Default for AssetCache<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug, V> AssetCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).cloned()
    }

    /// Return the cached value, loading it on first request.
    /// A failed load caches nothing.
    pub fn get_or_insert_with<F>(&mut self, key: K, load: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.entries.get(&key) {
            return Ok(value.clone());
        }
        let value = Arc::new(load()?);
        log::debug!("Cached {:?}", key);
        self.entries.insert(key, value.clone());
        Ok(value)
    }

    pub fn insert(&mut self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.entries.insert(key, value.clone());
        value
    }

    /// Swap in a new value; existing holders keep the old one until they drop it
    pub fn replace(&mut self, key: K, value: V) -> Option<Arc<V>> {
        self.entries.insert(key, Arc::new(value))
    }

    /// Rebuild `keys` one by one. `build` returning `Ok(None)` leaves the
    /// entry alone; a failure keeps the old value and moves on. Returns the
    /// replaced keys and the failures.
    pub fn rebuild<F>(&mut self, keys: Vec<K>, mut build: F) -> (Vec<K>, Vec<(K, anyhow::Error)>)
    where
        F: FnMut(&K) -> Result<Option<V>>,
    {
        let mut replaced = Vec::new();
        let mut failed = Vec::new();
        for key in keys {
            match build(&key) {
                Ok(Some(value)) => {
                    self.replace(key.clone(), value);
                    replaced.push(key);
                }
                Ok(None) => {}
                Err(e) => failed.push((key, e)),
            }
        }
        (replaced, failed)
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        self.entries.remove(key)
    }

    /// Holders outside the cache, `None` if the key is not cached
    pub fn ref_count(&self, key: &K) -> Option<usize> {
        self.entries.get(key).map(|value| Arc::strong_count(value) - 1)
    }

    /// Drop every entry only the cache still holds; returns their keys
    pub fn collect_unused(&mut self) -> Vec<K> {
        let unused: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, value)| Arc::strong_count(value) == 1)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &unused {
            self.entries.remove(key);
            log::debug!("Evicted {:?}", key);
        }
        unused
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureKey {
    File(PathBuf),
    /// Faces in +X, -X, +Y, -Y, +Z, -Z order
    Cubemap([PathBuf; 6]),
    Procedural(Procedural),
    Named(String),
}

impl TextureKey {
    /// True when `path` is one of the files this texture was built from
    pub fn depends_on(&self, path: &Path) -> bool {
        match self {
            TextureKey::File(file) => same_file(file, path),
            TextureKey::Cubemap(faces) => faces.iter().any(|face| same_file(face, path)),
            TextureKey::Procedural(_) | TextureKey::Named(_) => false,
        }
    }
}

// Also matches a sibling with another extension, which `resolve_path` may
// have substituted for the requested file
fn same_file(requested: &Path, changed: &Path) -> bool {
    requested == changed || requested.with_extension("") == changed.with_extension("")
}

fn procedural_kind(procedural: &Procedural) -> TextureKind {
    match procedural {
        Procedural::Checkerboard { .. } | Procedural::Solid { .. } => TextureKind::Texture2D,
        Procedural::SolidCubemap { .. } => TextureKind::Cubemap,
        Procedural::GradientVolume { .. } => TextureKind::Texture3D,
    }
}

/// GPU textures shared by path, face set, or name
pub struct TextureCache {
    cache: AssetCache<TextureKey, Texture>,
    device: Arc<VulkanDevice>,
    options: TextureOptions,
    asset_root: PathBuf,
}

impl TextureCache {
    pub fn new(device: Arc<VulkanDevice>, config: &TexturesConfig) -> Self {
        Self {
            cache: AssetCache::new(),
            device,
            options: TextureOptions::from(config),
            asset_root: config.asset_root.clone(),
        }
    }

    /// Relative paths are taken from the asset root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.asset_root.join(path)
        }
    }

    /// 2D texture from a file; a missing or broken file yields the fallback
    pub fn load_2d(&mut self, path: &Path) -> Result<Arc<Texture>> {
        let path = self.resolve(path);
        let (device, options) = (&self.device, &self.options);
        self.cache.get_or_insert_with(TextureKey::File(path.clone()), || {
            let data = TextureData::load_or_fallback(&path, options.fallback);
            Texture::from_data(device, &data, TextureKind::Texture2D, options)
        })
    }

    pub fn load_cubemap(&mut self, faces: &[PathBuf; 6]) -> Result<Arc<Texture>> {
        let faces = faces.clone().map(|face| self.resolve(&face));
        let (device, options) = (&self.device, &self.options);
        self.cache.get_or_insert_with(TextureKey::Cubemap(faces.clone()), || {
            let data = TextureData::load_cubemap_or_fallback(&faces, options.fallback);
            Texture::from_data(device, &data, TextureKind::Cubemap, options)
        })
    }

    pub fn load_procedural(&mut self, procedural: Procedural) -> Result<Arc<Texture>> {
        let (device, options) = (&self.device, &self.options);
        self.cache.get_or_insert_with(TextureKey::Procedural(procedural), || {
            let data = procedural.generate();
            Texture::from_data(device, &data, procedural_kind(&procedural), options)
        })
    }

    /// Register a texture built elsewhere (render targets, generated data)
    pub fn insert_named(&mut self, name: &str, texture: Texture) -> Arc<Texture> {
        self.cache.insert(TextureKey::Named(name.to_string()), texture)
    }

    pub fn get_named(&self, name: &str) -> Option<Arc<Texture>> {
        self.cache.get(&TextureKey::Named(name.to_string()))
    }

    /// Rebuild every cached texture that depends on `path`. Returns the keys
    /// that were replaced; their old textures live on in existing holders.
    /// Keys that fail to rebuild keep their old texture and are logged.
    /// The caller must make sure the GPU is done with the old ones.
    pub fn reload(&mut self, path: &Path) -> Vec<TextureKey> {
        let affected: Vec<TextureKey> = self
            .cache
            .keys()
            .filter(|key| key.depends_on(path))
            .cloned()
            .collect();

        let (device, options) = (&self.device, &self.options);
        let (replaced, failed) = self.cache.rebuild(affected, |key| match key {
            TextureKey::File(file) => {
                let data = TextureData::load_or_fallback(file, options.fallback);
                Texture::from_data(device, &data, TextureKind::Texture2D, options).map(Some)
            }
            TextureKey::Cubemap(faces) => {
                let data = TextureData::load_cubemap_or_fallback(faces, options.fallback);
                Texture::from_data(device, &data, TextureKind::Cubemap, options).map(Some)
            }
            TextureKey::Procedural(_) | TextureKey::Named(_) => Ok(None),
        });

        for key in &replaced {
            log::info!("Reloaded {:?}", key);
        }
        for (key, e) in &failed {
            log::warn!("Reload of {:?} failed, keeping the old texture: {:#}", key, e);
        }
        replaced
    }

    pub fn ref_count(&self, key: &TextureKey) -> Option<usize> {
        self.cache.ref_count(key)
    }

    pub fn collect_unused(&mut self) -> Vec<TextureKey> {
        self.cache.collect_unused()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_once() {
        let mut cache: AssetCache<&str, u32> = AssetCache::new();
        let mut loads = 0;
        let a = cache
            .get_or_insert_with("a", || {
                loads += 1;
                Ok(7)
            })
            .unwrap();
        let b = cache
            .get_or_insert_with("a", || {
                loads += 1;
                Ok(8)
            })
            .unwrap();
        assert_eq!(loads, 1);
        assert_eq!(*b, 7);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let mut cache: AssetCache<&str, u32> = AssetCache::new();
        assert!(cache
            .get_or_insert_with("bad", || anyhow::bail!("broken"))
            .is_err());
        assert!(!cache.contains(&"bad"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ref_count_tracks_holders() {
        let mut cache: AssetCache<&str, u32> = AssetCache::new();
        assert_eq!(cache.ref_count(&"x"), None);

        let first = cache.insert("x", 1);
        assert_eq!(cache.ref_count(&"x"), Some(1));
        let second = first.clone();
        assert_eq!(cache.ref_count(&"x"), Some(2));
        drop(first);
        drop(second);
        assert_eq!(cache.ref_count(&"x"), Some(0));
    }

    #[test]
    fn test_collect_unused_keeps_held_entries() {
        let mut cache: AssetCache<&str, u32> = AssetCache::new();
        let held = cache.insert("held", 1);
        cache.insert("idle", 2);

        let evicted = cache.collect_unused();
        assert_eq!(evicted, vec!["idle"]);
        assert!(cache.contains(&"held"));
        assert_eq!(cache.len(), 1);

        drop(held);
        assert_eq!(cache.collect_unused(), vec!["held"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_leaves_old_holders_alone() {
        let mut cache: AssetCache<&str, u32> = AssetCache::new();
        let old = cache.insert("tex", 1);
        let previous = cache.replace("tex", 2).unwrap();
        assert!(Arc::ptr_eq(&old, &previous));
        assert_eq!(*old, 1);
        assert_eq!(*cache.get(&"tex").unwrap(), 2);
        assert_eq!(cache.ref_count(&"tex"), Some(0));
    }

    #[test]
    fn test_rebuild_keeps_going_past_failures() {
        let mut cache: AssetCache<&str, u32> = AssetCache::new();
        let old_a = cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        cache.insert("named", 4);

        let (replaced, failed) = cache.rebuild(vec!["a", "b", "c", "named"], |key| match *key {
            "b" => anyhow::bail!("corrupt file"),
            "named" => Ok(None),
            _ => Ok(Some(10)),
        });

        assert_eq!(replaced, vec!["a", "c"]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "b");
        // Replaced entries hold the new value, the failed one keeps the old
        assert_eq!(*cache.get(&"a").unwrap(), 10);
        assert_eq!(*cache.get(&"c").unwrap(), 10);
        assert_eq!(*cache.get(&"b").unwrap(), 2);
        assert_eq!(*cache.get(&"named").unwrap(), 4);
        assert_eq!(*old_a, 1);
    }

    #[test]
    fn test_remove() {
        let mut cache: AssetCache<&str, u32> = AssetCache::new();
        cache.insert("a", 1);
        assert_eq!(cache.remove(&"a").map(|v| *v), Some(1));
        assert!(cache.remove(&"a").is_none());
    }

    #[test]
    fn test_key_dependencies() {
        let file = TextureKey::File(PathBuf::from("assets/rock.png"));
        assert!(file.depends_on(Path::new("assets/rock.png")));
        // A substituted sibling counts too
        assert!(file.depends_on(Path::new("assets/rock.jpg")));
        assert!(!file.depends_on(Path::new("assets/moss.png")));

        let faces = ["px", "nx", "py", "ny", "pz", "nz"].map(|f| PathBuf::from(format!("sky/{f}.png")));
        let cube = TextureKey::Cubemap(faces);
        assert!(cube.depends_on(Path::new("sky/ny.png")));
        assert!(!cube.depends_on(Path::new("sky/top.png")));

        let named = TextureKey::Named("shadow".into());
        assert!(!named.depends_on(Path::new("shadow")));
    }

    #[test]
    fn test_procedural_kinds() {
        assert_eq!(
            procedural_kind(&Procedural::GradientVolume { size: 8 }),
            TextureKind::Texture3D
        );
        assert_eq!(
            procedural_kind(&Procedural::SolidCubemap { rgba: [0; 4], size: 8 }),
            TextureKind::Cubemap
        );
    }
}
