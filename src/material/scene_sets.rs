// Per-scene descriptor sets
//
// Each scene gets its own descriptor pool, so releasing a scene frees all of
// its sets at once by destroying the pool.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;

use super::layout::{pool_sizes, DescriptorTable};

/// Identifies a group of material bindings (one environment, one albedo...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SceneId(pub u32);

/// Fails when `count` more sets would overflow a pool holding `used` of `capacity`
fn check_capacity(scene: SceneId, used: u32, capacity: u32, count: u32) -> Result<()> {
    if used.saturating_add(count) > capacity {
        anyhow::bail!(
            "{:?} has {} of {} descriptor sets, cannot allocate {} more",
            scene,
            used,
            capacity,
            count
        );
    }
    Ok(())
}

struct ScenePool {
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    capacity: u32,
}

pub struct SceneDescriptorSets {
    table: DescriptorTable,
    layout: vk::DescriptorSetLayout,
    sets_per_scene: u32,
    scenes: HashMap<SceneId, ScenePool>,
}

impl SceneDescriptorSets {
    pub fn new(table: DescriptorTable, layout: vk::DescriptorSetLayout, sets_per_scene: u32) -> Self {
        Self {
            table,
            layout,
            sets_per_scene: sets_per_scene.max(1),
            scenes: HashMap::new(),
        }
    }

    /// Allocate `count` more sets for `scene`, creating its pool on first use
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        scene: SceneId,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        if !self.scenes.contains_key(&scene) {
            let pool = self.create_pool(device, self.sets_per_scene.max(count))?;
            log::debug!("Created descriptor pool for {:?}", scene);
            self.scenes.insert(
                scene,
                ScenePool {
                    pool,
                    sets: Vec::new(),
                    capacity: self.sets_per_scene.max(count),
                },
            );
        }
        let entry = self
            .scenes
            .get_mut(&scene)
            .context("Scene pool missing")?;

        check_capacity(scene, entry.sets.len() as u32, entry.capacity, count)?;

        let layouts = vec![self.layout; count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(entry.pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            device.allocate_descriptor_sets(&alloc_info)
                .context("Failed to allocate descriptor sets")?
        };
        entry.sets.extend_from_slice(&sets);
        Ok(sets)
    }

    fn create_pool(&self, device: &ash::Device, max_sets: u32) -> Result<vk::DescriptorPool> {
        let sizes = pool_sizes(&[self.table], max_sets);
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        unsafe {
            device.create_descriptor_pool(&create_info, None)
                .context("Failed to create descriptor pool")
        }
    }

    pub fn sets(&self, scene: SceneId) -> &[vk::DescriptorSet] {
        self.scenes
            .get(&scene)
            .map(|entry| entry.sets.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, scene: SceneId) -> bool {
        self.scenes.contains_key(&scene)
    }

    /// Destroy the scene's pool and every set in it
    pub fn release(&mut self, device: &ash::Device, scene: SceneId) -> bool {
        match self.scenes.remove(&scene) {
            Some(entry) => {
                unsafe { device.destroy_descriptor_pool(entry.pool, None) };
                log::debug!("Released descriptor sets of {:?}", scene);
                true
            }
            None => false,
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for (_, entry) in self.scenes.drain() {
            unsafe { device.destroy_descriptor_pool(entry.pool, None) };
        }
    }
}
