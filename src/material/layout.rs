// Descriptor tables - static binding lists materials declare once

use anyhow::{Context, Result};
use ash::vk;
use std::collections::BTreeMap;

use crate::backend::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    CombinedImageSampler,
    StorageBuffer,
}

impl DescriptorKind {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// `ash` flag unions are not const
pub const VERTEX_FRAGMENT: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

/// One binding slot of a descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub stages: vk::ShaderStageFlags,
    pub count: u32,
}

impl DescriptorBinding {
    pub const fn uniform(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind: DescriptorKind::UniformBuffer,
            stages,
            count: 1,
        }
    }

    pub const fn sampler(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind: DescriptorKind::CombinedImageSampler,
            stages,
            count: 1,
        }
    }

    pub fn to_vk(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.kind.to_vk())
            .descriptor_count(self.count)
            .stage_flags(self.stages)
    }
}

pub type DescriptorTable = &'static [DescriptorBinding];

pub fn create_set_layout(device: &VulkanDevice, table: DescriptorTable) -> Result<vk::DescriptorSetLayout> {
    let bindings: Vec<_> = table.iter().map(DescriptorBinding::to_vk).collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe {
        device.device.create_descriptor_set_layout(&create_info, None)
            .context("Failed to create descriptor set layout")
    }
}

/// Pool sizes for `sets` sets of each table, summed per descriptor type
pub fn pool_sizes(tables: &[DescriptorTable], sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut totals: BTreeMap<i32, u32> = BTreeMap::new();
    for table in tables {
        for binding in table.iter() {
            *totals.entry(binding.kind.to_vk().as_raw()).or_default() += binding.count * sets;
        }
    }
    totals
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFLECT: DescriptorTable = &[
        DescriptorBinding::uniform(0, VERTEX_FRAGMENT),
        DescriptorBinding::sampler(1, vk::ShaderStageFlags::FRAGMENT),
    ];

    const SKY: DescriptorTable = &[DescriptorBinding::sampler(0, vk::ShaderStageFlags::FRAGMENT)];

    #[test]
    fn test_binding_to_vk() {
        let vk_binding = REFLECT[1].to_vk();
        assert_eq!(vk_binding.binding, 1);
        assert_eq!(vk_binding.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(vk_binding.descriptor_count, 1);
        assert_eq!(vk_binding.stage_flags, vk::ShaderStageFlags::FRAGMENT);

        let uniform = REFLECT[0].to_vk();
        assert!(uniform.stage_flags.contains(vk::ShaderStageFlags::VERTEX));
    }

    #[test]
    fn test_pool_sizes_sum_per_type() {
        let sizes = pool_sizes(&[REFLECT, SKY], 4);
        assert_eq!(sizes.len(), 2);

        let count = |ty: vk::DescriptorType| {
            sizes
                .iter()
                .find(|s| s.ty == ty)
                .map(|s| s.descriptor_count)
                .unwrap_or(0)
        };
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), 4);
        assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 8);
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), 0);
    }

    #[test]
    fn test_empty_tables() {
        assert!(pool_sizes(&[], 8).is_empty());
    }
}
