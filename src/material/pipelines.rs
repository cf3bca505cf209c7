// Per-render-pass pipeline variants
//
// A material owns one pipeline per render pass it draws in. Variants are
// built lazily the first time a pass asks for them.

use anyhow::Result;
use ash::vk;
use std::collections::BTreeMap;

/// Identifies a render pass; doubles as a bit in `RenderPassMask`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RenderPassId(pub u32);

impl RenderPassId {
    /// Swapchain pass
    pub const MAIN: Self = Self(0);
    /// Offscreen pass seen from the reflection probe
    pub const REFLECTION_CAPTURE: Self = Self(1);

    pub const fn bit(self) -> u32 {
        1 << self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderPassMask(pub u32);

impl RenderPassMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(u32::MAX);

    pub fn only(pass: RenderPassId) -> Self {
        Self(pass.bit())
    }

    pub fn with(self, pass: RenderPassId) -> Self {
        Self(self.0 | pass.bit())
    }

    pub fn without(self, pass: RenderPassId) -> Self {
        Self(self.0 & !pass.bit())
    }

    pub fn contains(self, pass: RenderPassId) -> bool {
        self.0 & pass.bit() != 0
    }

    /// Set passes in ascending order
    pub fn iter(self) -> impl Iterator<Item = RenderPassId> {
        (0..u32::BITS)
            .filter(move |&id| self.0 & (1 << id) != 0)
            .map(RenderPassId)
    }
}

pub struct PipelineVariants<P> {
    variants: BTreeMap<RenderPassId, P>,
}

impl<P> Default for PipelineVariants<P> {
    fn default() -> Self {
        Self {
            variants: BTreeMap::new(),
        }
    }
}

impl<P> PipelineVariants<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pass: RenderPassId) -> Option<&P> {
        self.variants.get(&pass)
    }

    /// Build the variant for `pass` unless it already exists
    pub fn get_or_try_insert_with<F>(&mut self, pass: RenderPassId, build: F) -> Result<&P>
    where
        F: FnOnce() -> Result<P>,
    {
        use std::collections::btree_map::Entry;
        match self.variants.entry(pass) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(build()?)),
        }
    }

    pub fn insert(&mut self, pass: RenderPassId, pipeline: P) -> Option<P> {
        self.variants.insert(pass, pipeline)
    }

    pub fn remove(&mut self, pass: RenderPassId) -> Option<P> {
        self.variants.remove(&pass)
    }

    /// Keep variants whose pass satisfies `keep`; returns the others
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<P>
    where
        F: FnMut(RenderPassId) -> bool,
    {
        let dropped: Vec<RenderPassId> = self
            .variants
            .keys()
            .copied()
            .filter(|&pass| !keep(pass))
            .collect();
        dropped
            .into_iter()
            .filter_map(|pass| self.variants.remove(&pass))
            .collect()
    }

    pub fn passes(&self) -> impl Iterator<Item = RenderPassId> + '_ {
        self.variants.keys().copied()
    }

    pub fn drain(&mut self) -> Vec<P> {
        std::mem::take(&mut self.variants).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl MaterialPipeline {
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
