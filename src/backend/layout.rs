// Image layout tracking and barrier generation
//
// Every image in Vulkan is in exactly one layout per subresource. Moving
// between layouts needs a pipeline barrier naming:
//   - which stages must finish before (src stage) and which must wait (dst stage)
//   - which memory accesses must be made available / visible
//
// This module keeps the per-mip layout of an image on the CPU side so the
// texture code never has to remember it by hand.

use ash::vk;

/// Layout states a tracked image can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayoutState {
    /// Contents undefined; only valid as a source
    #[default]
    Undefined,
    TransferDst,
    TransferSrc,
    ShaderReadOnly,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    General,
    PresentSrc,
}

impl ImageLayoutState {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Self::General => vk::ImageLayout::GENERAL,
            Self::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Memory accesses performed while an image sits in this layout
    pub fn access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => vk::AccessFlags::empty(),
            Self::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
            Self::TransferSrc => vk::AccessFlags::TRANSFER_READ,
            Self::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
            Self::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            Self::DepthStencilAttachment => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            Self::DepthStencilReadOnly => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ
            }
            Self::General => vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        }
    }

    /// Stage that last touched the image in this layout
    pub fn src_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::TransferDst | Self::TransferSrc => vk::PipelineStageFlags::TRANSFER,
            Self::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment => vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            Self::DepthStencilReadOnly => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
            }
            Self::General => vk::PipelineStageFlags::ALL_COMMANDS,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    /// Stage that must wait for the image to reach this layout
    pub fn dst_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::TransferDst | Self::TransferSrc => vk::PipelineStageFlags::TRANSFER,
            Self::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment => vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            // Sampled as well as depth tested
            Self::DepthStencilReadOnly => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
            }
            Self::General => vk::PipelineStageFlags::ALL_COMMANDS,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    /// Layouts in which the image may be written
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::TransferDst | Self::ColorAttachment | Self::DepthStencilAttachment | Self::General
        )
    }
}

/// A layout change over a run of mip levels (all array layers)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub from: ImageLayoutState,
    pub to: ImageLayoutState,
    pub base_level: u32,
    pub level_count: u32,
}

impl LayoutTransition {
    pub fn new(
        from: ImageLayoutState,
        to: ImageLayoutState,
        base_level: u32,
        level_count: u32,
    ) -> Self {
        Self { from, to, base_level, level_count }
    }

    /// Same layout and nothing written: no barrier needed.
    /// Write-after-write into the same layout still needs one.
    pub fn is_noop(&self) -> bool {
        self.from == self.to && !self.from.is_write()
    }

    pub fn to_barrier(
        &self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        layer_count: u32,
    ) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(self.from.access_mask())
            .dst_access_mask(self.to.access_mask())
            .old_layout(self.from.to_vk())
            .new_layout(self.to.to_vk())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: self.base_level,
                level_count: self.level_count,
                base_array_layer: 0,
                layer_count,
            })
    }
}

/// CPU-side record of the layout of every mip level of one image
#[derive(Debug, Clone)]
pub struct SubresourceLayouts {
    levels: Vec<ImageLayoutState>,
}

impl SubresourceLayouts {
    /// All levels start `Undefined`
    pub fn new(mip_levels: u32) -> Self {
        Self {
            levels: vec![ImageLayoutState::Undefined; mip_levels.max(1) as usize],
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.levels.len() as u32
    }

    /// `None` past the last level
    pub fn get(&self, level: u32) -> Option<ImageLayoutState> {
        self.levels.get(level as usize).copied()
    }

    /// The shared layout, if every level agrees
    pub fn uniform(&self) -> Option<ImageLayoutState> {
        let first = self.levels[0];
        self.levels.iter().all(|&l| l == first).then_some(first)
    }

    /// Record a layout that was reached outside of a tracked barrier
    /// (e.g. a render pass final layout). Returns false past the last level.
    pub fn set_level(&mut self, level: u32, state: ImageLayoutState) -> bool {
        match self.levels.get_mut(level as usize) {
            Some(slot) => {
                *slot = state;
                true
            }
            None => false,
        }
    }

    pub fn set_all(&mut self, state: ImageLayoutState) {
        self.levels.fill(state);
    }

    /// Move one level to `to`; `None` if no barrier is needed
    pub fn transition_level(&mut self, level: u32, to: ImageLayoutState) -> Option<LayoutTransition> {
        let transitions = self.transition_range(level, 1, to);
        transitions.into_iter().next()
    }

    /// Move every level to `to`, merging runs of equal layouts into one transition
    pub fn transition_all(&mut self, to: ImageLayoutState) -> Vec<LayoutTransition> {
        self.transition_range(0, self.mip_levels(), to)
    }

    pub fn transition_range(
        &mut self,
        base_level: u32,
        level_count: u32,
        to: ImageLayoutState,
    ) -> Vec<LayoutTransition> {
        // Levels past the end are ignored
        let end = (base_level as usize)
            .saturating_add(level_count as usize)
            .min(self.levels.len());
        let start = (base_level as usize).min(end);
        let mut transitions = Vec::new();

        let mut run_start = start;
        while run_start < end {
            let from = self.levels[run_start];
            let mut run_end = run_start + 1;
            while run_end < end && self.levels[run_end] == from {
                run_end += 1;
            }

            let transition = LayoutTransition::new(
                from,
                to,
                run_start as u32,
                (run_end - run_start) as u32,
            );
            if !transition.is_noop() {
                transitions.push(transition);
            }
            run_start = run_end;
        }

        self.levels[start..end].fill(to);
        transitions
    }
}

/// Image barriers collected and recorded as one `vkCmdPipelineBarrier`
#[derive(Debug, Default)]
pub struct BarrierBatch {
    barriers: Vec<vk::ImageMemoryBarrier<'static>>,
    src_stage_mask: vk::PipelineStageFlags,
    dst_stage_mask: vk::PipelineStageFlags,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transition; no-ops are skipped
    pub fn add(
        &mut self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        layer_count: u32,
        transition: &LayoutTransition,
    ) {
        if transition.is_noop() {
            return;
        }
        self.barriers
            .push(transition.to_barrier(image, aspect_mask, layer_count));
        self.src_stage_mask |= transition.from.src_stage();
        self.dst_stage_mask |= transition.to.dst_stage();
    }

    pub fn extend(
        &mut self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        layer_count: u32,
        transitions: &[LayoutTransition],
    ) {
        for transition in transitions {
            self.add(image, aspect_mask, layer_count, transition);
        }
    }

    pub fn barriers(&self) -> &[vk::ImageMemoryBarrier<'static>] {
        &self.barriers
    }

    pub fn src_stage_mask(&self) -> vk::PipelineStageFlags {
        self.src_stage_mask
    }

    pub fn dst_stage_mask(&self) -> vk::PipelineStageFlags {
        self.dst_stage_mask
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    /// Record all barriers; does nothing when empty
    pub fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                self.src_stage_mask,
                self.dst_stage_mask,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &self.barriers,
            );
        }
    }

    pub fn clear(&mut self) {
        self.barriers.clear();
        self.src_stage_mask = vk::PipelineStageFlags::empty();
        self.dst_stage_mask = vk::PipelineStageFlags::empty();
    }
}

/// Aspect bits to use for a format
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_layout_to_vk() {
        assert_eq!(ImageLayoutState::Undefined.to_vk(), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            ImageLayoutState::TransferDst.to_vk(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            ImageLayoutState::ShaderReadOnly.to_vk(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(ImageLayoutState::PresentSrc.to_vk(), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_read_to_same_read_is_noop() {
        let t = LayoutTransition::new(
            ImageLayoutState::ShaderReadOnly,
            ImageLayoutState::ShaderReadOnly,
            0,
            1,
        );
        assert!(t.is_noop());
    }

    #[test]
    fn test_write_after_write_needs_barrier() {
        let t = LayoutTransition::new(
            ImageLayoutState::TransferDst,
            ImageLayoutState::TransferDst,
            0,
            1,
        );
        assert!(!t.is_noop());
    }

    #[test]
    fn test_upload_barrier_fields() {
        let t = LayoutTransition::new(
            ImageLayoutState::Undefined,
            ImageLayoutState::TransferDst,
            0,
            4,
        );
        let image = vk::Image::from_raw(42);
        let barrier = t.to_barrier(image, vk::ImageAspectFlags::COLOR, 6);

        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::empty());
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.subresource_range.level_count, 4);
        assert_eq!(barrier.subresource_range.layer_count, 6);
        assert_eq!(barrier.image, image);
    }

    #[test]
    fn test_transition_all_merges_runs() {
        let mut layouts = SubresourceLayouts::new(5);
        layouts.set_level(0, ImageLayoutState::TransferSrc);
        layouts.set_level(1, ImageLayoutState::TransferSrc);
        layouts.set_level(2, ImageLayoutState::TransferDst);
        layouts.set_level(3, ImageLayoutState::TransferDst);
        layouts.set_level(4, ImageLayoutState::TransferDst);

        let transitions = layouts.transition_all(ImageLayoutState::ShaderReadOnly);

        assert_eq!(
            transitions,
            vec![
                LayoutTransition::new(
                    ImageLayoutState::TransferSrc,
                    ImageLayoutState::ShaderReadOnly,
                    0,
                    2
                ),
                LayoutTransition::new(
                    ImageLayoutState::TransferDst,
                    ImageLayoutState::ShaderReadOnly,
                    2,
                    3
                ),
            ]
        );
        assert_eq!(layouts.uniform(), Some(ImageLayoutState::ShaderReadOnly));
    }

    #[test]
    fn test_transition_level_skips_noop() {
        let mut layouts = SubresourceLayouts::new(3);
        layouts.set_all(ImageLayoutState::ShaderReadOnly);

        assert!(layouts
            .transition_level(1, ImageLayoutState::ShaderReadOnly)
            .is_none());

        let t = layouts
            .transition_level(1, ImageLayoutState::TransferSrc)
            .unwrap();
        assert_eq!(t.base_level, 1);
        assert_eq!(t.level_count, 1);
        assert_eq!(layouts.get(1), Some(ImageLayoutState::TransferSrc));
        assert_eq!(layouts.uniform(), None);
    }

    #[test]
    fn test_barrier_batch_unions_stages() {
        let mut batch = BarrierBatch::new();
        let image = vk::Image::from_raw(7);

        batch.add(
            image,
            vk::ImageAspectFlags::COLOR,
            1,
            &LayoutTransition::new(
                ImageLayoutState::TransferDst,
                ImageLayoutState::ShaderReadOnly,
                0,
                1,
            ),
        );
        batch.add(
            image,
            vk::ImageAspectFlags::COLOR,
            1,
            &LayoutTransition::new(
                ImageLayoutState::ColorAttachment,
                ImageLayoutState::ShaderReadOnly,
                1,
                1,
            ),
        );
        // Skipped
        batch.add(
            image,
            vk::ImageAspectFlags::COLOR,
            1,
            &LayoutTransition::new(
                ImageLayoutState::ShaderReadOnly,
                ImageLayoutState::ShaderReadOnly,
                2,
                1,
            ),
        );

        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.src_stage_mask(),
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(batch.dst_stage_mask(), vk::PipelineStageFlags::FRAGMENT_SHADER);

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.src_stage_mask(), vk::PipelineStageFlags::empty());
    }

    const ALL_STATES: [ImageLayoutState; 9] = [
        ImageLayoutState::Undefined,
        ImageLayoutState::TransferDst,
        ImageLayoutState::TransferSrc,
        ImageLayoutState::ShaderReadOnly,
        ImageLayoutState::ColorAttachment,
        ImageLayoutState::DepthStencilAttachment,
        ImageLayoutState::DepthStencilReadOnly,
        ImageLayoutState::General,
        ImageLayoutState::PresentSrc,
    ];

    /// Stages at which each access type may appear in a barrier
    fn supporting_stages(access: vk::AccessFlags) -> vk::PipelineStageFlags {
        use vk::AccessFlags as A;
        use vk::PipelineStageFlags as S;
        match access {
            A::TRANSFER_READ | A::TRANSFER_WRITE => S::TRANSFER,
            A::SHADER_READ | A::SHADER_WRITE => {
                S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER
            }
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE => S::COLOR_ATTACHMENT_OUTPUT,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE => {
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS
            }
            A::MEMORY_READ | A::MEMORY_WRITE => S::from_raw(!0),
            other => panic!("no stage table for {:?}", other),
        }
    }

    fn access_bits(mask: vk::AccessFlags) -> impl Iterator<Item = vk::AccessFlags> {
        (0..32)
            .map(|bit| vk::AccessFlags::from_raw(1 << bit))
            .filter(move |bit| mask.contains(*bit))
    }

    #[test]
    fn test_access_masks_legal_at_their_stages() {
        for state in ALL_STATES {
            for (stages, side) in [(state.src_stage(), "src"), (state.dst_stage(), "dst")] {
                if stages.contains(vk::PipelineStageFlags::ALL_COMMANDS) {
                    continue;
                }
                for access in access_bits(state.access_mask()) {
                    assert!(
                        stages.intersects(supporting_stages(access)),
                        "{:?}: {:?} not supported by {} stage {:?}",
                        state,
                        access,
                        side,
                        stages
                    );
                }
            }
        }
    }

    #[test]
    fn test_depth_read_only_waits_in_fragment_shader() {
        assert!(ImageLayoutState::DepthStencilReadOnly
            .dst_stage()
            .contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
    }

    #[test]
    fn test_out_of_range_levels_are_ignored() {
        let mut layouts = SubresourceLayouts::new(2);
        assert!(layouts
            .transition_range(5, 1, ImageLayoutState::ShaderReadOnly)
            .is_empty());
        assert_eq!(layouts.uniform(), Some(ImageLayoutState::Undefined));

        // A range running off the end only touches the levels that exist
        let transitions = layouts.transition_range(1, 10, ImageLayoutState::TransferDst);
        assert_eq!(
            transitions,
            vec![LayoutTransition::new(
                ImageLayoutState::Undefined,
                ImageLayoutState::TransferDst,
                1,
                1
            )]
        );

        assert_eq!(layouts.get(2), None);
        assert!(!layouts.set_level(2, ImageLayoutState::General));
        assert!(layouts.set_level(0, ImageLayoutState::General));
        assert_eq!(layouts.get(0), Some(ImageLayoutState::General));
    }

    #[test]
    fn test_aspect_for_format() {
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
