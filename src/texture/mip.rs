// Mip-chain math and generation
//
// Mips are built on the GPU by blitting level i-1 into level i with linear
// filtering. Each source level moves TransferDst -> TransferSrc right before
// it is read; at the end the whole chain goes to ShaderReadOnly.

use ash::vk;

use crate::backend::{BarrierBatch, ImageLayoutState, LayoutTransition, SubresourceLayouts};

/// Number of levels in a full chain: floor(log2(largest axis)) + 1
pub fn mip_level_count(width: u32, height: u32, depth: u32) -> u32 {
    let largest = width.max(height).max(depth).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Size of a mip level; no axis drops below 1
pub fn mip_extent(size: [u32; 3], level: u32) -> [u32; 3] {
    size.map(|axis| (axis >> level).max(1))
}

/// One downsample step of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipBlit {
    pub src_level: u32,
    pub dst_level: u32,
    pub src_size: [u32; 3],
    pub dst_size: [u32; 3],
    pub layer_count: u32,
}

impl MipBlit {
    pub fn to_vk(&self, aspect_mask: vk::ImageAspectFlags) -> vk::ImageBlit {
        vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: self.src_level,
                base_array_layer: 0,
                layer_count: self.layer_count,
            },
            src_offsets: [vk::Offset3D::default(), far_corner(self.src_size)],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: self.dst_level,
                base_array_layer: 0,
                layer_count: self.layer_count,
            },
            dst_offsets: [vk::Offset3D::default(), far_corner(self.dst_size)],
        }
    }
}

fn far_corner(size: [u32; 3]) -> vk::Offset3D {
    vk::Offset3D {
        x: size[0] as i32,
        y: size[1] as i32,
        z: size[2] as i32,
    }
}

/// Blits producing levels 1..mip_levels from level 0
pub fn blit_chain(size: [u32; 3], mip_levels: u32, layer_count: u32) -> Vec<MipBlit> {
    (1..mip_levels)
        .map(|dst_level| MipBlit {
            src_level: dst_level - 1,
            dst_level,
            src_size: mip_extent(size, dst_level - 1),
            dst_size: mip_extent(size, dst_level),
            layer_count,
        })
        .collect()
}

/// One recorded command of mip generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MipStep {
    Barrier(Vec<LayoutTransition>),
    Blit(MipBlit),
}

/// Plan the chain for an image whose level 0 is filled, updating `layouts`
/// as the commands would. Every level ends in ShaderReadOnly.
pub fn plan_mip_chain(
    size: [u32; 3],
    layer_count: u32,
    layouts: &mut SubresourceLayouts,
) -> Vec<MipStep> {
    let mut steps = Vec::new();
    for blit in blit_chain(size, layouts.mip_levels(), layer_count) {
        let mut transitions = Vec::new();
        transitions.extend(layouts.transition_level(blit.src_level, ImageLayoutState::TransferSrc));
        // Destination levels normally arrive in TransferDst with the upload
        if layouts.get(blit.dst_level) != Some(ImageLayoutState::TransferDst) {
            transitions
                .extend(layouts.transition_level(blit.dst_level, ImageLayoutState::TransferDst));
        }
        if !transitions.is_empty() {
            steps.push(MipStep::Barrier(transitions));
        }
        steps.push(MipStep::Blit(blit));
    }

    let finish = layouts.transition_all(ImageLayoutState::ShaderReadOnly);
    if !finish.is_empty() {
        steps.push(MipStep::Barrier(finish));
    }
    steps
}

/// Record the full mip chain planned by `plan_mip_chain`
pub fn record_mip_chain(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    size: [u32; 3],
    layer_count: u32,
    layouts: &mut SubresourceLayouts,
) {
    let aspect = vk::ImageAspectFlags::COLOR;
    let mut batch = BarrierBatch::new();

    for step in plan_mip_chain(size, layer_count, layouts) {
        match step {
            MipStep::Barrier(transitions) => {
                batch.clear();
                batch.extend(image, aspect, layer_count, &transitions);
                batch.record(device, cmd);
            }
            MipStep::Blit(blit) => unsafe {
                device.cmd_blit_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit.to_vk(aspect)],
                    vk::Filter::LINEAR,
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(1, 1, 1), 1);
        assert_eq!(mip_level_count(256, 256, 1), 9);
        assert_eq!(mip_level_count(256, 128, 1), 9);
        assert_eq!(mip_level_count(300, 17, 1), 9);
        assert_eq!(mip_level_count(32, 32, 64), 7);
        // Degenerate sizes still get one level
        assert_eq!(mip_level_count(0, 0, 0), 1);
    }

    #[test]
    fn test_mip_extent_clamps_to_one() {
        assert_eq!(mip_extent([256, 128, 1], 0), [256, 128, 1]);
        assert_eq!(mip_extent([256, 128, 1], 3), [32, 16, 1]);
        assert_eq!(mip_extent([256, 128, 1], 8), [1, 1, 1]);
        assert_eq!(mip_extent([256, 128, 1], 12), [1, 1, 1]);
    }

    #[test]
    fn test_blit_chain_covers_every_level() {
        let chain = blit_chain([256, 128, 1], 9, 6);
        assert_eq!(chain.len(), 8);

        assert_eq!(chain[0].src_level, 0);
        assert_eq!(chain[0].dst_level, 1);
        assert_eq!(chain[0].src_size, [256, 128, 1]);
        assert_eq!(chain[0].dst_size, [128, 64, 1]);

        let last = chain.last().unwrap();
        assert_eq!(last.src_level, 7);
        assert_eq!(last.dst_level, 8);
        assert_eq!(last.src_size, [2, 1, 1]);
        assert_eq!(last.dst_size, [1, 1, 1]);
        assert!(chain.iter().all(|b| b.layer_count == 6));
    }

    #[test]
    fn test_single_level_has_no_blits() {
        assert!(blit_chain([64, 64, 1], 1, 1).is_empty());
    }

    #[test]
    fn test_blit_to_vk_offsets() {
        let blit = MipBlit {
            src_level: 2,
            dst_level: 3,
            src_size: [16, 8, 4],
            dst_size: [8, 4, 2],
            layer_count: 1,
        };
        let vk_blit = blit.to_vk(vk::ImageAspectFlags::COLOR);
        assert_eq!(vk_blit.src_subresource.mip_level, 2);
        assert_eq!(vk_blit.dst_subresource.mip_level, 3);
        let far = vk_blit.src_offsets[1];
        assert_eq!((far.x, far.y, far.z), (16, 8, 4));
        let far = vk_blit.dst_offsets[1];
        assert_eq!((far.x, far.y, far.z), (8, 4, 2));
        let near = vk_blit.dst_offsets[0];
        assert_eq!((near.x, near.y, near.z), (0, 0, 0));
    }

    #[test]
    fn test_chain_moves_each_source_then_finishes_read_only() {
        use ImageLayoutState::{ShaderReadOnly, TransferDst, TransferSrc};

        let mut layouts = SubresourceLayouts::new(4);
        layouts.set_all(TransferDst);
        let steps = plan_mip_chain([8, 8, 1], 1, &mut layouts);
        let blits = blit_chain([8, 8, 1], 4, 1);

        assert_eq!(
            steps,
            vec![
                MipStep::Barrier(vec![LayoutTransition::new(TransferDst, TransferSrc, 0, 1)]),
                MipStep::Blit(blits[0]),
                MipStep::Barrier(vec![LayoutTransition::new(TransferDst, TransferSrc, 1, 1)]),
                MipStep::Blit(blits[1]),
                MipStep::Barrier(vec![LayoutTransition::new(TransferDst, TransferSrc, 2, 1)]),
                MipStep::Blit(blits[2]),
                MipStep::Barrier(vec![
                    LayoutTransition::new(TransferSrc, ShaderReadOnly, 0, 3),
                    LayoutTransition::new(TransferDst, ShaderReadOnly, 3, 1),
                ]),
            ]
        );
        assert_eq!(layouts.uniform(), Some(ShaderReadOnly));
    }

    #[test]
    fn test_chain_moves_stray_destination_into_transfer_dst() {
        use ImageLayoutState::{TransferDst, TransferSrc, Undefined};

        let mut layouts = SubresourceLayouts::new(2);
        layouts.set_level(0, TransferDst);
        let steps = plan_mip_chain([4, 4, 1], 6, &mut layouts);

        assert_eq!(
            steps[0],
            MipStep::Barrier(vec![
                LayoutTransition::new(TransferDst, TransferSrc, 0, 1),
                LayoutTransition::new(Undefined, TransferDst, 1, 1),
            ])
        );
        assert!(matches!(steps[1], MipStep::Blit(blit) if blit.layer_count == 6));
    }

    #[test]
    fn test_single_level_chain_only_finishes() {
        let mut layouts = SubresourceLayouts::new(1);
        layouts.set_all(ImageLayoutState::TransferDst);
        let steps = plan_mip_chain([1, 1, 1], 1, &mut layouts);
        assert_eq!(steps.len(), 1);
        assert!(matches!(&steps[0], MipStep::Barrier(t) if t.len() == 1));
    }
}
