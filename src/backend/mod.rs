// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod buffer;
pub mod device;
pub mod layout;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::GpuBuffer;
pub use device::VulkanDevice;
pub use layout::{BarrierBatch, ImageLayoutState, LayoutTransition, SubresourceLayouts};
pub use swapchain::Swapchain;
