// =============================================================================
// VK SCENE COMPONENTS - ECS render components over a thin Vulkan layer
// =============================================================================
//
// LAYERING:
// ┌─────────────────────────────────────────────────────────────────┐
// │  scene     (bevy_ecs components + systems, draw list)           │
// │    └── material  (descriptor tables, per-scene sets, variants)  │
// │          └── texture  (2D / 3D / cubemap / render target)       │
// │                └── backend  (device, buffers, layouts, passes)  │
// └─────────────────────────────────────────────────────────────────┘
//
// Every GPU object is a real `vk::*` handle; the layers above the backend only
// add bookkeeping (layout tracking, reference counts, variant maps).
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod material;
pub mod mesh;
pub mod scene;
pub mod texture;

pub use backend::VulkanDevice;
pub use config::Config;
