// Texture subsystem
//
// CPU data (source) -> staging buffer -> GPU image (gpu_texture)
//                                         └── mip chain + layout tracking
// Shared textures are reference counted through the cache.

pub mod cache;
pub mod format;
pub mod gpu_texture;
pub mod mip;
pub mod source;
pub mod watch;

pub use cache::{AssetCache, TextureCache, TextureKey};
pub use format::{select_depth_format, TextureFormat};
pub use gpu_texture::{SamplerDesc, Texture, TextureDesc, TextureKind, TextureOptions};
pub use source::{FallbackKind, Procedural, TextureData, TextureError};
pub use watch::TextureWatcher;
