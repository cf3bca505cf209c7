// CPU-side texture data: file decoding, procedural generators, fallbacks
//
// Everything here is plain memory. The GPU side only ever sees a validated
// `TextureData` whose pixel buffer is tightly packed, layer after layer.

use std::path::{Path, PathBuf};

use image::{ColorType, DynamicImage};
use thiserror::Error;

use super::format::TextureFormat;

/// Extensions tried, in order, when a requested file does not exist
pub const SUPPORTED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tga", "bmp", "hdr"];

#[derive(Debug, Error)]
pub enum TextureError {
    #[error("texture file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid texture dimensions: {0}")]
    InvalidDimensions(String),

    #[error("cubemap face {face} is {got_width}x{got_height} {got_format:?}, expected {width}x{height} {format:?}")]
    FaceMismatch {
        face: usize,
        width: u32,
        height: u32,
        format: TextureFormat,
        got_width: u32,
        got_height: u32,
        got_format: TextureFormat,
    },
}

/// What to show when a texture file cannot be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FallbackKind {
    /// Magenta/black checkerboard, impossible to miss
    #[default]
    Checkerboard,
    Magenta,
    Black,
}

const MAGENTA: [u8; 4] = [255, 0, 255, 255];
const BLACK: [u8; 4] = [0, 0, 0, 255];

/// Product of the dimensions, computed without u32 overflow
fn texel_count(dims: [u32; 3]) -> usize {
    dims.iter().map(|&d| d as usize).product()
}

/// Tightly packed pixels of a 2D image, a 3D volume, or a layered image
/// (6 layers for a cubemap)
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub layers: u32,
    pub format: TextureFormat,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn size(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    /// Bytes of one layer (a whole volume for 3D data)
    pub fn layer_bytes(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.depth as usize
            * self.format.bytes_per_pixel()
    }

    pub fn validate(&self) -> Result<(), TextureError> {
        if self.width == 0 || self.height == 0 || self.depth == 0 || self.layers == 0 {
            return Err(TextureError::InvalidDimensions(format!(
                "{}x{}x{} with {} layers",
                self.width, self.height, self.depth, self.layers
            )));
        }
        if self.depth > 1 && self.layers > 1 {
            return Err(TextureError::InvalidDimensions(
                "layered 3D textures are not supported".to_string(),
            ));
        }
        let expected = self.layer_bytes() * self.layers as usize;
        if self.pixels.len() != expected {
            return Err(TextureError::InvalidDimensions(format!(
                "expected {} bytes of pixel data, got {}",
                expected,
                self.pixels.len()
            )));
        }
        Ok(())
    }

    // =========================================================================
    // FILES
    // =========================================================================

    /// Decode an image file (PNG, JPEG, TGA, BMP, HDR)
    pub fn from_file(path: &Path) -> Result<Self, TextureError> {
        if !path.is_file() {
            return Err(TextureError::NotFound(path.to_path_buf()));
        }
        let image = image::open(path).map_err(|source| TextureError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!(
            "Decoded {:?}: {}x{} {:?}",
            path,
            image.width(),
            image.height(),
            image.color()
        );
        Ok(Self::from_image(image))
    }

    pub fn from_memory(bytes: &[u8]) -> Result<Self, TextureError> {
        let image = image::load_from_memory(bytes).map_err(|source| TextureError::Decode {
            path: PathBuf::from("<memory>"),
            source,
        })?;
        Ok(Self::from_image(image))
    }

    fn from_image(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        match image.color() {
            ColorType::Rgb32F | ColorType::Rgba32F => {
                let floats = image.to_rgba32f().into_raw();
                Self {
                    width,
                    height,
                    depth: 1,
                    layers: 1,
                    format: TextureFormat::Rgba32Float,
                    pixels: bytemuck::cast_slice(&floats).to_vec(),
                }
            }
            _ => Self {
                width,
                height,
                depth: 1,
                layers: 1,
                format: TextureFormat::Rgba8Srgb,
                pixels: image.to_rgba8().into_raw(),
            },
        }
    }

    /// Six face files in +X, -X, +Y, -Y, +Z, -Z order
    pub fn cubemap_from_files(paths: &[PathBuf; 6]) -> Result<Self, TextureError> {
        let faces = paths
            .iter()
            .map(|path| {
                let resolved =
                    resolve_path(path).ok_or_else(|| TextureError::NotFound(path.clone()))?;
                Self::from_file(&resolved)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::cubemap_from_faces(faces)
    }

    pub fn cubemap_from_faces(faces: Vec<TextureData>) -> Result<Self, TextureError> {
        if faces.len() != 6 {
            return Err(TextureError::InvalidDimensions(format!(
                "a cubemap needs 6 faces, got {}",
                faces.len()
            )));
        }
        let first = &faces[0];
        if first.width != first.height {
            return Err(TextureError::InvalidDimensions(format!(
                "cubemap faces must be square, got {}x{}",
                first.width, first.height
            )));
        }
        let mut data = Self {
            width: first.width,
            height: first.height,
            depth: 1,
            layers: 6,
            format: first.format,
            pixels: Vec::with_capacity(first.pixels.len() * 6),
        };
        for (face, face_data) in faces.into_iter().enumerate() {
            if face_data.width != data.width
                || face_data.height != data.height
                || face_data.format != data.format
                || face_data.layers != 1
                || face_data.depth != 1
            {
                return Err(TextureError::FaceMismatch {
                    face,
                    width: data.width,
                    height: data.height,
                    format: data.format,
                    got_width: face_data.width,
                    got_height: face_data.height,
                    got_format: face_data.format,
                });
            }
            data.pixels.extend_from_slice(&face_data.pixels);
        }
        Ok(data)
    }

    /// Stack equally sized 2D slices into a 3D volume
    pub fn from_layers(slices: Vec<TextureData>) -> Result<Self, TextureError> {
        let Some(first) = slices.first() else {
            return Err(TextureError::InvalidDimensions("no slices".to_string()));
        };
        let (width, height, format) = (first.width, first.height, first.format);
        let depth = slices.len() as u32;
        let mut pixels = Vec::with_capacity(first.pixels.len() * slices.len());
        for slice in &slices {
            if slice.width != width
                || slice.height != height
                || slice.format != format
                || slice.depth != 1
                || slice.layers != 1
            {
                return Err(TextureError::InvalidDimensions(format!(
                    "volume slice is {}x{} {:?}, expected {}x{} {:?}",
                    slice.width, slice.height, slice.format, width, height, format
                )));
            }
            pixels.extend_from_slice(&slice.pixels);
        }
        Ok(Self { width, height, depth, layers: 1, format, pixels })
    }

    // =========================================================================
    // PROCEDURAL
    // =========================================================================

    pub fn solid(rgba: [u8; 4], width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
            layers: 1,
            format: TextureFormat::Rgba8Srgb,
            pixels: rgba.repeat(texel_count([width, height, 1])),
        }
    }

    /// `size`x`size` board of `cells`x`cells` squares alternating `a` and `b`
    pub fn checkerboard(size: u32, cells: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = (size / cells.max(1)).max(1);
        let mut pixels = Vec::with_capacity(texel_count([size, size, 1]) * 4);
        for y in 0..size {
            for x in 0..size {
                let color = if ((x / cell) + (y / cell)) % 2 == 0 { a } else { b };
                pixels.extend_from_slice(&color);
            }
        }
        Self {
            width: size,
            height: size,
            depth: 1,
            layers: 1,
            format: TextureFormat::Rgba8Srgb,
            pixels,
        }
    }

    /// RGB gradient across a `size`^3 volume (R along x, G along y, B along z)
    pub fn gradient_volume(size: u32) -> Self {
        let last = size.saturating_sub(1).max(1) as usize;
        let scale = |v: u32| (v as usize * 255 / last) as u8;
        let mut pixels = Vec::with_capacity(texel_count([size, size, size]) * 4);
        for z in 0..size {
            for y in 0..size {
                for x in 0..size {
                    pixels.extend_from_slice(&[scale(x), scale(y), scale(z), 255]);
                }
            }
        }
        Self {
            width: size,
            height: size,
            depth: size,
            layers: 1,
            format: TextureFormat::Rgba8Unorm,
            pixels,
        }
    }

    pub fn solid_cubemap(rgba: [u8; 4], size: u32) -> Self {
        Self {
            width: size,
            height: size,
            depth: 1,
            layers: 6,
            format: TextureFormat::Rgba8Srgb,
            pixels: rgba.repeat(texel_count([size, size, 6])),
        }
    }

    pub fn fallback(kind: FallbackKind, size: u32) -> Self {
        match kind {
            FallbackKind::Checkerboard => Self::checkerboard(size, 8, MAGENTA, BLACK),
            FallbackKind::Magenta => Self::solid(MAGENTA, size, size),
            FallbackKind::Black => Self::solid(BLACK, size, size),
        }
    }

    pub fn fallback_cubemap(kind: FallbackKind, size: u32) -> Self {
        let face = Self::fallback(kind, size);
        Self {
            layers: 6,
            pixels: face.pixels.repeat(6),
            ..face
        }
    }

    // =========================================================================
    // FALLBACK LOADING
    // =========================================================================

    /// Load `path` (or a sibling with another supported extension); on any
    /// failure log it and return the procedural fallback instead
    pub fn load_or_fallback(path: &Path, kind: FallbackKind) -> Self {
        let result = match resolve_path(path) {
            Some(resolved) => Self::from_file(&resolved),
            None => Err(TextureError::NotFound(path.to_path_buf())),
        };
        match result {
            Ok(data) => data,
            Err(e) => {
                log::warn!("{}; using {:?} fallback", e, kind);
                Self::fallback(kind, FALLBACK_SIZE)
            }
        }
    }

    pub fn load_cubemap_or_fallback(paths: &[PathBuf; 6], kind: FallbackKind) -> Self {
        match Self::cubemap_from_files(paths) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("{}; using {:?} cubemap fallback", e, kind);
                Self::fallback_cubemap(kind, FALLBACK_SIZE)
            }
        }
    }
}

pub const FALLBACK_SIZE: u32 = 64;

const LIGHT_GREY: [u8; 4] = [200, 200, 200, 255];
const DARK_GREY: [u8; 4] = [60, 60, 60, 255];

/// A generated texture, requested by description instead of by file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedural {
    /// Grey checkerboard, handy as a neutral albedo
    Checkerboard { size: u32, cells: u32 },
    Solid { rgba: [u8; 4] },
    SolidCubemap { rgba: [u8; 4], size: u32 },
    GradientVolume { size: u32 },
}

impl Procedural {
    pub fn generate(&self) -> TextureData {
        match *self {
            Procedural::Checkerboard { size, cells } => {
                TextureData::checkerboard(size, cells, LIGHT_GREY, DARK_GREY)
            }
            Procedural::Solid { rgba } => TextureData::solid(rgba, 1, 1),
            Procedural::SolidCubemap { rgba, size } => TextureData::solid_cubemap(rgba, size),
            Procedural::GradientVolume { size } => TextureData::gradient_volume(size),
        }
    }
}

/// The requested path if it exists, otherwise the first sibling with the
/// same stem and a supported extension
pub fn resolve_path(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let found = SUPPORTED_EXTENSIONS
        .iter()
        .map(|ext| path.with_extension(ext))
        .find(|candidate| candidate.is_file());
    if let Some(candidate) = &found {
        log::info!("{:?} not found, using {:?}", path, candidate);
    }
    found
}

/// True for files the hot reloader should care about
pub fn is_supported_texture(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn write_png(path: &Path, width: u32, height: u32, color: [u8; 4]) {
        RgbaImage::from_pixel(width, height, Rgba(color))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_procedural_shapes() {
        let board = Procedural::Checkerboard { size: 16, cells: 4 }.generate();
        assert_eq!(board.size(), [16, 16, 1]);
        assert_eq!(&board.pixels[0..4], &LIGHT_GREY);

        let volume = Procedural::GradientVolume { size: 4 }.generate();
        assert_eq!(volume.depth, 4);
        assert!(volume.validate().is_ok());

        let cube = Procedural::SolidCubemap { rgba: [1, 2, 3, 4], size: 2 }.generate();
        assert_eq!(cube.layers, 6);
    }

    #[test]
    fn test_decode_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        write_png(&path, 4, 2, [255, 0, 0, 255]);

        let data = TextureData::from_file(&path).unwrap();
        assert_eq!((data.width, data.height, data.depth, data.layers), (4, 2, 1, 1));
        assert_eq!(data.format, TextureFormat::Rgba8Srgb);
        assert_eq!(&data.pixels[0..4], &[255, 0, 0, 255]);
        data.validate().unwrap();
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = TextureData::from_file(&dir.path().join("nope.png")).unwrap_err();
        assert!(matches!(err, TextureError::NotFound(_)));
    }

    #[test]
    fn test_resolve_sibling_extension() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("rock.png"), 2, 2, [1, 2, 3, 255]);

        let resolved = resolve_path(&dir.path().join("rock.jpg")).unwrap();
        assert_eq!(resolved, dir.path().join("rock.png"));
        assert!(resolve_path(&dir.path().join("grass.png")).is_none());
    }

    #[test]
    fn test_load_or_fallback_missing() {
        let dir = tempfile::tempdir().unwrap();
        let data = TextureData::load_or_fallback(
            &dir.path().join("missing.png"),
            FallbackKind::Magenta,
        );
        assert_eq!(data.width, FALLBACK_SIZE);
        assert_eq!(&data.pixels[0..4], &MAGENTA);
    }

    #[test]
    fn test_load_or_fallback_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"this is not a png").unwrap();

        assert!(matches!(
            TextureData::from_file(&path),
            Err(TextureError::Decode { .. })
        ));
        let data = TextureData::load_or_fallback(&path, FallbackKind::Checkerboard);
        data.validate().unwrap();
        assert_eq!(data.width, FALLBACK_SIZE);
    }

    #[test]
    fn test_checkerboard_pattern() {
        let board = TextureData::checkerboard(4, 2, MAGENTA, BLACK);
        let pixel = |x: usize, y: usize| &board.pixels[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(pixel(0, 0), &MAGENTA);
        assert_eq!(pixel(2, 0), &BLACK);
        assert_eq!(pixel(2, 2), &MAGENTA);
        assert_eq!(pixel(1, 3), &BLACK);
    }

    #[test]
    fn test_gradient_volume_corners() {
        let volume = TextureData::gradient_volume(4);
        volume.validate().unwrap();
        assert_eq!(volume.depth, 4);
        assert_eq!(&volume.pixels[0..4], &[0, 0, 0, 255]);
        let last = volume.pixels.len() - 4;
        assert_eq!(&volume.pixels[last..], &[255, 255, 255, 255]);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_texel_count_exceeds_u32() {
        // 4096^3 overflows u32 in any order of multiplication
        assert_eq!(texel_count([4096, 4096, 4096]), 1usize << 36);
        assert_eq!(texel_count([70_000, 70_000, 6]), 29_400_000_000);
    }

    #[test]
    fn test_gradient_scale_stays_in_range() {
        let volume = TextureData::gradient_volume(2);
        assert_eq!(&volume.pixels[0..4], &[0, 0, 0, 255]);
        assert_eq!(&volume.pixels[4..8], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_layers_stack_into_volume() {
        let layers = (0..3)
            .map(|i| TextureData::solid([i as u8 * 10, 0, 0, 255], 2, 2))
            .collect();
        let volume = TextureData::from_layers(layers).unwrap();
        volume.validate().unwrap();
        assert_eq!((volume.width, volume.height, volume.depth), (2, 2, 3));
        // Slice 2 starts after two 2x2 RGBA slices
        assert_eq!(volume.pixels[2 * 2 * 2 * 4], 20);

        let uneven = vec![TextureData::solid(BLACK, 2, 2), TextureData::solid(BLACK, 4, 4)];
        assert!(matches!(
            TextureData::from_layers(uneven),
            Err(TextureError::InvalidDimensions(_))
        ));
        assert!(TextureData::from_layers(Vec::new()).is_err());
    }

    #[test]
    fn test_cubemap_from_faces() {
        let faces = (0..6)
            .map(|i| TextureData::solid([i as u8, 0, 0, 255], 8, 8))
            .collect();
        let cube = TextureData::cubemap_from_faces(faces).unwrap();
        cube.validate().unwrap();
        assert_eq!(cube.layers, 6);
        // Face 3 starts after three 8x8 RGBA faces
        assert_eq!(cube.pixels[3 * 8 * 8 * 4], 3);
    }

    #[test]
    fn test_cubemap_face_mismatch() {
        let mut faces: Vec<_> = (0..6).map(|_| TextureData::solid(BLACK, 8, 8)).collect();
        faces[4] = TextureData::solid(BLACK, 4, 4);
        let err = TextureData::cubemap_from_faces(faces).unwrap_err();
        assert!(matches!(err, TextureError::FaceMismatch { face: 4, .. }));
    }

    #[test]
    fn test_cubemap_needs_six_faces() {
        let faces = vec![TextureData::solid(BLACK, 8, 8); 5];
        assert!(matches!(
            TextureData::cubemap_from_faces(faces),
            Err(TextureError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn test_missing_cubemap_face_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths: [PathBuf; 6] = std::array::from_fn(|i| dir.path().join(format!("f{i}.png")));
        for path in &paths[..5] {
            write_png(path, 2, 2, [9, 9, 9, 255]);
        }
        let cube = TextureData::load_cubemap_or_fallback(&paths, FallbackKind::Black);
        assert_eq!(cube.layers, 6);
        assert_eq!(cube.width, FALLBACK_SIZE);
        cube.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_short_buffer() {
        let mut data = TextureData::solid(BLACK, 4, 4);
        data.pixels.pop();
        assert!(data.validate().is_err());
    }

    #[test]
    fn test_supported_extension_check() {
        assert!(is_supported_texture(Path::new("a/b/sky.HDR")));
        assert!(is_supported_texture(Path::new("albedo.png")));
        assert!(!is_supported_texture(Path::new("notes.txt")));
        assert!(!is_supported_texture(Path::new("noext")));
    }
}
