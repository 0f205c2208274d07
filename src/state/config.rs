use crate::foundation::error::{ComposeError, ComposeResult};

/// Depth value of an empty (background) pixel.
///
/// Under z-buffer compositing a pixel is inactive exactly when its depth
/// equals this value.
pub const BACKGROUND_DEPTH: f32 = f32::MAX;

/// Pixel-wise combine operator applied during composition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompositeMode {
    /// Keep the pixel with the smaller depth. Ties keep the first operand.
    /// Requires a depth plane.
    ZBuffer,
    /// Source-over blend of premultiplied color, front over back. Requires a
    /// color plane and, for a correct result, an agreed composite order.
    Blend,
}

/// Color plane encoding of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ColorFormat {
    /// No color plane.
    None,
    /// 4x8-bit premultiplied RGBA.
    RgbaUbyte,
    /// 4x32-bit float premultiplied RGBA.
    RgbaFloat,
}

impl ColorFormat {
    /// Bytes of color data per active pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::None => 0,
            Self::RgbaUbyte => 4,
            Self::RgbaFloat => 16,
        }
    }
}

/// Depth plane encoding of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DepthFormat {
    /// No depth plane.
    None,
    /// 32-bit float depth.
    Float,
}

impl DepthFormat {
    /// Bytes of depth data per active pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::None => 0,
            Self::Float => 4,
        }
    }
}

/// The plane formats shared by every image in a session.
///
/// Both the dense and the sparse representation fix their formats at
/// construction; read and write paths use the identical encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PixelLayout {
    /// Color plane format.
    pub color: ColorFormat,
    /// Depth plane format.
    pub depth: DepthFormat,
}

impl PixelLayout {
    /// Create a layout. At least one plane must be present.
    pub fn new(color: ColorFormat, depth: DepthFormat) -> ComposeResult<Self> {
        if color == ColorFormat::None && depth == DepthFormat::None {
            return Err(ComposeError::format("image needs a color or depth plane"));
        }
        Ok(Self { color, depth })
    }

    /// Bytes of color data per active pixel record.
    pub fn color_size(self) -> usize {
        self.color.bytes_per_pixel()
    }

    /// Bytes of depth data per active pixel record.
    pub fn depth_size(self) -> usize {
        self.depth.bytes_per_pixel()
    }

    /// Bytes per active pixel record (color followed by depth).
    pub fn pixel_size(self) -> usize {
        self.color_size() + self.depth_size()
    }

    /// Check that the layout carries the planes `mode` needs.
    pub fn supports(self, mode: CompositeMode) -> ComposeResult<()> {
        match mode {
            CompositeMode::ZBuffer if self.depth == DepthFormat::None => Err(ComposeError::format(
                "z-buffer compositing requires a depth plane",
            )),
            CompositeMode::Blend if self.color == ColorFormat::None => Err(ComposeError::format(
                "blend compositing requires a color plane",
            )),
            _ => Ok(()),
        }
    }
}

/// Which composer the single-image façade dispatches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ComposeStrategy {
    /// Multi-round k-ary swap compositing.
    RadixK,
}

/// Options fixed at session setup.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SessionOpts {
    /// The composite operator.
    pub composite_mode: CompositeMode,
    /// Color plane format of all session images.
    pub color_format: ColorFormat,
    /// Depth plane format of all session images.
    pub depth_format: DepthFormat,
    /// Enable ordering-aware delegation and ordered tree composites.
    pub ordered_composite: bool,
    /// Front-to-back permutation of ranks; consulted when
    /// `ordered_composite` is on.
    pub composite_order: Vec<usize>,
    /// Permute images before multi-round radix-k so active-pixel density is
    /// roughly even across pieces.
    pub interlace_images: bool,
    /// Target k for the radix-k factorization.
    pub magic_k: usize,
    /// Composer used for a single tile's group.
    pub single_image_strategy: ComposeStrategy,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            composite_mode: CompositeMode::ZBuffer,
            color_format: ColorFormat::RgbaUbyte,
            depth_format: DepthFormat::Float,
            ordered_composite: false,
            composite_order: Vec::new(),
            interlace_images: false,
            magic_k: 8,
            single_image_strategy: ComposeStrategy::RadixK,
        }
    }
}

impl SessionOpts {
    /// The image layout implied by the configured formats.
    pub fn layout(&self) -> ComposeResult<PixelLayout> {
        let layout = PixelLayout::new(self.color_format, self.depth_format)?;
        layout.supports(self.composite_mode)?;
        Ok(layout)
    }

    pub(crate) fn validate(&self) -> ComposeResult<()> {
        self.layout()?;
        if self.magic_k < 2 {
            return Err(ComposeError::sanity("magic_k must be at least 2"));
        }
        // The composite-order permutation is validated against the topology.
        Ok(())
    }
}
