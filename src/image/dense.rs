use crate::state::config::{BACKGROUND_DEPTH, ColorFormat, CompositeMode, DepthFormat, PixelLayout};

/// A fixed-size raster with optional color and depth planes.
///
/// This is the form images arrive in from the rendering front-end and leave
/// in after collect. Pixels are indexed row-major as a 1D sequence of
/// `width * height` samples.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseImage {
    width: usize,
    height: usize,
    layout: PixelLayout,
    color_u8: Vec<u8>,
    color_f32: Vec<f32>,
    depth: Vec<f32>,
}

impl DenseImage {
    /// Create a cleared image: transparent black color, background depth.
    pub fn new(layout: PixelLayout, width: usize, height: usize) -> Self {
        let n = width * height;
        let color_u8 = match layout.color {
            ColorFormat::RgbaUbyte => vec![0u8; 4 * n],
            _ => Vec::new(),
        };
        let color_f32 = match layout.color {
            ColorFormat::RgbaFloat => vec![0f32; 4 * n],
            _ => Vec::new(),
        };
        let depth = match layout.depth {
            DepthFormat::Float => vec![BACKGROUND_DEPTH; n],
            DepthFormat::None => Vec::new(),
        };
        Self {
            width,
            height,
            layout,
            color_u8,
            color_f32,
            depth,
        }
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Total pixel count.
    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }

    /// The plane layout.
    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Reset every pixel to transparent black color and background depth.
    pub fn clear(&mut self) {
        self.color_u8.fill(0);
        self.color_f32.fill(0.0);
        self.depth.fill(BACKGROUND_DEPTH);
    }

    /// 8-bit color plane, 4 bytes per pixel. Empty unless the layout is
    /// [`ColorFormat::RgbaUbyte`].
    pub fn color_ubyte(&self) -> &[u8] {
        &self.color_u8
    }

    /// Mutable 8-bit color plane.
    pub fn color_ubyte_mut(&mut self) -> &mut [u8] {
        &mut self.color_u8
    }

    /// Float color plane, 4 values per pixel. Empty unless the layout is
    /// [`ColorFormat::RgbaFloat`].
    pub fn color_float(&self) -> &[f32] {
        &self.color_f32
    }

    /// Mutable float color plane.
    pub fn color_float_mut(&mut self) -> &mut [f32] {
        &mut self.color_f32
    }

    /// Depth plane, one value per pixel. Empty unless the layout has float
    /// depth.
    pub fn depth(&self) -> &[f32] {
        &self.depth
    }

    /// Mutable depth plane.
    pub fn depth_mut(&mut self) -> &mut [f32] {
        &mut self.depth
    }

    /// Whether pixel `i` survives compression under `mode`.
    ///
    /// Depth-tested sessions drop background-depth pixels; blended sessions
    /// drop zero-alpha pixels.
    pub fn is_active(&self, mode: CompositeMode, i: usize) -> bool {
        match mode {
            CompositeMode::ZBuffer => self.depth[i] != BACKGROUND_DEPTH,
            CompositeMode::Blend => match self.layout.color {
                ColorFormat::RgbaUbyte => self.color_u8[4 * i + 3] != 0,
                ColorFormat::RgbaFloat => self.color_f32[4 * i + 3] != 0.0,
                ColorFormat::None => false,
            },
        }
    }

    /// Append pixel `i`'s active record (color bytes then depth bytes,
    /// little-endian) to `out`. Values round-trip bit-exactly.
    pub(crate) fn append_record(&self, i: usize, out: &mut Vec<u8>) {
        match self.layout.color {
            ColorFormat::RgbaUbyte => out.extend_from_slice(&self.color_u8[4 * i..4 * i + 4]),
            ColorFormat::RgbaFloat => {
                for c in &self.color_f32[4 * i..4 * i + 4] {
                    out.extend_from_slice(&c.to_le_bytes());
                }
            }
            ColorFormat::None => {}
        }
        if self.layout.depth == DepthFormat::Float {
            out.extend_from_slice(&self.depth[i].to_le_bytes());
        }
    }

    /// Overwrite pixel `i` from an active record.
    pub(crate) fn write_record(&mut self, i: usize, record: &[u8]) {
        let mut pos = 0;
        match self.layout.color {
            ColorFormat::RgbaUbyte => {
                self.color_u8[4 * i..4 * i + 4].copy_from_slice(&record[..4]);
                pos = 4;
            }
            ColorFormat::RgbaFloat => {
                for c in 0..4 {
                    self.color_f32[4 * i + c] = f32::from_le_bytes(le_word(record, pos));
                    pos += 4;
                }
            }
            ColorFormat::None => {}
        }
        if self.layout.depth == DepthFormat::Float {
            self.depth[i] = f32::from_le_bytes(le_word(record, pos));
        }
    }

    /// Read pixel `i`'s record into a fresh buffer.
    pub(crate) fn record(&self, i: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.layout.pixel_size());
        self.append_record(i, &mut out);
        out
    }
}

fn le_word(bytes: &[u8], pos: usize) -> [u8; 4] {
    [bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PixelLayout {
        PixelLayout::new(ColorFormat::RgbaUbyte, DepthFormat::Float).unwrap()
    }

    #[test]
    fn new_image_is_cleared() {
        let img = DenseImage::new(layout(), 4, 2);
        assert_eq!(img.num_pixels(), 8);
        assert!(img.color_ubyte().iter().all(|&b| b == 0));
        assert!(img.depth().iter().all(|&d| d == BACKGROUND_DEPTH));
    }

    #[test]
    fn cleared_pixels_are_inactive() {
        let mut img = DenseImage::new(layout(), 2, 2);
        assert!(!img.is_active(CompositeMode::ZBuffer, 0));
        img.depth_mut()[0] = 0.5;
        assert!(img.is_active(CompositeMode::ZBuffer, 0));
    }

    #[test]
    fn blend_activity_follows_alpha() {
        let l = PixelLayout::new(ColorFormat::RgbaUbyte, DepthFormat::None).unwrap();
        let mut img = DenseImage::new(l, 2, 1);
        assert!(!img.is_active(CompositeMode::Blend, 1));
        img.color_ubyte_mut()[4 + 3] = 17;
        assert!(img.is_active(CompositeMode::Blend, 1));
    }

    #[test]
    fn records_round_trip() {
        let mut img = DenseImage::new(layout(), 2, 1);
        img.color_ubyte_mut()[..4].copy_from_slice(&[10, 20, 30, 40]);
        img.depth_mut()[0] = 0.25;

        let rec = img.record(0);
        assert_eq!(rec.len(), img.layout().pixel_size());

        let mut other = DenseImage::new(layout(), 2, 1);
        other.write_record(0, &rec);
        assert_eq!(other.color_ubyte()[..4], [10, 20, 30, 40]);
        assert_eq!(other.depth()[0], 0.25);
    }

    #[test]
    fn float_records_round_trip() {
        let l = PixelLayout::new(ColorFormat::RgbaFloat, DepthFormat::Float).unwrap();
        let mut img = DenseImage::new(l, 1, 1);
        img.color_float_mut().copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        img.depth_mut()[0] = 0.75;

        let mut other = DenseImage::new(l, 1, 1);
        other.write_record(0, &img.record(0));
        assert_eq!(other.color_float(), img.color_float());
        assert_eq!(other.depth(), img.depth());
    }
}
