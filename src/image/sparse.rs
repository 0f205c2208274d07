use crate::foundation::error::{ComposeError, ComposeResult};
use crate::image::dense::DenseImage;
use crate::state::config::{ColorFormat, CompositeMode, DepthFormat, PixelLayout};

/// Header length of the sparse wire format.
pub(crate) const HEADER_BYTES: usize = 28;

/// Bytes occupied by one `(inactive, active)` run pair.
pub(crate) const RUN_PAIR_BYTES: usize = 8;

const MAGIC: u32 = 0x534C_494D; // "SLIM"

/// A run-length encoded partial image.
///
/// The owned buffer **is** the wire form; [`SparseImage::package_for_send`]
/// and [`SparseImage::unpackage_from_receive`] move it to and from the
/// transport without translation. All multi-byte fields are little-endian;
/// that byte order is canonical regardless of the host.
///
/// Byte layout:
///
/// | offset | field |
/// |--------|-------|
/// | 0      | magic `0x534C494D` |
/// | 4      | color format (0 none, 1 rgba-ubyte, 2 rgba-float) |
/// | 8      | depth format (0 none, 1 float) |
/// | 12     | width |
/// | 16     | height |
/// | 20     | active pixel count |
/// | 24     | run-data byte length |
///
/// The run data is a sequence of `(inactive: u32, active: u32)` pairs, each
/// pair followed by `active` pixel records (color bytes then depth bytes).
/// Either count may be zero and a trailing inactive run is permitted; the
/// covered pixels of all runs sum to `width * height`. Images produced
/// during exchange are one row high by construction, so `width` doubles as
/// the pixel count there.
#[derive(Debug)]
pub struct SparseImage {
    buf: Vec<u8>,
}

impl SparseImage {
    /// Image width in pixels.
    pub fn width(&self) -> usize {
        read_u32(&self.buf, 12) as usize
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        read_u32(&self.buf, 16) as usize
    }

    /// Total pixel count covered by the runs.
    pub fn num_pixels(&self) -> usize {
        self.width() * self.height()
    }

    /// Number of active pixels carried.
    pub fn active_pixels(&self) -> usize {
        read_u32(&self.buf, 20) as usize
    }

    /// The plane layout the records are encoded with.
    pub fn layout(&self) -> PixelLayout {
        let color = match read_u32(&self.buf, 4) {
            1 => ColorFormat::RgbaUbyte,
            2 => ColorFormat::RgbaFloat,
            _ => ColorFormat::None,
        };
        let depth = match read_u32(&self.buf, 8) {
            1 => DepthFormat::Float,
            _ => DepthFormat::None,
        };
        PixelLayout { color, depth }
    }

    /// The run region of the buffer.
    pub(crate) fn run_data(&self) -> &[u8] {
        &self.buf[HEADER_BYTES..]
    }

    /// An image of `width * height` fully inactive pixels.
    pub fn new_inactive(
        layout: PixelLayout,
        width: usize,
        height: usize,
        recycle: Vec<u8>,
    ) -> ComposeResult<Self> {
        let mut w = SparseWriter::new(layout, recycle);
        w.push_inactive(width * height);
        w.finish(width, height)
    }

    /// Hand the wire bytes to the transport. The buffer is already the
    /// on-the-wire form, so this is a move, not a copy.
    pub fn package_for_send(self) -> Vec<u8> {
        self.buf
    }

    /// Reconstruct an image from received wire bytes, validating the header
    /// and every run against the declared totals.
    pub fn unpackage_from_receive(bytes: Vec<u8>) -> ComposeResult<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(ComposeError::format("received image shorter than header"));
        }
        if read_u32(&bytes, 0) != MAGIC {
            return Err(ComposeError::format("received image has bad magic"));
        }
        if read_u32(&bytes, 4) > 2 || read_u32(&bytes, 8) > 1 {
            return Err(ComposeError::format("received image has unknown format"));
        }
        let run_bytes = read_u32(&bytes, 24) as usize;
        if HEADER_BYTES + run_bytes > bytes.len() {
            return Err(ComposeError::format("received image truncated"));
        }
        let mut buf = bytes;
        buf.truncate(HEADER_BYTES + run_bytes);
        let img = Self { buf };
        if img.layout().pixel_size() == 0 {
            return Err(ComposeError::format("received image carries no planes"));
        }
        img.validate_runs()?;
        Ok(img)
    }

    /// Give the backing storage back for recycling.
    pub(crate) fn into_buf(self) -> Vec<u8> {
        self.buf
    }

    /// Decode into a cleared dense image (inactive pixels become
    /// background).
    pub fn to_dense(&self, mode: CompositeMode) -> ComposeResult<DenseImage> {
        let mut dense = DenseImage::new(self.layout(), self.width(), self.height());
        crate::image::composite::composite_sub(
            &mut dense,
            mode,
            0,
            self,
            crate::image::composite::Orientation::DestOnTop,
        )?;
        Ok(dense)
    }

    fn validate_runs(&self) -> ComposeResult<()> {
        let record_size = self.layout().pixel_size();
        let data = self.run_data();
        let mut pos = 0;
        let mut covered = 0usize;
        let mut active = 0usize;
        while pos < data.len() {
            if pos + RUN_PAIR_BYTES > data.len() {
                return Err(ComposeError::format("run pair extends past buffer"));
            }
            let inactive_px = read_u32(data, pos) as usize;
            let active_px = read_u32(data, pos + 4) as usize;
            pos += RUN_PAIR_BYTES;
            let record_bytes = active_px * record_size;
            if pos + record_bytes > data.len() {
                return Err(ComposeError::format("active records extend past buffer"));
            }
            pos += record_bytes;
            covered += inactive_px + active_px;
            active += active_px;
        }
        if covered != self.num_pixels() {
            return Err(ComposeError::format(format!(
                "runs cover {covered} pixels, header declares {}",
                self.num_pixels()
            )));
        }
        if active != self.active_pixels() {
            return Err(ComposeError::format(
                "active pixel count disagrees with header",
            ));
        }
        Ok(())
    }
}

/// Bytes needed to hold any sparse encoding of `num_pixels` pixels in
/// `layout`.
///
/// The worst run overhead is one pair per two pixels (alternating active and
/// inactive) plus a possible trailing pair, and the worst payload is every
/// pixel active.
pub fn buffer_size(layout: PixelLayout, num_pixels: usize) -> usize {
    HEADER_BYTES + RUN_PAIR_BYTES * (num_pixels / 2 + 1) + num_pixels * layout.pixel_size()
}

/// Upper bound of [`buffer_size`] over every supported layout.
pub fn max_buffer_size(num_pixels: usize) -> usize {
    let widest = PixelLayout {
        color: ColorFormat::RgbaFloat,
        depth: DepthFormat::Float,
    };
    buffer_size(widest, num_pixels)
}

/// Run-length encode a dense image, skipping pixels that are inactive under
/// `mode`. Active color and depth values are preserved bit-exactly.
pub fn compress(dense: &DenseImage, mode: CompositeMode) -> ComposeResult<SparseImage> {
    compress_range(dense, mode, 0, dense.num_pixels(), dense.width(), dense.height())
}

/// Run-length encode the pixel range `[offset, offset + count)` of a dense
/// image. The result is one row high.
pub fn compress_sub(
    dense: &DenseImage,
    mode: CompositeMode,
    offset: usize,
    count: usize,
) -> ComposeResult<SparseImage> {
    if offset + count > dense.num_pixels() {
        return Err(ComposeError::format(format!(
            "sub-compress range {offset}..{} exceeds {} pixels",
            offset + count,
            dense.num_pixels()
        )));
    }
    compress_range(dense, mode, offset, count, count, 1)
}

fn compress_range(
    dense: &DenseImage,
    mode: CompositeMode,
    offset: usize,
    count: usize,
    width: usize,
    height: usize,
) -> ComposeResult<SparseImage> {
    dense.layout().supports(mode)?;
    let mut writer = SparseWriter::new(dense.layout(), Vec::new());
    writer.reserve_for(count);

    let mut i = offset;
    let end = offset + count;
    while i < end {
        if dense.is_active(mode, i) {
            let mut record = Vec::with_capacity(dense.layout().pixel_size());
            dense.append_record(i, &mut record);
            writer.push_active_records(&record, 1);
            i += 1;
        } else {
            let start = i;
            while i < end && !dense.is_active(mode, i) {
                i += 1;
            }
            writer.push_inactive(i - start);
        }
    }
    writer.finish(width, height)
}

/// Incremental builder of the sparse wire form.
///
/// Adjacent pushes of the same kind merge into one run, so building an image
/// pixel range by pixel range yields canonical output. `append_runs` splices
/// a finished image's runs verbatim; readers tolerate the resulting pair
/// boundaries.
pub(crate) struct SparseWriter {
    buf: Vec<u8>,
    layout: PixelLayout,
    covered: usize,
    active: usize,
    open_pair: Option<usize>,
}

impl SparseWriter {
    pub(crate) fn new(layout: PixelLayout, recycle: Vec<u8>) -> Self {
        let mut buf = recycle;
        buf.clear();
        buf.resize(HEADER_BYTES, 0);
        Self {
            buf,
            layout,
            covered: 0,
            active: 0,
            open_pair: None,
        }
    }

    /// Reserve for the worst-case encoding of `num_pixels` pixels.
    pub(crate) fn reserve_for(&mut self, num_pixels: usize) {
        let want = buffer_size(self.layout, num_pixels);
        self.buf.reserve(want.saturating_sub(self.buf.len()));
    }

    pub(crate) fn push_inactive(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        match self.open_pair {
            Some(pair) if read_u32(&self.buf, pair + 4) == 0 => {
                bump_u32(&mut self.buf, pair, count);
            }
            _ => self.open_new_pair(count, 0),
        }
        self.covered += count;
    }

    pub(crate) fn push_active_records(&mut self, records: &[u8], count: usize) {
        if count == 0 {
            return;
        }
        debug_assert_eq!(records.len(), count * self.layout.pixel_size());
        match self.open_pair {
            Some(pair) => bump_u32(&mut self.buf, pair + 4, count),
            None => self.open_new_pair(0, count),
        }
        self.buf.extend_from_slice(records);
        self.covered += count;
        self.active += count;
    }

    /// Splice another image's runs onto the end. The layouts must match.
    pub(crate) fn append_runs(&mut self, img: &SparseImage) -> ComposeResult<()> {
        if img.layout() != self.layout {
            return Err(ComposeError::format(
                "cannot splice runs of a different layout",
            ));
        }
        self.open_pair = None;
        self.buf.extend_from_slice(img.run_data());
        self.covered += img.num_pixels();
        self.active += img.active_pixels();
        Ok(())
    }

    pub(crate) fn finish(self, width: usize, height: usize) -> ComposeResult<SparseImage> {
        if self.covered != width * height {
            return Err(ComposeError::sanity(format!(
                "sparse writer covered {} of {} pixels",
                self.covered,
                width * height
            )));
        }
        let run_bytes = self.buf.len() - HEADER_BYTES;
        let mut buf = self.buf;
        write_u32(&mut buf, 0, MAGIC);
        write_u32(&mut buf, 4, color_id(self.layout.color));
        write_u32(&mut buf, 8, depth_id(self.layout.depth));
        write_u32(&mut buf, 12, to_u32(width)?);
        write_u32(&mut buf, 16, to_u32(height)?);
        write_u32(&mut buf, 20, to_u32(self.active)?);
        write_u32(&mut buf, 24, to_u32(run_bytes)?);
        Ok(SparseImage { buf })
    }

    fn open_new_pair(&mut self, inactive: usize, active: usize) {
        let pair = self.buf.len();
        self.buf.extend_from_slice(&(inactive as u32).to_le_bytes());
        self.buf.extend_from_slice(&(active as u32).to_le_bytes());
        self.open_pair = Some(pair);
    }
}

/// One contiguous chunk of same-kind pixels yielded by [`PixelCursor`].
#[derive(Debug)]
pub(crate) enum Run<'a> {
    /// `count` inactive pixels.
    Inactive(usize),
    /// `count` active pixels and their packed records.
    Active { count: usize, records: &'a [u8] },
}

/// Forward-only reader over a sparse image's runs.
///
/// `peek` exposes the current chunk and `advance` consumes part or all of
/// it, which lets callers carve pixel ranges that do not line up with run
/// boundaries.
pub(crate) struct PixelCursor<'a> {
    data: &'a [u8],
    record_size: usize,
    pos: usize,
    pending_inactive: usize,
    pending_active: usize,
    active_start: usize,
}

impl<'a> PixelCursor<'a> {
    pub(crate) fn new(img: &'a SparseImage) -> Self {
        Self {
            data: img.run_data(),
            record_size: img.layout().pixel_size(),
            pos: 0,
            pending_inactive: 0,
            pending_active: 0,
            active_start: 0,
        }
    }

    /// The current chunk, or `None` when the image is exhausted.
    pub(crate) fn peek(&mut self) -> ComposeResult<Option<Run<'a>>> {
        while self.pending_inactive == 0 && self.pending_active == 0 {
            if self.pos >= self.data.len() {
                return Ok(None);
            }
            if self.pos + RUN_PAIR_BYTES > self.data.len() {
                return Err(ComposeError::format("run pair extends past buffer"));
            }
            self.pending_inactive = read_u32(self.data, self.pos) as usize;
            self.pending_active = read_u32(self.data, self.pos + 4) as usize;
            self.pos += RUN_PAIR_BYTES;
            self.active_start = self.pos;
            let record_bytes = self.pending_active * self.record_size;
            if self.pos + record_bytes > self.data.len() {
                return Err(ComposeError::format("active records extend past buffer"));
            }
            self.pos += record_bytes;
        }
        if self.pending_inactive > 0 {
            Ok(Some(Run::Inactive(self.pending_inactive)))
        } else {
            let bytes = self.pending_active * self.record_size;
            Ok(Some(Run::Active {
                count: self.pending_active,
                records: &self.data[self.active_start..self.active_start + bytes],
            }))
        }
    }

    /// Consume `count` pixels of the current chunk.
    pub(crate) fn advance(&mut self, count: usize) {
        if self.pending_inactive > 0 {
            debug_assert!(count <= self.pending_inactive);
            self.pending_inactive -= count;
        } else {
            debug_assert!(count <= self.pending_active);
            self.pending_active -= count;
            self.active_start += count * self.record_size;
        }
    }
}

fn color_id(c: ColorFormat) -> u32 {
    match c {
        ColorFormat::None => 0,
        ColorFormat::RgbaUbyte => 1,
        ColorFormat::RgbaFloat => 2,
    }
}

fn depth_id(d: DepthFormat) -> u32 {
    match d {
        DepthFormat::None => 0,
        DepthFormat::Float => 1,
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn write_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn bump_u32(buf: &mut [u8], at: usize, by: usize) {
    let v = read_u32(buf, at) as usize + by;
    write_u32(buf, at, v as u32);
}

fn to_u32(v: usize) -> ComposeResult<u32> {
    u32::try_from(v).map_err(|_| ComposeError::sanity("pixel count exceeds wire format"))
}
