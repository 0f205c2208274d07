use crate::foundation::error::{ComposeError, ComposeResult};
use crate::image::dense::DenseImage;
use crate::image::sparse::{PixelCursor, Run, SparseImage, SparseWriter};
use crate::state::config::{ColorFormat, CompositeMode, PixelLayout};

/// Which operand of a sparse-into-dense composite sits in front.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    /// The sparse source is composited over the dense destination.
    SourceOnTop,
    /// The dense destination stays in front of the sparse source.
    DestOnTop,
}

/// Composite two sparse images covering the same pixel range into a third.
///
/// `front` is the first operand: it wins depth ties under
/// [`CompositeMode::ZBuffer`] and sits on top under
/// [`CompositeMode::Blend`]. The result reuses `recycle`'s capacity; it
/// never aliases an input because all three buffers are distinct owned
/// values.
pub fn composite(
    mode: CompositeMode,
    front: &SparseImage,
    back: &SparseImage,
    recycle: Vec<u8>,
) -> ComposeResult<SparseImage> {
    let layout = front.layout();
    layout.supports(mode)?;
    if back.layout() != layout {
        return Err(ComposeError::format("composite inputs differ in layout"));
    }
    if front.num_pixels() != back.num_pixels() {
        return Err(ComposeError::format(format!(
            "composite inputs cover {} and {} pixels",
            front.num_pixels(),
            back.num_pixels()
        )));
    }

    let record_size = layout.pixel_size();
    let mut writer = SparseWriter::new(layout, recycle);
    writer.reserve_for(front.num_pixels());
    let mut fa = PixelCursor::new(front);
    let mut fb = PixelCursor::new(back);
    let mut combined = vec![0u8; record_size];

    loop {
        let run_a = fa.peek()?;
        let run_b = fb.peek()?;
        match (run_a, run_b) {
            (None, None) => break,
            (Some(Run::Inactive(x)), Some(Run::Inactive(y))) => {
                let n = x.min(y);
                writer.push_inactive(n);
                fa.advance(n);
                fb.advance(n);
            }
            (Some(Run::Active { count, records }), Some(Run::Inactive(y))) => {
                let n = count.min(y);
                writer.push_active_records(&records[..n * record_size], n);
                fa.advance(n);
                fb.advance(n);
            }
            (Some(Run::Inactive(x)), Some(Run::Active { count, records })) => {
                let n = count.min(x);
                writer.push_active_records(&records[..n * record_size], n);
                fa.advance(n);
                fb.advance(n);
            }
            (
                Some(Run::Active {
                    count: ca,
                    records: ra,
                }),
                Some(Run::Active {
                    count: cb,
                    records: rb,
                }),
            ) => {
                let n = ca.min(cb);
                for i in 0..n {
                    combine_records(
                        mode,
                        layout,
                        &ra[i * record_size..(i + 1) * record_size],
                        &rb[i * record_size..(i + 1) * record_size],
                        &mut combined,
                    );
                    writer.push_active_records(&combined, 1);
                }
                fa.advance(n);
                fb.advance(n);
            }
            _ => {
                return Err(ComposeError::sanity(
                    "composite inputs ran out of pixels at different points",
                ));
            }
        }
    }

    writer.finish(front.width(), front.height())
}

/// Composite a sparse image into the pixel range starting at `offset` of a
/// dense image.
///
/// This is the non-tree path kept for single-destination strategies; collect
/// uses its [`Orientation::DestOnTop`] form to unpack pieces over a cleared
/// background.
pub fn composite_sub(
    dense: &mut DenseImage,
    mode: CompositeMode,
    offset: usize,
    sparse: &SparseImage,
    orientation: Orientation,
) -> ComposeResult<()> {
    let layout = dense.layout();
    layout.supports(mode)?;
    if sparse.layout() != layout {
        return Err(ComposeError::format(
            "sub-composite inputs differ in layout",
        ));
    }
    if offset + sparse.num_pixels() > dense.num_pixels() {
        return Err(ComposeError::format(format!(
            "sub-composite range {offset}..{} exceeds {} pixels",
            offset + sparse.num_pixels(),
            dense.num_pixels()
        )));
    }

    let record_size = layout.pixel_size();
    let mut cursor = PixelCursor::new(sparse);
    let mut pos = offset;
    let mut combined = vec![0u8; record_size];
    while let Some(run) = cursor.peek()? {
        match run {
            Run::Inactive(n) => {
                pos += n;
                cursor.advance(n);
            }
            Run::Active { count, records } => {
                for i in 0..count {
                    let incoming = &records[i * record_size..(i + 1) * record_size];
                    let existing = dense.record(pos + i);
                    match orientation {
                        Orientation::SourceOnTop => {
                            combine_records(mode, layout, incoming, &existing, &mut combined);
                        }
                        Orientation::DestOnTop => {
                            combine_records(mode, layout, &existing, incoming, &mut combined);
                        }
                    }
                    dense.write_record(pos + i, &combined);
                }
                pos += count;
                cursor.advance(count);
            }
        }
    }
    Ok(())
}

/// Combine two active pixel records into `out` (`out.len() == record size`).
fn combine_records(
    mode: CompositeMode,
    layout: PixelLayout,
    first: &[u8],
    second: &[u8],
    out: &mut [u8],
) {
    match mode {
        CompositeMode::ZBuffer => {
            let at = layout.color_size();
            let df = record_f32(first, at);
            let ds = record_f32(second, at);
            // Strict less-than: ties keep the first operand.
            if ds < df {
                out.copy_from_slice(second);
            } else {
                out.copy_from_slice(first);
            }
        }
        CompositeMode::Blend => {
            match layout.color {
                ColorFormat::RgbaUbyte => {
                    let inv = 255u16 - u16::from(first[3]);
                    for c in 0..4 {
                        out[c] = first[c].saturating_add(mul_div255(u16::from(second[c]), inv));
                    }
                }
                ColorFormat::RgbaFloat => {
                    let fa = record_f32(first, 12);
                    for c in 0..4 {
                        let f = record_f32(first, 4 * c);
                        let s = record_f32(second, 4 * c);
                        let v = f + (1.0 - fa) * s;
                        out[4 * c..4 * c + 4].copy_from_slice(&v.to_le_bytes());
                    }
                }
                ColorFormat::None => {}
            }
            // Blending is driven by color; a depth sample, when present,
            // follows the front operand.
            let at = layout.color_size();
            if layout.depth_size() > 0 {
                out[at..at + 4].copy_from_slice(&first[at..at + 4]);
            }
        }
    }
}

fn record_f32(record: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]])
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}
