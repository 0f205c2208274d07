use crate::foundation::error::{ComposeError, ComposeResult};
use crate::image::sparse::{PixelCursor, Run, SparseImage, SparseWriter};

/// One piece produced by [`split`].
#[derive(Debug)]
pub struct SplitPiece {
    /// The piece's pixels as a one-row sparse image.
    pub image: SparseImage,
    /// Absolute offset of the piece in final-image pixel space.
    pub offset: usize,
}

/// The largest piece [`split`] can produce for these parameters; used to
/// size receive buffers before the split happens.
pub fn split_partition_num_pixels(
    start_size: usize,
    k: usize,
    remaining_partitions: usize,
) -> usize {
    let sub = remaining_partitions / k;
    let base = start_size / remaining_partitions;
    let remainder = start_size % remaining_partitions;
    sub * base + remainder.min(sub)
}

/// Partition a sparse image into `k` contiguous pieces.
///
/// The image is conceptually divided into `remaining_partitions` eventual
/// partitions — the number of pieces the whole algorithm will have produced
/// when it finishes — sized `n / remaining_partitions` with the remainder
/// spread one pixel each over the leading partitions. Each piece takes
/// `remaining_partitions / k` consecutive eventual partitions, so a later
/// split of a piece lands on the same global boundaries. Pieces are
/// disjoint, cover the input, and are returned with absolute offsets
/// (`start_offset` is the input's own offset in final-image space).
///
/// `recycle` may supply buffers to reuse for the piece encodings.
pub fn split(
    input: &SparseImage,
    start_offset: usize,
    k: usize,
    remaining_partitions: usize,
    mut recycle: Vec<Vec<u8>>,
) -> ComposeResult<Vec<SplitPiece>> {
    if k == 0 || remaining_partitions < k || !remaining_partitions.is_multiple_of(k) {
        return Err(ComposeError::sanity(format!(
            "cannot split into {k} of {remaining_partitions} remaining partitions"
        )));
    }

    let n = input.num_pixels();
    let layout = input.layout();
    let sub = remaining_partitions / k;
    let base = n / remaining_partitions;
    let remainder = n % remaining_partitions;

    let mut pieces = Vec::with_capacity(k);
    let mut cursor = PixelCursor::new(input);
    let mut offset = start_offset;
    for i in 0..k {
        let size = sub * base + remainder.saturating_sub(i * sub).min(sub);
        let mut writer = SparseWriter::new(layout, recycle.pop().unwrap_or_default());
        writer.reserve_for(size);

        let mut need = size;
        while need > 0 {
            let Some(run) = cursor.peek()? else {
                return Err(ComposeError::sanity("split ran out of input pixels"));
            };
            match run {
                Run::Inactive(count) => {
                    let take = count.min(need);
                    writer.push_inactive(take);
                    cursor.advance(take);
                    need -= take;
                }
                Run::Active { count, records } => {
                    let take = count.min(need);
                    let record_size = layout.pixel_size();
                    writer.push_active_records(&records[..take * record_size], take);
                    cursor.advance(take);
                    need -= take;
                }
            }
        }

        pieces.push(SplitPiece {
            image: writer.finish(size, 1)?,
            offset,
        });
        offset += size;
    }
    if cursor.peek()?.is_some() {
        return Err(ComposeError::sanity("split left input pixels unconsumed"));
    }
    Ok(pieces)
}
