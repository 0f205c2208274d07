use crate::foundation::error::{ComposeError, ComposeResult};
use crate::image::sparse::{SparseImage, SparseWriter};
use crate::image::split::split;
use crate::state::buffers::{BufferName, StateBufferPool};

/// Permute a sparse image so that a later partition into `groups` contiguous
/// pieces draws each piece from across the whole input.
///
/// Active pixels cluster where the scene projects, so un-permuted pieces
/// have wildly different active counts. The input's `groups` eventual
/// partitions (blocks) are shuffled by bit-reversed index, which spreads
/// neighboring blocks far apart at every factor of the later splits. The
/// shuffle keeps the `n % groups` oversized blocks in the leading slots and
/// the base-size blocks in the trailing slots so every later split boundary
/// still falls exactly on a block boundary.
///
/// The inverse is recomputable from `(global_partition, groups, n)` alone;
/// see [`interlace_offset`].
pub fn interlace(
    input: &SparseImage,
    groups: usize,
    pool: &mut StateBufferPool,
) -> ComposeResult<SparseImage> {
    if groups == 0 {
        return Err(ComposeError::sanity("cannot interlace into zero groups"));
    }
    let n = input.num_pixels();

    let recycle = (0..groups)
        .map(|_| pool.take(BufferName::InterlaceScratch))
        .collect();
    let blocks = split(input, 0, groups, groups, recycle)?;

    let mut writer = SparseWriter::new(input.layout(), pool.take(BufferName::RadixkInterlaced));
    writer.reserve_for(n);
    for slot in 0..groups {
        let source = source_block(slot, groups, n);
        writer.append_runs(&blocks[source].image)?;
    }
    let out = writer.finish(input.width(), input.height())?;

    for block in blocks {
        pool.put(BufferName::InterlaceScratch, block.image.into_buf());
    }
    Ok(out)
}

/// Offset in the original image of the pixels that global partition
/// `global_partition` owns after compositing an interlaced image.
pub fn interlace_offset(
    global_partition: usize,
    groups: usize,
    num_pixels: usize,
) -> ComposeResult<usize> {
    if groups == 0 || global_partition >= groups {
        return Err(ComposeError::sanity(format!(
            "global partition {global_partition} out of {groups} groups"
        )));
    }
    let source = source_block(global_partition, groups, num_pixels);
    let base = num_pixels / groups;
    let remainder = num_pixels % groups;
    Ok(source * base + source.min(remainder))
}

/// The source block placed at `slot` by the interlace shuffle.
///
/// Oversized blocks (indices below `n % groups`) shuffle among the leading
/// slots, base-size blocks among the rest; each class by filtered
/// bit-reversal.
fn source_block(slot: usize, groups: usize, num_pixels: usize) -> usize {
    let remainder = num_pixels % groups;
    if slot < remainder {
        bit_reversed(slot, remainder)
    } else {
        remainder + bit_reversed(slot - remainder, groups - remainder)
    }
}

/// The `index`-th value of the bit-reversal enumeration of `0..len`:
/// reverse `ceil(log2(len))` bits, skipping reversals that land outside the
/// range.
fn bit_reversed(index: usize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let bits = usize::BITS - (len - 1).leading_zeros();
    let mut seen = 0;
    for v in 0..(1usize << bits) {
        let u = v.reverse_bits() >> (usize::BITS - bits);
        if u < len {
            if seen == index {
                return u;
            }
            seen += 1;
        }
    }
    unreachable!("bit-reversal enumeration is a permutation");
}
