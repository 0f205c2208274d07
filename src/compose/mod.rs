//! Composition strategies and their driver: the radix-k composer, the
//! reduce delegator and façade, and the collect step that assembles tile
//! images on their display nodes.

mod radixk;
mod reduce;

pub use radixk::radixk_compose;
pub use reduce::{Delegation, TileRenderer, delegate, reduce_compose};

pub use crate::state::config::ComposeStrategy;

use crate::foundation::error::{ComposeError, ComposeResult};
use crate::image::{DenseImage, Orientation, SparseImage, composite_sub};
use crate::state::buffers::{BufferName, StateBufferPool};
use crate::state::config::SessionOpts;
use crate::state::topology::TileParams;
use crate::transport::{Communicator, Tag};

/// Tag for collect piece payloads.
const COLLECT_TAG: Tag = 2300;

/// Composite one tile's partial images across its compose group.
///
/// Thin dispatcher over the configured [`ComposeStrategy`]. Returns the
/// caller's piece of the composited image and the piece's offset in the
/// tile's pixel space.
pub fn single_image_compose(
    opts: &SessionOpts,
    pool: &mut StateBufferPool,
    comm: &mut dyn Communicator,
    compose_group: &[usize],
    image_dest: usize,
    input: SparseImage,
) -> ComposeResult<(SparseImage, usize)> {
    match opts.single_image_strategy {
        ComposeStrategy::RadixK => {
            radixk_compose(opts, pool, comm, compose_group, image_dest, input)
        }
    }
}

/// Assemble the composited pieces of one tile on its display node.
///
/// World-collective: every process calls this once per tile, passing its
/// piece and offset when it composited part of this tile and `None`
/// otherwise. Piece placements are gathered to the display node first, then
/// non-empty pieces travel point to point and are unpacked into the dense
/// result over a cleared background. Returns the assembled image at the
/// display node, `None` everywhere else.
pub fn single_image_collect(
    comm: &mut dyn Communicator,
    opts: &SessionOpts,
    pool: &mut StateBufferPool,
    tile: &TileParams,
    piece: Option<(SparseImage, usize)>,
) -> ComposeResult<Option<DenseImage>> {
    let layout = opts.layout()?;
    let root = tile.display_node;

    let (offset, pixels) = piece
        .as_ref()
        .map(|(image, offset)| (*offset, image.num_pixels()))
        .unwrap_or((0, 0));
    let mut record = Vec::with_capacity(16);
    record.extend_from_slice(&(offset as u64).to_le_bytes());
    record.extend_from_slice(&(pixels as u64).to_le_bytes());
    let gathered = comm.gather(root, record)?;

    if comm.rank() != root {
        if let Some((image, _)) = piece {
            if pixels > 0 {
                comm.send(root, COLLECT_TAG, image.package_for_send())?;
            } else {
                pool.put(BufferName::CollectResult, image.into_buf());
            }
        }
        return Ok(None);
    }

    let records = gathered.ok_or_else(|| {
        ComposeError::transport("gather returned no records at the collect root")
    })?;
    let mut dense = DenseImage::new(layout, tile.width, tile.height);
    for (rank, record) in records.iter().enumerate() {
        let (piece_offset, piece_pixels) = decode_placement(record)?;
        if piece_pixels == 0 {
            continue;
        }
        if rank == root {
            let Some((image, _)) = piece.as_ref() else {
                return Err(ComposeError::sanity(
                    "collect root gathered its own piece but holds none",
                ));
            };
            composite_sub(&mut dense, opts.composite_mode, piece_offset, image, Orientation::DestOnTop)?;
        } else {
            let bytes = comm.recv(rank, COLLECT_TAG)?;
            let image = SparseImage::unpackage_from_receive(bytes)?;
            if image.num_pixels() != piece_pixels || image.layout() != layout {
                return Err(ComposeError::format(
                    "collected piece does not match its gathered placement",
                ));
            }
            composite_sub(&mut dense, opts.composite_mode, piece_offset, &image, Orientation::DestOnTop)?;
        }
    }
    if let Some((image, _)) = piece {
        pool.put(BufferName::CollectResult, image.into_buf());
    }
    Ok(Some(dense))
}

fn decode_placement(record: &[u8]) -> ComposeResult<(usize, usize)> {
    if record.len() != 16 {
        return Err(ComposeError::format("collect placement record malformed"));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&record[..8]);
    let offset = u64::from_le_bytes(word) as usize;
    word.copy_from_slice(&record[8..]);
    let pixels = u64::from_le_bytes(word) as usize;
    Ok((offset, pixels))
}
