use smallvec::SmallVec;
use tracing::debug;

use crate::foundation::error::{ComposeError, ComposeResult};
use crate::foundation::pivot::pivot_range;
use crate::image::{
    SparseImage, buffer_size, composite, interlace, interlace_offset, split,
    split_partition_num_pixels,
};
use crate::state::buffers::{BufferName, StateBufferPool};
use crate::state::config::{CompositeMode, PixelLayout, SessionOpts};
use crate::transport::{Communicator, RequestId, Tag};

/// Base tag for piece exchanges; offset by the round index so a straggler
/// from an earlier round can never match a current-round receive.
const SWAP_IMAGE_TAG_BASE: Tag = 2200;

type Factors = SmallVec<[usize; 8]>;

/// One peer of the current round.
struct Partner {
    rank: usize,
    piece_offset: usize,
    piece_size: usize,
    state: PieceState,
}

/// Progress of a partner's piece through the composite tree.
enum PieceState {
    /// Not delivered yet.
    Pending,
    /// Delivered and sitting at `level` of the tree.
    Arrived { level: u32, image: SparseImage },
    /// Consumed as the back operand of a composite.
    Done,
}

impl Partner {
    fn level(&self) -> Option<u32> {
        match &self.state {
            PieceState::Arrived { level, .. } => Some(*level),
            _ => None,
        }
    }
}

/// Factor the group size into per-round k values near `magic_k`.
///
/// Prefers `magic_k` itself, then the closest divisor in `[2, 2*magic_k)`
/// searched outward from `magic_k`, then the smallest divisor above that
/// range. A remaining prime ends up as one big final round.
pub(crate) fn factor_rounds(group_size: usize, magic_k: usize) -> ComposeResult<Factors> {
    let mut factors = Factors::new();
    let max_rounds = if group_size > 1 {
        group_size.ilog2() as usize
    } else {
        0
    };

    let mut next_divide = group_size;
    while next_divide > 1 {
        let mut next_k = None;

        if next_divide.is_multiple_of(magic_k) {
            next_k = Some(magic_k);
        }
        if next_k.is_none() {
            next_k = pivot_range(2, magic_k, 2 * magic_k)
                .find(|&try_k| next_divide.is_multiple_of(try_k));
        }
        if next_k.is_none() {
            // The smallest useful factor above 2*magic_k is at most the
            // square root; anything between that and next_divide itself
            // cannot be a smallest factor.
            let max_k = next_divide.isqrt();
            next_k = (2 * magic_k..max_k).find(|&try_k| next_divide.is_multiple_of(try_k));
        }
        // Still nothing: next_divide is a large prime. Give up and use it.
        let next_k = next_k.unwrap_or(next_divide);

        factors.push(next_k);
        next_divide /= next_k;
        if factors.len() > max_rounds {
            return Err(ComposeError::sanity(
                "more radix-k factors than possible for the group size",
            ));
        }
    }

    if factors.iter().product::<usize>() != group_size {
        return Err(ComposeError::sanity(
            "product of radix-k factors does not equal the group size",
        ));
    }
    Ok(factors)
}

/// The caller's partition index for every round: digit `r` of its group
/// rank in the mixed radix given by the factors.
fn partition_indices(factors: &Factors, group_rank: usize) -> Factors {
    let mut indices = Factors::new();
    let mut step = 1;
    for &k in factors {
        indices.push((group_rank / step) % k);
        step *= k;
    }
    indices
}

/// Composite the partial images of `compose_group` with radix-k swaps.
///
/// Each round splits the working image into k pieces, trades pieces with
/// the round's k partners, and composites the received pieces in a pairwise
/// tree. After the final round every participant owns a disjoint, evenly
/// sized partition of the composited image; the return value is that
/// partition and its offset in final-image pixel space.
///
/// `compose_group` lists the participating world ranks in composite order
/// (earlier is in front for blending). The caller's rank must be in the
/// group. `image_dest` is advisory only: radix-k always leaves the image
/// evenly partitioned.
pub fn radixk_compose(
    opts: &SessionOpts,
    pool: &mut StateBufferPool,
    comm: &mut dyn Communicator,
    compose_group: &[usize],
    _image_dest: usize,
    input: SparseImage,
) -> ComposeResult<(SparseImage, usize)> {
    let group_size = compose_group.len();
    let Some(group_rank) = compose_group.iter().position(|&r| r == comm.rank()) else {
        return Err(ComposeError::topology(format!(
            "local rank {} not in compose group",
            comm.rank()
        )));
    };

    if group_size == 1 {
        // Alone in the group: the input already is the composited image.
        return Ok((input, 0));
    }

    let layout = opts.layout()?;
    if input.layout() != layout {
        return Err(ComposeError::format(
            "input image layout differs from session formats",
        ));
    }

    let factors = factor_rounds(group_size, opts.magic_k)?;
    if factors.is_empty() {
        return Err(ComposeError::sanity("radix-k has no rounds"));
    }
    let indices = partition_indices(&factors, group_rank);
    debug!(group_size, ?factors, group_rank, "starting radix-k compose");

    let original_pixels = input.num_pixels();
    let use_interlace = factors.len() > 1 && opts.interlace_images;
    let mut working = if use_interlace {
        let interlaced = interlace(&input, group_size, pool)?;
        pool.put(BufferName::RadixkSpare, input.into_buf());
        interlaced
    } else {
        input
    };

    let mut my_offset = 0usize;
    let mut remaining_partitions = group_size;

    for (round, &current_k) in factors.iter().enumerate() {
        let my_size = working.num_pixels();
        let my_index = indices[round];
        let tag = SWAP_IMAGE_TAG_BASE + round as Tag;
        let step: usize = factors[..round].iter().product();
        let first_group_rank = group_rank - my_index * step;

        let max_piece = split_partition_num_pixels(my_size, current_k, remaining_partitions);
        let receive_capacity = buffer_size(layout, max_piece);

        let mut partners: Vec<Partner> = (0..current_k)
            .map(|i| Partner {
                rank: compose_group[first_group_rank + i * step],
                piece_offset: 0,
                piece_size: 0,
                state: PieceState::Pending,
            })
            .collect();

        // Post every receive before any piece goes out.
        let mut receive_slots: Vec<Option<RequestId>> = Vec::with_capacity(current_k);
        for (i, partner) in partners.iter().enumerate() {
            receive_slots.push(if i == my_index {
                None
            } else {
                Some(comm.irecv(partner.rank, tag)?)
            });
        }

        let recycle = (0..current_k)
            .map(|_| pool.take(BufferName::RadixkSend))
            .collect();
        let split_pieces = split(&working, my_offset, current_k, remaining_partitions, recycle)?;
        for (partner, piece) in partners.iter_mut().zip(&split_pieces) {
            partner.piece_offset = piece.offset;
            partner.piece_size = piece.image.num_pixels();
        }
        let expected_size = partners[my_index].piece_size;
        pool.put(BufferName::RadixkSpare, working.into_buf());

        // Send outward from the own index: each peer starts its composite
        // tree with the piece nearest its own, so staggering the order gets
        // first-needed pieces onto the wire first.
        let mut pieces: Vec<Option<SparseImage>> =
            split_pieces.into_iter().map(|p| Some(p.image)).collect();
        let mut send_slots: Vec<Option<RequestId>> = (0..current_k).map(|_| None).collect();
        for i in pivot_range(0, my_index, current_k) {
            let Some(piece) = pieces[i].take() else {
                return Err(ComposeError::sanity("split piece vanished before send"));
            };
            if i == my_index {
                partners[i].state = PieceState::Arrived {
                    level: 0,
                    image: piece,
                };
            } else {
                let payload = piece.package_for_send();
                send_slots[i] = Some(comm.isend(partners[i].rank, tag, payload)?);
            }
        }

        working = composite_incoming(
            comm,
            opts.composite_mode,
            ExpectedPiece {
                layout,
                pixels: expected_size,
                max_bytes: receive_capacity,
            },
            &mut partners,
            &mut receive_slots,
            my_index,
            pool,
        )?;

        comm.wait_all(&mut send_slots)?;
        my_offset = partners[my_index].piece_offset;
        remaining_partitions /= current_k;
    }

    let piece_offset = if use_interlace {
        let mut global_partition = 0usize;
        for (round, &index) in indices.iter().enumerate() {
            let weight: usize = factors[round + 1..].iter().product();
            global_partition += index * weight;
        }
        interlace_offset(global_partition, group_size, original_pixels)?
    } else {
        my_offset
    };

    Ok((working, piece_offset))
}

/// What a received piece must look like to enter the tree.
#[derive(Clone, Copy)]
struct ExpectedPiece {
    layout: PixelLayout,
    pixels: usize,
    max_bytes: usize,
}

/// Drain receives with wait-any, feeding each arrival into the composite
/// tree until the round's k pieces have merged into one image.
fn composite_incoming(
    comm: &mut dyn Communicator,
    mode: CompositeMode,
    expected: ExpectedPiece,
    partners: &mut [Partner],
    receive_slots: &mut [Option<RequestId>],
    my_index: usize,
    pool: &mut StateBufferPool,
) -> ComposeResult<SparseImage> {
    let mut scratch = pool.take(BufferName::RadixkSpare);

    // The self piece arrived implicitly; it may already promote a level.
    let mut done = try_composite_incoming(mode, partners, my_index, &mut scratch, pool)?;

    while !done {
        let (receive_index, payload) = comm.wait_any(receive_slots)?;
        let Some(bytes) = payload else {
            return Err(ComposeError::sanity("send request among round receives"));
        };
        if bytes.len() > expected.max_bytes {
            return Err(ComposeError::format(
                "received piece exceeds the sized receive buffer",
            ));
        }
        let image = SparseImage::unpackage_from_receive(bytes)?;
        if image.num_pixels() != expected.pixels || image.layout() != expected.layout {
            return Err(ComposeError::format(
                "radix-k received an image with the wrong size",
            ));
        }
        partners[receive_index].state = PieceState::Arrived { level: 0, image };
        done = try_composite_incoming(mode, partners, receive_index, &mut scratch, pool)?;
    }
    pool.put(BufferName::RadixkSpare, scratch);

    match std::mem::replace(&mut partners[0].state, PieceState::Done) {
        PieceState::Arrived { image, .. } => Ok(image),
        _ => Err(ComposeError::sanity("composite tree finished without a root")),
    }
}

/// Promote the piece at `incoming` up the pairwise tree as far as arrivals
/// allow. Returns true when the whole round has been composited.
///
/// A node's sibling at level L sits 2^L away; the pair composites front
/// (lower index) over back, the result replaces the front at level L+1,
/// and the back is done. A node whose sibling falls outside the round
/// promotes without compositing, except at the root, where that means the
/// tree is complete.
fn try_composite_incoming(
    mode: CompositeMode,
    partners: &mut [Partner],
    incoming: usize,
    scratch: &mut Vec<u8>,
    pool: &mut StateBufferPool,
) -> ComposeResult<bool> {
    let current_k = partners.len();
    let mut index = incoming;

    loop {
        let Some(level) = partners[index].level() else {
            return Err(ComposeError::sanity("composite walk left an arrived node"));
        };
        let dist_to_sibling = 1usize << level;
        let subtree_size = dist_to_sibling << 1;

        let (front, back) = if index.is_multiple_of(subtree_size) {
            let back = index + dist_to_sibling;
            if back >= current_k {
                if index == 0 {
                    // No partner at the top of the tree: fully composited.
                    break;
                }
                set_level(&mut partners[index], level + 1);
                continue;
            }
            (index, back)
        } else {
            (index - dist_to_sibling, index)
        };

        if partners[front].level() != partners[back].level() {
            // The pair is incomplete; wait for more arrivals.
            break;
        }

        let front_image = take_image(&mut partners[front])?;
        let back_image = take_image(&mut partners[back])?;
        let merged = composite(mode, &front_image, &back_image, std::mem::take(scratch))?;
        *scratch = front_image.into_buf();
        pool.put(BufferName::RadixkSend, back_image.into_buf());
        partners[front].state = PieceState::Arrived {
            level: level + 1,
            image: merged,
        };
        partners[back].state = PieceState::Done;
        index = front;
    }

    Ok(partners[0]
        .level()
        .is_some_and(|level| (1usize << level) >= current_k))
}

fn set_level(partner: &mut Partner, new_level: u32) {
    if let PieceState::Arrived { level, .. } = &mut partner.state {
        *level = new_level;
    }
}

fn take_image(partner: &mut Partner) -> ComposeResult<SparseImage> {
    match std::mem::replace(&mut partner.state, PieceState::Done) {
        PieceState::Arrived { image, .. } => Ok(image),
        _ => Err(ComposeError::sanity("composite pair member has no image")),
    }
}
