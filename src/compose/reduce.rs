use tracing::debug;

use crate::compose::{single_image_collect, single_image_compose};
use crate::foundation::error::{ComposeError, ComposeResult};
use crate::image::{DenseImage, SparseImage, composite, compress};
use crate::state::Session;
use crate::state::buffers::{BufferName, StateBufferPool};
use crate::state::config::SessionOpts;
use crate::state::topology::Topology;
use crate::transport::{Communicator, RequestId, Tag};

/// Base tag for contribution transfers; offset by tile index.
const TRANSFER_TAG_BASE: Tag = 2100;

/// The rendering front-end as the reduce façade consumes it.
pub trait TileRenderer {
    /// Produce the dense partial image this process rendered for `tile`.
    /// The image must match the tile dimensions and the session formats.
    fn render_tile(&mut self, tile: usize) -> ComposeResult<DenseImage>;
}

/// The delegation plan for one compose, as seen by the calling process.
///
/// Every process derives the identical plan from the shared session state;
/// the per-rank fields below are this process's slice of it.
#[derive(Clone, Debug)]
pub struct Delegation {
    /// The tile this process was seated to composite, if any.
    pub compose_tile: Option<usize>,
    /// Compose group of that tile, in composite order for ordered sessions.
    /// Empty when unseated.
    pub compose_group: Vec<usize>,
    /// Index of the tile's display node within `compose_group` (ordered
    /// sessions; zero otherwise).
    pub group_image_dest: usize,
    /// For each tile this process contributes to, the rank its contribution
    /// is sent to.
    pub tile_send_dest: Vec<Option<usize>>,
    /// Per tile, every `(contributor, destination)` pair. Receivers use this
    /// to know which transfers to expect.
    pub(crate) tile_assignments: Vec<Vec<(usize, usize)>>,
    /// Per tile, the seated process group.
    pub(crate) groups: Vec<Vec<usize>>,
}

fn ratio(contrib: usize, quota: usize) -> f64 {
    contrib as f64 / quota as f64
}

/// Compute the process-to-tile delegation.
///
/// Tiles are granted process quotas proportional to their contribution
/// counts, display nodes and contributors are seated into their tiles, and
/// every contribution gets a send destination inside its tile's group —
/// minimizing transfers in unordered sessions, and preserving contiguous
/// composite-order chunks in ordered ones.
pub fn delegate(opts: &SessionOpts, topology: &Topology) -> ComposeResult<Delegation> {
    let num_tiles = topology.tiles.len();
    let num_processes = topology.num_processes;
    let rank = topology.rank;
    let contrib = topology.contrib_counts();
    let total: usize = contrib.iter().sum();

    if total < 1 {
        debug!("no processes are drawing");
        return Ok(Delegation {
            compose_tile: None,
            compose_group: Vec::new(),
            group_image_dest: 0,
            tile_send_dest: vec![None; num_tiles],
            tile_assignments: vec![Vec::new(); num_tiles],
            groups: vec![Vec::new(); num_tiles],
        });
    }

    // Minimum process count per tile, proportional to contributions but at
    // least one for any tile with images and never more than its images.
    let mut quota: Vec<usize> = (0..num_tiles)
        .map(|t| {
            let proportional = contrib[t] * num_processes / total;
            proportional.max(usize::from(contrib[t] > 0)).min(contrib[t])
        })
        .collect();
    let mut allocated: usize = quota.iter().sum();

    // Hand out leftover processes to the tiles with the most images per
    // process; earlier tiles win ties.
    while allocated < num_processes {
        let mut max = 0;
        for t in 1..num_tiles {
            if quota[t] < contrib[t]
                && (quota[max] == contrib[max]
                    || ratio(contrib[max], quota[max]) < ratio(contrib[t], quota[t]))
            {
                max = t;
            }
        }
        if quota[max] < contrib[max] {
            quota[max] += 1;
            allocated += 1;
        } else {
            // Every tile is saturated; leftover processes stay unseated.
            break;
        }
    }

    // Take processes back from the tiles with the fewest images per process.
    while allocated > num_processes {
        let mut min = 0;
        for t in 1..num_tiles {
            if quota[t] > 1
                && (quota[min] < 2 || ratio(contrib[min], quota[min]) > ratio(contrib[t], quota[t]))
            {
                min = t;
            }
        }
        if quota[min] == 0 {
            return Err(ComposeError::sanity("quota rebalance underflow"));
        }
        quota[min] -= 1;
        allocated -= 1;
    }

    let mut node_assignment: Vec<Option<usize>> = vec![None; num_processes];
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); num_tiles];
    fn seat(
        assignment: &mut [Option<usize>],
        groups: &mut [Vec<usize>],
        node: usize,
        tile: usize,
    ) {
        assignment[node] = Some(tile);
        groups[tile].push(node);
    }

    // Display nodes first: a tile with images must include its display node.
    for t in 0..num_tiles {
        if contrib[t] > 0 {
            seat(
                &mut node_assignment,
                &mut groups,
                topology.tiles[t].display_node,
                t,
            );
        }
    }

    // Seat every remaining process into some tile it renders, if that tile
    // still has room.
    for node in 0..num_processes {
        if node_assignment[node].is_some() {
            continue;
        }
        for t in 0..num_tiles {
            if topology.contained_masks[node][t] && groups[t].len() < quota[t] {
                seat(&mut node_assignment, &mut groups, node, t);
                break;
            }
        }
    }

    // Fill leftover quota slots with whoever is still unseated.
    let mut node = 0;
    for t in 0..num_tiles {
        while groups[t].len() < quota[t] {
            while node < num_processes && node_assignment[node].is_some() {
                node += 1;
            }
            if node >= num_processes {
                return Err(ComposeError::sanity("seating ran out of processes"));
            }
            seat(&mut node_assignment, &mut groups, node, t);
        }
    }

    // Send destinations per tile.
    let mut tile_assignments: Vec<Vec<(usize, usize)>> = vec![Vec::new(); num_tiles];
    let mut group_image_dest = 0;
    for t in 0..num_tiles {
        if contrib[t] == 0 {
            continue;
        }
        let mut assignments = Vec::with_capacity(contrib[t]);
        let group_size = groups[t].len();

        if !opts.ordered_composite {
            // Free to route any image anywhere: keep seated contributors'
            // images in place and deal the rest round-robin to group members
            // that do not already hold an image of their own.
            let mut receiver = 0usize;
            let mut started = false;
            let mut first_loop = true;
            for snode in 0..num_processes {
                if !topology.contained_masks[snode][t] {
                    continue;
                }
                if node_assignment[snode] == Some(t) {
                    assignments.push((snode, snode));
                    continue;
                }
                loop {
                    if started {
                        receiver += 1;
                    } else {
                        started = true;
                    }
                    if receiver >= group_size {
                        receiver = 0;
                        first_loop = false;
                    }
                    let dest = groups[t][receiver];
                    let keeps_own_image = topology.contained_masks[dest][t]
                        && node_assignment[dest] == Some(t);
                    if !(first_loop && keeps_own_image) {
                        break;
                    }
                }
                assignments.push((snode, groups[t][receiver]));
            }
        } else {
            // Ordered composite: each group member must end up with a
            // contiguous chunk of the composite order. Communication costs
            // come second.
            let contributors: Vec<usize> = opts
                .composite_order
                .iter()
                .copied()
                .filter(|&s| topology.contained_masks[s][t])
                .collect();
            if contributors.len() != contrib[t] {
                return Err(ComposeError::sanity(
                    "miscounted number of tile contributions",
                ));
            }

            // Shuffle the group so a seated contributor sits at the slot of
            // the chunk it belongs to, keeping its images local.
            for (i, &snode) in contributors.iter().enumerate() {
                let slot = i * group_size / contributors.len();
                if node_assignment[snode] == Some(t) {
                    let Some(j) = (0..group_size).rev().find(|&j| groups[t][j] == snode) else {
                        return Err(ComposeError::sanity("seated contributor missing from group"));
                    };
                    groups[t].swap(j, slot);
                }
            }

            if node_assignment[rank] == Some(t) {
                group_image_dest = groups[t]
                    .iter()
                    .position(|&r| r == topology.tiles[t].display_node)
                    .ok_or_else(|| {
                        ComposeError::sanity("display process not participating in its tile")
                    })?;
            }

            for (i, &snode) in contributors.iter().enumerate() {
                let slot = i * group_size / contributors.len();
                assignments.push((snode, groups[t][slot]));
            }
        }

        tile_assignments[t] = assignments;
    }

    // Every contribution must have exactly one destination in its group.
    for t in 0..num_tiles {
        if tile_assignments[t].len() != contrib[t] {
            return Err(ComposeError::sanity("contribution without a destination"));
        }
        for &(_, dest) in &tile_assignments[t] {
            if !groups[t].contains(&dest) {
                return Err(ComposeError::sanity("send destination outside tile group"));
            }
        }
    }

    let compose_tile = node_assignment[rank];
    let compose_group = compose_tile.map(|t| groups[t].clone()).unwrap_or_default();
    let tile_send_dest = (0..num_tiles)
        .map(|t| {
            tile_assignments[t]
                .iter()
                .find(|&&(s, _)| s == rank)
                .map(|&(_, d)| d)
        })
        .collect();

    Ok(Delegation {
        compose_tile,
        compose_group,
        group_image_dest,
        tile_send_dest,
        tile_assignments,
        groups,
    })
}

/// Compose every tile with the reduce strategy and collect the results to
/// their display nodes.
///
/// Each process renders and compresses its contributions, ships them to
/// their delegated destinations, composites whatever lands on it, runs the
/// single-image compose over its tile's group, and takes part in one
/// collect per tile. Returns the assembled dense image when this process
/// displays a tile, `None` otherwise; displaying a tile nobody rendered to
/// yields a cleared image.
pub fn reduce_compose(
    session: &mut Session,
    comm: &mut dyn Communicator,
    renderer: &mut dyn TileRenderer,
) -> ComposeResult<Option<DenseImage>> {
    let (opts, topology, pool) = session.parts();
    if comm.rank() != topology.rank || comm.num_ranks() != topology.num_processes {
        return Err(ComposeError::topology(
            "communicator does not match the session topology",
        ));
    }
    debug!(rank = topology.rank, "in reduce compose");

    let layout = opts.layout()?;
    let plan = delegate(opts, topology)?;

    // Transfer phase: render own contributions and ship them out.
    let mut transfer_sends: Vec<Option<RequestId>> = Vec::new();
    let mut held: Vec<(usize, SparseImage)> = Vec::new();
    for (t, tile) in topology.tiles.iter().enumerate() {
        if !topology.contained_masks[topology.rank][t] {
            continue;
        }
        let dense = renderer.render_tile(t)?;
        if dense.layout() != layout
            || dense.width() != tile.width
            || dense.height() != tile.height
        {
            return Err(ComposeError::format(format!(
                "rendered image for tile {t} does not match tile parameters"
            )));
        }
        let sparse = compress(&dense, opts.composite_mode)?;
        let Some(dest) = plan.tile_send_dest[t] else {
            return Err(ComposeError::sanity("contribution without a destination"));
        };
        if dest == topology.rank {
            if plan.compose_tile != Some(t) {
                return Err(ComposeError::sanity("self destination outside own tile"));
            }
            held.push((topology.rank, sparse));
        } else {
            let request = comm.isend(dest, TRANSFER_TAG_BASE + t as Tag, sparse.package_for_send())?;
            transfer_sends.push(Some(request));
        }
    }

    // Compose phase: merge incoming contributions and run the group compose.
    let mut composed: Option<(SparseImage, usize)> = None;
    if let Some(t) = plan.compose_tile {
        let tile = &topology.tiles[t];
        let mut items = held;

        let senders: Vec<usize> = plan.tile_assignments[t]
            .iter()
            .filter(|&&(s, d)| d == topology.rank && s != topology.rank)
            .map(|&(s, _)| s)
            .collect();
        let mut slots: Vec<Option<RequestId>> = Vec::with_capacity(senders.len());
        for &s in &senders {
            slots.push(Some(comm.irecv(s, TRANSFER_TAG_BASE + t as Tag)?));
        }
        while slots.iter().any(Option::is_some) {
            let (i, payload) = comm.wait_any(&mut slots)?;
            let Some(bytes) = payload else {
                return Err(ComposeError::sanity("send request among transfer receives"));
            };
            let image = SparseImage::unpackage_from_receive(bytes)?;
            if image.num_pixels() != tile.num_pixels() || image.layout() != layout {
                return Err(ComposeError::format(
                    "transferred contribution does not cover its tile",
                ));
            }
            items.push((senders[i], image));
        }

        if opts.ordered_composite {
            // Incoming images are a contiguous chunk of the composite
            // order; merge them front to back.
            let order_index = |r: usize| {
                opts.composite_order.iter().position(|&o| o == r).unwrap_or(usize::MAX)
            };
            items.sort_by_key(|&(s, _)| order_index(s));
        }

        let mut iter = items.into_iter();
        let mut accumulated = match iter.next() {
            Some((_, first)) => first,
            // Seated without any routed contribution: start from an empty
            // tile image.
            None => SparseImage::new_inactive(
                layout,
                tile.width,
                tile.height,
                pool.take(BufferName::ReduceTransfer),
            )?,
        };
        for (_, image) in iter {
            let merged = composite(
                opts.composite_mode,
                &accumulated,
                &image,
                pool.take(BufferName::ReduceTransfer),
            )?;
            pool.put(BufferName::ReduceTransfer, accumulated.into_buf());
            pool.put(BufferName::ReduceTransfer, image.into_buf());
            accumulated = merged;
        }

        composed = Some(single_image_compose(
            opts,
            pool,
            comm,
            &plan.compose_group,
            plan.group_image_dest,
            accumulated,
        )?);
    }

    comm.wait_all(&mut transfer_sends)?;

    // Collect phase: all processes take part in every tile's collect.
    let displayed = topology.displayed_tile();
    let mut display_image = None;
    for (t, tile) in topology.tiles.iter().enumerate() {
        let piece = if plan.compose_tile == Some(t) {
            composed.take()
        } else {
            None
        };
        let collected = single_image_collect(comm, opts, pool, tile, piece)?;
        if displayed == Some(t) {
            display_image = collected;
        }
    }

    Ok(display_image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::config::{ColorFormat, CompositeMode, DepthFormat};
    use crate::state::topology::TileParams;

    fn topology(masks: Vec<Vec<bool>>, displays: Vec<usize>) -> Topology {
        let tiles = displays
            .into_iter()
            .map(|display_node| TileParams {
                width: 4,
                height: 4,
                display_node,
            })
            .collect();
        Topology {
            num_processes: masks.len(),
            rank: 0,
            tiles,
            contained_masks: masks,
        }
    }

    fn unordered_opts() -> SessionOpts {
        SessionOpts::default()
    }

    fn quota_of(plan_groups: &[Vec<usize>]) -> Vec<usize> {
        plan_groups.iter().map(Vec::len).collect()
    }

    #[test]
    fn quotas_sum_to_process_count() {
        // 8 processes, 3 tiles, contributions [6, 2, 8].
        let mut masks = vec![vec![false; 3]; 8];
        for p in 0..6 {
            masks[p][0] = true;
        }
        for p in 0..2 {
            masks[p][1] = true;
        }
        for p in 0..8 {
            masks[p][2] = true;
        }
        let topo = topology(masks, vec![0, 1, 2]);
        let plan = delegate(&unordered_opts(), &topo).unwrap();

        let seats = quota_of(&plan.groups);
        assert_eq!(seats.iter().sum::<usize>(), 8);
        assert!(seats[2] >= 3, "largest tile got {seats:?}");
        // No process seated twice.
        let mut seen = vec![false; 8];
        for group in &plan.groups {
            for &p in group {
                assert!(!seen[p], "process {p} seated twice");
                seen[p] = true;
            }
        }
    }

    #[test]
    fn display_nodes_sit_in_their_groups() {
        let masks = vec![
            vec![true, false],
            vec![true, true],
            vec![false, true],
            vec![false, true],
        ];
        let topo = topology(masks, vec![3, 0]);
        let plan = delegate(&unordered_opts(), &topo).unwrap();
        assert!(plan.groups[0].contains(&3));
        assert!(plan.groups[1].contains(&0));
    }

    #[test]
    fn every_contribution_has_one_destination_in_group() {
        let masks = vec![
            vec![true, true],
            vec![true, false],
            vec![true, true],
            vec![false, true],
            vec![true, false],
        ];
        let topo = topology(masks, vec![0, 4]);
        let plan = delegate(&unordered_opts(), &topo).unwrap();
        for (t, assignments) in plan.tile_assignments.iter().enumerate() {
            assert_eq!(assignments.len(), topo.contrib_count(t));
            let mut senders: Vec<usize> = assignments.iter().map(|&(s, _)| s).collect();
            senders.sort_unstable();
            senders.dedup();
            assert_eq!(senders.len(), assignments.len());
            for &(_, dest) in assignments {
                assert!(plan.groups[t].contains(&dest));
            }
        }
    }

    #[test]
    fn seated_contributors_send_to_themselves_unordered() {
        let masks = vec![vec![true], vec![true], vec![true], vec![true]];
        let topo = topology(masks, vec![1]);
        let plan = delegate(&unordered_opts(), &topo).unwrap();
        // One tile, everyone contributes, everyone is seated: all self-sends.
        for &(s, d) in &plan.tile_assignments[0] {
            assert_eq!(s, d);
        }
    }

    #[test]
    fn no_contributions_means_no_assignment() {
        let masks = vec![vec![false], vec![false]];
        let topo = topology(masks, vec![0]);
        let plan = delegate(&unordered_opts(), &topo).unwrap();
        assert_eq!(plan.compose_tile, None);
        assert!(plan.compose_group.is_empty());
        assert_eq!(plan.tile_send_dest, vec![None]);
    }

    #[test]
    fn starved_cluster_leaves_processes_unseated() {
        // Three processes, one tile, one contribution: quotas cap at the
        // image count and the leftover processes stay unseated.
        let masks = vec![vec![true], vec![false], vec![false]];
        let mut topo = topology(masks, vec![0]);
        let plan = delegate(&unordered_opts(), &topo).unwrap();
        assert_eq!(plan.groups[0], vec![0]);
        assert_eq!(plan.compose_tile, Some(0));

        topo.rank = 1;
        let plan = delegate(&unordered_opts(), &topo).unwrap();
        assert_eq!(plan.compose_tile, None);
    }

    #[test]
    fn ordered_chunks_are_contiguous_in_composite_order() {
        let masks = vec![vec![true]; 6];
        let topo = topology(masks, vec![2]);
        let opts = SessionOpts {
            composite_mode: CompositeMode::Blend,
            color_format: ColorFormat::RgbaUbyte,
            depth_format: DepthFormat::None,
            ordered_composite: true,
            composite_order: vec![5, 3, 1, 0, 2, 4],
            ..SessionOpts::default()
        };
        let plan = delegate(&opts, &topo).unwrap();

        // Walk contributors in composite order; their destinations must be
        // non-decreasing group slots (contiguous chunks).
        let dest_of = |s: usize| {
            plan.tile_assignments[0]
                .iter()
                .find(|&&(snode, _)| snode == s)
                .map(|&(_, d)| d)
                .unwrap()
        };
        let slot_of = |r: usize| plan.groups[0].iter().position(|&g| g == r).unwrap();
        let mut last_slot = 0;
        for &s in &opts.composite_order {
            let slot = slot_of(dest_of(s));
            assert!(slot >= last_slot, "chunks out of order");
            last_slot = slot;
        }
        // Everyone is seated and contributes: destinations stay local.
        for &(s, d) in &plan.tile_assignments[0] {
            assert_eq!(s, d);
        }
    }

    #[test]
    fn ordered_mode_reports_display_position() {
        let masks = vec![vec![true]; 4];
        let topo = topology(masks, vec![2]);
        let opts = SessionOpts {
            composite_mode: CompositeMode::Blend,
            color_format: ColorFormat::RgbaUbyte,
            depth_format: DepthFormat::None,
            ordered_composite: true,
            composite_order: vec![2, 0, 1, 3],
            ..SessionOpts::default()
        };
        let plan = delegate(&opts, &topo).unwrap();
        assert_eq!(plan.compose_group[plan.group_image_dest], 2);
    }
}
