//! End-to-end reduce composes on an in-process cluster: delegation,
//! transfer, group compositing, and collect to the display nodes.

use std::thread;

use sortlast::{
    ColorFormat, ComposeResult, CompositeMode, DenseImage, DepthFormat, LocalCluster, PixelLayout,
    Session, SessionOpts, SparseImage, TileParams, TileRenderer, Topology, composite, compress,
    reduce_compose,
};

fn z_layout() -> PixelLayout {
    PixelLayout::new(ColorFormat::RgbaUbyte, DepthFormat::Float).unwrap()
}

/// Deterministic contribution of `rank` for `tile`.
fn contribution(layout: PixelLayout, mode: CompositeMode, rank: usize, tile: usize) -> DenseImage {
    let (w, h) = (4, 2);
    let mut img = DenseImage::new(layout, w, h);
    for i in 0..w * h {
        if (i + rank + tile) % 4 == 0 {
            continue; // background
        }
        match mode {
            CompositeMode::ZBuffer => {
                img.depth_mut()[i] = (((i * 5 + rank * 11 + tile * 3) % 29) as f32) / 29.0;
                let tint = (rank * 8 + tile + 1) as u8;
                img.color_ubyte_mut()[4 * i..4 * i + 4].copy_from_slice(&[tint, tint, 0, 255]);
            }
            CompositeMode::Blend => {
                let tint = 30 * (rank as u8 + 1);
                img.color_ubyte_mut()[4 * i..4 * i + 4].copy_from_slice(&[tint, 120 - tint, 0, 128]);
            }
        }
    }
    img
}

struct ScenarioRenderer {
    layout: PixelLayout,
    mode: CompositeMode,
    rank: usize,
}

impl TileRenderer for ScenarioRenderer {
    fn render_tile(&mut self, tile: usize) -> ComposeResult<DenseImage> {
        Ok(contribution(self.layout, self.mode, self.rank, tile))
    }
}

/// Sequential reference for one tile: composite its contributors in the
/// given order.
fn reference_tile(
    layout: PixelLayout,
    mode: CompositeMode,
    contributors: &[usize],
    tile: usize,
) -> DenseImage {
    let mut acc: Option<SparseImage> = None;
    for &rank in contributors {
        let sparse = compress(&contribution(layout, mode, rank, tile), mode).unwrap();
        acc = Some(match acc {
            None => sparse,
            Some(front) => composite(mode, &front, &sparse, Vec::new()).unwrap(),
        });
    }
    acc.unwrap().to_dense(mode).unwrap()
}

fn run_reduce(opts: SessionOpts, topology: Topology) -> Vec<Option<DenseImage>> {
    let world = topology.num_processes;
    let cluster = LocalCluster::new(world);
    let layout = PixelLayout::new(opts.color_format, opts.depth_format).unwrap();
    let mut handles = Vec::new();
    for rank in 0..world {
        let mut comm = cluster.comm(rank);
        let opts = opts.clone();
        let mut topology = topology.clone();
        topology.rank = rank;
        handles.push(thread::spawn(move || {
            let mut renderer = ScenarioRenderer {
                layout,
                mode: opts.composite_mode,
                rank,
            };
            let mut session = Session::new(opts, topology).unwrap();
            reduce_compose(&mut session, &mut comm, &mut renderer).unwrap()
        }));
    }
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn two_tiles_collect_on_their_display_nodes() {
    let opts = SessionOpts::default();
    let layout = z_layout();
    let topology = Topology {
        num_processes: 4,
        rank: 0,
        tiles: vec![
            TileParams {
                width: 4,
                height: 2,
                display_node: 0,
            },
            TileParams {
                width: 4,
                height: 2,
                display_node: 2,
            },
        ],
        contained_masks: vec![
            vec![true, false],
            vec![true, true],
            vec![false, true],
            vec![false, true],
        ],
    };

    let results = run_reduce(opts.clone(), topology);

    let expected_t0 = reference_tile(layout, opts.composite_mode, &[0, 1], 0);
    let expected_t1 = reference_tile(layout, opts.composite_mode, &[1, 2, 3], 1);
    assert_eq!(results[0].as_ref(), Some(&expected_t0));
    assert_eq!(results[2].as_ref(), Some(&expected_t1));
    assert!(results[1].is_none());
    assert!(results[3].is_none());
}

#[test]
fn many_processes_one_tile() {
    let opts = SessionOpts::default();
    let layout = z_layout();
    let topology = Topology {
        num_processes: 6,
        rank: 0,
        tiles: vec![TileParams {
            width: 4,
            height: 2,
            display_node: 3,
        }],
        contained_masks: vec![vec![true]; 6],
    };

    let results = run_reduce(opts.clone(), topology);
    let expected = reference_tile(layout, opts.composite_mode, &[0, 1, 2, 3, 4, 5], 0);
    for (rank, result) in results.iter().enumerate() {
        if rank == 3 {
            assert_eq!(result.as_ref(), Some(&expected));
        } else {
            assert!(result.is_none());
        }
    }
}

#[test]
fn ordered_blend_follows_composite_order() {
    let opts = SessionOpts {
        composite_mode: CompositeMode::Blend,
        color_format: ColorFormat::RgbaUbyte,
        depth_format: DepthFormat::None,
        ordered_composite: true,
        composite_order: vec![2, 0, 1],
        ..SessionOpts::default()
    };
    let layout = PixelLayout::new(ColorFormat::RgbaUbyte, DepthFormat::None).unwrap();
    let topology = Topology {
        num_processes: 3,
        rank: 0,
        tiles: vec![TileParams {
            width: 4,
            height: 2,
            display_node: 1,
        }],
        contained_masks: vec![vec![true]; 3],
    };

    let results = run_reduce(opts.clone(), topology);
    let expected = reference_tile(layout, opts.composite_mode, &[2, 0, 1], 0);
    assert_eq!(results[1].as_ref(), Some(&expected));

    // The blend is order-sensitive, so this only passes for [2, 0, 1].
    let wrong = reference_tile(layout, opts.composite_mode, &[0, 1, 2], 0);
    assert_ne!(results[1].as_ref(), Some(&wrong));
}

#[test]
fn displayed_tile_with_no_contributions_comes_back_cleared() {
    let opts = SessionOpts::default();
    let topology = Topology {
        num_processes: 2,
        rank: 0,
        tiles: vec![
            TileParams {
                width: 4,
                height: 2,
                display_node: 0,
            },
            TileParams {
                width: 4,
                height: 2,
                display_node: 1,
            },
        ],
        // Nobody renders tile 1.
        contained_masks: vec![vec![true, false], vec![true, false]],
    };

    let results = run_reduce(opts.clone(), topology);
    assert!(results[0].is_some());
    let cleared = DenseImage::new(z_layout(), 4, 2);
    assert_eq!(results[1].as_ref(), Some(&cleared));
}
