//! End-to-end radix-k runs on an in-process cluster: one thread per rank,
//! checked against a sequential reference composite.

use std::thread;

use sortlast::{
    ColorFormat, CompositeMode, DenseImage, DepthFormat, LocalCluster, PixelLayout, SessionOpts,
    SparseImage, StateBufferPool, composite, compress, radixk_compose,
};

fn z_opts(magic_k: usize) -> SessionOpts {
    SessionOpts {
        magic_k,
        ..SessionOpts::default()
    }
}

fn z_layout() -> PixelLayout {
    PixelLayout::new(ColorFormat::RgbaUbyte, DepthFormat::Float).unwrap()
}

/// Deterministic per-rank test image: a mix of background and foreground
/// pixels with depths that vary by pixel and rank.
fn scene_image(rank: usize, pixels: usize) -> DenseImage {
    let mut img = DenseImage::new(z_layout(), pixels, 1);
    for i in 0..pixels {
        if (i + rank) % 3 == 0 {
            continue; // leave background
        }
        img.depth_mut()[i] = (((i * 7 + rank * 13) % 31) as f32) / 31.0;
        let tint = (rank + 1) as u8;
        img.color_ubyte_mut()[4 * i..4 * i + 4].copy_from_slice(&[tint, tint, tint, 255]);
    }
    img
}

/// Sequential reference: composite every rank's image front to back in
/// group order.
fn reference_composite(
    mode: CompositeMode,
    group: &[usize],
    image_of: impl Fn(usize) -> DenseImage,
) -> DenseImage {
    let mut acc: Option<SparseImage> = None;
    for &rank in group {
        let sparse = compress(&image_of(rank), mode).unwrap();
        acc = Some(match acc {
            None => sparse,
            Some(front) => composite(mode, &front, &sparse, Vec::new()).unwrap(),
        });
    }
    acc.unwrap().to_dense(mode).unwrap()
}

/// Run radix-k on every rank of an in-process cluster; returns each rank's
/// piece offset and decoded piece.
fn run_radixk(
    opts: &SessionOpts,
    world: usize,
    pixels: usize,
    image_of: impl Fn(usize) -> DenseImage + Clone + Send + 'static,
) -> Vec<(usize, DenseImage)> {
    let cluster = LocalCluster::new(world);
    let group: Vec<usize> = (0..world).collect();
    let mut handles = Vec::new();
    for rank in 0..world {
        let mut comm = cluster.comm(rank);
        let opts = opts.clone();
        let group = group.clone();
        let image_of = image_of.clone();
        handles.push(thread::spawn(move || {
            let mut pool = StateBufferPool::new();
            let input = compress(&image_of(rank), opts.composite_mode).unwrap();
            let (piece, offset) =
                radixk_compose(&opts, &mut pool, &mut comm, &group, 0, input).unwrap();
            (offset, piece.to_dense(opts.composite_mode).unwrap())
        }));
    }
    let results: Vec<(usize, DenseImage)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Coverage: the pieces partition [0, pixels) with no gap or overlap.
    let mut covered = vec![false; pixels];
    for (offset, piece) in &results {
        for i in *offset..*offset + piece.num_pixels() {
            assert!(!covered[i], "piece ranges overlap at pixel {i}");
            covered[i] = true;
        }
    }
    assert!(covered.iter().all(|&c| c), "piece ranges leave gaps");
    results
}

/// Stitch the returned pieces into one dense image.
fn assemble(pixels: usize, results: &[(usize, DenseImage)]) -> DenseImage {
    let layout = results[0].1.layout();
    let mut out = DenseImage::new(layout, pixels, 1);
    for (offset, piece) in results {
        for i in 0..piece.num_pixels() {
            if !piece.color_ubyte().is_empty() {
                let src = &piece.color_ubyte()[4 * i..4 * i + 4];
                out.color_ubyte_mut()[4 * (offset + i)..4 * (offset + i) + 4]
                    .copy_from_slice(src);
            }
            if !piece.depth().is_empty() {
                out.depth_mut()[offset + i] = piece.depth()[i];
            }
        }
    }
    out
}

#[test]
fn single_process_returns_input_unchanged() {
    let pixels = 16;
    let opts = z_opts(8);
    let mut img = DenseImage::new(z_layout(), pixels, 1);
    for i in 0..pixels {
        img.depth_mut()[i] = 0.0;
        img.color_ubyte_mut()[4 * i..4 * i + 4].copy_from_slice(&[255, 255, 255, 255]);
    }

    let cluster = LocalCluster::new(1);
    let mut comm = cluster.comm(0);
    let mut pool = StateBufferPool::new();
    let input = compress(&img, opts.composite_mode).unwrap();
    let (piece, offset) = radixk_compose(&opts, &mut pool, &mut comm, &[0], 0, input).unwrap();
    assert_eq!(offset, 0);
    assert_eq!(piece.to_dense(opts.composite_mode).unwrap(), img);
}

#[test]
fn four_processes_single_round_partition() {
    // W=4, M=8: the pivot search lands on k=4, so one round and four
    // four-pixel pieces of the sixteen-pixel image.
    let pixels = 16;
    let opts = z_opts(8);
    let image_of = move |rank: usize| {
        let mut img = DenseImage::new(z_layout(), pixels, 1);
        for i in 0..pixels {
            img.depth_mut()[i] = 0.25 * rank as f32;
            let tint = (rank + 1) as u8;
            img.color_ubyte_mut()[4 * i..4 * i + 4].copy_from_slice(&[tint, 0, 0, 255]);
        }
        img
    };

    let results = run_radixk(&opts, 4, pixels, image_of);
    let mut offsets: Vec<usize> = results.iter().map(|(o, _)| *o).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, 4, 8, 12]);

    // Process 0 renders the nearest depth everywhere.
    for (_, piece) in &results {
        assert_eq!(piece.num_pixels(), 4);
        for i in 0..4 {
            assert_eq!(piece.depth()[i], 0.0);
            assert_eq!(piece.color_ubyte()[4 * i], 1);
        }
    }
}

#[test]
fn six_processes_match_reference() {
    let pixels = 25;
    let opts = z_opts(8);
    let world = 6;
    let results = run_radixk(&opts, world, pixels, move |r| scene_image(r, pixels));
    let assembled = assemble(pixels, &results);
    let group: Vec<usize> = (0..world).collect();
    let expected = reference_composite(opts.composite_mode, &group, |r| scene_image(r, pixels));
    assert_eq!(assembled, expected);
}

#[test]
fn multi_round_factorization_matches_reference() {
    // W=12, M=2 forces three rounds of k=2, 2, 3.
    let pixels = 61;
    let opts = z_opts(2);
    let world = 12;
    let results = run_radixk(&opts, world, pixels, move |r| scene_image(r, pixels));
    let assembled = assemble(pixels, &results);
    let group: Vec<usize> = (0..world).collect();
    let expected = reference_composite(opts.composite_mode, &group, |r| scene_image(r, pixels));
    assert_eq!(assembled, expected);
}

#[test]
fn interlaced_multi_round_matches_reference() {
    let pixels = 57;
    let opts = SessionOpts {
        magic_k: 2,
        interlace_images: true,
        ..SessionOpts::default()
    };
    let world = 8;
    let results = run_radixk(&opts, world, pixels, move |r| scene_image(r, pixels));
    let assembled = assemble(pixels, &results);
    let group: Vec<usize> = (0..world).collect();
    let expected = reference_composite(opts.composite_mode, &group, |r| scene_image(r, pixels));
    assert_eq!(assembled, expected);
}

#[test]
fn ordered_blend_composites_in_group_order() {
    let pixels = 12;
    let layout = PixelLayout::new(ColorFormat::RgbaUbyte, DepthFormat::None).unwrap();
    let opts = SessionOpts {
        composite_mode: CompositeMode::Blend,
        color_format: ColorFormat::RgbaUbyte,
        depth_format: DepthFormat::None,
        ..SessionOpts::default()
    };
    let image_of = move |rank: usize| {
        let mut img = DenseImage::new(layout, pixels, 1);
        for i in 0..pixels {
            // Half-transparent, premultiplied, distinct per rank.
            let tint = 40 * (rank as u8 + 1);
            img.color_ubyte_mut()[4 * i..4 * i + 4].copy_from_slice(&[tint, 128 - tint, 0, 128]);
        }
        img
    };

    // The compose group is the composite order: [2, 0, 1].
    let group = vec![2usize, 0, 1];
    let cluster = LocalCluster::new(3);
    let mut handles = Vec::new();
    for rank in 0..3 {
        let mut comm = cluster.comm(rank);
        let opts = opts.clone();
        let group = group.clone();
        handles.push(thread::spawn(move || {
            let mut pool = StateBufferPool::new();
            let input = compress(&image_of(rank), opts.composite_mode).unwrap();
            let (piece, offset) =
                radixk_compose(&opts, &mut pool, &mut comm, &group, 0, input).unwrap();
            (offset, piece.to_dense(opts.composite_mode).unwrap())
        }));
    }
    let results: Vec<(usize, DenseImage)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let assembled = assemble(pixels, &results);
    let expected = reference_composite(opts.composite_mode, &group, image_of);
    assert_eq!(assembled, expected);

    // Any other order gives a different blend.
    let wrong = reference_composite(opts.composite_mode, &[0, 1, 2], image_of);
    assert_ne!(assembled, wrong);
}

#[test]
fn rank_outside_group_is_a_topology_error() {
    let cluster = LocalCluster::new(2);
    let mut comm = cluster.comm(1);
    let mut pool = StateBufferPool::new();
    let opts = z_opts(8);
    let input = compress(&scene_image(1, 8), opts.composite_mode).unwrap();
    let err = radixk_compose(&opts, &mut pool, &mut comm, &[0], 0, input).unwrap_err();
    assert!(err.to_string().contains("topology error"));
}
