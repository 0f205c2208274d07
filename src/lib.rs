//! Sortlast is a parallel image-composition core for sort-last rendering.
//!
//! In sort-last rendering, each process renders part of a 3D scene into a
//! full-frame image of color and/or depth samples. Those partial images are
//! combined pixel by pixel into the final picture. This crate implements the
//! combine step for message-passing clusters:
//!
//! - A run-length [`SparseImage`] codec that skips inactive pixels and
//!   supports compression, pairwise composition, partitioning, and
//!   interlacing permutations.
//! - The radix-k composer ([`radixk_compose`]): a multi-round swap-composite
//!   scheduler that leaves each participant with an even partition of the
//!   composited image.
//! - The reduce delegator and façade ([`reduce_compose`]): a process-to-tile
//!   assignment planner plus the transfer/compose/collect driver for
//!   multi-tile displays.
//!
//! Rendering, the message-passing transport, and display output are
//! collaborator interfaces; an in-process [`transport::LocalCluster`] is
//! provided so a whole compose group can run as threads in one test.
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod foundation;

pub mod compose;
pub mod image;
pub mod state;
pub mod transport;

pub use crate::compose::{
    ComposeStrategy, Delegation, TileRenderer, delegate, radixk_compose, reduce_compose,
    single_image_collect, single_image_compose,
};
pub use crate::foundation::error::{ComposeError, ComposeResult};
pub use crate::foundation::pivot::pivot_range;
pub use crate::image::{
    BACKGROUND_DEPTH, DenseImage, Orientation, SparseImage, buffer_size, compress, compress_sub,
    composite, composite_sub, interlace, interlace_offset, max_buffer_size, split,
    split_partition_num_pixels,
};
pub use crate::state::{
    BufferName, ColorFormat, CompositeMode, DepthFormat, PixelLayout, Session, SessionOpts,
    StateBufferPool, TileParams, Topology,
};
pub use crate::transport::{Communicator, LocalCluster, RequestId};
