//! The message-passing seam the composers drive.
//!
//! The core never talks to a network itself; it posts sends and receives
//! through [`Communicator`] and blocks only in `wait_any`/`wait_all`/
//! `recv`. Delivery must be reliable and ordered per (source, destination,
//! tag) triple, with no message size cap beyond the declared byte count —
//! the guarantees MPI-style transports provide. [`LocalCluster`] is the
//! in-process implementation used by tests and single-node runs.

mod local;

pub use local::{LocalCluster, LocalComm};

use crate::foundation::error::ComposeResult;

/// Message tag.
pub type Tag = u32;

/// Handle to a pending non-blocking operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(pub(crate) usize);

/// Point-to-point and collective operations the composers require.
///
/// Payloads are owned byte vectors: a send hands its buffer to the
/// transport, and a completed receive hands the arrived bytes back. That
/// matches the sparse-image wire form, which travels without translation.
pub trait Communicator {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of processes in the world.
    fn num_ranks(&self) -> usize;

    /// Post a non-blocking send.
    fn isend(&mut self, to: usize, tag: Tag, payload: Vec<u8>) -> ComposeResult<RequestId>;

    /// Post a non-blocking receive for the next message from `from` with
    /// `tag`.
    fn irecv(&mut self, from: usize, tag: Tag) -> ComposeResult<RequestId>;

    /// Block until one of the listed requests completes. The completed slot
    /// is set to `None`; the result is its index and, for receives, the
    /// payload.
    fn wait_any(
        &mut self,
        requests: &mut [Option<RequestId>],
    ) -> ComposeResult<(usize, Option<Vec<u8>>)>;

    /// Block until every listed request completes, clearing the slots.
    /// Payloads of receive requests are discarded.
    fn wait_all(&mut self, requests: &mut [Option<RequestId>]) -> ComposeResult<()>;

    /// Blocking send.
    fn send(&mut self, to: usize, tag: Tag, payload: Vec<u8>) -> ComposeResult<()>;

    /// Blocking receive of the next message from `from` with `tag`.
    fn recv(&mut self, from: usize, tag: Tag) -> ComposeResult<Vec<u8>>;

    /// Gather every rank's payload at `root`. Returns the payloads indexed
    /// by rank at the root, `None` elsewhere. Collective: every rank must
    /// call it in the same order.
    fn gather(&mut self, root: usize, payload: Vec<u8>) -> ComposeResult<Option<Vec<Vec<u8>>>>;
}
