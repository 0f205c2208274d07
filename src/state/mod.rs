//! Session state: composition options, cluster topology, and the named
//! scratch-buffer pool that backs every compose.

pub(crate) mod buffers;
pub(crate) mod config;
pub(crate) mod topology;

pub use buffers::{BufferName, StateBufferPool};
pub use config::{
    BACKGROUND_DEPTH, ColorFormat, CompositeMode, DepthFormat, PixelLayout, SessionOpts,
};
pub use topology::{TileParams, Topology};

use crate::foundation::error::ComposeResult;

/// A compositing session: validated options and topology plus the scratch
/// buffers reused from one compose to the next.
///
/// A session is process-local. It is not reentrant: a compose may not be
/// started while another compose is in flight on the same session, which the
/// `&mut self` receivers of the compose entry points enforce.
pub struct Session {
    opts: SessionOpts,
    topology: Topology,
    pool: StateBufferPool,
}

impl Session {
    /// Create a session, validating the options against the topology.
    pub fn new(opts: SessionOpts, topology: Topology) -> ComposeResult<Self> {
        opts.validate()?;
        topology.validate(&opts)?;
        Ok(Self {
            opts,
            topology,
            pool: StateBufferPool::new(),
        })
    }

    /// The session options.
    pub fn opts(&self) -> &SessionOpts {
        &self.opts
    }

    /// The cluster and tile topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Split borrow used by the compose drivers.
    pub(crate) fn parts(&mut self) -> (&SessionOpts, &Topology, &mut StateBufferPool) {
        (&self.opts, &self.topology, &mut self.pool)
    }

    /// The scratch-buffer pool.
    pub fn pool_mut(&mut self) -> &mut StateBufferPool {
        &mut self.pool
    }
}
