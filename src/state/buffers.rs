use std::collections::HashMap;

/// Symbolic names for the scratch regions a compose acquires.
///
/// Taking a name again after a previous use hands back the recycled storage;
/// any view into the previous use is gone by then because regions are owned
/// values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferName {
    /// Per-round radix-k send pieces.
    RadixkSend,
    /// Spare image cycled through the radix-k composite tree.
    RadixkSpare,
    /// Interlaced copy of the radix-k input.
    RadixkInterlaced,
    /// Scratch blocks built while interlacing.
    InterlaceScratch,
    /// Contribution accumulated during the reduce transfer phase.
    ReduceTransfer,
    /// Dense tile image assembled by collect.
    CollectResult,
}

/// Named pool of reusable byte regions.
///
/// The compose strategies are called once per frame with similarly sized
/// working sets, so regions are handed out by symbolic name and returned
/// when a compose is done with them, keeping their capacity warm for the
/// next compose. Regions live until the next compose; nothing is freed in
/// between.
#[derive(Debug, Default)]
pub struct StateBufferPool {
    buckets: HashMap<BufferName, Vec<Vec<u8>>>,
}

impl StateBufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared region for `name`, recycling capacity when a previous
    /// compose returned one.
    pub fn take(&mut self, name: BufferName) -> Vec<u8> {
        match self.buckets.get_mut(&name).and_then(Vec::pop) {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::new(),
        }
    }

    /// Return a region to `name`'s bucket for reuse.
    pub fn put(&mut self, name: BufferName, buf: Vec<u8>) {
        self.buckets.entry(name).or_default().push(buf);
    }
}
