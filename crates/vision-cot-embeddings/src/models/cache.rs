//! Incremental key/value cache for the backbone.

use crate::layers::KvSlot;

/// Per-layer cached keys/values plus the number of cached positions.
///
/// Owned by one generation or training call; never shared.
#[derive(Debug, Clone)]
pub struct KvCache {
    slots: Vec<KvSlot>,
    len: usize,
}

impl KvCache {
    /// Empty cache for `num_layers` layers.
    pub fn new(num_layers: usize) -> Self {
        Self {
            slots: vec![None; num_layers],
            len: 0,
        }
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [KvSlot] {
        &mut self.slots
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.len += n;
    }
}
