//! Versioned output-buffer descriptor.
//!
//! The buffer descriptor carries its own monotonic version; the handle only
//! accepts newer-or-equal descriptors, so a stale planner update can never
//! roll back buffer assignments already sent to the worker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Output buffer layout a task should produce into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBuffers {
    /// Descriptor version; bumped on every layout change.
    pub version: u64,
    /// Whether the set of buffer ids is final.
    pub no_more_buffer_ids: bool,
    /// Buffer id to consumer partition mapping.
    pub buffers: BTreeMap<String, u32>,
}

impl OutputBuffers {
    /// Initial empty descriptor at version zero.
    pub fn initial() -> Self {
        Self {
            version: 0,
            no_more_buffer_ids: false,
            buffers: BTreeMap::new(),
        }
    }

    /// Whether this descriptor supersedes `other`.
    pub fn is_newer_than(&self, other: &OutputBuffers) -> bool {
        self.version > other.version
    }

    /// Add a buffer, producing a bumped-version descriptor.
    pub fn with_buffer(&self, buffer_id: impl Into<String>, partition: u32) -> Self {
        let mut next = self.clone();
        next.buffers.insert(buffer_id.into(), partition);
        next.version += 1;
        next
    }

    /// Seal the buffer id set, producing a bumped-version descriptor.
    pub fn with_no_more_buffer_ids(&self) -> Self {
        let mut next = self.clone();
        next.no_more_buffer_ids = true;
        next.version += 1;
        next
    }
}

impl Default for OutputBuffers {
    fn default() -> Self {
        Self::initial()
    }
}
