//! # World Configuration

use serde::{Deserialize, Serialize};

use crate::event::DEFAULT_EVENT_CAPACITY;

/// Tuning knobs for a [`crate::World`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Scheduler worker threads per phase. 0 uses the available parallelism.
    pub worker_threads: usize,
    /// Events held in the channel before spilling into the overflow buffer.
    pub event_channel_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            event_channel_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl WorldConfig {
    /// Single-threaded execution in registration order.
    #[must_use]
    pub const fn serial() -> Self {
        Self {
            worker_threads: 1,
            event_channel_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Worker count with 0 resolved to the machine's parallelism.
    #[must_use]
    pub fn resolved_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}
