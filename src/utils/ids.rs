use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a layer, unique for the lifetime of the [`LayerIdAllocator`] that handed it out
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId(u64);

impl LayerId {
    /// Raw value of this id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<LayerId> for u64 {
    fn from(id: LayerId) -> u64 {
        id.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a display, as assigned by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DisplayId(pub u64);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monotonic counter for layer ids
///
/// Ids start at 1 and are never reused. One allocator is shared by every session
/// of a compositor (see [`CompositorContext`](crate::context::CompositorContext)),
/// which keeps ids unique across displays.
#[derive(Debug)]
pub struct LayerIdAllocator {
    next: AtomicU64,
}

impl Default for LayerIdAllocator {
    fn default() -> Self {
        LayerIdAllocator {
            next: AtomicU64::new(1),
        }
    }
}

impl LayerIdAllocator {
    /// Create a new allocator, starting at id 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the next id from the allocator
    pub fn next_id(&self) -> LayerId {
        LayerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
