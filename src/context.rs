//! State shared by every display of a compositor

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use tracing::debug;

use crate::utils::{LayerId, LayerIdAllocator};

/// Compositor wide state, shared by all [`CompositionSession`](crate::session::CompositionSession)s
///
/// Holds what would otherwise be process globals: the layer id counter, so ids stay
/// unique across displays, and resource restrictions that apply to every display.
#[derive(Debug, Default)]
pub struct CompositorContext {
    layer_ids: LayerIdAllocator,
    restricted: AtomicBool,
    throttling_refresh_rate: AtomicU32,
}

impl CompositorContext {
    /// Creates a context, ready to be shared
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a new layer id
    pub fn next_layer_id(&self) -> LayerId {
        self.layer_ids.next_id()
    }

    /// Whether multimedia resources are restricted, e.g. because of thermal pressure
    pub fn is_restricted(&self) -> bool {
        self.restricted.load(Ordering::Acquire)
    }

    /// Updates the resource restriction, returns whether it changed
    pub fn set_restricted(&self, restricted: bool) -> bool {
        let previous = self.restricted.swap(restricted, Ordering::AcqRel);
        if previous != restricted {
            debug!(restricted, "Resource restriction changed");
        }
        previous != restricted
    }

    /// Refresh rate cap requested by thermal management, 0 if unrestricted
    pub fn throttling_refresh_rate(&self) -> u32 {
        self.throttling_refresh_rate.load(Ordering::Acquire)
    }

    /// Caps the refresh rate of all displays, 0 lifts the cap
    pub fn set_throttling_refresh_rate(&self, rate: u32) {
        self.throttling_refresh_rate.store(rate, Ordering::Release);
    }
}
