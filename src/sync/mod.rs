//! Fences and sync points
//!
//! Every asynchronous hardware operation the engine performs on a buffer (reading an
//! input layer, writing a capture, scanning out a frame) is tracked through a [`Fence`].
//! Fences are shared between the layer that received them and whoever waits on them,
//! so they are passed around wrapped in a reference-counted [`SyncPoint`].
//!
//! Kernel sync files are wrapped by [`SyncFileFence`], engines may bring their own
//! fence types and get them back through [`SyncPoint::get`].

use std::{os::unix::io::OwnedFd, sync::Arc};

use downcast_rs::{impl_downcast, Downcast};

mod sync_file;

pub use self::sync_file::SyncFileFence;

/// The wait on a fence ended without the fence signalling
///
/// Nothing is known about the state of the fence afterwards, the wait may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("waiting on the fence was interrupted")]
pub struct Interrupted;

/// An operation of the display hardware that completes in finite time
pub trait Fence: std::fmt::Debug + Send + Sync + Downcast {
    /// Whether the operation completed
    fn is_signaled(&self) -> bool;

    /// Blocks until the operation completed
    fn wait(&self) -> Result<(), Interrupted>;

    /// Duplicates the fence as a sync file descriptor, if it is backed by one
    fn export(&self) -> Option<OwnedFd> {
        None
    }
}
impl_downcast!(Fence);

/// A shared handle to an optional [`Fence`]
///
/// A sync point without a fence counts as signalled. Clones wait on the same fence.
#[derive(Debug, Clone, Default)]
#[must_use = "a `SyncPoint` may carry a fence that has to be waited on before the buffer is touched"]
pub struct SyncPoint {
    fence: Option<Arc<dyn Fence>>,
}

impl SyncPoint {
    /// A sync point that never blocks
    pub fn signaled() -> Self {
        SyncPoint { fence: None }
    }

    /// Wraps a sync file descriptor handed over by the client or the kernel
    pub fn from_fd(fd: OwnedFd) -> Self {
        SyncFileFence::new(fd).into()
    }

    /// Whether a fence is attached
    pub fn has_fence(&self) -> bool {
        self.fence.is_some()
    }

    /// The attached fence, if it is an `F`
    pub fn get<F: Fence>(&self) -> Option<&F> {
        self.fence.as_deref().and_then(|fence| fence.downcast_ref())
    }

    /// Whether the fence signalled, `true` without a fence
    pub fn is_reached(&self) -> bool {
        self.fence.as_deref().map_or(true, |fence| fence.is_signaled())
    }

    /// Blocks until the fence signalled, returns immediately without a fence
    #[profiling::function]
    pub fn wait(&self) -> Result<(), Interrupted> {
        match self.fence.as_deref() {
            Some(fence) => fence.wait(),
            None => Ok(()),
        }
    }

    /// Duplicates the fence as a sync file descriptor
    ///
    /// `None` without a fence or for fences not backed by a file descriptor. Clients
    /// treat a missing fd as already signalled.
    pub fn export(&self) -> Option<OwnedFd> {
        self.fence.as_deref().and_then(|fence| fence.export())
    }

    /// Whether both sync points wait on the very same fence
    pub fn same_fence(&self, other: &SyncPoint) -> bool {
        match (&self.fence, &other.fence) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: Fence> From<T> for SyncPoint {
    fn from(fence: T) -> Self {
        SyncPoint {
            fence: Some(Arc::new(fence)),
        }
    }
}
