use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;
use tracing::warn;

use super::{Fence, Interrupted};

/// A fence backed by a kernel sync file
///
/// The fd becomes readable once every operation it tracks has completed.
#[derive(Debug)]
pub struct SyncFileFence {
    fd: OwnedFd,
}

impl SyncFileFence {
    /// Take ownership of a sync file descriptor
    pub fn new(fd: OwnedFd) -> Self {
        SyncFileFence { fd }
    }

    fn poll(&self, timeout_ms: i32) -> Result<bool, Errno> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        let ready = poll(&mut fds, timeout_ms)?;
        Ok(ready > 0 && fds[0].revents().intersects(PollFlags::IN | PollFlags::ERR))
    }
}

impl AsFd for SyncFileFence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Fence for SyncFileFence {
    fn is_signaled(&self) -> bool {
        self.poll(0).unwrap_or(false)
    }

    #[profiling::function]
    fn wait(&self) -> Result<(), Interrupted> {
        loop {
            match self.poll(-1) {
                Ok(true) => return Ok(()),
                Ok(false) | Err(Errno::INTR) | Err(Errno::AGAIN) => continue,
                Err(err) => {
                    warn!(?err, "Failed to wait on sync file");
                    return Err(Interrupted);
                }
            }
        }
    }

    fn export(&self) -> Option<OwnedFd> {
        self.fd.try_clone().ok()
    }
}
