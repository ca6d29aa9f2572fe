//! display side of the pipeline: framebuffers and commits
use std::io;

use bitflags::bitflags;
use drm::control::{framebuffer, AtomicCommitFlags};

use crate::fence::OutFence;

mod atomic;
mod device;
mod framebuffer_bridge;

pub use atomic::{build_commit, AtomicCommitter, PendingCommit, PropertyWrite};
pub use device::DrmKms;
pub use framebuffer_bridge::{FramebufferBridge, ScanoutSurface, SurfaceBuffer, SurfaceId};

bitflags! {
    /// behavior of one commit
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        /// the transaction may change timings, first commit only
        const ALLOW_MODESET = 1;
        /// return before the commit is applied
        const NONBLOCK = 1 << 1;
        /// deliver a page flip event once the commit is applied
        const PAGE_FLIP_EVENT = 1 << 2;
    }
}

impl From<CommitFlags> for AtomicCommitFlags {
    fn from(flags: CommitFlags) -> Self {
        let mut out = AtomicCommitFlags::empty();
        if flags.contains(CommitFlags::ALLOW_MODESET) {
            out |= AtomicCommitFlags::ALLOW_MODESET;
        }
        if flags.contains(CommitFlags::NONBLOCK) {
            out |= AtomicCommitFlags::NONBLOCK;
        }
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            out |= AtomicCommitFlags::PAGE_FLIP_EVENT;
        }
        out
    }
}

/// kernel operations the pipeline performs on the display device
///
/// the chain (connector, crtc, mode) is fixed when the device is built
pub trait KmsDevice {
    fn add_framebuffer(&mut self, buffer: &SurfaceBuffer) -> io::Result<framebuffer::Handle>;

    fn destroy_framebuffer(&mut self, fb: framebuffer::Handle) -> io::Result<()>;

    /// upload the selected mode, returning the blob id
    fn create_mode_blob(&mut self) -> io::Result<u64>;

    fn destroy_mode_blob(&mut self, blob: u64) -> io::Result<()>;

    /// submit `commit` as one transaction
    ///
    /// the in-fence of the commit is consumed. Returns the out-fence when the
    /// commit asked for one.
    fn atomic_commit(&mut self, flags: CommitFlags, commit: PendingCommit) -> io::Result<Option<OutFence>>;

    /// legacy modeset showing `fb`
    fn set_crtc(&mut self, fb: framebuffer::Handle) -> io::Result<()>;

    /// legacy flip to `fb`, requesting a flip event
    fn page_flip(&mut self, fb: framebuffer::Handle) -> io::Result<()>;

    /// block until the pending flip completed
    fn wait_page_flip(&mut self) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_kernel_flags() {
        let flags = AtomicCommitFlags::from(CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT);
        assert_eq!(flags, AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT);
        assert_eq!(AtomicCommitFlags::from(CommitFlags::ALLOW_MODESET), AtomicCommitFlags::ALLOW_MODESET);
        assert!(AtomicCommitFlags::from(CommitFlags::empty()).is_empty());
        // every commit the loop sends is a real one
        assert!(!AtomicCommitFlags::from(CommitFlags::all()).contains(AtomicCommitFlags::TEST_ONLY));
    }
}
