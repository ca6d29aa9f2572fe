use std::{
    io,
    os::fd::{FromRawFd, OwnedFd},
};

use drm::control::{
    atomic::AtomicModeReq, connector, crtc, framebuffer, property, Device as ControlDevice, Event, Mode,
    PageFlipFlags,
};
use kms_scanner::DisplayChain;

use crate::{
    card::Card,
    fence::OutFence,
    kms::{CommitFlags, KmsDevice, PendingCommit, SurfaceBuffer},
};

/// kms operations on a real card
#[derive(Debug)]
pub struct DrmKms {
    card: Card,
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
}

impl DrmKms {
    pub fn new(card: Card, chain: &DisplayChain, mode: Mode) -> Self {
        Self {
            card,
            connector: chain.connector_handle(),
            crtc: chain.crtc_handle(),
            mode,
        }
    }

    pub fn card(&self) -> &Card {
        &self.card
    }
}

impl KmsDevice for DrmKms {
    fn add_framebuffer(&mut self, buffer: &SurfaceBuffer) -> io::Result<framebuffer::Handle> {
        self.card.add_framebuffer(buffer, 24, 32)
    }

    fn destroy_framebuffer(&mut self, fb: framebuffer::Handle) -> io::Result<()> {
        self.card.destroy_framebuffer(fb)
    }

    fn create_mode_blob(&mut self) -> io::Result<u64> {
        match self.card.create_property_blob(&self.mode)? {
            property::Value::Blob(id) => Ok(id),
            other => Err(io::Error::other(format!("unexpected mode blob value {other:?}"))),
        }
    }

    fn destroy_mode_blob(&mut self, blob: u64) -> io::Result<()> {
        self.card.destroy_property_blob(blob)
    }

    fn atomic_commit(&mut self, flags: CommitFlags, commit: PendingCommit) -> io::Result<Option<OutFence>> {
        let (writes, in_fence, out_fence) = commit.into_parts();

        let mut req = AtomicModeReq::new();
        for write in &writes {
            req.add_raw_property(write.object, write.property, write.value);
        }

        let mut out_fd: i32 = -1;
        if let Some(write) = &out_fence {
            // kernel writes the new fence descriptor through this pointer
            req.add_raw_property(write.object, write.property, std::ptr::addr_of_mut!(out_fd) as u64);
        }

        let result = self.card.atomic_commit(flags.into(), req);
        // the kernel holds its own reference to the in-fence now
        drop(in_fence);
        result?;

        let out_fd = unsafe { std::ptr::read_volatile(std::ptr::addr_of!(out_fd)) };
        if out_fence.is_none() || out_fd < 0 {
            return Ok(None);
        }
        Ok(Some(OutFence::new(unsafe { OwnedFd::from_raw_fd(out_fd) })))
    }

    fn set_crtc(&mut self, fb: framebuffer::Handle) -> io::Result<()> {
        self.card.set_crtc(self.crtc, Some(fb), (0, 0), &[self.connector], Some(self.mode))
    }

    fn page_flip(&mut self, fb: framebuffer::Handle) -> io::Result<()> {
        self.card.page_flip(self.crtc, fb, PageFlipFlags::EVENT, None)
    }

    fn wait_page_flip(&mut self) -> io::Result<()> {
        loop {
            for event in self.card.receive_events()? {
                match event {
                    Event::PageFlip(flip) if flip.crtc == self.crtc => {
                        tracing::trace!(frame = flip.frame, "page flip completed");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}
