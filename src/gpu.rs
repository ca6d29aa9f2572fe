//! gpu binding: gbm scanout surfaces driven through an egl window
use std::os::fd::OwnedFd;

use crate::{
    card::Card,
    fence::{Presented, SyncApi},
    kms::ScanoutSurface,
    Result,
};

mod context;
mod image;
mod scanout;

pub use context::{EglContext, NativeSync, FENCE_EXTENSIONS};
pub use image::{
    BufferAllocator, DmaBufImage, DmaBufPlane, ImageImporter, LinearBuffer, GL_IMAGE_EXTENSIONS, IMAGE_EXTENSIONS,
};
pub(crate) use image::TEXTURE_EXTERNAL_OES;
pub use scanout::{LockedBuffer, ScanoutRing, SCANOUT_FORMAT};

/// the swap side of the gpu
pub trait Presenter {
    type Surface: ScanoutSurface;

    /// flush the frame's commands and swap
    fn present(&mut self) -> Result<Presented>;

    /// whether the ring has a surface left for the next frame
    ///
    /// when it has none the caller blocks until the display gives one back
    fn has_free_surface(&self) -> bool;

    /// lock the surface the last present produced
    ///
    /// only valid while [`Presenter::has_free_surface`] holds
    fn acquire_next_surface(&mut self) -> Result<Self::Surface>;

    /// give a surface back to the ring once the display let go of it
    fn release_surface(&mut self, surface: Self::Surface);
}

pub struct Gpu {
    // egl state is torn down before the gbm objects it points into
    egl: EglContext,
    ring: ScanoutRing,
}

impl Gpu {
    pub fn new(card: Card, size: (u32, u32)) -> Result<Self> {
        let ring = ScanoutRing::new(card, size)?;
        let egl = EglContext::new(&ring)?;
        Ok(Self { egl, ring })
    }

    pub fn size(&self) -> (u32, u32) {
        self.ring.size()
    }

    /// whether native fence sync can be used
    pub fn explicit_fencing(&self) -> bool {
        self.egl.has_native_fences()
    }

    pub fn image_importer(&self) -> Result<ImageImporter> {
        self.egl.image_importer()
    }

    /// linear buffers on the scanout device, for textures the gpu imports
    pub fn allocator(&self) -> BufferAllocator<'_> {
        BufferAllocator::new(self.ring.device())
    }
}

impl Presenter for Gpu {
    type Surface = LockedBuffer;

    fn present(&mut self) -> Result<Presented> {
        self.egl.swap_buffers()?;
        Ok(Presented::new())
    }

    fn has_free_surface(&self) -> bool {
        self.ring.has_free_buffers()
    }

    fn acquire_next_surface(&mut self) -> Result<LockedBuffer> {
        self.ring.lock_front_buffer()
    }

    fn release_surface(&mut self, surface: LockedBuffer) {
        drop(surface);
    }
}

impl SyncApi for Gpu {
    type Sync = NativeSync;

    fn create_native_fence(&mut self, fd: Option<OwnedFd>) -> Result<NativeSync> {
        self.egl.create_native_fence(fd)
    }

    fn wait_sync(&mut self, sync: &NativeSync) -> Result<()> {
        self.egl.wait_sync(sync)
    }

    fn client_wait_sync(&mut self, sync: &NativeSync) -> Result<()> {
        self.egl.client_wait_sync(sync)
    }

    fn dup_native_fence_fd(&mut self, sync: &NativeSync) -> Result<OwnedFd> {
        self.egl.dup_native_fence_fd(sync)
    }

    fn destroy_sync(&mut self, sync: NativeSync) -> Result<()> {
        self.egl.destroy_sync(sync)
    }
}
