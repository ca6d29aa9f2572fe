use std::io;

use drm::buffer::DrmFourcc;
use gbm::{AsRaw, BufferObject, BufferObjectFlags};

use crate::{
    card::Card,
    kms::{ScanoutSurface, SurfaceBuffer, SurfaceId},
    Error, Result,
};

/// format of every scanout surface, the egl config has to match it
pub const SCANOUT_FORMAT: DrmFourcc = DrmFourcc::Xrgb8888;

/// gbm surface the egl window renders into
pub struct ScanoutRing {
    surface: gbm::Surface<()>,
    device: gbm::Device<Card>,
    size: (u32, u32),
}

impl ScanoutRing {
    pub fn new(card: Card, size: (u32, u32)) -> Result<Self> {
        let device = gbm::Device::new(card).map_err(Error::device("create gbm device"))?;
        let surface = device
            .create_surface::<()>(size.0, size.1, SCANOUT_FORMAT, BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING)
            .map_err(Error::device("create gbm surface"))?;

        tracing::debug!("created {}x{} gbm surface", size.0, size.1);
        Ok(Self { surface, device, size })
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub(crate) fn device_ptr(&self) -> *mut std::ffi::c_void {
        self.device.as_raw() as *mut _
    }

    pub(crate) fn surface_ptr(&self) -> *mut std::ffi::c_void {
        self.surface.as_raw() as *mut _
    }

    /// take the buffer the last swap produced
    pub(crate) fn device(&self) -> &gbm::Device<Card> {
        &self.device
    }

    pub fn has_free_buffers(&self) -> bool {
        self.surface.has_free_buffers()
    }

    pub fn lock_front_buffer(&self) -> Result<LockedBuffer> {
        // SAFETY: only called after a successful eglSwapBuffers on this surface
        let bo = unsafe { self.surface.lock_front_buffer() }
            .map_err(|err| Error::Device { op: "lock front buffer", source: io::Error::other(err) })?;
        Ok(LockedBuffer(bo))
    }
}

/// front buffer locked out of the ring, returned to it on drop
pub struct LockedBuffer(BufferObject<()>);

impl ScanoutSurface for LockedBuffer {
    fn id(&self) -> SurfaceId {
        SurfaceId::new(self.0.as_raw() as usize)
    }

    fn buffer(&self) -> SurfaceBuffer {
        SurfaceBuffer::from_buffer(&self.0)
    }
}
