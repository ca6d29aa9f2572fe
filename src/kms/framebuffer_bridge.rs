use std::collections::HashMap;

use drm::{
    buffer::{self, Buffer, DrmFourcc},
    control::framebuffer,
};

use crate::{kms::KmsDevice, Error, Result};

/// identity of a renderable surface, stable while the surface lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(usize);

impl SurfaceId {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

/// layout of a surface as the display engine imports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceBuffer {
    pub size: (u32, u32),
    pub pitch: u32,
    pub format: DrmFourcc,
    pub handle: buffer::Handle,
}

impl SurfaceBuffer {
    pub fn from_buffer(buffer: &(impl Buffer + ?Sized)) -> Self {
        Self {
            size: buffer.size(),
            pitch: buffer.pitch(),
            format: buffer.format(),
            handle: buffer.handle(),
        }
    }
}

impl Buffer for SurfaceBuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn handle(&self) -> buffer::Handle {
        self.handle
    }
}

/// a locked surface that can be scanned out
pub trait ScanoutSurface {
    fn id(&self) -> SurfaceId;
    fn buffer(&self) -> SurfaceBuffer;
}

/// surface -> framebuffer side table
///
/// a surface is registered with the display engine on its first
/// presentation and reuses that framebuffer afterwards. The registration
/// lives until [`FramebufferBridge::on_surface_destroyed`] or
/// [`FramebufferBridge::clear`], both of which must run before the surface
/// itself goes away.
#[derive(Debug, Default)]
pub struct FramebufferBridge {
    cache: HashMap<SurfaceId, framebuffer::Handle>,
}

impl FramebufferBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_framebuffer<K: KmsDevice>(
        &mut self,
        kms: &mut K,
        surface: &impl ScanoutSurface,
    ) -> Result<framebuffer::Handle> {
        let id = surface.id();
        if let Some(fb) = self.cache.get(&id) {
            return Ok(*fb);
        }

        let buffer = surface.buffer();
        let fb = kms.add_framebuffer(&buffer).map_err(Error::BufferImportFailed)?;
        tracing::debug!(?fb, size = ?buffer.size, pitch = buffer.pitch, "registered framebuffer for surface {:#x}", id.raw());

        self.cache.insert(id, fb);
        Ok(fb)
    }

    /// drop the registration of a surface about to be destroyed
    ///
    /// returns whether the surface had one
    pub fn on_surface_destroyed<K: KmsDevice>(&mut self, kms: &mut K, id: SurfaceId) -> Result<bool> {
        let Some(fb) = self.cache.remove(&id) else {
            return Ok(false);
        };
        kms.destroy_framebuffer(fb).map_err(Error::device("destroy framebuffer"))?;
        Ok(true)
    }

    /// destroy every registration, for teardown
    ///
    /// all framebuffers are attempted, the first failure is returned
    pub fn clear<K: KmsDevice>(&mut self, kms: &mut K) -> Result<()> {
        let mut result = Ok(());
        let mut ids: Vec<_> = self.cache.keys().copied().collect();
        ids.sort();

        for id in ids {
            if let Err(err) = self.on_surface_destroyed(kms, id) {
                tracing::warn!("{err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.cache.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sim::{EventLog, SimDevice, SimSurface},
        ErrorKind,
    };

    fn device() -> SimDevice {
        SimDevice::new(EventLog::default())
    }

    #[test]
    fn get_framebuffer_is_idempotent() {
        let mut kms = device();
        let mut bridge = FramebufferBridge::new();
        let surface = SimSurface::new(SurfaceId::new(0x10), (1920, 1080));

        let first = bridge.get_framebuffer(&mut kms, &surface).unwrap();
        let second = bridge.get_framebuffer(&mut kms, &surface).unwrap();

        assert_eq!(first, second);
        assert_eq!(kms.registrations(), 1);
        assert_eq!(bridge.len(), 1);
    }

    #[test]
    fn surfaces_get_distinct_framebuffers() {
        let mut kms = device();
        let mut bridge = FramebufferBridge::new();
        let a = SimSurface::new(SurfaceId::new(0x10), (640, 480));
        let b = SimSurface::new(SurfaceId::new(0x20), (640, 480));

        let fa = bridge.get_framebuffer(&mut kms, &a).unwrap();
        let fb = bridge.get_framebuffer(&mut kms, &b).unwrap();

        assert_ne!(fa, fb);
        assert_eq!(kms.registrations(), 2);
    }

    #[test]
    fn destroying_surface_releases_framebuffer() {
        let mut kms = device();
        let mut bridge = FramebufferBridge::new();
        let surface = SimSurface::new(SurfaceId::new(0x10), (640, 480));

        bridge.get_framebuffer(&mut kms, &surface).unwrap();
        assert!(bridge.on_surface_destroyed(&mut kms, surface.id()).unwrap());
        assert!(!bridge.on_surface_destroyed(&mut kms, surface.id()).unwrap());

        assert_eq!(kms.live_framebuffers(), 0);
        assert!(bridge.is_empty());

        bridge.get_framebuffer(&mut kms, &surface).unwrap();
        assert_eq!(kms.registrations(), 2);
    }

    #[test]
    fn clear_destroys_all() {
        let mut kms = device();
        let mut bridge = FramebufferBridge::new();
        for id in 1..=3 {
            let surface = SimSurface::new(SurfaceId::new(id), (64, 64));
            bridge.get_framebuffer(&mut kms, &surface).unwrap();
        }

        bridge.clear(&mut kms).unwrap();

        assert!(bridge.is_empty());
        assert_eq!(kms.live_framebuffers(), 0);
    }

    #[test]
    fn rejected_import_is_reported() {
        let mut kms = device();
        kms.reject_framebuffers(true);
        let mut bridge = FramebufferBridge::new();
        let surface = SimSurface::new(SurfaceId::new(0x10), (64, 64));

        let err = bridge.get_framebuffer(&mut kms, &surface).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BufferImportFailed);
        assert!(!bridge.contains(surface.id()));
    }
}
