//! in-memory display device and gpu
//!
//! drives the render loop without hardware. Every call is recorded in a
//! shared [`EventLog`], so tests can check the order of operations across
//! the device and the gpu. Fence descriptors are real descriptors of
//! `/dev/null`.
use std::{
    cell::RefCell,
    collections::HashSet,
    fs::File,
    io,
    num::NonZeroU32,
    os::fd::OwnedFd,
    rc::Rc,
};

use drm::{
    buffer::{self, DrmFourcc},
    control::{framebuffer, property},
};
use kms_scanner::{DisplayChain, ModeInfo, ObjectArena, ObjectKind, PropertySet};

use crate::{
    fence::{OutFence, Presented, SyncApi},
    gpu::Presenter,
    kms::{CommitFlags, KmsDevice, PendingCommit, ScanoutSurface, SurfaceBuffer, SurfaceId},
    render::Renderer,
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Draw(u64),
    Present,
    CreateFence { imported: bool },
    GpuWait,
    ClientWait,
    ExportFence,
    DestroyFence,
    Acquire(SurfaceId),
    Release(SurfaceId),
    AddFramebuffer(framebuffer::Handle),
    DestroyFramebuffer(framebuffer::Handle),
    CreateModeBlob,
    DestroyModeBlob,
    Commit(CommitFlags),
    SetCrtc,
    PageFlip,
    PageFlipEvent,
}

/// event sequence shared by the simulated collaborators
#[derive(Debug, Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<SimEvent>>>);

impl EventLog {
    pub fn push(&self, event: SimEvent) {
        self.0.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.0.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&SimEvent) -> bool) -> usize {
        self.0.borrow().iter().filter(|event| pred(event)).count()
    }
}

/// a descriptor to stand in for a fence
pub fn null_fd() -> io::Result<OwnedFd> {
    File::open("/dev/null").map(OwnedFd::from)
}

fn nonzero(id: u32) -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(id.saturating_sub(1))
}

/// what one accepted commit contained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub flags: CommitFlags,
    pub properties: Vec<(ObjectKind, &'static str)>,
    pub in_fence: bool,
}

impl CommitRecord {
    pub fn contains(&self, kind: ObjectKind, name: &str) -> bool {
        self.properties.iter().any(|(k, n)| *k == kind && *n == name)
    }
}

/// display device keeping its kernel objects in memory
#[derive(Debug)]
pub struct SimDevice {
    log: EventLog,
    next_id: u32,
    framebuffers: HashSet<framebuffer::Handle>,
    registrations: usize,
    blobs: HashSet<u64>,
    commits: Vec<CommitRecord>,
    attempts: usize,
    reject_after: Option<usize>,
    reject_framebuffers: bool,
    flip_pending: bool,
}

impl SimDevice {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            next_id: 100,
            framebuffers: HashSet::new(),
            registrations: 0,
            blobs: HashSet::new(),
            commits: Vec::new(),
            attempts: 0,
            reject_after: None,
            reject_framebuffers: false,
            flip_pending: false,
        }
    }

    /// accept `n` commits, reject every later one with `EBUSY`
    pub fn reject_commits_after(&mut self, n: usize) {
        self.reject_after = Some(n);
    }

    pub fn reject_framebuffers(&mut self, reject: bool) {
        self.reject_framebuffers = reject;
    }

    /// framebuffer registrations performed, destroyed ones included
    pub fn registrations(&self) -> usize {
        self.registrations
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_mode_blobs(&self) -> usize {
        self.blobs.len()
    }

    pub fn commits(&self) -> &[CommitRecord] {
        &self.commits
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl KmsDevice for SimDevice {
    fn add_framebuffer(&mut self, buffer: &SurfaceBuffer) -> io::Result<framebuffer::Handle> {
        if self.reject_framebuffers || buffer.format != DrmFourcc::Xrgb8888 {
            return Err(io::Error::from_raw_os_error(22));
        }
        let fb = framebuffer::Handle::from(nonzero(self.next_id()));
        self.registrations += 1;
        self.framebuffers.insert(fb);
        self.log.push(SimEvent::AddFramebuffer(fb));
        Ok(fb)
    }

    fn destroy_framebuffer(&mut self, fb: framebuffer::Handle) -> io::Result<()> {
        if !self.framebuffers.remove(&fb) {
            return Err(io::Error::from_raw_os_error(2));
        }
        self.log.push(SimEvent::DestroyFramebuffer(fb));
        Ok(())
    }

    fn create_mode_blob(&mut self) -> io::Result<u64> {
        let blob = self.next_id() as u64;
        self.blobs.insert(blob);
        self.log.push(SimEvent::CreateModeBlob);
        Ok(blob)
    }

    fn destroy_mode_blob(&mut self, blob: u64) -> io::Result<()> {
        if !self.blobs.remove(&blob) {
            return Err(io::Error::from_raw_os_error(2));
        }
        self.log.push(SimEvent::DestroyModeBlob);
        Ok(())
    }

    fn atomic_commit(&mut self, flags: CommitFlags, commit: PendingCommit) -> io::Result<Option<OutFence>> {
        self.attempts += 1;
        if self.reject_after.is_some_and(|n| self.attempts > n) {
            return Err(io::Error::from_raw_os_error(16));
        }
        if self.flip_pending && flags.contains(CommitFlags::NONBLOCK) {
            return Err(io::Error::from_raw_os_error(16));
        }

        let wants_out_fence = commit.out_fence_property().is_some();
        self.commits.push(CommitRecord {
            flags,
            properties: commit.properties().collect(),
            in_fence: commit.in_fence().is_some(),
        });
        self.flip_pending = flags.contains(CommitFlags::PAGE_FLIP_EVENT);
        self.log.push(SimEvent::Commit(flags));
        drop(commit);

        match wants_out_fence {
            true => Ok(Some(OutFence::new(null_fd()?))),
            false => Ok(None),
        }
    }

    fn set_crtc(&mut self, fb: framebuffer::Handle) -> io::Result<()> {
        if !self.framebuffers.contains(&fb) {
            return Err(io::Error::from_raw_os_error(2));
        }
        self.log.push(SimEvent::SetCrtc);
        Ok(())
    }

    fn page_flip(&mut self, fb: framebuffer::Handle) -> io::Result<()> {
        if !self.framebuffers.contains(&fb) {
            return Err(io::Error::from_raw_os_error(2));
        }
        if self.flip_pending {
            return Err(io::Error::from_raw_os_error(16));
        }
        self.flip_pending = true;
        self.log.push(SimEvent::PageFlip);
        Ok(())
    }

    fn wait_page_flip(&mut self) -> io::Result<()> {
        if !self.flip_pending {
            // nothing would ever wake a real wait
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no page flip pending"));
        }
        self.flip_pending = false;
        self.log.push(SimEvent::PageFlipEvent);
        Ok(())
    }
}

/// a surface of the simulated ring
#[derive(Debug, PartialEq, Eq)]
pub struct SimSurface {
    id: SurfaceId,
    buffer: SurfaceBuffer,
}

impl SimSurface {
    pub fn new(id: SurfaceId, size: (u32, u32)) -> Self {
        let buffer = SurfaceBuffer {
            size,
            pitch: size.0 * 4,
            format: DrmFourcc::Xrgb8888,
            handle: buffer::Handle::from(nonzero(id.raw() as u32)),
        };
        Self { id, buffer }
    }
}

impl ScanoutSurface for SimSurface {
    fn id(&self) -> SurfaceId {
        self.id
    }

    fn buffer(&self) -> SurfaceBuffer {
        self.buffer
    }
}

#[derive(Debug)]
pub struct SimSync {
    id: u64,
    _fd: Option<OwnedFd>,
}

/// gpu with a fixed depth surface ring
#[derive(Debug)]
pub struct SimGpu {
    log: EventLog,
    size: (u32, u32),
    held: Vec<bool>,
    next_slot: usize,
    front_ready: bool,
    max_held: usize,
    next_sync: u64,
    live_syncs: HashSet<u64>,
}

impl SimGpu {
    pub fn new(log: EventLog, depth: usize) -> Self {
        Self {
            log,
            size: (1920, 1080),
            held: vec![false; depth.max(1)],
            next_slot: 0,
            front_ready: false,
            max_held: 0,
            next_sync: 0,
            live_syncs: HashSet::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.held.len()
    }

    /// surfaces locked and not released yet
    pub fn held(&self) -> usize {
        self.held.iter().filter(|held| **held).count()
    }

    pub fn max_held(&self) -> usize {
        self.max_held
    }

    pub fn live_syncs(&self) -> usize {
        self.live_syncs.len()
    }

    fn surface_id(slot: usize) -> SurfaceId {
        SurfaceId::new((slot + 1) * 0x1000)
    }
}

impl Presenter for SimGpu {
    type Surface = SimSurface;

    fn present(&mut self) -> Result<Presented> {
        self.front_ready = true;
        self.log.push(SimEvent::Present);
        Ok(Presented::new())
    }

    fn has_free_surface(&self) -> bool {
        self.held() < self.depth()
    }

    fn acquire_next_surface(&mut self) -> Result<SimSurface> {
        if !self.front_ready {
            return Err(Error::Render("no presented frame to lock".into()));
        }

        let depth = self.held.len();
        let slot = (0..depth)
            .map(|offset| (self.next_slot + offset) % depth)
            .find(|slot| !self.held[*slot])
            .ok_or_else(|| Error::Device {
                op: "lock front buffer",
                source: io::Error::new(io::ErrorKind::WouldBlock, "every surface is held"),
            })?;

        self.held[slot] = true;
        self.next_slot = (slot + 1) % depth;
        self.front_ready = false;
        self.max_held = self.max_held.max(self.held());

        let id = Self::surface_id(slot);
        self.log.push(SimEvent::Acquire(id));
        Ok(SimSurface::new(id, self.size))
    }

    fn release_surface(&mut self, surface: SimSurface) {
        let slot = surface.id.raw() / 0x1000 - 1;
        if let Some(held) = self.held.get_mut(slot) {
            *held = false;
        }
        self.log.push(SimEvent::Release(surface.id));
    }
}

impl SyncApi for SimGpu {
    type Sync = SimSync;

    fn create_native_fence(&mut self, fd: Option<OwnedFd>) -> Result<SimSync> {
        self.next_sync += 1;
        self.live_syncs.insert(self.next_sync);
        self.log.push(SimEvent::CreateFence { imported: fd.is_some() });
        Ok(SimSync { id: self.next_sync, _fd: fd })
    }

    fn wait_sync(&mut self, _: &SimSync) -> Result<()> {
        self.log.push(SimEvent::GpuWait);
        Ok(())
    }

    fn client_wait_sync(&mut self, _: &SimSync) -> Result<()> {
        self.log.push(SimEvent::ClientWait);
        Ok(())
    }

    fn dup_native_fence_fd(&mut self, _: &SimSync) -> Result<OwnedFd> {
        self.log.push(SimEvent::ExportFence);
        null_fd().map_err(Error::device("export fence"))
    }

    fn destroy_sync(&mut self, sync: SimSync) -> Result<()> {
        if !self.live_syncs.remove(&sync.id) {
            return Err(Error::Egl(format!("sync {} destroyed twice", sync.id)));
        }
        self.log.push(SimEvent::DestroyFence);
        Ok(())
    }
}

/// renderer recording the frames it was asked to draw
#[derive(Debug)]
pub struct SimRenderer {
    log: EventLog,
}

impl SimRenderer {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl Renderer for SimRenderer {
    fn draw(&mut self, frame: u64) -> Result<()> {
        self.log.push(SimEvent::Draw(frame));
        Ok(())
    }
}

const CONNECTOR_PROPS: &[&str] = &["EDID", "DPMS", "CRTC_ID"];
const CRTC_PROPS: &[&str] = &["ACTIVE", "MODE_ID", "OUT_FENCE_PTR", "VRR_ENABLED"];
const PLANE_PROPS: &[&str] = &[
    "type", "FB_ID", "IN_FENCE_FD", "CRTC_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y", "SRC_W",
    "SRC_H",
];

/// a connected `size` output with a primary plane exposing every property
pub fn display_chain(size: (u16, u16)) -> DisplayChain {
    display_chain_without(&[], size)
}

/// like [`display_chain`] without the listed properties
pub fn display_chain_without(missing: &[(ObjectKind, &str)], size: (u16, u16)) -> DisplayChain {
    let mut next_prop = 0;
    let mut props = |kind: ObjectKind, names: &[&str]| {
        let mut set = PropertySet::new();
        for name in names {
            next_prop += 1;
            if missing.contains(&(kind, *name)) {
                continue;
            }
            let value = match *name {
                "type" => 1,
                _ => 0,
            };
            set.push(*name, property::Handle::from(nonzero(next_prop)), value);
        }
        set
    };

    let connector_props = props(ObjectKind::Connector, CONNECTOR_PROPS);
    let crtc_props = props(ObjectKind::Crtc, CRTC_PROPS);
    let plane_props = props(ObjectKind::Plane, PLANE_PROPS);

    let mut objects = ObjectArena::new();
    let connector = objects.insert(ObjectKind::Connector, nonzero(31), connector_props);
    let crtc = objects.insert(ObjectKind::Crtc, nonzero(41), crtc_props);
    let plane = objects.insert(ObjectKind::Plane, nonzero(51), plane_props);

    DisplayChain {
        name: "Virtual-1".into(),
        monitor: None,
        objects,
        connector,
        crtc,
        plane,
        crtc_index: 0,
        mode: ModeInfo::new(format!("{}x{}", size.0, size.1), size, 60).preferred(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_fails_when_every_surface_is_held() {
        let mut gpu = SimGpu::new(EventLog::default(), 2);

        let _presented = gpu.present().unwrap();
        let a = gpu.acquire_next_surface().unwrap();
        let _presented = gpu.present().unwrap();
        let b = gpu.acquire_next_surface().unwrap();
        assert!(!gpu.has_free_surface());
        let _presented = gpu.present().unwrap();
        assert!(gpu.acquire_next_surface().is_err());

        gpu.release_surface(a);
        assert!(gpu.has_free_surface());
        let c = gpu.acquire_next_surface().unwrap();
        assert_ne!(c.id(), b.id());
        assert_eq!(gpu.max_held(), 2);
    }

    #[test]
    fn acquire_needs_a_present() {
        let mut gpu = SimGpu::new(EventLog::default(), 3);
        assert!(gpu.acquire_next_surface().is_err());
    }

    #[test]
    fn chain_omits_requested_properties() {
        let chain = display_chain_without(&[(ObjectKind::Plane, "IN_FENCE_FD")], (1280, 720));
        let plane = &chain.objects.get(chain.plane).props;
        assert!(!plane.contains("IN_FENCE_FD"));
        assert!(plane.contains("FB_ID"));
        assert_eq!(chain.mode.size, (1280, 720));
    }
}
