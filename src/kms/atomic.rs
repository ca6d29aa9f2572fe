use std::os::fd::AsRawFd;

use drm::control::{framebuffer, property, RawResourceHandle};
use kms_scanner::{DisplayChain, ObjectId, ObjectKind};

use crate::{
    fence::{InFence, OutFence},
    kms::{CommitFlags, KmsDevice},
    Error, Result,
};

/// one `(object, property, value)` triple of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyWrite {
    pub kind: ObjectKind,
    pub object: RawResourceHandle,
    pub name: &'static str,
    pub property: property::Handle,
    pub value: u64,
}

/// a fully resolved transaction, ready for submission
#[derive(Debug)]
pub struct PendingCommit {
    writes: Vec<PropertyWrite>,
    in_fence: Option<InFence>,
    /// crtc `OUT_FENCE_PTR`, its value is the address the device provides
    out_fence: Option<PropertyWrite>,
}

impl PendingCommit {
    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    pub fn in_fence(&self) -> Option<&InFence> {
        self.in_fence.as_ref()
    }

    pub fn out_fence_property(&self) -> Option<&PropertyWrite> {
        self.out_fence.as_ref()
    }

    /// every property touched, `OUT_FENCE_PTR` included
    pub fn properties(&self) -> impl Iterator<Item = (ObjectKind, &'static str)> + '_ {
        self.writes
            .iter()
            .chain(self.out_fence.iter())
            .map(|write| (write.kind, write.name))
    }

    pub fn contains(&self, kind: ObjectKind, name: &str) -> bool {
        self.properties().any(|(k, n)| k == kind && n == name)
    }

    pub fn value(&self, kind: ObjectKind, name: &str) -> Option<u64> {
        self.writes
            .iter()
            .find(|write| write.kind == kind && write.name == name)
            .map(|write| write.value)
    }

    pub fn into_parts(self) -> (Vec<PropertyWrite>, Option<InFence>, Option<PropertyWrite>) {
        (self.writes, self.in_fence, self.out_fence)
    }
}

struct Writes<'a> {
    chain: &'a DisplayChain,
    writes: Vec<PropertyWrite>,
}

impl Writes<'_> {
    fn resolve(&self, id: ObjectId, name: &'static str, value: u64) -> Result<PropertyWrite> {
        let object = self.chain.objects.get(id);
        let property = object
            .props
            .handle(name)
            .ok_or(Error::UnknownProperty { object: object.kind, name })?;
        Ok(PropertyWrite { kind: object.kind, object: object.handle, name, property, value })
    }

    fn set(&mut self, id: ObjectId, name: &'static str, value: u64) -> Result<()> {
        let write = self.resolve(id, name, value)?;
        self.writes.push(write);
        Ok(())
    }
}

/// resolve every property of one frame's transaction
///
/// `modeset` carries the mode blob when timings are being set. A missing
/// property fails the whole transaction, nothing is partially built.
pub fn build_commit(
    chain: &DisplayChain,
    fb: framebuffer::Handle,
    modeset: Option<u64>,
    in_fence: Option<InFence>,
) -> Result<PendingCommit> {
    let mut writes = Writes { chain, writes: Vec::with_capacity(16) };
    let crtc_id = u32::from(chain.crtc_handle()) as u64;
    let (width, height) = chain.mode.size;
    let (width, height) = (width as u64, height as u64);

    if let Some(blob) = modeset {
        writes.set(chain.connector, "CRTC_ID", crtc_id)?;
        writes.set(chain.crtc, "MODE_ID", blob)?;
        writes.set(chain.crtc, "ACTIVE", 1)?;
    }

    writes.set(chain.plane, "FB_ID", u32::from(fb) as u64)?;
    writes.set(chain.plane, "CRTC_ID", crtc_id)?;
    // source rectangle is 16.16 fixed point
    writes.set(chain.plane, "SRC_X", 0)?;
    writes.set(chain.plane, "SRC_Y", 0)?;
    writes.set(chain.plane, "SRC_W", width << 16)?;
    writes.set(chain.plane, "SRC_H", height << 16)?;
    writes.set(chain.plane, "CRTC_X", 0)?;
    writes.set(chain.plane, "CRTC_Y", 0)?;
    writes.set(chain.plane, "CRTC_W", width)?;
    writes.set(chain.plane, "CRTC_H", height)?;

    let out_fence = match &in_fence {
        Some(fence) => {
            writes.set(chain.plane, "IN_FENCE_FD", fence.as_raw_fd() as u64)?;
            Some(writes.resolve(chain.crtc, "OUT_FENCE_PTR", 0)?)
        }
        None => None,
    };

    Ok(PendingCommit { writes: writes.writes, in_fence, out_fence })
}

/// atomic strategy of the display chain
#[derive(Debug)]
pub struct AtomicCommitter {
    chain: DisplayChain,
    mode_blob: Option<u64>,
    commits: u64,
}

impl AtomicCommitter {
    pub fn new(chain: DisplayChain) -> Self {
        Self { chain, mode_blob: None, commits: 0 }
    }

    pub fn chain(&self) -> &DisplayChain {
        &self.chain
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// plane and crtc expose the in/out fence properties
    pub fn supports_explicit_fencing(&self) -> bool {
        let plane = &self.chain.objects.get(self.chain.plane).props;
        let crtc = &self.chain.objects.get(self.chain.crtc).props;
        plane.contains("IN_FENCE_FD") && crtc.contains("OUT_FENCE_PTR")
    }

    /// show `fb`, returning the out-fence of the commit if one was requested
    pub fn commit<K: KmsDevice>(
        &mut self,
        kms: &mut K,
        fb: framebuffer::Handle,
        flags: CommitFlags,
        in_fence: Option<InFence>,
    ) -> Result<Option<OutFence>> {
        let modeset = match flags.contains(CommitFlags::ALLOW_MODESET) {
            true => Some(self.mode_blob(kms)?),
            false => None,
        };

        let pending = build_commit(&self.chain, fb, modeset, in_fence)?;
        tracing::trace!(?fb, ?flags, writes = pending.writes().len(), "atomic commit");

        let out_fence = kms.atomic_commit(flags, pending).map_err(Error::TransactionRejected)?;
        self.commits += 1;
        Ok(out_fence)
    }

    fn mode_blob<K: KmsDevice>(&mut self, kms: &mut K) -> Result<u64> {
        if let Some(blob) = self.mode_blob {
            return Ok(blob);
        }
        let blob = kms.create_mode_blob().map_err(Error::device("create mode blob"))?;
        self.mode_blob = Some(blob);
        Ok(blob)
    }

    pub fn teardown<K: KmsDevice>(&mut self, kms: &mut K) -> Result<()> {
        if let Some(blob) = self.mode_blob.take() {
            kms.destroy_mode_blob(blob).map_err(Error::device("destroy mode blob"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sim::{self, null_fd, EventLog, SimDevice},
        ErrorKind,
    };
    use std::num::NonZeroU32;

    const PLANE: [&str; 10] =
        ["FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H"];

    fn fb(id: u32) -> framebuffer::Handle {
        framebuffer::Handle::from(NonZeroU32::new(id).unwrap())
    }

    #[test]
    fn modeset_commit_sets_chain_and_plane() {
        let chain = sim::display_chain((1920, 1080));
        let commit = build_commit(&chain, fb(70), Some(99), None).unwrap();

        assert!(commit.contains(ObjectKind::Connector, "CRTC_ID"));
        assert_eq!(commit.value(ObjectKind::Crtc, "MODE_ID"), Some(99));
        assert_eq!(commit.value(ObjectKind::Crtc, "ACTIVE"), Some(1));
        for name in PLANE {
            assert!(commit.contains(ObjectKind::Plane, name), "missing plane {name}");
        }
        assert!(!commit.contains(ObjectKind::Plane, "IN_FENCE_FD"));
        assert!(commit.out_fence_property().is_none());
        assert_eq!(commit.writes().len(), 13);
    }

    #[test]
    fn flip_commit_only_touches_plane() {
        let chain = sim::display_chain((1920, 1080));
        let commit = build_commit(&chain, fb(70), None, None).unwrap();

        assert!(commit.properties().all(|(kind, _)| kind == ObjectKind::Plane));
        assert_eq!(commit.writes().len(), PLANE.len());
        assert_eq!(commit.value(ObjectKind::Plane, "FB_ID"), Some(70));
    }

    #[test]
    fn source_rectangle_is_fixed_point() {
        let chain = sim::display_chain((1280, 720));
        let commit = build_commit(&chain, fb(70), None, None).unwrap();

        assert_eq!(commit.value(ObjectKind::Plane, "SRC_W"), Some(1280 << 16));
        assert_eq!(commit.value(ObjectKind::Plane, "SRC_H"), Some(720 << 16));
        assert_eq!(commit.value(ObjectKind::Plane, "CRTC_W"), Some(1280));
        assert_eq!(commit.value(ObjectKind::Plane, "CRTC_H"), Some(720));
    }

    #[test]
    fn in_fence_adds_fence_properties() {
        let chain = sim::display_chain((1920, 1080));
        let fence = InFence::new(null_fd().unwrap());
        let raw = fence.as_raw_fd() as u64;
        let commit = build_commit(&chain, fb(70), None, Some(fence)).unwrap();

        assert_eq!(commit.value(ObjectKind::Plane, "IN_FENCE_FD"), Some(raw));
        assert!(commit.contains(ObjectKind::Crtc, "OUT_FENCE_PTR"));
        assert!(commit.in_fence().is_some());
    }

    #[test]
    fn missing_property_aborts_before_submission() {
        let chain = sim::display_chain_without(&[(ObjectKind::Plane, "IN_FENCE_FD")], (1920, 1080));
        let mut kms = SimDevice::new(EventLog::default());
        let mut committer = AtomicCommitter::new(chain);

        let err = committer
            .commit(&mut kms, fb(70), CommitFlags::NONBLOCK, Some(InFence::new(null_fd().unwrap())))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnknownProperty);
        assert!(kms.commits().is_empty());
        assert!(!committer.supports_explicit_fencing());
    }

    #[test]
    fn mode_blob_is_created_once_and_destroyed_on_teardown() {
        let mut kms = SimDevice::new(EventLog::default());
        let mut committer = AtomicCommitter::new(sim::display_chain((1920, 1080)));

        committer.commit(&mut kms, fb(70), CommitFlags::ALLOW_MODESET, None).unwrap();
        committer.commit(&mut kms, fb(71), CommitFlags::ALLOW_MODESET, None).unwrap();
        assert_eq!(kms.live_mode_blobs(), 1);

        committer.teardown(&mut kms).unwrap();
        assert_eq!(kms.live_mode_blobs(), 0);
        assert_eq!(committer.commits(), 2);
    }

    #[test]
    fn rejected_transaction_surfaces_kernel_error() {
        let mut kms = SimDevice::new(EventLog::default());
        kms.reject_commits_after(0);
        let mut committer = AtomicCommitter::new(sim::display_chain((1920, 1080)));

        let err = committer.commit(&mut kms, fb(70), CommitFlags::ALLOW_MODESET, None).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransactionRejected);
        assert_eq!(committer.commits(), 0);
    }

    #[test]
    fn out_fence_returned_with_in_fence() {
        let mut kms = SimDevice::new(EventLog::default());
        let mut committer = AtomicCommitter::new(sim::display_chain((1920, 1080)));

        let out = committer
            .commit(&mut kms, fb(70), CommitFlags::NONBLOCK, Some(InFence::new(null_fd().unwrap())))
            .unwrap();
        assert!(out.is_some());

        let out = committer.commit(&mut kms, fb(70), CommitFlags::NONBLOCK, None).unwrap();
        assert!(out.is_none());
    }
}
