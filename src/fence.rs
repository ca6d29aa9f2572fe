//! explicit synchronization between the gpu and the display engine
//!
//! two fences cross the boundary every frame:
//!
//! - the out-fence of the previous commit signals that the display let go of
//!   the buffer it was scanning out. The gpu waits on it before the new frame
//!   draws, and the cpu waits on it once more right before the next
//!   non-blocking commit, since the kernel rejects a commit while the
//!   previous one is still pending.
//! - the render fence is created after the frame's draw calls and exported as
//!   a file descriptor after the present call flushed the command stream.
//!   That descriptor travels with the commit as the plane in-fence.
//!
//! fence handles are move-only, a consumed fence cannot be waited on twice.
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::Result;

/// "gpu rendering complete" descriptor, consumed by an atomic commit
#[derive(Debug)]
pub struct InFence(OwnedFd);

impl InFence {
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    pub fn into_fd(self) -> OwnedFd {
        self.0
    }
}

impl AsFd for InFence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for InFence {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// "display completed the flip" descriptor, returned by an atomic commit
#[derive(Debug)]
pub struct OutFence(OwnedFd);

impl OutFence {
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    pub fn into_fd(self) -> OwnedFd {
        self.0
    }
}

impl AsFd for OutFence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// proof that the current frame went through `present`
///
/// only presenters hand these out, and exporting a render fence requires one,
/// so the export can never precede the present call of its frame
#[derive(Debug)]
#[must_use]
pub struct Presented(());

impl Presented {
    pub(crate) fn new() -> Self {
        Self(())
    }
}

/// native fence entry points of the gpu binding
pub trait SyncApi {
    type Sync;

    /// wrap `fd` as a sync object, or create a fence for the commands
    /// submitted so far when `fd` is `None`
    ///
    /// the descriptor belongs to the sync object afterwards
    fn create_native_fence(&mut self, fd: Option<OwnedFd>) -> Result<Self::Sync>;

    /// make the gpu wait for `sync` before executing later commands
    fn wait_sync(&mut self, sync: &Self::Sync) -> Result<()>;

    /// block the calling thread until `sync` signals
    fn client_wait_sync(&mut self, sync: &Self::Sync) -> Result<()>;

    fn dup_native_fence_fd(&mut self, sync: &Self::Sync) -> Result<OwnedFd>;

    fn destroy_sync(&mut self, sync: Self::Sync) -> Result<()>;
}

/// fence created after the draw calls of a frame, not yet exported
#[derive(Debug)]
#[must_use]
pub struct RenderFence<S>(S);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FenceStats {
    pub created: u64,
    pub destroyed: u64,
    pub exported: u64,
    pub gpu_waits: u64,
    pub cpu_waits: u64,
}

impl FenceStats {
    /// sync objects currently alive
    pub fn live(&self) -> u64 {
        self.created - self.destroyed
    }
}

#[derive(Debug)]
pub struct FencePipeline<S> {
    out_fence: Option<OutFence>,
    display_wait: Option<S>,
    stats: FenceStats,
}

impl<S> Default for FencePipeline<S> {
    fn default() -> Self {
        Self { out_fence: None, display_wait: None, stats: FenceStats::default() }
    }
}

impl<S> FencePipeline<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> FenceStats {
        self.stats
    }

    pub fn has_out_fence(&self) -> bool {
        self.out_fence.is_some()
    }

    /// out-fence produced by the last commit
    pub fn set_out_fence(&mut self, fence: OutFence) {
        if self.out_fence.replace(fence).is_some() {
            tracing::warn!("dropping an out-fence that was never waited on");
        }
    }

    /// order the next draw calls after the previous flip
    ///
    /// does not block, the gpu sequences the wait
    pub fn wait_for_display<A>(&mut self, api: &mut A) -> Result<()>
    where
        A: SyncApi<Sync = S>,
    {
        let Some(fence) = self.out_fence.take() else {
            return Ok(());
        };

        let sync = api.create_native_fence(Some(fence.into_fd()))?;
        self.stats.created += 1;

        if let Err(err) = api.wait_sync(&sync) {
            self.destroy(api, sync)?;
            return Err(err);
        }
        self.stats.gpu_waits += 1;
        self.display_wait = Some(sync);
        Ok(())
    }

    pub fn insert_render_fence<A>(&mut self, api: &mut A) -> Result<RenderFence<S>>
    where
        A: SyncApi<Sync = S>,
    {
        let sync = api.create_native_fence(None)?;
        self.stats.created += 1;
        Ok(RenderFence(sync))
    }

    /// export `fence` as the in-fence of the upcoming commit and destroy it
    pub fn export_render_fence<A>(&mut self, api: &mut A, fence: RenderFence<S>, _: Presented) -> Result<InFence>
    where
        A: SyncApi<Sync = S>,
    {
        let RenderFence(sync) = fence;
        let fd = api.dup_native_fence_fd(&sync);
        self.destroy(api, sync)?;
        let fd = fd?;
        self.stats.exported += 1;
        Ok(InFence::new(fd))
    }

    /// cpu wait for the previous flip, then drop its sync object
    pub fn finish_display_wait<A>(&mut self, api: &mut A) -> Result<()>
    where
        A: SyncApi<Sync = S>,
    {
        let Some(sync) = self.display_wait.take() else {
            return Ok(());
        };

        let waited = api.client_wait_sync(&sync);
        self.destroy(api, sync)?;
        waited?;
        self.stats.cpu_waits += 1;
        Ok(())
    }

    /// cpu wait for the last commit's flip, whether or not the gpu was
    /// ordered after it yet
    pub fn block_on_display<A>(&mut self, api: &mut A) -> Result<()>
    where
        A: SyncApi<Sync = S>,
    {
        self.finish_display_wait(api)?;
        let Some(fence) = self.out_fence.take() else {
            return Ok(());
        };

        let sync = api.create_native_fence(Some(fence.into_fd()))?;
        self.stats.created += 1;
        self.display_wait = Some(sync);
        self.finish_display_wait(api)
    }

    /// destroy whatever is still in flight
    pub fn teardown<A>(&mut self, api: &mut A) -> Result<()>
    where
        A: SyncApi<Sync = S>,
    {
        if let Some(sync) = self.display_wait.take() {
            self.destroy(api, sync)?;
        }
        if self.out_fence.take().is_some() {
            tracing::debug!("closing pending out-fence");
        }
        Ok(())
    }

    fn destroy<A>(&mut self, api: &mut A, sync: S) -> Result<()>
    where
        A: SyncApi<Sync = S>,
    {
        self.stats.destroyed += 1;
        api.destroy_sync(sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{null_fd, EventLog, SimEvent, SimGpu};

    fn gpu() -> (EventLog, SimGpu) {
        let log = EventLog::default();
        (log.clone(), SimGpu::new(log, 2))
    }

    #[test]
    fn nothing_to_wait_without_out_fence() {
        let (log, mut gpu) = gpu();
        let mut pipeline = FencePipeline::new();

        pipeline.wait_for_display(&mut gpu).unwrap();
        pipeline.finish_display_wait(&mut gpu).unwrap();

        assert_eq!(pipeline.stats(), FenceStats::default());
        assert!(log.events().is_empty());
    }

    #[test]
    fn out_fence_is_waited_by_gpu_then_cpu() {
        let (log, mut gpu) = gpu();
        let mut pipeline = FencePipeline::new();

        pipeline.set_out_fence(OutFence::new(null_fd().unwrap()));
        pipeline.wait_for_display(&mut gpu).unwrap();
        assert!(!pipeline.has_out_fence());
        assert_eq!(pipeline.stats().live(), 1);

        pipeline.finish_display_wait(&mut gpu).unwrap();

        let stats = pipeline.stats();
        assert_eq!((stats.gpu_waits, stats.cpu_waits), (1, 1));
        assert_eq!(stats.live(), 0);
        assert_eq!(
            log.events(),
            [
                SimEvent::CreateFence { imported: true },
                SimEvent::GpuWait,
                SimEvent::ClientWait,
                SimEvent::DestroyFence,
            ]
        );
        assert_eq!(gpu.live_syncs(), 0);
    }

    #[test]
    fn blocking_on_display_skips_the_gpu_wait() {
        let (log, mut gpu) = gpu();
        let mut pipeline = FencePipeline::new();

        pipeline.set_out_fence(OutFence::new(null_fd().unwrap()));
        pipeline.block_on_display(&mut gpu).unwrap();
        // nothing left for the next frame to wait on
        pipeline.wait_for_display(&mut gpu).unwrap();

        let stats = pipeline.stats();
        assert_eq!((stats.gpu_waits, stats.cpu_waits), (0, 1));
        assert_eq!(stats.live(), 0);
        assert_eq!(
            log.events(),
            [SimEvent::CreateFence { imported: true }, SimEvent::ClientWait, SimEvent::DestroyFence]
        );
    }

    #[test]
    fn render_fence_exports_after_present() {
        use crate::gpu::Presenter;

        let (log, mut gpu) = gpu();
        let mut pipeline = FencePipeline::new();

        let fence = pipeline.insert_render_fence(&mut gpu).unwrap();
        let presented = gpu.present().unwrap();
        let in_fence = pipeline.export_render_fence(&mut gpu, fence, presented).unwrap();

        assert!(in_fence.as_raw_fd() >= 0);
        assert_eq!(pipeline.stats().exported, 1);
        assert_eq!(pipeline.stats().live(), 0);
        assert_eq!(
            log.events(),
            [
                SimEvent::CreateFence { imported: false },
                SimEvent::Present,
                SimEvent::ExportFence,
                SimEvent::DestroyFence,
            ]
        );
    }

    #[test]
    fn teardown_releases_pending_wait() {
        let (_, mut gpu) = gpu();
        let mut pipeline = FencePipeline::new();

        pipeline.set_out_fence(OutFence::new(null_fd().unwrap()));
        pipeline.wait_for_display(&mut gpu).unwrap();
        pipeline.set_out_fence(OutFence::new(null_fd().unwrap()));
        pipeline.teardown(&mut gpu).unwrap();

        assert_eq!(pipeline.stats().live(), 0);
        assert!(!pipeline.has_out_fence());
        assert_eq!(gpu.live_syncs(), 0);
    }
}
