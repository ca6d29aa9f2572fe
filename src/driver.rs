//! the render loop
//!
//! each frame goes through the same sequence:
//!
//! 1. order the gpu after the previous flip (out-fence)
//! 2. draw
//! 3. insert the render fence, present, export the fence (in-fence)
//! 4. lock the new surface and look up its framebuffer
//! 5. cpu wait for the previous flip, then commit
//! 6. release the surface the previous flip took off screen
//!
//! the first frame is a blocking modeset, every later one a non-blocking flip.
//! A surface replaced by a non-blocking commit stays held until that commit's
//! flip completed. When the ring runs dry the frame blocks on the flip before
//! rendering.
use std::{
    fmt, io,
    time::{Duration, Instant},
};

use drm::control::framebuffer;

use crate::{
    fence::{FencePipeline, FenceStats, InFence, SyncApi},
    gpu::Presenter,
    kms::{AtomicCommitter, CommitFlags, FramebufferBridge, KmsDevice},
    render::Renderer,
    Error, Result,
};

const REPORT_INTERVAL: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// nothing shown yet, the next commit sets the mode
    Priming,
    /// mode is set, frames are flipped
    Steady,
}

/// how commits learn that the previous frame reached the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// in/out fences travel with each commit
    Explicit,
    /// page flip events, the loop blocks on each one
    Implicit,
}

#[derive(Debug)]
pub enum Strategy {
    Atomic { committer: AtomicCommitter, sync: SyncMode },
    /// `set_crtc` then `page_flip`
    Legacy,
}

impl Strategy {
    /// atomic commits, fenced when both the gpu and the display chain allow it
    pub fn atomic(committer: AtomicCommitter, gpu_fences: bool) -> Strategy {
        let sync = match (gpu_fences, committer.supports_explicit_fencing()) {
            (true, true) => SyncMode::Explicit,
            (false, _) => {
                tracing::info!("gpu has no native fences, waiting on page flip events");
                SyncMode::Implicit
            }
            (true, false) => {
                tracing::info!("display chain has no fence properties, waiting on page flip events");
                SyncMode::Implicit
            }
        };
        Strategy::Atomic { committer, sync }
    }

    pub fn sync_mode(&self) -> SyncMode {
        match self {
            Strategy::Atomic { sync, .. } => *sync,
            Strategy::Legacy => SyncMode::Implicit,
        }
    }
}

/// outcome of [`Driver::run`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub elapsed: Duration,
    pub fences: FenceStats,
}

impl RunSummary {
    pub fn fps(&self) -> f64 {
        match self.elapsed.as_secs_f64() {
            secs if secs > 0.0 => self.frames as f64 / secs,
            _ => 0.0,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rendered {} frames in {:.2}s ({:.1} fps), {} fences created, {} destroyed",
            self.frames,
            self.elapsed.as_secs_f64(),
            self.fps(),
            self.fences.created,
            self.fences.destroyed,
        )
    }
}

struct FrameClock {
    start: Instant,
    last: Instant,
}

impl FrameClock {
    fn new() -> Self {
        let now = Instant::now();
        Self { start: now, last: now }
    }

    fn tick(&mut self, frames: u64) {
        if frames == 0 || frames % REPORT_INTERVAL != 0 {
            return;
        }
        let now = Instant::now();
        let secs = now.duration_since(self.last).as_secs_f64();
        if secs > 0.0 {
            tracing::info!("rendered {frames} frames, {:.1} fps", REPORT_INTERVAL as f64 / secs);
        }
        self.last = now;
    }
}

pub struct Driver<K, G, R>
where
    G: Presenter + SyncApi,
{
    kms: K,
    // gl objects of the renderer go before the context they live in
    renderer: R,
    gpu: G,
    strategy: Strategy,
    bridge: FramebufferBridge,
    fences: FencePipeline<G::Sync>,
    state: LoopState,
    on_screen: Option<G::Surface>,
    /// taken off screen by a flip that may still be pending
    retired: Option<G::Surface>,
    frame: u64,
    clock: FrameClock,
}

impl<K, G, R> Driver<K, G, R>
where
    K: KmsDevice,
    G: Presenter + SyncApi,
    R: Renderer,
{
    pub fn new(kms: K, gpu: G, renderer: R, strategy: Strategy) -> Self {
        Self {
            kms,
            renderer,
            gpu,
            strategy,
            bridge: FramebufferBridge::new(),
            fences: FencePipeline::new(),
            state: LoopState::Priming,
            on_screen: None,
            retired: None,
            frame: 0,
            clock: FrameClock::new(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// frames presented so far
    pub fn frames(&self) -> u64 {
        self.frame
    }

    pub fn fence_stats(&self) -> FenceStats {
        self.fences.stats()
    }

    pub fn bridge(&self) -> &FramebufferBridge {
        &self.bridge
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn kms(&self) -> &K {
        &self.kms
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    fn explicit(&self) -> bool {
        self.strategy.sync_mode() == SyncMode::Explicit
    }

    /// render and present one frame
    pub fn step(&mut self) -> Result<()> {
        let explicit = self.explicit();

        self.reclaim_surface()?;
        if explicit {
            self.fences.wait_for_display(&mut self.gpu)?;
        }

        self.renderer.draw(self.frame)?;

        let render_fence = match explicit {
            true => Some(self.fences.insert_render_fence(&mut self.gpu)?),
            false => None,
        };
        let presented = self.gpu.present()?;
        let in_fence = match render_fence {
            Some(fence) => Some(self.fences.export_render_fence(&mut self.gpu, fence, presented)?),
            None => None,
        };

        let surface = self.gpu.acquire_next_surface()?;
        let fb = match self.bridge.get_framebuffer(&mut self.kms, &surface) {
            Ok(fb) => fb,
            Err(err) => {
                self.gpu.release_surface(surface);
                return Err(err);
            }
        };

        let flipped = match self.show(fb, in_fence) {
            Ok(flipped) => flipped,
            Err(err) => {
                self.gpu.release_surface(surface);
                return Err(err);
            }
        };

        if let Some(previous) = self.on_screen.replace(surface) {
            match flipped {
                true => self.gpu.release_surface(previous),
                false => self.retired = Some(previous),
            }
        }

        if self.state == LoopState::Priming {
            tracing::info!(sync = ?self.strategy.sync_mode(), "mode set, entering steady state");
            self.state = LoopState::Steady;
        }
        self.frame += 1;
        self.clock.tick(self.frame);
        Ok(())
    }

    /// block on the pending flip while every surface of the ring is held
    fn reclaim_surface(&mut self) -> Result<()> {
        if self.gpu.has_free_surface() {
            return Ok(());
        }
        if self.retired.is_none() {
            return Err(Error::Device {
                op: "lock front buffer",
                source: io::Error::new(io::ErrorKind::WouldBlock, "every surface is held and no flip is pending"),
            });
        }

        tracing::trace!(frame = self.frame, "surface ring exhausted, waiting for the flip");
        self.fences.block_on_display(&mut self.gpu)?;
        self.release_retired();
        Ok(())
    }

    fn release_retired(&mut self) {
        if let Some(surface) = self.retired.take() {
            self.gpu.release_surface(surface);
        }
    }

    /// put `fb` on screen, returns whether the flip already completed
    fn show(&mut self, fb: framebuffer::Handle, in_fence: Option<InFence>) -> Result<bool> {
        let priming = self.state == LoopState::Priming;
        tracing::trace!(frame = self.frame, ?fb, priming, "show");

        match &mut self.strategy {
            Strategy::Atomic { committer, sync } => {
                let mut flags = match priming {
                    true => CommitFlags::ALLOW_MODESET,
                    false => CommitFlags::NONBLOCK,
                };
                let wait_flip = !priming && *sync == SyncMode::Implicit;
                if wait_flip {
                    flags |= CommitFlags::PAGE_FLIP_EVENT;
                }

                self.fences.finish_display_wait(&mut self.gpu)?;
                // the previous flip is done, so is the surface it replaced
                if let Some(surface) = self.retired.take() {
                    self.gpu.release_surface(surface);
                }
                if let Some(out_fence) = committer.commit(&mut self.kms, fb, flags, in_fence)? {
                    self.fences.set_out_fence(out_fence);
                }
                if wait_flip {
                    self.kms.wait_page_flip().map_err(Error::device("wait for page flip"))?;
                }
                Ok(priming || wait_flip)
            }
            Strategy::Legacy => {
                if priming {
                    self.kms.set_crtc(fb).map_err(Error::device("set crtc"))?;
                } else {
                    self.kms.page_flip(fb).map_err(Error::device("page flip"))?;
                    self.kms.wait_page_flip().map_err(Error::device("wait for page flip"))?;
                }
                Ok(true)
            }
        }
    }

    /// run `frames` frames, or until an error when `None`
    pub fn run(&mut self, frames: Option<u64>) -> Result<RunSummary> {
        let start = self.frame;
        self.clock = FrameClock::new();

        while frames.map_or(true, |limit| self.frame - start < limit) {
            if let Err(err) = self.step() {
                tracing::error!(frame = self.frame, "{err}");
                return Err(err);
            }
        }

        Ok(self.summary(start))
    }

    fn summary(&self, start: u64) -> RunSummary {
        RunSummary {
            frames: self.frame - start,
            elapsed: self.clock.start.elapsed(),
            fences: self.fences.stats(),
        }
    }

    /// give everything back to the kernel: surfaces, framebuffers, the
    /// mode blob and pending fences
    ///
    /// every step runs even if an earlier one failed, the first error wins
    pub fn teardown(&mut self) -> Result<()> {
        let mut result = Ok(());
        let mut keep = |step: Result<()>| {
            if let Err(err) = step {
                tracing::warn!("teardown: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        };

        if let Some(surface) = self.on_screen.take() {
            self.gpu.release_surface(surface);
        }
        self.release_retired();
        keep(self.bridge.clear(&mut self.kms));
        if let Strategy::Atomic { committer, .. } = &mut self.strategy {
            keep(committer.teardown(&mut self.kms));
        }
        keep(self.fences.teardown(&mut self.gpu));

        let stats = self.fences.stats();
        tracing::debug!(created = stats.created, destroyed = stats.destroyed, "driver torn down");
        result
    }
}
