use atomflip::{
    driver::{Driver, LoopState, Strategy, SyncMode},
    kms::{AtomicCommitter, CommitFlags},
    sim::{self, EventLog, SimDevice, SimEvent, SimGpu, SimRenderer},
};
use kms_scanner::ObjectKind;

type SimDriver = Driver<SimDevice, SimGpu, SimRenderer>;

const FRAMES: u64 = 120;

fn atomic_driver(depth: usize, gpu_fences: bool) -> (EventLog, SimDriver) {
    let log = EventLog::default();
    let chain = sim::display_chain((1920, 1080));
    let driver = Driver::new(
        SimDevice::new(log.clone()),
        SimGpu::new(log.clone(), depth),
        SimRenderer::new(log.clone()),
        Strategy::atomic(AtomicCommitter::new(chain), gpu_fences),
    );
    (log, driver)
}

#[test]
fn fenced_atomic_run() {
    let (log, mut driver) = atomic_driver(2, true);
    assert_eq!(driver.strategy().sync_mode(), SyncMode::Explicit);

    let summary = driver.run(Some(FRAMES)).unwrap();
    assert_eq!(summary.frames, FRAMES);
    assert_eq!(driver.state(), LoopState::Steady);

    let commits = driver.kms().commits();
    assert_eq!(commits.len() as u64, FRAMES);
    assert_eq!(commits[0].flags, CommitFlags::ALLOW_MODESET);
    assert!(commits[1..].iter().all(|c| c.flags == CommitFlags::NONBLOCK));

    for commit in commits {
        assert!(commit.in_fence);
        assert!(commit.contains(ObjectKind::Plane, "FB_ID"));
        assert!(commit.contains(ObjectKind::Plane, "IN_FENCE_FD"));
        assert!(commit.contains(ObjectKind::Crtc, "OUT_FENCE_PTR"));
    }

    // the ring of two surfaces is registered once per surface
    assert_eq!(driver.kms().registrations(), 2);
    assert!(driver.gpu().max_held() <= 2);

    driver.teardown().unwrap();
    let stats = driver.fence_stats();
    assert_eq!(stats.created, stats.destroyed);
    assert_eq!(stats.exported, FRAMES);
    assert_eq!(driver.gpu().live_syncs(), 0);
    assert_eq!(driver.gpu().held(), 0);
    assert_eq!(driver.kms().live_framebuffers(), 0);
    assert_eq!(driver.kms().live_mode_blobs(), 0);

    assert_eq!(log.count(|e| *e == SimEvent::Present), FRAMES as usize);
}

#[test]
fn render_fence_is_exported_after_present() {
    let (log, mut driver) = atomic_driver(2, true);
    driver.run(Some(FRAMES)).unwrap();

    let events = log.events();
    for (i, event) in events.iter().enumerate() {
        if *event == SimEvent::Present {
            assert_eq!(events[i - 1], SimEvent::CreateFence { imported: false });
            assert_eq!(events[i + 1], SimEvent::ExportFence);
        }
    }
}

#[test]
fn previous_flip_is_waited_before_each_commit() {
    let (log, mut driver) = atomic_driver(3, true);
    driver.run(Some(FRAMES)).unwrap();

    let events = log.events();
    let commits: Vec<_> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, SimEvent::Commit(_)))
        .map(|(i, _)| i)
        .collect();

    for pair in commits.windows(2) {
        let between = &events[pair[0]..pair[1]];
        assert!(between.contains(&SimEvent::ClientWait));
        assert!(between.contains(&SimEvent::CreateFence { imported: true }));

        let gpu_wait = between.iter().position(|e| *e == SimEvent::GpuWait).unwrap();
        let draw = between.iter().position(|e| matches!(e, SimEvent::Draw(_))).unwrap();
        assert!(gpu_wait < draw);
    }
}

#[test]
fn replaced_surface_is_held_until_its_flip_completes() {
    let (log, mut driver) = atomic_driver(3, true);
    driver.run(Some(FRAMES)).unwrap();

    let events = log.events();
    let commits: Vec<_> = (0..events.len()).filter(|i| matches!(events[*i], SimEvent::Commit(_))).collect();

    let mut released = 0;
    for (i, event) in events.iter().enumerate() {
        let SimEvent::Release(id) = event else { continue };
        released += 1;

        let acquired = events[..i].iter().rposition(|e| *e == SimEvent::Acquire(*id)).unwrap();
        // the commit showing the surface, then the one replacing it
        let replaced_by = commits.iter().filter(|c| **c > acquired).nth(1).copied().unwrap();
        assert!(replaced_by < i);
        assert!(events[replaced_by..i].contains(&SimEvent::ClientWait));
    }
    assert_eq!(released, FRAMES as usize - 2);
    assert!(driver.gpu().max_held() <= 3);
}

#[test]
fn implicit_run_creates_no_fences() {
    let (log, mut driver) = atomic_driver(2, false);
    driver.run(Some(FRAMES)).unwrap();
    driver.teardown().unwrap();

    assert_eq!(driver.fence_stats().created, 0);
    assert_eq!(log.count(|e| matches!(e, SimEvent::CreateFence { .. })), 0);
    assert_eq!(log.count(|e| *e == SimEvent::PageFlipEvent), FRAMES as usize - 1);
    assert!(driver.kms().commits().iter().all(|c| !c.in_fence));
}

#[test]
fn legacy_run() {
    let log = EventLog::default();
    let mut driver = Driver::new(
        SimDevice::new(log.clone()),
        SimGpu::new(log.clone(), 2),
        SimRenderer::new(log.clone()),
        Strategy::Legacy,
    );

    let summary = driver.run(Some(FRAMES)).unwrap();
    driver.teardown().unwrap();

    assert_eq!(summary.frames, FRAMES);
    assert_eq!(log.count(|e| *e == SimEvent::SetCrtc), 1);
    assert_eq!(log.count(|e| *e == SimEvent::PageFlip), FRAMES as usize - 1);
    assert_eq!(log.count(|e| *e == SimEvent::PageFlipEvent), FRAMES as usize - 1);
    assert_eq!(driver.kms().live_framebuffers(), 0);
    assert_eq!(driver.fence_stats().created, 0);
}
