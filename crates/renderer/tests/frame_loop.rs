//! End-to-end frame loop tests against the headless device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use cadence_core::RenderConfig;
use cadence_renderer::{FRAMES_IN_FLIGHT, FrameManager, FrameOutcome, FrameStats};
use cadence_rhi::headless::{HeadlessDevice, HeadlessImage, HeadlessSignal, HeadlessSurface};
use cadence_rhi::vk;
use cadence_rhi::{AcquiredImage, RhiError, RhiResult, SwapchainSurface};

fn setup(device: &Arc<HeadlessDevice>) -> (FrameManager<HeadlessDevice>, HeadlessSurface) {
    let mut config = RenderConfig::default();
    config.presentation.width = 320;
    config.presentation.height = 240;
    let manager = FrameManager::new(device.clone(), &config).unwrap();
    let surface = HeadlessSurface::new(device, 320, 240, 3).unwrap();
    (manager, surface)
}

fn present(
    manager: &mut FrameManager<HeadlessDevice>,
    surface: &mut HeadlessSurface,
) -> FrameOutcome {
    manager.render_frame(surface, |_, _, _| {}).unwrap()
}

#[test]
fn test_frames_present_in_order() {
    let device = HeadlessDevice::immediate();
    let (mut manager, mut surface) = setup(&device);

    let mut ticks = Vec::new();
    for _ in 0..6 {
        match present(&mut manager, &mut surface) {
            FrameOutcome::Presented { tick } => ticks.push(tick),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    // One render submission and one copy submission per frame.
    assert_eq!(ticks, vec![2, 4, 6, 8, 10, 12]);
    assert_eq!(surface.presented(), &[0, 1, 2, 0, 1, 2]);
    assert_eq!(
        manager.stats(),
        FrameStats {
            presented: 6,
            skipped: 0
        }
    );

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 12);
    for copy in submissions.iter().skip(1).step_by(2) {
        assert_eq!(copy.waits.len(), 2);
        assert!(copy.signal.is_some());
    }
}

#[test]
fn test_slots_alternate_render_targets() {
    let device = HeadlessDevice::immediate();
    let (mut manager, mut surface) = setup(&device);

    let mut slots = Vec::new();
    for _ in 0..4 {
        manager
            .render_frame(&mut surface, |_, _, frame| {
                assert_eq!(frame.extent().width, 320);
                slots.push(frame.slot());
            })
            .unwrap();
    }
    assert_eq!(slots, vec![0, 1, 0, 1]);

    let targets: Vec<u64> = device.copies().iter().map(|c| c.render_target).collect();
    assert_eq!(targets.len(), 4);
    assert_ne!(targets[0], targets[1]);
    assert_eq!(targets[0], targets[2]);
    assert_eq!(targets[1], targets[3]);
}

#[test]
fn test_frame_waits_for_slot_reuse() {
    let device = HeadlessDevice::manual();
    let (mut manager, mut surface) = setup(&device);

    for _ in 0..FRAMES_IN_FLIGHT {
        assert!(matches!(
            present(&mut manager, &mut surface),
            FrameOutcome::Presented { .. }
        ));
    }
    assert_eq!(device.pending_ticks(), vec![1, 2, 3, 4]);

    let released = Arc::new(AtomicBool::new(false));
    let gpu = {
        let device = device.clone();
        let released = released.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            device.complete_all();
        })
    };

    let outcome = present(&mut manager, &mut surface);
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(outcome, FrameOutcome::Presented { tick: 6 });

    gpu.join().unwrap();
    device.complete_all();
    manager.wait_idle().unwrap();
}

#[test]
fn test_invalidated_acquire_skips_one_frame() {
    let device = HeadlessDevice::immediate();
    let (mut manager, mut surface) = setup(&device);

    surface.invalidate_next_acquire();
    let outcome = present(&mut manager, &mut surface);
    assert!(matches!(outcome, FrameOutcome::Skipped { .. }));
    assert_eq!(surface.recreations(), 1);
    assert_eq!(manager.presentation().available(), FRAMES_IN_FLIGHT);

    assert!(matches!(
        present(&mut manager, &mut surface),
        FrameOutcome::Presented { .. }
    ));
    assert_eq!(
        manager.stats(),
        FrameStats {
            presented: 1,
            skipped: 1
        }
    );
}

#[test]
fn test_invalidated_present_recreates_before_next_frame() {
    let device = HeadlessDevice::immediate();
    let (mut manager, mut surface) = setup(&device);

    surface.invalidate_next_present();
    assert!(matches!(
        present(&mut manager, &mut surface),
        FrameOutcome::Skipped { .. }
    ));
    assert!(matches!(
        present(&mut manager, &mut surface),
        FrameOutcome::Presented { .. }
    ));
    assert_eq!(surface.recreations(), 1);
    assert_eq!(surface.presented(), &[0]);
}

#[test]
fn test_rejected_submission_skips_frame() {
    let device = HeadlessDevice::immediate();
    let (mut manager, mut surface) = setup(&device);

    present(&mut manager, &mut surface);
    let before = manager.counter().submitted_tick();

    device.fail_next_submit();
    match present(&mut manager, &mut surface) {
        FrameOutcome::Skipped { reason } => assert!(reason.contains("rejected")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(manager.counter().submitted_tick(), before);

    assert_eq!(
        present(&mut manager, &mut surface),
        FrameOutcome::Presented { tick: before + 2 }
    );
}

/// Surface whose next acquisition arms a queue rejection, so the copy into
/// the acquired image is the submission that fails.
struct RejectCopySurface {
    inner: HeadlessSurface,
    device: Arc<HeadlessDevice>,
    reject_next_copy: bool,
}

impl SwapchainSurface<HeadlessDevice> for RejectCopySurface {
    fn acquire_next_image(&mut self) -> RhiResult<AcquiredImage<HeadlessImage>> {
        let acquired = self.inner.acquire_next_image()?;
        if std::mem::take(&mut self.reject_next_copy) {
            self.device.fail_next_submit();
        }
        Ok(acquired)
    }

    fn acquire_signal(&self, acquired: &AcquiredImage<HeadlessImage>) -> &HeadlessSignal {
        self.inner.acquire_signal(acquired)
    }

    fn present(
        &mut self,
        acquired: &AcquiredImage<HeadlessImage>,
        wait: &HeadlessSignal,
    ) -> RhiResult<()> {
        self.inner.present(acquired, wait)
    }

    fn discard(&mut self, acquired: &AcquiredImage<HeadlessImage>) {
        self.inner.discard(acquired);
    }

    fn recreate(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.inner.recreate(width, height)
    }

    fn extent(&self) -> vk::Extent2D {
        self.inner.extent()
    }

    fn needs_recreation(&self) -> bool {
        self.inner.needs_recreation()
    }
}

#[test]
fn test_rejected_copy_retires_signals_and_discards_image() {
    let device = HeadlessDevice::immediate();
    let (mut manager, inner) = setup(&device);
    let mut surface = RejectCopySurface {
        inner,
        device: device.clone(),
        reject_next_copy: false,
    };

    assert_eq!(
        manager.render_frame(&mut surface, |_, _, _| {}).unwrap(),
        FrameOutcome::Presented { tick: 2 }
    );

    surface.reject_next_copy = true;
    match manager.render_frame(&mut surface, |_, _, _| {}).unwrap() {
        FrameOutcome::Skipped { reason } => assert!(reason.contains("rejected")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(surface.inner.discarded(), &[1]);
    assert!(surface.needs_recreation());
    assert_eq!(manager.presentation().available(), FRAMES_IN_FLIGHT);

    // Render flush, then an empty submission waiting on both copy signals.
    assert_eq!(manager.counter().submitted_tick(), 4);
    let retire = &device.submissions()[3];
    assert_eq!(retire.tick, 4);
    assert_eq!(retire.waits.len(), 2);
    assert_eq!(retire.signal, None);

    for expected in [6, 8] {
        let outcome = manager
            .render_frame(&mut surface, |_, _, frame| {
                assert!(!frame.render_finished().is_raised());
                assert!(!frame.present_ready().is_raised());
            })
            .unwrap();
        assert_eq!(outcome, FrameOutcome::Presented { tick: expected });
    }

    assert_eq!(surface.inner.recreations(), 1);
    assert_eq!(surface.inner.presented(), &[0, 0, 1]);
    assert_eq!(
        manager.stats(),
        FrameStats {
            presented: 3,
            skipped: 1
        }
    );
}

#[test]
fn test_lost_device_is_fatal() {
    let device = HeadlessDevice::immediate();
    let (mut manager, mut surface) = setup(&device);

    present(&mut manager, &mut surface);
    device.lose_device();

    let err = manager
        .render_frame(&mut surface, |_, _, _| {})
        .unwrap_err();
    assert!(err.is_device_lost());
    assert!(matches!(err, RhiError::DeviceLost(_)));
}

#[test]
fn test_resize_recreates_render_targets() {
    let device = HeadlessDevice::immediate();
    let (mut manager, mut surface) = setup(&device);

    present(&mut manager, &mut surface);
    manager.resize(640, 480).unwrap();

    assert_eq!(manager.presentation().extent().width, 640);
    assert_eq!(manager.presentation().extent().height, 480);
    assert_eq!(device.live_render_targets(), FRAMES_IN_FLIGHT);

    manager
        .render_frame(&mut surface, |_, _, frame| {
            assert_eq!(frame.render_target().extent().width, 640);
        })
        .unwrap();
}

#[test]
fn test_drop_releases_everything() {
    let device = HeadlessDevice::manual();
    {
        let (mut manager, mut surface) = setup(&device);
        present(&mut manager, &mut surface);
        present(&mut manager, &mut surface);
        assert!(device.live_allocators() > 0);
        device.complete_all();
    }

    assert_eq!(device.live_allocators(), 0);
    assert_eq!(device.live_signals(), 0);
    assert_eq!(device.live_render_targets(), 0);
}
