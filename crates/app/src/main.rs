//! Cadence - headless frame loop driver
//!
//! Runs the frame manager against the headless device, with a background
//! thread standing in for the GPU. Useful for watching pacing, slot reuse and
//! surface recreation in the logs without a display.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use cadence_core::{RenderConfig, Timer};
use cadence_renderer::{FrameManager, FrameOutcome};
use cadence_rhi::headless::{CompletionMode, HeadlessDevice, HeadlessSurface};

#[derive(Parser, Debug)]
#[command(name = "cadence", version, about = "Headless frame loop driver")]
struct Cli {
    /// Configuration file; defaults are used if it does not exist
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    /// Number of frames to render
    #[arg(short, long, default_value_t = 240)]
    frames: u64,

    /// Simulated GPU time per submission, in milliseconds
    #[arg(long, default_value_t = 4)]
    gpu_latency_ms: u64,

    /// Invalidate the surface every N frames (0 disables)
    #[arg(long, default_value_t = 0)]
    invalidate_every: u64,

    /// Number of surface images
    #[arg(long, default_value_t = 3)]
    surface_images: u32,
}

/// Completes submitted work in order, one submission per `latency`.
struct GpuThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GpuThread {
    fn spawn(device: Arc<HeadlessDevice>, latency: Duration) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("gpu".to_string())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    match device.complete_next() {
                        Some(tick) => {
                            debug!("GPU completed tick {}", tick);
                            thread::sleep(latency);
                        }
                        None => thread::sleep(Duration::from_millis(1)),
                    }
                }
            })
            .context("Failed to spawn GPU thread")?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("GPU thread panicked");
        }
    }
}

impl Drop for GpuThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RenderConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    match config.log_filter.as_deref() {
        Some(filter) => cadence_core::init_logging_with_filter(filter),
        None => cadence_core::init_logging(),
    }
    info!("Starting cadence frame loop ({} frames)", cli.frames);

    let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual));
    let mut gpu = GpuThread::spawn(device.clone(), Duration::from_millis(cli.gpu_latency_ms))?;

    let mut frames = FrameManager::new(device.clone(), &config)?;
    let mut surface = HeadlessSurface::new(
        &device,
        config.presentation.width,
        config.presentation.height,
        cli.surface_images,
    )?;

    let mut timer = Timer::new();
    for n in 1..=cli.frames {
        if cli.invalidate_every > 0 && n % cli.invalidate_every == 0 {
            surface.invalidate_next_acquire();
        }

        let outcome = frames.render_frame(&mut surface, |_device, _cmd, frame| {
            debug!("Recording frame {} into slot {}", n, frame.slot());
        })?;
        let elapsed = timer.tick();

        if let FrameOutcome::Skipped { reason } = outcome {
            info!("Frame {} skipped: {}", n, reason);
        } else if n % 60 == 0 {
            info!(
                "Frame {}: {:.2} ms, {:.1} fps average",
                n,
                elapsed.as_secs_f64() * 1000.0,
                timer.average_fps()
            );
        }
    }

    frames.wait_idle()?;
    gpu.stop();

    let stats = frames.stats();
    info!(
        "Done: {} presented, {} skipped, {} submissions, {} command allocator(s), longest frame {:.2} ms",
        stats.presented,
        stats.skipped,
        device.submissions().len(),
        device.allocators_created(),
        timer.longest_frame().as_secs_f64() * 1000.0
    );

    Ok(())
}
