use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use deskcap::{
    CaptureParams, CaptureTarget, DesktopCaptureDevice, DeviceOptions, ResolutionPolicy,
    StatsSink, SyntheticDesktop, SyntheticWindow, WindowId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Screen to capture
    #[arg(short, long, default_value_t = 0, conflicts_with = "window")]
    screen: u32,

    /// Window to capture instead of a screen
    #[arg(short, long)]
    window: Option<WindowId>,

    /// Target frames per second
    #[arg(long, default_value_t = 30.0)]
    fps: f32,

    /// Maximum output width
    #[arg(long, default_value_t = 1280)]
    max_width: u32,

    /// Maximum output height
    #[arg(long, default_value_t = 720)]
    max_height: u32,

    /// How output size follows the source
    #[arg(long, value_enum, default_value_t = Policy::Fixed)]
    policy: Policy,

    /// Seconds to capture before stopping
    #[arg(short, long, default_value_t = 5.0)]
    duration: f32,

    /// Directory to write PNG snapshots into
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Write every Nth frame as a snapshot
    #[arg(long, default_value_t = 30)]
    snapshot_every: u64,

    /// Window to leave out of screen captures
    #[arg(long)]
    exclude_window: Option<WindowId>,

    /// Close the captured window after this many seconds
    #[arg(long)]
    close_window_after: Option<f32>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    /// Letterbox into the requested size
    Fixed,
    /// Follow the source size up to the requested size
    WithinLimit,
}

impl From<Policy> for ResolutionPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Fixed => ResolutionPolicy::Fixed,
            Policy::WithinLimit => ResolutionPolicy::WithinLimit,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("deskcap starting");

    let desktop = demo_desktop();
    let target = match args.window {
        Some(id) => CaptureTarget::Window(id),
        None => CaptureTarget::Screen(args.screen),
    };

    let params = CaptureParams::from_frame_rate(args.fps, args.max_width, args.max_height)
        .with_policy(args.policy.into());
    params.validate().context("Invalid capture parameters")?;

    tracing::info!("Target: {}", target);
    tracing::info!("Output: up to {}x{} ({:?})", args.max_width, args.max_height, args.policy);
    tracing::info!("Target FPS: {}", args.fps);

    // Window capture borrows this runtime, screen capture gets its own thread
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let options = DeviceOptions {
        notification_window: args.exclude_window,
        shared_runtime: Some(runtime.handle().clone()),
    };
    let mut device = DesktopCaptureDevice::create(target, Arc::new(desktop.clone()), options)
        .with_context(|| format!("Failed to create capture device for {}", target))?;

    let (sink, stats) = StatsSink::new();
    let sink = match &args.snapshot_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            sink.with_snapshots(dir, args.snapshot_every)
        }
        None => sink,
    };

    device
        .allocate_and_start(params, Box::new(sink))
        .context("Failed to start capture")?;

    let started = Instant::now();
    let duration = Duration::from_secs_f32(args.duration.max(0.0));
    let close_after = args.close_window_after.map(|s| Duration::from_secs_f32(s.max(0.0)));
    let mut window_closed = false;

    while started.elapsed() < duration && !stats.failed() {
        if let (Some(after), CaptureTarget::Window(id)) = (close_after, target) {
            if !window_closed && started.elapsed() >= after {
                desktop.close_window(id);
                window_closed = true;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    device.stop_and_deallocate();
    drop(device);

    let summary = stats.summary();
    tracing::info!(
        "Captured {} frames, average {:.1} fps, last size {:?}, {} snapshots",
        summary.frames,
        summary.average_fps(),
        summary.last_size,
        summary.snapshots
    );

    if let Some(error) = summary.error {
        bail!("Capture ended early: {}", error);
    }
    Ok(())
}

/// Two screens with a couple of windows on the first
fn demo_desktop() -> SyntheticDesktop {
    let desktop = SyntheticDesktop::new();
    desktop.add_screen(0, 1920, 1080);
    desktop.add_screen(1, 1280, 1024);
    desktop.add_window(
        1,
        SyntheticWindow {
            screen: 0,
            x: 100,
            y: 80,
            width: 800,
            height: 600,
            color: [0x20, 0x60, 0xc0],
        },
    );
    desktop.add_window(
        2,
        SyntheticWindow {
            screen: 0,
            x: 1000,
            y: 400,
            width: 641,
            height: 479,
            color: [0xc0, 0x40, 0x20],
        },
    );
    desktop
}
