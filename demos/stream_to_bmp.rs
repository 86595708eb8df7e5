use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dupl_capture::bmp::write_image;
use dupl_capture::{
    platform_backend, CaptureDeviceManager, CaptureEvent, StreamConfig, StreamHandle,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let output_index: usize = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()
        .context("output index must be a number")?
        .unwrap_or(0);
    let out_dir = PathBuf::from(std::env::args().nth(2).unwrap_or_else(|| "frames".into()));
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let mut manager = CaptureDeviceManager::new(platform_backend());
    manager.enumerate_outputs().context("failed to enumerate outputs")?;
    for monitor in manager.monitors() {
        println!("  {monitor}");
    }

    let stream = StreamHandle::start(
        manager,
        StreamConfig {
            output_index,
            ..StreamConfig::from_env()
        },
    )
    .context("failed to start streaming")?;

    let stats = stream.stats().clone();
    let start = Instant::now();
    let run_duration = Duration::from_secs(5);
    let mut written = 0u32;

    println!("Streaming output #{output_index} for {run_duration:?}...");
    while start.elapsed() < run_duration {
        match stream.recv_timeout(Duration::from_millis(500)) {
            Ok(CaptureEvent::Frame(frame)) => {
                // Every 30th changed frame is enough to eyeball the output.
                if frame.sequence % 30 == 1 {
                    let path = out_dir.join(format!("frame-{:06}.bmp", frame.sequence));
                    write_image(&path, &frame.image)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    written += 1;
                    println!(
                        "  seq={} {}x{} changed_area={} rects={} -> {}",
                        frame.sequence,
                        frame.image.width,
                        frame.image.height,
                        frame.changes.total_area,
                        frame.changes.len(),
                        path.display()
                    );
                }
            }
            Ok(CaptureEvent::FrameDropped { sequence }) => {
                println!("  frame dropped: seq={sequence}");
            }
            Ok(CaptureEvent::DeviceLost(err)) => {
                println!("  device lost: {err}");
            }
            Ok(CaptureEvent::Recovered { attempts }) => {
                println!("  recovered after {attempts} attempt(s)");
            }
            Ok(CaptureEvent::StreamEnded) => {
                println!("  stream ended");
                break;
            }
            Ok(CaptureEvent::Error(err)) => {
                println!("  stream error: {err}");
                break;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                println!("  (desktop idle for 500ms)");
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                println!("  stream ended unexpectedly");
                break;
            }
        }
    }

    let tail_events = stream.stop_and_drain();
    let snap = stats.snapshot();
    println!(
        "\nDone: {} captured, {} dropped, {} timeouts, {} recoveries, {written} bitmaps, \
         {} tail events",
        snap.frames_captured,
        snap.frames_dropped,
        snap.timeouts,
        snap.recoveries,
        tail_events.len(),
    );
    Ok(())
}
