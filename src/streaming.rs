//! Continuous capture on a dedicated thread.
//!
//! The stream thread runs the synchronous acquire → reconcile → copy loop
//! of a [`CaptureDeviceManager`] and delivers [`CaptureEvent`]s through a
//! bounded channel. Frames carry `Arc` snapshots, so the consumer never
//! reads the buffer the capture thread is writing. When the consumer falls
//! behind, new frames are dropped rather than queued. Device loss is
//! recovered on the stream thread by rebuilding the device and
//! duplication.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::CaptureBackend;
use crate::encode::{EncodeFeeder, EncoderSampleBuilder};
use crate::env_config::{env_var_positive_u32, env_var_positive_u64};
use crate::error::{CaptureError, CaptureResult};
use crate::manager::{CaptureDeviceManager, CaptureStep, CapturedFrame};
use crate::region::Rect;

/// Configuration for a continuous capture stream.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Output to capture when the manager is not initialized yet.
    pub output_index: usize,
    /// Longest time a single acquire blocks waiting for a new frame.
    pub acquire_timeout_ms: u32,
    /// Target frames per second. `0` captures as fast as frames arrive.
    pub target_fps: u32,
    /// Frames buffered in the channel before new frames are dropped.
    pub buffer_depth: usize,
    /// Consecutive transient errors tolerated before the stream exits.
    pub max_consecutive_errors: usize,
    /// Device rebuild attempts after a device loss before giving up.
    pub max_recovery_attempts: u32,
    /// Delay before the first rebuild attempt; grows linearly per attempt.
    pub recovery_backoff: Duration,
    /// Output-local region to capture. `None` captures the whole output.
    pub region: Option<Rect>,
    /// Also emit frames whose pixels did not change (pointer-only or
    /// empty updates).
    pub emit_unchanged: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            output_index: 0,
            acquire_timeout_ms: 100,
            target_fps: 60,
            buffer_depth: 3,
            max_consecutive_errors: 30,
            max_recovery_attempts: 5,
            recovery_backoff: Duration::from_millis(250),
            region: None,
            emit_unchanged: false,
        }
    }
}

impl StreamConfig {
    /// Defaults overridden by `DUPL_CAPTURE_ACQUIRE_TIMEOUT_MS` and
    /// `DUPL_CAPTURE_TARGET_FPS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = env_var_positive_u32("DUPL_CAPTURE_ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout_ms = timeout;
        }
        if let Some(fps) = env_var_positive_u64("DUPL_CAPTURE_TARGET_FPS") {
            config.target_fps = u32::try_from(fps).unwrap_or(u32::MAX);
        }
        config
    }
}

/// Events delivered by a running stream.
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(CapturedFrame),
    /// Frames were captured while the channel was full. `sequence` is the
    /// latest one dropped. Sent once the consumer frees a slot.
    FrameDropped { sequence: u64 },
    /// The device or duplication was lost. The stream is rebuilding it.
    DeviceLost(CaptureError),
    /// Capture resumed after a device loss.
    Recovered { attempts: u32 },
    /// The stream hit an unrecoverable error and is about to exit.
    Error(CaptureError),
    /// The stream thread is exiting. No more events follow.
    StreamEnded,
}

/// Live statistics updated by the stream thread.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub timeouts: AtomicU64,
    pub errors_recovered: AtomicU64,
    pub recoveries: AtomicU64,
    /// Effective FPS as `f64` bits, updated once per second.
    pub current_fps: AtomicU64,
    /// Frames sitting in the channel.
    pub buffer_fill: AtomicU64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors_recovered: self.errors_recovered.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            current_fps: f64::from_bits(self.current_fps.load(Ordering::Relaxed)),
            buffer_fill: self.buffer_fill.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct StreamStatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub timeouts: u64,
    pub errors_recovered: u64,
    pub recoveries: u64,
    pub current_fps: f64,
    pub buffer_fill: u64,
}

/// Stop/pause flags and the stream thread. Dropping it stops and joins
/// the thread.
struct StreamControl {
    stop_flag: Arc<AtomicBool>,
    pause_flag: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    join_handle: Option<JoinHandle<()>>,
}

impl StreamControl {
    fn spawn<B>(
        mut manager: CaptureDeviceManager<B>,
        config: StreamConfig,
    ) -> CaptureResult<(Self, mpsc::Receiver<CaptureEvent>)>
    where
        B: CaptureBackend + 'static,
    {
        if !manager.is_ready() {
            manager.select_and_initialize(config.output_index)?;
        }

        let (tx, rx) = mpsc::sync_channel::<CaptureEvent>(config.buffer_depth.max(1));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let pause_flag = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(StreamStats::default());

        let stop = stop_flag.clone();
        let pause = pause_flag.clone();
        let loop_stats = stats.clone();
        let join_handle = std::thread::Builder::new()
            .name("dupl-capture-stream".to_string())
            .spawn(move || {
                crate::parallel::warmup_pool();
                stream_loop(&mut manager, &config, &tx, &stop, &pause, &loop_stats);
            })
            .map_err(|e| {
                CaptureError::Platform(anyhow::anyhow!(
                    "failed to spawn capture stream thread: {e}"
                ))
            })?;

        Ok((
            Self {
                stop_flag,
                pause_flag,
                stats,
                join_handle: Some(join_handle),
            },
            rx,
        ))
    }

    fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    fn join(&mut self) {
        self.stop();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for StreamControl {
    fn drop(&mut self) {
        self.join();
    }
}

/// Handle to a running capture stream. Dropping the handle stops the
/// stream thread.
pub struct StreamHandle {
    receiver: mpsc::Receiver<CaptureEvent>,
    control: StreamControl,
    buffer_depth: usize,
}

impl StreamHandle {
    /// Start capturing on a background thread. An uninitialized manager is
    /// bound to `config.output_index` first, so selection errors surface
    /// here.
    pub fn start<B>(manager: CaptureDeviceManager<B>, config: StreamConfig) -> CaptureResult<Self>
    where
        B: CaptureBackend + 'static,
    {
        let buffer_depth = config.buffer_depth.max(1);
        let (control, receiver) = StreamControl::spawn(manager, config)?;
        Ok(Self {
            receiver,
            control,
            buffer_depth,
        })
    }

    fn consumed(&self, event: &CaptureEvent) {
        if matches!(event, CaptureEvent::Frame(_)) {
            self.control.stats.buffer_fill.fetch_sub(1, Ordering::Release);
        }
    }

    /// Block until the next event arrives or the stream thread exits.
    pub fn recv(&self) -> Result<CaptureEvent, mpsc::RecvError> {
        let event = self.receiver.recv()?;
        self.consumed(&event);
        Ok(event)
    }

    pub fn try_recv(&self) -> Result<CaptureEvent, mpsc::TryRecvError> {
        let event = self.receiver.try_recv()?;
        self.consumed(&event);
        Ok(event)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<CaptureEvent, mpsc::RecvTimeoutError> {
        let event = self.receiver.recv_timeout(timeout)?;
        self.consumed(&event);
        Ok(event)
    }

    /// Feed captured frames to `feeder` until the stream ends, an error
    /// event arrives, or `max_frames` frames were fed. Returns the number
    /// of frames fed.
    pub fn forward_to(
        &self,
        feeder: &mut dyn EncodeFeeder,
        builder: &mut EncoderSampleBuilder,
        max_frames: Option<usize>,
    ) -> CaptureResult<usize> {
        let mut fed = 0usize;
        while max_frames.map_or(true, |max| fed < max) {
            let Ok(event) = self.recv() else {
                break;
            };
            match event {
                CaptureEvent::Frame(frame) => {
                    builder.feed(feeder, &frame.image, None)?;
                    fed += 1;
                }
                CaptureEvent::Error(err) => return Err(err),
                CaptureEvent::StreamEnded => break,
                CaptureEvent::FrameDropped { .. }
                | CaptureEvent::DeviceLost(_)
                | CaptureEvent::Recovered { .. } => {}
            }
        }
        Ok(fed)
    }

    /// Signal the stream thread to stop. It exits after the current
    /// iteration.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Pause capturing. The device and duplication stay bound.
    pub fn pause(&self) {
        self.control.pause_flag.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.control.pause_flag.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.control.pause_flag.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.control.stats
    }

    /// Channel fill as a fraction of `buffer_depth`.
    pub fn buffer_fill_percent(&self) -> f64 {
        let fill = self.control.stats.buffer_fill.load(Ordering::Relaxed);
        (fill as f64 / self.buffer_depth as f64).min(1.0)
    }

    /// Stop the stream, wait for the thread, and return every event still
    /// buffered.
    pub fn stop_and_drain(mut self) -> Vec<CaptureEvent> {
        self.control.join();
        let mut events = Vec::new();
        while let Ok(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

fn stream_loop<B: CaptureBackend>(
    manager: &mut CaptureDeviceManager<B>,
    config: &StreamConfig,
    tx: &mpsc::SyncSender<CaptureEvent>,
    stop: &AtomicBool,
    pause: &AtomicBool,
    stats: &StreamStats,
) {
    let interval = (config.target_fps > 0)
        .then(|| Duration::from_secs_f64(1.0 / f64::from(config.target_fps)));
    let mut consecutive_errors = 0usize;
    let mut fps_counter = 0u64;
    let mut fps_epoch = Instant::now();
    let mut pending_drop: Option<u64> = None;

    info!(?config, "capture stream started");
    while !stop.load(Ordering::Acquire) {
        if pause.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
            fps_counter = 0;
            fps_epoch = Instant::now();
            continue;
        }

        if let Some(sequence) = pending_drop {
            match tx.try_send(CaptureEvent::FrameDropped { sequence }) {
                Ok(()) => pending_drop = None,
                Err(mpsc::TrySendError::Full(_)) => {}
                Err(mpsc::TrySendError::Disconnected(_)) => break,
            }
        }

        let frame_start = Instant::now();
        match manager.capture_frame(config.acquire_timeout_ms, config.region) {
            Ok(CaptureStep::TimedOut) => {
                consecutive_errors = 0;
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Ok(CaptureStep::Frame(frame)) => {
                consecutive_errors = 0;
                stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                if frame.image_updated || config.emit_unchanged {
                    let sequence = frame.sequence;
                    match tx.try_send(CaptureEvent::Frame(frame)) {
                        Ok(()) => {
                            stats.buffer_fill.fetch_add(1, Ordering::Release);
                        }
                        Err(mpsc::TrySendError::Full(_)) => {
                            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                            pending_drop = Some(sequence);
                        }
                        Err(mpsc::TrySendError::Disconnected(_)) => break,
                    }
                }
            }
            Err(err) if err.requires_reinitialization() => {
                let _ = tx.try_send(CaptureEvent::DeviceLost(err.to_sendable()));
                match recover(manager, config, stop) {
                    Ok(attempts) => {
                        stats.recoveries.fetch_add(1, Ordering::Relaxed);
                        let _ = tx.try_send(CaptureEvent::Recovered { attempts });
                    }
                    Err(err) => {
                        let _ = tx.try_send(CaptureEvent::Error(err.to_sendable()));
                        break;
                    }
                }
                continue;
            }
            Err(err) if err.is_retryable() => {
                consecutive_errors += 1;
                stats.errors_recovered.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, consecutive_errors, "transient capture error");
                if consecutive_errors >= config.max_consecutive_errors {
                    let _ = tx.try_send(CaptureEvent::Error(err.to_sendable()));
                    break;
                }
                std::thread::sleep(Duration::from_millis(16));
                continue;
            }
            Err(err) => {
                warn!(error = %err, "fatal capture error");
                let _ = tx.try_send(CaptureEvent::Error(err.to_sendable()));
                break;
            }
        }

        fps_counter += 1;
        let fps_elapsed = fps_epoch.elapsed();
        if fps_elapsed >= Duration::from_secs(1) {
            let fps = fps_counter as f64 / fps_elapsed.as_secs_f64();
            stats.current_fps.store(fps.to_bits(), Ordering::Relaxed);
            fps_counter = 0;
            fps_epoch = Instant::now();
        }

        if let Some(interval) = interval {
            let elapsed = frame_start.elapsed();
            if elapsed < interval {
                spin_sleep(interval - elapsed);
            }
        }
    }

    info!(stats = ?stats.snapshot(), "capture stream ended");
    let _ = tx.try_send(CaptureEvent::StreamEnded);
}

fn recover<B: CaptureBackend>(
    manager: &mut CaptureDeviceManager<B>,
    config: &StreamConfig,
    stop: &AtomicBool,
) -> CaptureResult<u32> {
    let attempts = config.max_recovery_attempts.max(1);
    let mut last_error = CaptureError::DeviceRemoved;
    for attempt in 1..=attempts {
        if stop.load(Ordering::Acquire) {
            return Err(CaptureError::InvalidState("stream stopped during recovery"));
        }
        match manager.recover_from_device_loss() {
            Ok(()) => {
                info!(attempt, "capture device recovered");
                return Ok(attempt);
            }
            Err(err) => {
                warn!(attempt, error = %err, "device recovery attempt failed");
                last_error = err;
                std::thread::sleep(config.recovery_backoff * attempt);
            }
        }
    }
    Err(last_error)
}

/// Sleep that spins for the last stretch to avoid coarse timer resolution.
fn spin_sleep(duration: Duration) {
    const SPIN_THRESHOLD: Duration = Duration::from_micros(1500);

    let target = Instant::now() + duration;
    if duration > SPIN_THRESHOLD {
        std::thread::sleep(duration - SPIN_THRESHOLD);
    }
    while Instant::now() < target {
        std::hint::spin_loop();
    }
}

/// Async wrapper around the capture stream for tokio-based pipelines.
///
/// Requires the `tokio-stream` feature.
#[cfg(feature = "tokio-stream")]
pub struct AsyncStreamHandle {
    async_rx: tokio::sync::mpsc::Receiver<CaptureEvent>,
    control: StreamControl,
    bridge: Option<JoinHandle<()>>,
}

#[cfg(feature = "tokio-stream")]
impl AsyncStreamHandle {
    /// Start a capture stream plus a bridge thread forwarding its events
    /// into a `tokio::sync::mpsc` channel.
    pub fn start<B>(manager: CaptureDeviceManager<B>, config: StreamConfig) -> CaptureResult<Self>
    where
        B: CaptureBackend + 'static,
    {
        let channel_depth = config.buffer_depth.max(1);
        let (control, sync_rx) = StreamControl::spawn(manager, config)?;
        let (async_tx, async_rx) = tokio::sync::mpsc::channel::<CaptureEvent>(channel_depth);

        let bridge_stop = control.stop_flag.clone();
        let bridge_stats = control.stats.clone();
        let bridge = std::thread::Builder::new()
            .name("dupl-capture-async-bridge".to_string())
            .spawn(move || loop {
                match sync_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(event) => {
                        if matches!(&event, CaptureEvent::Frame(_)) {
                            bridge_stats.buffer_fill.fetch_sub(1, Ordering::Release);
                        }
                        if async_tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if bridge_stop.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| {
                CaptureError::Platform(anyhow::anyhow!("failed to spawn async bridge thread: {e}"))
            })?;

        Ok(Self {
            async_rx,
            control,
            bridge: Some(bridge),
        })
    }

    pub async fn next_event(&mut self) -> Option<CaptureEvent> {
        self.async_rx.recv().await
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn pause(&self) {
        self.control.pause_flag.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.control.pause_flag.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.control.stats
    }
}

#[cfg(feature = "tokio-stream")]
impl Drop for AsyncStreamHandle {
    fn drop(&mut self) {
        self.control.join();
        // Unblocks a bridge stuck in `blocking_send`.
        self.async_rx.close();
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
    }
}
