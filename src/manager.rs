//! Device, enumeration, and duplication lifecycle for one selected output.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::backend::{CaptureBackend, GraphicsDevice};
use crate::bitmap::BitmapImage;
use crate::device::DeviceCreationParams;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::{AcquireOutcome, Frame, FrameInfo};
use crate::frame_cache::{FrameBufferCache, SurfaceReader};
use crate::frame_source::FrameSource;
use crate::monitor::{flatten_outputs, MonitorDescriptor};
use crate::pointer::PointerInfo;
use crate::reconcile::{ChangedRegionSet, RegionReconciler};
use crate::region::{Point, Rect};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Enumerated,
    DeviceReady,
    DuplicationReady,
    Capturing,
    TimedOut,
    /// The device or duplication was lost. Call
    /// [`CaptureDeviceManager::recover_from_device_loss`].
    DeviceLost,
}

/// Result of one successful capture step.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    /// Snapshot of the captured region. Never mutated after it is handed
    /// out.
    pub image: Arc<BitmapImage>,
    pub changes: ChangedRegionSet,
    pub info: FrameInfo,
    pub sequence: u64,
    pub output_index: usize,
    /// Output-local rectangle the image covers.
    pub region: Rect,
    /// Whether pixels were copied for this frame. `false` means `image` is
    /// the unchanged image from an earlier frame.
    pub image_updated: bool,
}

#[derive(Clone, Debug)]
pub enum CaptureStep {
    TimedOut,
    Frame(CapturedFrame),
}

type Descriptor<B> =
    MonitorDescriptor<<B as CaptureBackend>::Adapter, <B as CaptureBackend>::Output>;
type Surface<B> = <<B as CaptureBackend>::Device as GraphicsDevice>::Surface;

pub struct CaptureDeviceManager<B: CaptureBackend> {
    backend: B,
    params: DeviceCreationParams,
    // Field order is drop order: the duplication goes before its device,
    // the device before the enumeration handles.
    source: Option<FrameSource<B::Duplication>>,
    device: Option<B::Device>,
    monitors: Vec<Descriptor<B>>,
    cache: FrameBufferCache,
    reconciler: RegionReconciler,
    pointer: PointerInfo,
    state: ManagerState,
    selected: Option<usize>,
}

impl<B: CaptureBackend> CaptureDeviceManager<B> {
    /// Manager using [`DeviceCreationParams::from_env`].
    pub fn new(backend: B) -> Self {
        Self::with_params(backend, DeviceCreationParams::from_env())
    }

    pub fn with_params(backend: B, params: DeviceCreationParams) -> Self {
        Self {
            backend,
            params,
            source: None,
            device: None,
            monitors: Vec::new(),
            cache: FrameBufferCache::new(),
            reconciler: RegionReconciler::new(),
            pointer: PointerInfo::new(),
            state: ManagerState::Uninitialized,
            selected: None,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn params(&self) -> &DeviceCreationParams {
        &self.params
    }

    pub fn monitors(&self) -> &[Descriptor<B>] {
        &self.monitors
    }

    pub fn selected_output(&self) -> Option<&Descriptor<B>> {
        self.selected.and_then(|index| self.monitors.get(index))
    }

    pub fn pointer(&self) -> &PointerInfo {
        &self.pointer
    }

    /// Whether a duplication is bound and frames can be acquired.
    pub fn is_ready(&self) -> bool {
        self.source.is_some()
    }

    /// Replace the output list with a fresh enumeration. Returns the number
    /// of outputs found.
    pub fn enumerate_outputs(&mut self) -> CaptureResult<usize> {
        self.monitors.clear();
        let entries = self.backend.enumerate_outputs()?;
        self.monitors = flatten_outputs(entries);
        if self.state == ManagerState::Uninitialized {
            self.state = ManagerState::Enumerated;
        }
        info!(outputs = self.monitors.len(), "enumerated outputs");
        for monitor in &self.monitors {
            debug!(%monitor, "output");
        }
        Ok(self.monitors.len())
    }

    /// Bind a device and duplication to output `index`.
    ///
    /// The list is enumerated again once when `index` is out of range. On
    /// failure the device and enumeration are released.
    pub fn select_and_initialize(&mut self, index: usize) -> CaptureResult<()> {
        self.teardown();
        self.selected = Some(index);

        let result = self.initialize_output(index);
        if let Err(err) = &result {
            warn!(index, error = %err, "output initialization failed");
            self.teardown();
            self.monitors.clear();
            self.state = ManagerState::Uninitialized;
        }
        result
    }

    fn initialize_output(&mut self, index: usize) -> CaptureResult<()> {
        if index >= self.monitors.len() {
            self.enumerate_outputs()?;
        }
        let descriptor = self
            .monitors
            .get(index)
            .ok_or(CaptureError::MonitorIndexOutOfRange {
                index,
                available: self.monitors.len(),
            })?;

        let device = self.backend.create_device(&descriptor.adapter, &self.params)?;
        self.state = ManagerState::DeviceReady;
        debug!(index, adapter = descriptor.adapter_index, "graphics device created");

        let source = FrameSource::initialize(&self.backend, &device, descriptor)?;
        info!(%descriptor, "duplication ready");
        self.device = Some(device);
        self.source = Some(source);
        self.state = ManagerState::DuplicationReady;
        Ok(())
    }

    /// Rebuild enumeration, device, and duplication for the previously
    /// selected output.
    pub fn recover_from_device_loss(&mut self) -> CaptureResult<()> {
        let index = self
            .selected
            .ok_or(CaptureError::InvalidState("no output has been selected"))?;
        info!(index, "recovering from device loss");
        self.teardown();
        self.monitors.clear();
        self.state = ManagerState::Uninitialized;
        self.enumerate_outputs()?;
        self.select_and_initialize(index)
    }

    fn teardown(&mut self) {
        self.source = None;
        self.device = None;
        self.cache.reset();
        if self.state != ManagerState::Uninitialized {
            self.state = if self.monitors.is_empty() {
                ManagerState::Uninitialized
            } else {
                ManagerState::Enumerated
            };
        }
    }

    fn mark_device_lost(&mut self, err: &CaptureError) {
        warn!(error = %err, "capture device lost, releasing graphics objects");
        self.source = None;
        self.device = None;
        self.state = ManagerState::DeviceLost;
    }

    pub fn current_image(&self) -> Option<Arc<BitmapImage>> {
        self.cache.current()
    }

    pub fn previous_image(&mut self, copy_if_absent: bool) -> CaptureResult<Option<Arc<BitmapImage>>> {
        self.cache.rotate_to_previous(copy_if_absent)
    }

    /// Acquire one frame, fold its metadata, and copy `region` (output-local,
    /// whole output when `None`) if anything changed.
    pub fn capture_frame(
        &mut self,
        timeout_ms: u32,
        region: Option<Rect>,
    ) -> CaptureResult<CaptureStep> {
        match self.capture_frame_inner(timeout_ms, region) {
            Err(err) if err.requires_reinitialization() => {
                self.mark_device_lost(&err);
                Err(err)
            }
            other => other,
        }
    }

    fn capture_frame_inner(
        &mut self,
        timeout_ms: u32,
        region: Option<Rect>,
    ) -> CaptureResult<CaptureStep> {
        let (Some(source), Some(device)) = (self.source.as_mut(), self.device.as_mut()) else {
            return Err(CaptureError::InvalidState("no duplication is bound"));
        };

        let desktop_rect = source.desktop_rect();
        let bounds = desktop_rect.relative_to(desktop_rect.top_left());
        let target = match region {
            None => bounds,
            Some(rect) => rect.intersect(&bounds).ok_or_else(|| {
                CaptureError::InvalidConfig(format!("region {rect:?} lies outside {bounds:?}"))
            })?,
        };

        let frame = match source.acquire_frame(timeout_ms) {
            Ok(AcquireOutcome::Frame(frame)) => frame,
            Ok(AcquireOutcome::TimedOut) => {
                self.state = ManagerState::TimedOut;
                return Ok(CaptureStep::TimedOut);
            }
            Err(err) => {
                let _ = source.release_frame();
                return Err(err);
            }
        };
        let info = frame.info;
        let sequence = frame.sequence;
        let copied = copy_changes::<B>(device, &mut self.cache, &mut self.reconciler, &frame, target);

        if copied.is_ok() {
            if let Err(err) = source.update_pointer(&mut self.pointer, Point::default()) {
                if err.requires_reinitialization() {
                    let _ = source.release_frame();
                    return Err(err);
                }
                warn!(error = %err, "pointer update failed");
            }
        }

        let released = source.release_frame();
        let (changes, image, image_updated) = copied?;
        released?;

        self.state = ManagerState::Capturing;
        trace!(sequence, area = changes.total_area, image_updated, "captured frame");
        Ok(CaptureStep::Frame(CapturedFrame {
            image,
            changes,
            info,
            sequence,
            output_index: source.output_index(),
            region: target,
            image_updated,
        }))
    }
}

fn copy_changes<B: CaptureBackend>(
    device: &mut B::Device,
    cache: &mut FrameBufferCache,
    reconciler: &mut RegionReconciler,
    frame: &Frame<'_, Surface<B>>,
    target: Rect,
) -> CaptureResult<(ChangedRegionSet, Arc<BitmapImage>, bool)> {
    let changes = reconciler.reconcile_into(&frame.metadata)?.clone();
    if changes.is_empty() {
        if let Some(image) = cache.current_from(target) {
            return Ok((changes, image, false));
        }
    }

    cache.retire_current();
    let mut reader = SurfaceReader {
        device,
        surface: frame.surface,
    };
    let image = cache.capture_region(&mut reader, target)?;
    Ok((changes, image, true))
}
