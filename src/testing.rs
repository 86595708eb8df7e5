//! Scriptable in-memory backend used by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{
    CaptureBackend, DuplicationOutput, GraphicsDevice, MappedRegion, OutputEntry,
    PointerShapeInfo, RawAcquire, Rotation,
};
use crate::device::{DeviceCreationParams, RemovedReason};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::FrameInfo;
use crate::region::{MoveRect, Point, Rect, DIRTY_RECT_BYTES, MOVE_RECT_BYTES};

/// Extra bytes appended to every mapped row so readers must honour the
/// pitch.
pub(crate) const MOCK_ROW_PADDING: u32 = 16;

#[derive(Debug)]
pub(crate) struct MockSurface {
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Tightly packed BGRA rows.
    pub(crate) pixels: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum MockFailure {
    AccessLost,
    DeviceRemoved(RemovedReason),
    Platform,
}

impl MockFailure {
    fn raise(self, shared: &mut MockShared) -> CaptureError {
        match self {
            Self::AccessLost => CaptureError::AccessLost,
            Self::DeviceRemoved(reason) => {
                shared.removed_reason = reason;
                CaptureError::Platform(anyhow::anyhow!("device hung"))
            }
            Self::Platform => CaptureError::Platform(anyhow::anyhow!("scripted failure")),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct MockFrame {
    surface: Arc<MockSurface>,
    moves: Vec<MoveRect>,
    dirty: Vec<Rect>,
    pointer: Option<(Point, Vec<u8>)>,
    metadata_failure: Option<MockFailure>,
    pointer_shape_fails: bool,
}

impl MockFrame {
    pub(crate) fn solid(width: u32, height: u32, value: u8) -> Self {
        Self::from_fn(width, height, |_, _| [value; 4])
    }

    /// Every pixel encodes its own coordinates: `[x, y, seed, 0xFF]`.
    pub(crate) fn patterned(width: u32, height: u32, seed: u8) -> Self {
        Self::from_fn(width, height, |x, y| [x as u8, y as u8, seed, 0xFF])
    }

    fn from_fn(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&pixel(x, y));
            }
        }
        Self {
            surface: Arc::new(MockSurface {
                width,
                height,
                pixels,
            }),
            moves: Vec::new(),
            dirty: Vec::new(),
            pointer: None,
            metadata_failure: None,
            pointer_shape_fails: false,
        }
    }

    pub(crate) fn with_moves(mut self, moves: Vec<MoveRect>) -> Self {
        self.moves = moves;
        self
    }

    pub(crate) fn with_dirty(mut self, dirty: Vec<Rect>) -> Self {
        self.dirty = dirty;
        self
    }

    pub(crate) fn with_pointer(mut self, position: Point, shape: Vec<u8>) -> Self {
        self.pointer = Some((position, shape));
        self
    }

    pub(crate) fn failing_metadata(mut self, failure: MockFailure) -> Self {
        self.metadata_failure = Some(failure);
        self
    }

    pub(crate) fn failing_pointer_shape(mut self) -> Self {
        self.pointer_shape_fails = true;
        self
    }

    fn info(&self, sequence: i64) -> FrameInfo {
        let metadata = self.moves.len() * MOVE_RECT_BYTES + self.dirty.len() * DIRTY_RECT_BYTES;
        let mut info = FrameInfo {
            last_present_time: sequence,
            accumulated_frames: 1,
            total_metadata_size: metadata as u32,
            ..FrameInfo::default()
        };
        if let Some((position, shape)) = &self.pointer {
            info.last_mouse_update_time = sequence;
            info.pointer_position = *position;
            info.pointer_visible = true;
            info.pointer_shape_buffer_size = shape.len() as u32;
        }
        info
    }
}

#[derive(Clone, Debug)]
pub(crate) enum MockStep {
    Frame(MockFrame),
    /// A frame that carries no desktop surface.
    EmptyFrame,
    Timeout,
    Fail(MockFailure),
}

#[derive(Clone, Debug, Default)]
pub(crate) struct MockCounters {
    pub(crate) enumerations: usize,
    pub(crate) device_creations: usize,
    pub(crate) duplications: usize,
    pub(crate) releases: usize,
    pub(crate) region_reads: usize,
    pub(crate) move_budgets: Vec<u32>,
    pub(crate) dirty_budgets: Vec<u32>,
}

struct MockShared {
    outputs: Vec<Rect>,
    next_outputs: Option<Vec<Rect>>,
    rotation: Rotation,
    script: VecDeque<MockStep>,
    removed_reason: RemovedReason,
    fail_device_creation: bool,
    fail_duplication: bool,
    held: Option<MockFrame>,
    holding: bool,
    counters: MockCounters,
}

#[derive(Clone)]
pub(crate) struct MockBackend {
    shared: Arc<Mutex<MockShared>>,
    live_handles: Arc<AtomicUsize>,
    live_devices: Arc<AtomicUsize>,
    live_duplications: Arc<AtomicUsize>,
}

impl MockBackend {
    pub(crate) fn with_outputs(outputs: Vec<Rect>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MockShared {
                outputs,
                next_outputs: None,
                rotation: Rotation::Identity,
                script: VecDeque::new(),
                removed_reason: RemovedReason::None,
                fail_device_creation: false,
                fail_duplication: false,
                held: None,
                holding: false,
                counters: MockCounters::default(),
            })),
            live_handles: Arc::new(AtomicUsize::new(0)),
            live_devices: Arc::new(AtomicUsize::new(0)),
            live_duplications: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn single_output(width: i32, height: i32) -> Self {
        Self::with_outputs(vec![Rect::new(0, 0, width, height)])
    }

    fn lock(&self) -> MutexGuard<'_, MockShared> {
        self.shared.lock().expect("mock backend state poisoned")
    }

    pub(crate) fn script(&self, steps: impl IntoIterator<Item = MockStep>) {
        self.lock().script.extend(steps);
    }

    pub(crate) fn set_rotation(&self, rotation: Rotation) {
        self.lock().rotation = rotation;
    }

    pub(crate) fn fail_device_creation(&self, fail: bool) {
        self.lock().fail_device_creation = fail;
    }

    pub(crate) fn fail_duplication(&self, fail: bool) {
        self.lock().fail_duplication = fail;
    }

    /// The next enumeration reports `outputs` instead of the current set.
    pub(crate) fn replace_outputs_on_next_enumeration(&self, outputs: Vec<Rect>) {
        self.lock().next_outputs = Some(outputs);
    }

    pub(crate) fn counters(&self) -> MockCounters {
        self.lock().counters.clone()
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    pub(crate) fn live_devices(&self) -> usize {
        self.live_devices.load(Ordering::SeqCst)
    }

    pub(crate) fn live_duplications(&self) -> usize {
        self.live_duplications.load(Ordering::SeqCst)
    }

    /// A duplication that is not tied to any device, for source-level
    /// tests.
    pub(crate) fn duplication(&self) -> CaptureResult<MockDuplication> {
        let rotation = self.lock().rotation;
        Ok(MockDuplication::new(self, rotation))
    }
}

pub(crate) struct MockHandle {
    live: Arc<AtomicUsize>,
}

impl MockHandle {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            live: Arc::clone(live),
        }
    }
}

impl Clone for MockHandle {
    fn clone(&self) -> Self {
        Self::new(&self.live)
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockDevice {
    shared: Arc<Mutex<MockShared>>,
    _live: MockHandle,
}

impl GraphicsDevice for MockDevice {
    type Surface = Arc<MockSurface>;

    fn read_region(
        &mut self,
        surface: &Self::Surface,
        rect: Rect,
        sink: &mut dyn FnMut(MappedRegion<'_>) -> CaptureResult<()>,
    ) -> CaptureResult<()> {
        let bounds = Rect::new(0, 0, surface.width as i32, surface.height as i32);
        if !bounds.contains_rect(&rect) {
            return Err(CaptureError::InvalidConfig(format!(
                "{rect:?} is outside the {bounds:?} surface"
            )));
        }
        self.shared
            .lock()
            .expect("mock backend state poisoned")
            .counters
            .region_reads += 1;

        let (width, height) = rect.extent()?;
        let row_bytes = width * 4;
        let row_pitch = row_bytes + MOCK_ROW_PADDING;
        let mut staging = vec![0xEE; (row_pitch * height) as usize];
        for row in 0..height {
            let src_y = rect.top as u32 + row;
            let src = ((src_y * surface.width + rect.left as u32) * 4) as usize;
            let dst = (row * row_pitch) as usize;
            staging[dst..dst + row_bytes as usize]
                .copy_from_slice(&surface.pixels[src..src + row_bytes as usize]);
        }
        sink(MappedRegion {
            data: &staging,
            row_pitch,
            width,
            height,
        })
    }

    fn removed_reason(&self) -> RemovedReason {
        self.shared
            .lock()
            .expect("mock backend state poisoned")
            .removed_reason
    }
}

pub(crate) struct MockDuplication {
    shared: Arc<Mutex<MockShared>>,
    rotation: Rotation,
    sequence: i64,
    _live: MockHandle,
}

impl MockDuplication {
    fn new(backend: &MockBackend, rotation: Rotation) -> Self {
        Self {
            shared: Arc::clone(&backend.shared),
            rotation,
            sequence: 0,
            _live: MockHandle::new(&backend.live_duplications),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockShared> {
        self.shared.lock().expect("mock backend state poisoned")
    }
}

impl DuplicationOutput for MockDuplication {
    type Surface = Arc<MockSurface>;

    fn rotation(&self) -> Rotation {
        self.rotation
    }

    fn acquire_next_frame(&mut self, _timeout_ms: u32) -> CaptureResult<RawAcquire<Self::Surface>> {
        let mut shared = self.shared.lock().expect("mock backend state poisoned");
        if shared.holding {
            return Err(CaptureError::InvalidState("previous frame was not released"));
        }
        match shared.script.pop_front() {
            None | Some(MockStep::Timeout) => Ok(RawAcquire::TimedOut),
            Some(MockStep::EmptyFrame) => {
                shared.holding = true;
                Ok(RawAcquire::Acquired {
                    surface: None,
                    info: FrameInfo::default(),
                })
            }
            Some(MockStep::Frame(frame)) => {
                self.sequence += 1;
                let info = frame.info(self.sequence);
                let surface = Arc::clone(&frame.surface);
                shared.holding = true;
                shared.held = Some(frame);
                Ok(RawAcquire::Acquired {
                    surface: Some(surface),
                    info,
                })
            }
            Some(MockStep::Fail(failure)) => Err(failure.raise(&mut shared)),
        }
    }

    fn frame_move_rects(
        &mut self,
        budget_bytes: u32,
        out: &mut Vec<MoveRect>,
    ) -> CaptureResult<()> {
        let mut shared = self.lock();
        shared.counters.move_budgets.push(budget_bytes);
        let Some(frame) = shared.held.clone() else {
            return Err(CaptureError::NoFrame);
        };
        if let Some(failure) = frame.metadata_failure {
            return Err(failure.raise(&mut shared));
        }
        if (budget_bytes as usize) < frame.moves.len() * MOVE_RECT_BYTES {
            return Err(CaptureError::BufferOverflow);
        }
        out.clear();
        out.extend_from_slice(&frame.moves);
        Ok(())
    }

    fn frame_dirty_rects(&mut self, budget_bytes: u32, out: &mut Vec<Rect>) -> CaptureResult<()> {
        let mut shared = self.lock();
        shared.counters.dirty_budgets.push(budget_bytes);
        let Some(frame) = shared.held.as_ref() else {
            return Err(CaptureError::NoFrame);
        };
        if (budget_bytes as usize) < frame.dirty.len() * DIRTY_RECT_BYTES {
            return Err(CaptureError::BufferOverflow);
        }
        out.clear();
        out.extend_from_slice(&frame.dirty);
        Ok(())
    }

    fn frame_pointer_shape(&mut self, out: &mut [u8]) -> CaptureResult<PointerShapeInfo> {
        let shared = self.lock();
        let Some((_, shape)) = shared.held.as_ref().and_then(|frame| {
            (!frame.pointer_shape_fails)
                .then_some(frame.pointer.as_ref())
                .flatten()
        }) else {
            return Err(CaptureError::Platform(anyhow::anyhow!("no pointer shape")));
        };
        if out.len() < shape.len() {
            return Err(CaptureError::BufferOverflow);
        }
        out[..shape.len()].copy_from_slice(shape);
        Ok(PointerShapeInfo {
            shape_type: 2,
            width: 4,
            height: (shape.len() / 16) as u32,
            pitch: 16,
            hotspot: Point::default(),
        })
    }

    fn release_frame(&mut self) -> CaptureResult<()> {
        let mut shared = self.lock();
        if !shared.holding {
            return Err(CaptureError::InvalidState("no frame to release"));
        }
        shared.holding = false;
        shared.held = None;
        shared.counters.releases += 1;
        Ok(())
    }

    fn removed_reason(&self) -> RemovedReason {
        self.lock().removed_reason
    }
}

impl CaptureBackend for MockBackend {
    type Adapter = MockHandle;
    type Output = MockHandle;
    type Device = MockDevice;
    type Duplication = MockDuplication;

    fn enumerate_outputs(&self) -> CaptureResult<Vec<OutputEntry<MockHandle, MockHandle>>> {
        let mut shared = self.lock();
        shared.counters.enumerations += 1;
        if let Some(next) = shared.next_outputs.take() {
            shared.outputs = next;
        }
        Ok(shared
            .outputs
            .iter()
            .enumerate()
            .map(|(index, rect)| OutputEntry {
                adapter_index: 0,
                output_index: index as u32,
                desktop_rect: *rect,
                name: format!(r"\\.\DISPLAY{}", index + 1),
                adapter: MockHandle::new(&self.live_handles),
                output: MockHandle::new(&self.live_handles),
            })
            .collect())
    }

    fn create_device(
        &self,
        _adapter: &MockHandle,
        _params: &DeviceCreationParams,
    ) -> CaptureResult<MockDevice> {
        let mut shared = self.lock();
        shared.counters.device_creations += 1;
        if shared.fail_device_creation {
            return Err(CaptureError::Platform(anyhow::anyhow!(
                "no driver accepted the device request"
            )));
        }
        shared.removed_reason = RemovedReason::None;
        Ok(MockDevice {
            shared: Arc::clone(&self.shared),
            _live: MockHandle::new(&self.live_devices),
        })
    }

    fn duplicate_output(
        &self,
        _device: &MockDevice,
        _output: &MockHandle,
    ) -> CaptureResult<MockDuplication> {
        let (fail, rotation) = {
            let mut shared = self.lock();
            shared.counters.duplications += 1;
            (shared.fail_duplication, shared.rotation)
        };
        if fail {
            return Err(CaptureError::AccessLost);
        }
        Ok(MockDuplication::new(self, rotation))
    }
}
