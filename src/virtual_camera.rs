// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Simulated sensor and ISP.
//!
//! [`VirtualSensor`] answers extended control transactions like a V4L2
//! sub-device, clamping values to their range. [`VirtualIsp`] pairs queued
//! raw, parameter and statistics buffers into frames, renders auto exposure
//! statistics from a [`SceneModel`] lit by the sensor's current exposure and
//! gain, and reports completions to an event loop. Both support fault
//! injection so the error paths of the pipeline can be driven on a desktop.

use crate::{
    buffer::{BufferHandle, BufferMetadata, BufferStatus, FrameBuffer, Queue},
    controls::cid,
    device::{flags, kind, BatchFailure, ControlBackend, ExtControl, ExtValue, RawControl},
    error::{HalError, Result},
    event_loop::{Event, EventSender, HardwareEvent},
    ipa::isp::{AeStatistics, IspParams, AE_MEAN_MAX, PARAMS_SIZE, STATS_SIZE},
    pipeline::IspHardware,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    io,
    ops::Bound,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, trace, warn};

/// Sensor model reported by the virtual sensor.
pub const SENSOR_MODEL: &str = "imx477";

/// Byte array control holding a lens shading table.
pub const LENS_SHADING_TABLE: u32 = 0x00a0_0901;
/// String control the engine cannot marshal.
pub const SENSOR_NAME: u32 = 0x00a0_0902;
const USER_CLASS: u32 = 0x0098_0001;

/// Frame interval of the virtual sensor in nanoseconds.
pub const FRAME_INTERVAL_NS: u64 = 33_333_333;

const RAW_SIZE: usize = 4096;

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

fn eio() -> io::Error {
    io::Error::from_raw_os_error(libc::EIO)
}

struct SensorControl {
    raw: RawControl,
    value: i64,
    payload: Vec<u8>,
}

impl SensorControl {
    fn new(id: u32, name: &str, ty: u32, min: i64, max: i64, def: i64, flags: u32) -> Self {
        Self {
            raw: RawControl {
                id,
                name: name.into(),
                kind: ty,
                minimum: min,
                maximum: max,
                step: 1,
                default_value: def,
                flags,
                elems: 1,
                elem_size: if ty == kind::INTEGER64 { 8 } else { 4 },
            },
            value: def,
            payload: Vec::new(),
        }
    }

    fn array(id: u32, name: &str, elems: u32) -> Self {
        Self {
            raw: RawControl {
                id,
                name: name.into(),
                kind: kind::U8,
                minimum: 0,
                maximum: 255,
                step: 1,
                default_value: 0,
                flags: flags::HAS_PAYLOAD,
                elems,
                elem_size: 1,
            },
            value: 0,
            payload: vec![0; elems as usize],
        }
    }
}

#[derive(Default)]
struct SensorState {
    controls: BTreeMap<u32, SensorControl>,
    fail_id: Option<u32>,
    reject_batches: bool,
    query_failures: HashSet<u32>,
    io_count: usize,
}

/// Simulated camera sensor sub-device. Clones share the same device.
#[derive(Clone)]
pub struct VirtualSensor {
    state: Arc<Mutex<SensorState>>,
}

impl Default for VirtualSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualSensor {
    pub fn new() -> Self {
        use kind::*;

        let controls = [
            SensorControl::new(USER_CLASS, "User Controls", CTRL_CLASS, 0, 0, 0, 0),
            SensorControl::new(cid::BRIGHTNESS, "Brightness", INTEGER, 0, 255, 128, 0),
            SensorControl::new(cid::CONTRAST, "Contrast", INTEGER, 0, 255, 128, 0),
            SensorControl::new(cid::SATURATION, "Saturation", INTEGER, 0, 255, 128, 0),
            SensorControl::new(cid::EXPOSURE, "Exposure", INTEGER, 4, 2000, 1000, 0),
            SensorControl::new(cid::VBLANK, "Vertical Blanking", INTEGER, 40, 1000, 100, 0),
            SensorControl::new(
                cid::HBLANK,
                "Horizontal Blanking",
                INTEGER,
                0,
                0,
                0,
                flags::DISABLED,
            ),
            SensorControl::new(cid::ANALOGUE_GAIN, "Analogue Gain", INTEGER, 16, 256, 16, 0),
            SensorControl::new(
                cid::PIXEL_RATE,
                "Pixel Rate",
                INTEGER64,
                840_000_000,
                840_000_000,
                840_000_000,
                flags::READ_ONLY,
            ),
            SensorControl::new(cid::TEST_PATTERN, "Test Pattern", MENU, 0, 4, 0, 0),
            SensorControl::new(SENSOR_NAME, "Sensor Name", STRING, 0, 32, 0, flags::READ_ONLY),
            SensorControl::array(LENS_SHADING_TABLE, "Lens Shading Table", 16),
        ];

        let state = SensorState {
            controls: controls.into_iter().map(|c| (c.raw.id, c)).collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SensorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn model(&self) -> &'static str {
        SENSOR_MODEL
    }

    /// Number of get and set batches that reached the device.
    pub fn io_count(&self) -> usize {
        self.lock().io_count
    }

    /// Makes set batches fail at the first entry for `id`.
    pub fn fail_control(&self, id: Option<u32>) {
        self.lock().fail_id = id;
    }

    /// Makes every batch fail validation as a whole.
    pub fn reject_batches(&self, reject: bool) {
        self.lock().reject_batches = reject;
    }

    /// Makes single control queries for `id` fail.
    pub fn fail_query(&self, id: u32) {
        self.lock().query_failures.insert(id);
    }

    /// Changes the range of `id`, as a driver does when the sensor mode
    /// changes.
    pub fn set_range(&self, id: u32, min: i64, max: i64) {
        if let Some(ctrl) = self.lock().controls.get_mut(&id) {
            ctrl.raw.minimum = min;
            ctrl.raw.maximum = max;
            ctrl.value = ctrl.value.clamp(min, max);
        }
    }

    pub fn value(&self, id: u32) -> Option<i64> {
        self.lock().controls.get(&id).map(|c| c.value)
    }

    pub fn payload(&self, id: u32) -> Option<Vec<u8>> {
        self.lock().controls.get(&id).map(|c| c.payload.clone())
    }

    pub fn exposure(&self) -> i64 {
        self.value(cid::EXPOSURE).unwrap_or_default()
    }

    pub fn gain(&self) -> i64 {
        self.value(cid::ANALOGUE_GAIN).unwrap_or_default()
    }
}

impl ControlBackend for VirtualSensor {
    fn query_control(&self, id: u32) -> io::Result<RawControl> {
        let state = self.lock();
        let next = flags::NEXT_CTRL | flags::NEXT_COMPOUND;

        if id & next != 0 {
            let base = id & !next;
            return state
                .controls
                .range((Bound::Excluded(base), Bound::Unbounded))
                .next()
                .map(|(_, c)| c.raw.clone())
                .ok_or_else(einval);
        }

        if state.query_failures.contains(&id) {
            return Err(eio());
        }
        state
            .controls
            .get(&id)
            .map(|c| c.raw.clone())
            .ok_or_else(einval)
    }

    fn get_controls(&self, controls: &mut [ExtControl<'_>]) -> std::result::Result<(), BatchFailure> {
        let mut state = self.lock();
        state.io_count += 1;
        if state.reject_batches {
            return Err(BatchFailure::Rejected(einval()));
        }

        for (index, ctrl) in controls.iter_mut().enumerate() {
            let Some(current) = state.controls.get(&ctrl.id) else {
                return Err(BatchFailure::At {
                    index,
                    error: einval(),
                });
            };
            match &mut ctrl.value {
                ExtValue::Integer(v) => *v = current.value as i32,
                ExtValue::Integer64(v) => *v = current.value,
                ExtValue::Payload(data) => {
                    let len = data.len().min(current.payload.len());
                    data[..len].copy_from_slice(&current.payload[..len]);
                }
            }
        }
        Ok(())
    }

    fn set_controls(&self, controls: &mut [ExtControl<'_>]) -> std::result::Result<(), BatchFailure> {
        let mut state = self.lock();
        state.io_count += 1;
        if state.reject_batches {
            return Err(BatchFailure::Rejected(einval()));
        }

        let fail_id = state.fail_id;
        for (index, ctrl) in controls.iter_mut().enumerate() {
            if fail_id == Some(ctrl.id) {
                return Err(BatchFailure::At { index, error: eio() });
            }
            let Some(target) = state.controls.get_mut(&ctrl.id) else {
                return Err(BatchFailure::At {
                    index,
                    error: einval(),
                });
            };
            if target.raw.flags & flags::READ_ONLY != 0 {
                return Err(BatchFailure::At {
                    index,
                    error: io::Error::from_raw_os_error(libc::EACCES),
                });
            }

            let (min, max) = (target.raw.minimum, target.raw.maximum);
            match &mut ctrl.value {
                ExtValue::Integer(v) => {
                    target.value = (*v as i64).clamp(min, max);
                    *v = target.value as i32;
                }
                ExtValue::Integer64(v) => {
                    target.value = (*v).clamp(min, max);
                    *v = target.value;
                }
                ExtValue::Payload(data) => {
                    if data.len() != target.payload.len() {
                        return Err(BatchFailure::At {
                            index,
                            error: einval(),
                        });
                    }
                    target.payload.copy_from_slice(data);
                }
            }
        }
        Ok(())
    }
}

/// Region weights of the auto exposure grid, brighter towards the centre.
const REGION_WEIGHTS: [f64; AE_MEAN_MAX] = [
    0.1, 1.0, 1.0, 1.0, 0.1, //
    1.0, 0.9, 1.0, 0.9, 1.0, //
    1.0, 1.0, 1.2, 1.0, 1.0, //
    1.0, 0.9, 1.0, 0.9, 1.0, //
    0.1, 1.0, 1.0, 1.0, 0.1, //
];

/// Uniformly lit scene seen by the virtual sensor.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SceneModel {
    pub reflectance: f64,
}

impl SceneModel {
    pub fn new(reflectance: f64) -> Self {
        Self { reflectance }
    }

    /// Auto exposure grid for the given exposure (lines) and gain code,
    /// where a gain code of 16 is unity gain.
    pub fn exp_means(&self, exposure: i64, gain: i64) -> [u8; AE_MEAN_MAX] {
        let level = self.reflectance * exposure.max(0) as f64 * gain.max(0) as f64 / 16.0;
        REGION_WEIGHTS.map(|weight| (level * weight).clamp(0.0, 255.0) as u8)
    }
}

/// Order in which the virtual ISP reports the buffers of a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum CompletionOrder {
    /// Raw first, then parameters and statistics.
    #[default]
    RawFirst,
    /// Parameters and statistics first, then raw.
    StatsFirst,
    /// Raw completions are held back until [`VirtualIsp::release_raw`].
    HoldRaw,
}

/// Simulated ISP with raw, parameter and statistics queues.
pub struct VirtualIsp {
    events: EventSender,
    sensor: VirtualSensor,
    scene: SceneModel,
    order: CompletionOrder,
    memory: HashMap<BufferHandle, FrameBuffer>,
    raw: VecDeque<BufferHandle>,
    params: VecDeque<BufferHandle>,
    stats: VecDeque<BufferHandle>,
    held: VecDeque<(BufferHandle, BufferMetadata)>,
    streaming: bool,
    aec_enabled: bool,
    sequence: u32,
    raw_errors: usize,
    fail_queue: bool,
    fail_stream_on: bool,
}

impl VirtualIsp {
    pub fn new(events: EventSender, sensor: VirtualSensor, scene: SceneModel) -> Self {
        Self {
            events,
            sensor,
            scene,
            order: CompletionOrder::default(),
            memory: HashMap::new(),
            raw: VecDeque::new(),
            params: VecDeque::new(),
            stats: VecDeque::new(),
            held: VecDeque::new(),
            streaming: false,
            aec_enabled: true,
            sequence: 0,
            raw_errors: 0,
            fail_queue: false,
            fail_stream_on: false,
        }
    }

    pub fn set_completion_order(&mut self, order: CompletionOrder) {
        self.order = order;
    }

    pub fn set_scene(&mut self, scene: SceneModel) {
        self.scene = scene;
    }

    /// Reports the next `count` raw buffers with an error status.
    pub fn inject_raw_errors(&mut self, count: usize) {
        self.raw_errors = count;
    }

    pub fn fail_queue(&mut self, fail: bool) {
        self.fail_queue = fail;
    }

    pub fn fail_stream_on(&mut self, fail: bool) {
        self.fail_stream_on = fail;
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether the auto exposure measurement module is enabled by the last
    /// parameter buffer that touched it.
    pub fn aec_enabled(&self) -> bool {
        self.aec_enabled
    }

    pub fn queued(&self, queue: Queue) -> usize {
        match queue {
            Queue::Raw => self.raw.len(),
            Queue::Params => self.params.len(),
            Queue::Stats => self.stats.len(),
        }
    }

    fn post(&self, event: HardwareEvent) {
        if let Err(e) = self.events.send(Event::Hardware(event)) {
            warn!("event loop closed, dropping hardware event: {e}");
        }
    }

    fn buffer_ready(&self, buffer: BufferHandle, metadata: BufferMetadata) {
        self.post(HardwareEvent::BufferReady { buffer, metadata });
    }

    fn apply_params(&mut self, buffer: BufferHandle) -> Result<()> {
        let Some(memory) = self.memory.get(&buffer) else {
            return Ok(());
        };
        let map = memory.map()?;
        if let Some(aec) = IspParams::read_from(map.as_slice()).and_then(|p| p.aec_enabled()) {
            trace!(aec, "auto exposure measurement toggled");
            self.aec_enabled = aec;
        }
        Ok(())
    }

    fn render_stats(&self, buffer: BufferHandle) -> Result<()> {
        let Some(memory) = self.memory.get(&buffer) else {
            return Ok(());
        };
        let stats = if self.aec_enabled {
            AeStatistics::with_means(
                self.scene
                    .exp_means(self.sensor.exposure(), self.sensor.gain()),
            )
        } else {
            AeStatistics::default()
        };
        let mut map = memory.map()?;
        if !stats.write_to(map.as_slice_mut()) {
            return Err(HalError::InvalidArgument(format!(
                "statistics buffer {buffer} is too small"
            )));
        }
        Ok(())
    }

    /// Captures one frame if a raw, a parameter and a statistics buffer are
    /// queued. Returns false if nothing was captured.
    pub fn capture(&mut self) -> Result<bool> {
        if !self.streaming || self.raw.is_empty() || self.params.is_empty() || self.stats.is_empty()
        {
            return Ok(false);
        }
        let (Some(raw), Some(params), Some(stats)) = (
            self.raw.pop_front(),
            self.params.pop_front(),
            self.stats.pop_front(),
        ) else {
            return Ok(false);
        };

        self.sequence = self.sequence.wrapping_add(1);
        self.post(HardwareEvent::FrameStart {
            sequence: self.sequence,
        });

        self.apply_params(params)?;
        self.render_stats(stats)?;

        let metadata = BufferMetadata {
            status: BufferStatus::Success,
            sequence: self.sequence,
            timestamp: self.sequence as u64 * FRAME_INTERVAL_NS,
        };
        let raw_metadata = if self.raw_errors > 0 {
            self.raw_errors -= 1;
            BufferMetadata {
                status: BufferStatus::Error,
                ..metadata
            }
        } else {
            metadata
        };

        match self.order {
            CompletionOrder::RawFirst => {
                self.buffer_ready(raw, raw_metadata);
                self.buffer_ready(params, metadata);
                self.buffer_ready(stats, metadata);
            }
            CompletionOrder::StatsFirst => {
                self.buffer_ready(params, metadata);
                self.buffer_ready(stats, metadata);
                self.buffer_ready(raw, raw_metadata);
            }
            CompletionOrder::HoldRaw => {
                self.buffer_ready(params, metadata);
                self.buffer_ready(stats, metadata);
                self.held.push_back((raw, raw_metadata));
            }
        }

        trace!(sequence = self.sequence, %raw, "captured frame");
        Ok(true)
    }

    /// Captures frames until a queue runs dry.
    pub fn capture_all(&mut self) -> Result<usize> {
        let mut count = 0;
        while self.capture()? {
            count += 1;
        }
        Ok(count)
    }

    /// Reports every raw buffer held back by [`CompletionOrder::HoldRaw`].
    pub fn release_raw(&mut self) -> usize {
        let held: Vec<_> = self.held.drain(..).collect();
        for (buffer, metadata) in &held {
            self.buffer_ready(*buffer, *metadata);
        }
        held.len()
    }
}

impl IspHardware for VirtualIsp {
    fn allocate_buffers(&mut self, queue: Queue, count: usize) -> Result<Vec<FrameBuffer>> {
        let size = match queue {
            Queue::Raw => RAW_SIZE,
            Queue::Params => PARAMS_SIZE,
            Queue::Stats => STATS_SIZE,
        };

        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            let handle = BufferHandle::new(queue, index as u32);
            let buffer = FrameBuffer::allocate(handle, size)?;
            let planes = buffer
                .planes()
                .iter()
                .map(|plane| plane.try_clone())
                .collect::<io::Result<Vec<_>>>()?;
            self.memory
                .insert(handle, FrameBuffer::from_planes(handle, planes));
            buffers.push(buffer);
        }

        debug!(queue = queue.name(), count, "allocated buffers");
        Ok(buffers)
    }

    fn release_buffers(&mut self, queue: Queue) {
        self.memory.retain(|handle, _| handle.queue() != queue);
    }

    fn queue_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        if self.fail_queue {
            return Err(HalError::Io(eio()));
        }
        match buffer.queue() {
            Queue::Raw => self.raw.push_back(buffer),
            Queue::Params => self.params.push_back(buffer),
            Queue::Stats => self.stats.push_back(buffer),
        }
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.fail_stream_on {
            return Err(HalError::Io(eio()));
        }
        self.streaming = true;
        self.aec_enabled = true;
        debug!("stream on");
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;

        let cancelled = BufferMetadata {
            status: BufferStatus::Cancelled,
            sequence: self.sequence,
            timestamp: 0,
        };
        let held: Vec<_> = self.held.drain(..).map(|(buffer, _)| buffer).collect();
        let queued: Vec<_> = self
            .raw
            .drain(..)
            .chain(self.params.drain(..))
            .chain(self.stats.drain(..))
            .collect();
        for buffer in held.into_iter().chain(queued) {
            self.buffer_ready(buffer, cancelled);
        }

        debug!("stream off");
        Ok(())
    }
}
