// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Completion coordinator for a raw sensor + ISP camera.
//!
//! A frame is finished by three independent sub-events which may arrive in
//! any order: the raw buffer completes, the parameter buffer is dequeued, and
//! the algorithms report metadata for the statistics. Each handler records
//! its sub-event and then checks whether the frame is complete. Removing the
//! frame from the tracker is the point at which completion is decided, so a
//! request can only ever be completed once.
//!
//! All handlers run on the thread that drives the pipeline's [`EventLoop`].

use crate::{
    buffer::{BufferHandle, BufferMetadata, BufferStatus, FrameBuffer, Plane, Queue},
    config::PipelineConfig,
    controls::{cid, ids, ControlList, ControlValue},
    device::{ControlBackend, V4l2Device},
    error::{HalError, Result},
    event_loop::{Event, EventLoop, HardwareEvent},
    frames::{FrameId, FrameInfo, FrameTracker, RequestRejected},
    ipa::{
        proxy::IpaProxy, ActionSender, IpaAction, IpaBuffer, IpaEvent, IpaInterface, IpaStream,
        SensorInfo, SENSOR_ENTITY,
    },
    request::{Request, StreamId},
    sensor::cam_helper_for,
};
use kanal::Sender;
use std::{
    collections::BTreeMap,
    io,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

/// Maps the normalised brightness, contrast and saturation controls of a
/// request to the sensor's 0..255 register scale.
fn sensor_colour_controls(request: &ControlList) -> ControlList {
    request
        .iter()
        .filter_map(|(id, value)| {
            let (control, offset) = match id {
                ids::BRIGHTNESS => (cid::BRIGHTNESS, 128.0),
                ids::CONTRAST => (cid::CONTRAST, 0.0),
                ids::SATURATION => (cid::SATURATION, 0.0),
                _ => return None,
            };
            let value = (value.as_f32()? * 128.0 + offset).round() as i32;
            Some((control, ControlValue::from(value.clamp(0, 255))))
        })
        .collect()
}

/// Hardware queues of the ISP.
pub trait IspHardware {
    /// Allocates `count` buffers on `queue`.
    fn allocate_buffers(&mut self, queue: Queue, count: usize) -> Result<Vec<FrameBuffer>>;

    fn release_buffers(&mut self, queue: Queue);

    /// Hands `buffer` to the hardware. Its completion is reported later as a
    /// [`HardwareEvent::BufferReady`].
    fn queue_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    fn stream_on(&mut self) -> Result<()>;

    /// Stops streaming. Every queued buffer is returned with
    /// [`BufferStatus::Cancelled`].
    fn stream_off(&mut self) -> Result<()>;
}

/// Receives completions from the pipeline.
///
/// `buffer_completed` is called once for every buffer of a request, always
/// before the single `request_completed` call for that request.
pub trait CompletionSink {
    fn buffer_completed(&mut self, request: &Request, buffer: BufferHandle);

    fn request_completed(&mut self, request: Request);
}

#[derive(Debug)]
pub enum CompletionEvent {
    BufferCompleted { cookie: u64, buffer: BufferHandle },
    RequestCompleted(Request),
}

impl CompletionSink for Vec<CompletionEvent> {
    fn buffer_completed(&mut self, request: &Request, buffer: BufferHandle) {
        self.push(CompletionEvent::BufferCompleted {
            cookie: request.cookie(),
            buffer,
        });
    }

    fn request_completed(&mut self, request: Request) {
        self.push(CompletionEvent::RequestCompleted(request));
    }
}

impl CompletionSink for Sender<CompletionEvent> {
    fn buffer_completed(&mut self, request: &Request, buffer: BufferHandle) {
        let event = CompletionEvent::BufferCompleted {
            cookie: request.cookie(),
            buffer,
        };
        if let Err(e) = self.send(event) {
            warn!(%buffer, "buffer completion dropped: {e}");
        }
    }

    fn request_completed(&mut self, request: Request) {
        let cookie = request.cookie();
        if let Err(e) = self.send(CompletionEvent::RequestCompleted(request)) {
            warn!(cookie, "request completion dropped: {e}");
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamConfiguration {
    pub stream: StreamId,
    pub width: u32,
    pub height: u32,
    /// Depth of the parameter and statistics pools.
    pub buffer_count: usize,
}

/// Capabilities every camera pipeline implementation provides.
pub trait PipelineHandler {
    fn configure(&mut self, config: &StreamConfiguration) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Stops streaming and completes every in-flight request with an error.
    fn stop(&mut self);

    fn queue_request(&mut self, request: Request) -> std::result::Result<FrameId, RequestRejected>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Stopped,
    Configured,
    Running,
    Stopping,
    /// The instance hit an unrecoverable error and must be torn down.
    Failed,
}

pub struct IspPipeline<H: IspHardware, B: ControlBackend, S: CompletionSink> {
    events: EventLoop,
    sensor: V4l2Device<B>,
    sensor_model: String,
    hardware: H,
    sink: S,
    ipa: Box<dyn IpaInterface>,
    frames: FrameTracker,
    params: Vec<FrameBuffer>,
    stats: Vec<FrameBuffer>,
    state: State,
    sequence: u32,
}

impl<H: IspHardware, B: ControlBackend, S: CompletionSink> IspPipeline<H, B, S> {
    /// Builds a pipeline around `sensor` and `hardware`. The algorithms
    /// returned by `make_ipa` are moved to their own thread and initialized
    /// for the configured hardware revision.
    ///
    /// `hardware` must post its completions to `events`.
    pub fn new<I, F>(
        events: EventLoop,
        sensor: V4l2Device<B>,
        hardware: H,
        sink: S,
        config: &PipelineConfig,
        make_ipa: F,
    ) -> Result<Self>
    where
        I: IpaInterface + 'static,
        F: FnOnce(ActionSender) -> I,
    {
        let mut ipa = IpaProxy::spawn(make_ipa(ActionSender::new(events.sender())))?;
        ipa.init(config.hw_revision)?;

        Ok(Self {
            events,
            sensor,
            sensor_model: config.sensor_model.clone(),
            hardware,
            sink,
            ipa: Box::new(ipa),
            frames: FrameTracker::new(),
            params: Vec::new(),
            stats: Vec::new(),
            state: State::Stopped,
            sequence: 0,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn sensor(&self) -> &V4l2Device<B> {
        &self.sensor
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    pub fn frames(&self) -> &FrameTracker {
        &self.frames
    }

    /// Sequence number of the most recent frame start.
    pub fn latest_sequence(&self) -> u32 {
        self.sequence
    }

    pub fn has_pending_requests(&self) -> bool {
        self.frames.in_flight() > 0
    }

    /// Handles every event already queued, without waiting.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.events.try_next() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Handles events until `done` returns true or `timeout` expires.
    /// Returns the final value of `done`.
    pub fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if let Some(event) = self.events.next_timeout(remaining) {
                self.handle_event(event);
            }
        }
        true
    }

    fn fail(&mut self, reason: &str) {
        error!("pipeline failed: {reason}");
        self.state = State::Failed;
    }

    fn ipa_buffers(buffers: &[FrameBuffer]) -> io::Result<Vec<IpaBuffer>> {
        buffers
            .iter()
            .map(|buffer| {
                Ok(IpaBuffer {
                    id: buffer.handle().cookie(),
                    planes: buffer
                        .planes()
                        .iter()
                        .map(Plane::try_clone)
                        .collect::<io::Result<_>>()?,
                })
            })
            .collect()
    }

    fn release_buffers(&mut self) {
        if self.params.is_empty() && self.stats.is_empty() {
            return;
        }
        let ids: Vec<u32> = self
            .params
            .iter()
            .chain(&self.stats)
            .map(|buffer| buffer.handle().cookie())
            .collect();
        self.ipa.unmap_buffers(&ids);
        self.hardware.release_buffers(Queue::Params);
        self.hardware.release_buffers(Queue::Stats);
        self.params.clear();
        self.stats.clear();
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Hardware(HardwareEvent::BufferReady { buffer, metadata }) => {
                match buffer.queue() {
                    Queue::Raw => self.raw_buffer_ready(buffer, metadata),
                    Queue::Params => self.param_buffer_ready(buffer),
                    Queue::Stats => self.stat_buffer_ready(buffer, metadata),
                }
            }
            Event::Hardware(HardwareEvent::FrameStart { sequence }) => {
                trace!(sequence, "frame start");
                self.sequence = sequence;
            }
            Event::Ipa(IpaAction::ParamsFilled { frame }) => self.queue_frame_buffers(frame),
            Event::Ipa(IpaAction::SetSensorControls {
                frame,
                mut controls,
            }) => self.set_sensor_controls(frame, &mut controls),
            Event::Ipa(IpaAction::MetadataReady { frame, metadata }) => {
                self.metadata_ready(frame, &metadata)
            }
            Event::Ipa(IpaAction::Fatal { reason }) => self.fail(&reason),
        }
    }

    fn raw_buffer_ready(&mut self, buffer: BufferHandle, metadata: BufferMetadata) {
        let Some(info) = self.frames.find_by_buffer_mut(buffer) else {
            warn!(%buffer, "completion for a buffer without a frame");
            return;
        };

        let request = &mut info.request;
        request
            .metadata_mut()
            .set(ids::SENSOR_TIMESTAMP, metadata.timestamp as i64);
        request
            .metadata_mut()
            .set(ids::SENSOR_SEQUENCE, metadata.sequence as i64);
        if metadata.status != BufferStatus::Success {
            debug!(frame = info.id, status = ?metadata.status, "raw buffer failed");
            request.set_error();
        }

        if let Err(e) = request.complete_buffer(buffer) {
            error!(frame = info.id, "{e}");
            return;
        }
        self.sink.buffer_completed(&info.request, buffer);

        let id = info.id;
        self.try_finalize(id);
    }

    fn param_buffer_ready(&mut self, buffer: BufferHandle) {
        let Some(info) = self.frames.find_by_buffer_mut(buffer) else {
            warn!(%buffer, "completion for a buffer without a frame");
            return;
        };
        info.param_dequeued = true;

        let id = info.id;
        self.try_finalize(id);
    }

    fn stat_buffer_ready(&mut self, buffer: BufferHandle, metadata: BufferMetadata) {
        let Some(info) = self.frames.find_by_buffer_mut(buffer) else {
            warn!(%buffer, "completion for a buffer without a frame");
            return;
        };

        let id = info.id;
        if metadata.status != BufferStatus::Success || info.request.has_error() {
            info.metadata_processed = true;
            self.try_finalize(id);
            return;
        }

        self.ipa.process_event(IpaEvent::StatBufferReady {
            frame: id,
            buffer_id: buffer.cookie(),
        });
    }

    fn queue_frame_buffers(&mut self, frame: FrameId) {
        if self.state != State::Running {
            debug!(frame, "not queueing buffers, pipeline is not running");
            return;
        }
        let Some(info) = self.frames.find(frame) else {
            warn!(frame, "parameters filled for an unknown frame");
            return;
        };

        let buffers: Vec<BufferHandle> = [Some(info.param_buffer), Some(info.stat_buffer)]
            .into_iter()
            .chain([info.raw_buffer])
            .flatten()
            .collect();

        for buffer in buffers {
            if let Err(e) = self.hardware.queue_buffer(buffer) {
                return self.fail(&format!("failed to queue {buffer}: {e}"));
            }
        }
        trace!(frame, "frame buffers queued");
    }

    fn set_sensor_controls(&mut self, frame: FrameId, controls: &mut ControlList) {
        match self.sensor.write_controls(controls) {
            Ok(()) => trace!(frame, %controls, "sensor controls applied"),
            Err(e) => warn!(frame, "failed to apply sensor controls: {e}"),
        }
    }

    fn metadata_ready(&mut self, frame: FrameId, metadata: &ControlList) {
        let Some(info) = self.frames.find_mut(frame) else {
            debug!(frame, "metadata for a frame no longer in flight");
            return;
        };
        info.request.metadata_mut().merge(metadata);
        info.metadata_processed = true;
        self.try_finalize(frame);
    }

    fn try_finalize(&mut self, id: FrameId) {
        let complete = self
            .frames
            .find(id)
            .is_some_and(|info| self.frames.try_complete(info));
        if !complete {
            return;
        }

        match self.frames.remove_frame(id) {
            Ok(info) => self.finalize(info),
            Err(e) => error!(frame = id, "{e}"),
        }
    }

    fn finalize(&mut self, mut info: FrameInfo) {
        if let Err(e) = info.request.complete() {
            error!(frame = info.id, "{e}");
            return;
        }
        trace!(
            frame = info.id,
            cookie = info.request.cookie(),
            error = info.request.has_error(),
            "request complete"
        );
        self.sink.request_completed(info.request);
    }

    /// Completes frame `id` immediately, flagging its request as failed.
    fn cancel_frame(&mut self, id: FrameId) {
        let mut info = match self.frames.remove_frame(id) {
            Ok(info) => info,
            Err(e) => {
                error!(frame = id, "{e}");
                return;
            }
        };

        info.request.set_error();
        for buffer in info.request.pending_buffers() {
            if let Err(e) = info.request.complete_buffer(buffer) {
                error!(frame = id, "{e}");
                continue;
            }
            self.sink.buffer_completed(&info.request, buffer);
        }
        debug!(frame = id, "frame cancelled");
        self.finalize(info);
    }
}

impl<H: IspHardware, B: ControlBackend, S: CompletionSink> PipelineHandler for IspPipeline<H, B, S> {
    /// Refreshes the sensor control ranges, allocates the parameter and
    /// statistics pools, shares them with the algorithms and configures the
    /// algorithms for the stream.
    ///
    /// # Errors
    ///
    /// [`HalError::Configuration`] while streaming, [`HalError::InvalidArgument`]
    /// for an empty pool and any error from the hardware or the algorithms.
    /// A failure to share buffers with the algorithms is fatal.
    fn configure(&mut self, config: &StreamConfiguration) -> Result<()> {
        if !matches!(self.state, State::Stopped | State::Configured) {
            return Err(HalError::Configuration(format!(
                "cannot configure in state {:?}",
                self.state
            )));
        }
        if config.buffer_count == 0 {
            return Err(HalError::InvalidArgument("buffer count must be at least 1".into()));
        }

        self.sensor.refresh_control_info();
        self.release_buffers();

        self.params = self
            .hardware
            .allocate_buffers(Queue::Params, config.buffer_count)?;
        self.stats = self
            .hardware
            .allocate_buffers(Queue::Stats, config.buffer_count)?;

        let mut buffers = Self::ipa_buffers(&self.params)?;
        buffers.extend(Self::ipa_buffers(&self.stats)?);
        if let Err(e) = self.ipa.map_buffers(buffers) {
            self.fail(&e.to_string());
            return Err(e);
        }

        let delays = cam_helper_for(&self.sensor_model)
            .map(|helper| helper.delays())
            .unwrap_or_default();
        let sensor = SensorInfo {
            model: self.sensor_model.clone(),
            width: config.width,
            height: config.height,
            delays,
        };
        let streams = BTreeMap::from([(
            config.stream,
            IpaStream {
                id: config.stream,
                width: config.width,
                height: config.height,
            },
        )]);
        let entity_controls = BTreeMap::from([(SENSOR_ENTITY, self.sensor.controls().clone())]);

        self.ipa.configure(&sensor, &streams, &entity_controls)?;

        self.state = State::Configured;
        info!(
            sensor = %self.sensor_model,
            width = config.width,
            height = config.height,
            buffers = config.buffer_count,
            "pipeline configured"
        );
        Ok(())
    }

    /// Seeds the frame tracker and starts the algorithms and the hardware,
    /// undoing the earlier steps if a later one fails.
    fn start(&mut self) -> Result<()> {
        if self.state != State::Configured {
            return Err(HalError::Configuration(format!(
                "cannot start in state {:?}",
                self.state
            )));
        }

        self.frames.initialize(
            self.params.iter().map(FrameBuffer::handle),
            self.stats.iter().map(FrameBuffer::handle),
        )?;

        if let Err(e) = self.ipa.start() {
            let _ = self.frames.clear();
            return Err(e);
        }

        if let Err(e) = self.hardware.stream_on() {
            self.ipa.stop();
            self.dispatch_pending();
            let _ = self.frames.clear();
            return Err(e);
        }

        self.state = State::Running;
        info!("pipeline started");
        Ok(())
    }

    fn stop(&mut self) {
        let failed = match self.state {
            State::Running => false,
            State::Failed => true,
            _ => return,
        };
        self.state = State::Stopping;

        if let Err(e) = self.hardware.stream_off() {
            warn!("stream off: {e}");
        }
        self.dispatch_pending();

        // Actions for events queued before the stop are posted before it
        // returns.
        self.ipa.stop();
        self.dispatch_pending();

        for id in self.frames.ids() {
            self.cancel_frame(id);
        }
        if let Err(e) = self.frames.clear() {
            error!("{e}");
        }

        self.state = if failed {
            State::Failed
        } else {
            State::Configured
        };
        info!("pipeline stopped");
    }

    fn queue_request(&mut self, request: Request) -> std::result::Result<FrameId, RequestRejected> {
        let error = match self.state {
            State::Running if request.buffer(StreamId::RAW).is_none() => Some(
                HalError::InvalidArgument(format!("request {} has no raw buffer", request.cookie())),
            ),
            State::Running
                if request
                    .buffers()
                    .any(|(stream, buffer)| stream != StreamId::RAW || buffer.queue() != Queue::Raw) =>
            {
                Some(HalError::InvalidArgument(format!(
                    "request {} carries a buffer for an unsupported stream",
                    request.cookie()
                )))
            }
            State::Running => None,
            State::Failed => Some(HalError::HardwareFatal("pipeline has failed".into())),
            state => Some(HalError::Configuration(format!(
                "cannot queue requests in state {state:?}"
            ))),
        };
        if let Some(error) = error {
            return Err(RequestRejected { request, error });
        }

        let mut controls = sensor_colour_controls(request.controls());
        if !controls.is_empty() {
            if let Err(error) = self.sensor.write_controls(&mut controls) {
                warn!(cookie = request.cookie(), "failed to apply request controls: {error}");
                return Err(RequestRejected { request, error });
            }
            debug!(cookie = request.cookie(), %controls, "request controls applied");
        }

        let id = match self.frames.create_frame(request) {
            Ok(id) => id,
            Err(rejected) => {
                warn!("request rejected: {}", rejected.error);
                return Err(rejected);
            }
        };

        if let Some(info) = self.frames.find(id) {
            self.ipa.process_event(IpaEvent::QueueRequest {
                frame: id,
                buffer_id: info.param_buffer.cookie(),
                controls: info.request.controls().clone(),
            });
        }
        trace!(frame = id, "request queued");
        Ok(id)
    }
}

impl<H: IspHardware, B: ControlBackend, S: CompletionSink> Drop for IspPipeline<H, B, S> {
    fn drop(&mut self) {
        if matches!(self.state, State::Running | State::Failed) {
            self.stop();
        }
        self.release_buffers();
    }
}
