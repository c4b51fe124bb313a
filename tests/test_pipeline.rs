// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_isp::{
    buffer::{BufferHandle, Queue},
    config::{CameraHalConfig, Facing, PipelineConfig},
    controls::{cid, ids, ControlValue},
    device::V4l2Device,
    error::HalError,
    event_loop::EventLoop,
    ipa::auto_exposure::AutoExposureIpa,
    pipeline::{CompletionEvent, IspPipeline, PipelineHandler, State},
    request::{Request, StreamId},
    virtual_camera::{CompletionOrder, SceneModel, VirtualIsp, VirtualSensor},
};
use serial_test::serial;
use std::{collections::HashMap, error::Error, fs, time::Duration};

const TIMEOUT: Duration = Duration::from_secs(2);

type Pipeline = IspPipeline<VirtualIsp, VirtualSensor, Vec<CompletionEvent>>;

fn build(config: &PipelineConfig, reflectance: f64) -> Result<(Pipeline, VirtualSensor), HalError> {
    let events = EventLoop::new();
    let sensor = VirtualSensor::new();
    let isp = VirtualIsp::new(
        events.sender(),
        sensor.clone(),
        SceneModel::new(reflectance),
    );
    let mut pipeline = IspPipeline::new(
        events,
        V4l2Device::open(sensor.clone())?,
        isp,
        Vec::new(),
        config,
        AutoExposureIpa::new,
    )?;
    pipeline.configure(&config.stream_configuration())?;
    Ok((pipeline, sensor))
}

fn running(config: &PipelineConfig) -> Result<(Pipeline, VirtualSensor), HalError> {
    let (mut pipeline, sensor) = build(config, 0.25)?;
    pipeline.start()?;
    Ok((pipeline, sensor))
}

fn request(cookie: u64) -> Result<Request, HalError> {
    let mut request = Request::new(cookie);
    request.add_buffer(
        StreamId::RAW,
        BufferHandle::new(Queue::Raw, (cookie % 8) as u32),
    )?;
    Ok(request)
}

/// Queues `request` and runs it through the hardware to completion.
fn capture(pipeline: &mut Pipeline, request: Request) -> Result<(), Box<dyn Error>> {
    pipeline.queue_request(request)?;
    assert!(pipeline.run_until(|p| p.hardware().queued(Queue::Raw) > 0, TIMEOUT));
    pipeline.hardware_mut().capture_all()?;
    assert!(pipeline.run_until(|p| !p.has_pending_requests(), TIMEOUT));
    Ok(())
}

fn completed(pipeline: &mut Pipeline) -> Vec<Request> {
    pipeline
        .sink_mut()
        .drain(..)
        .filter_map(|event| match event {
            CompletionEvent::RequestCompleted(request) => Some(request),
            CompletionEvent::BufferCompleted { .. } => None,
        })
        .collect()
}

/// Checks that every request completed exactly once, after all of its
/// buffers, and returns the number of requests.
fn assert_completed_once(events: &[CompletionEvent]) -> usize {
    let mut buffers: HashMap<u64, usize> = HashMap::new();
    let mut requests: HashMap<u64, usize> = HashMap::new();
    for event in events {
        match event {
            CompletionEvent::BufferCompleted { cookie, .. } => {
                assert!(!requests.contains_key(cookie), "buffer after request {cookie}");
                *buffers.entry(*cookie).or_default() += 1;
            }
            CompletionEvent::RequestCompleted(request) => {
                let count = requests.entry(request.cookie()).or_default();
                *count += 1;
                assert_eq!(*count, 1, "request {} completed twice", request.cookie());
                assert_eq!(buffers.get(&request.cookie()), Some(&1));
                assert!(!request.has_pending_buffers());
            }
        }
    }
    requests.len()
}

#[test]
#[serial]
fn test_request_lifecycle() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig::default();
    let (mut pipeline, _sensor) = build(&config, 0.25)?;
    assert_eq!(pipeline.state(), State::Configured);

    let rejected = pipeline
        .queue_request(request(0)?)
        .expect_err("pipeline is not running");
    assert!(matches!(rejected.error, HalError::Configuration(_)));
    assert_eq!(rejected.request.cookie(), 0);

    pipeline.start()?;
    assert_eq!(pipeline.state(), State::Running);
    assert!(pipeline.hardware().is_streaming());

    let rejected = pipeline
        .queue_request(Request::new(1))
        .expect_err("no raw buffer");
    assert!(matches!(rejected.error, HalError::InvalidArgument(_)));

    let mut other = Request::new(2);
    other.add_buffer(StreamId(1), BufferHandle::new(Queue::Raw, 0))?;
    other.add_buffer(StreamId::RAW, BufferHandle::new(Queue::Raw, 1))?;
    let rejected = pipeline
        .queue_request(other)
        .expect_err("unsupported stream");
    assert!(matches!(rejected.error, HalError::InvalidArgument(_)));

    capture(&mut pipeline, request(3)?)?;
    let done = completed(&mut pipeline);
    assert_eq!(done.len(), 1);
    let metadata = done[0].metadata();
    assert!(!done[0].has_error());
    assert_eq!(metadata.get(ids::SENSOR_SEQUENCE), Some(&ControlValue::Integer64(1)));
    assert!(metadata.get(ids::SENSOR_TIMESTAMP).is_some());
    assert!(metadata.get(ids::EXPOSURE_TIME).is_some());
    assert!(metadata.get(ids::AE_LOCKED).is_some());
    assert_eq!(pipeline.latest_sequence(), 1);

    pipeline.stop();
    assert_eq!(pipeline.state(), State::Configured);
    assert!(!pipeline.hardware().is_streaming());

    // A stopped pipeline can be reconfigured and restarted.
    pipeline.configure(&config.stream_configuration())?;
    pipeline.start()?;
    capture(&mut pipeline, request(4)?)?;
    assert_eq!(completed(&mut pipeline).len(), 1);

    Ok(())
}

#[test]
#[serial]
fn test_completion_order_raw_last() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, _sensor) = running(&PipelineConfig::default())?;
    pipeline
        .hardware_mut()
        .set_completion_order(CompletionOrder::HoldRaw);

    let id = pipeline.queue_request(request(0)?)?;
    assert!(pipeline.run_until(|p| p.hardware().queued(Queue::Raw) > 0, TIMEOUT));
    pipeline.hardware_mut().capture_all()?;

    // Parameters and metadata arrive while the raw buffer is outstanding.
    assert!(pipeline.run_until(
        |p| p
            .frames()
            .find(id)
            .is_some_and(|info| info.param_dequeued && info.metadata_processed),
        TIMEOUT
    ));
    assert!(pipeline.sink().is_empty());
    assert!(pipeline.has_pending_requests());

    assert_eq!(pipeline.hardware_mut().release_raw(), 1);
    assert!(pipeline.run_until(|p| !p.has_pending_requests(), TIMEOUT));

    let events = std::mem::take(pipeline.sink_mut());
    assert_eq!(assert_completed_once(&events), 1);
    let Some(CompletionEvent::RequestCompleted(request)) = events.last() else {
        return Err("request did not complete last".into());
    };
    assert!(!request.has_error());
    assert!(request.metadata().get(ids::EXPOSURE_TIME).is_some());
    assert!(request.metadata().get(ids::SENSOR_SEQUENCE).is_some());

    Ok(())
}

#[test]
#[serial]
fn test_completion_order_raw_first() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, _sensor) = running(&PipelineConfig::default())?;

    let id = pipeline.queue_request(request(0)?)?;
    assert!(pipeline.run_until(|p| p.hardware().queued(Queue::Raw) > 0, TIMEOUT));
    pipeline.hardware_mut().capture_all()?;

    // The raw buffer completes before the metadata is in.
    assert!(pipeline.run_until(
        |p| p
            .frames()
            .find(id)
            .map_or(true, |info| !info.request.has_pending_buffers()),
        TIMEOUT
    ));
    assert!(pipeline.run_until(|p| !p.has_pending_requests(), TIMEOUT));

    let events = std::mem::take(pipeline.sink_mut());
    assert_eq!(assert_completed_once(&events), 1);
    assert!(matches!(
        events.as_slice(),
        [
            CompletionEvent::BufferCompleted { cookie: 0, .. },
            CompletionEvent::RequestCompleted(_)
        ]
    ));
    Ok(())
}

#[test]
#[serial]
fn test_concurrent_requests_complete_once() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig::default();
    for order in [
        CompletionOrder::RawFirst,
        CompletionOrder::StatsFirst,
        CompletionOrder::HoldRaw,
    ] {
        let (mut pipeline, _sensor) = running(&config)?;
        pipeline.hardware_mut().set_completion_order(order);

        for cookie in 0..config.buffer_count as u64 {
            pipeline.queue_request(request(cookie)?)?;
        }
        let expected = config.buffer_count;
        assert!(pipeline.run_until(|p| p.hardware().queued(Queue::Raw) == expected, TIMEOUT));
        assert_eq!(pipeline.hardware_mut().capture_all()?, expected);
        pipeline.hardware_mut().release_raw();
        assert!(pipeline.run_until(|p| !p.has_pending_requests(), TIMEOUT));
        // Late raw buffers of the held order.
        pipeline.hardware_mut().release_raw();
        pipeline.dispatch_pending();

        let events = std::mem::take(pipeline.sink_mut());
        assert_eq!(assert_completed_once(&events), expected, "{order:?}");
        assert_eq!(pipeline.frames().available_params(), expected);
        assert_eq!(pipeline.frames().available_stats(), expected);
    }
    Ok(())
}

#[test]
#[serial]
fn test_pool_exhaustion() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig {
        buffer_count: 2,
        ..Default::default()
    };
    let (mut pipeline, _sensor) = running(&config)?;

    pipeline.queue_request(request(0)?)?;
    pipeline.queue_request(request(1)?)?;
    let rejected = pipeline
        .queue_request(request(2)?)
        .expect_err("pools are empty");
    assert!(matches!(rejected.error, HalError::ResourceExhausted(_)));
    assert!(!rejected.error.is_fatal());

    assert!(pipeline.run_until(|p| p.hardware().queued(Queue::Raw) == 2, TIMEOUT));
    pipeline.hardware_mut().capture()?;
    assert!(pipeline.run_until(|p| p.frames().in_flight() == 1, TIMEOUT));

    pipeline.queue_request(rejected.request)?;
    assert!(pipeline.run_until(|p| p.hardware().queued(Queue::Raw) == 2, TIMEOUT));
    pipeline.hardware_mut().capture_all()?;
    assert!(pipeline.run_until(|p| !p.has_pending_requests(), TIMEOUT));
    assert_eq!(completed(&mut pipeline).len(), 3);

    Ok(())
}

#[test]
#[serial]
fn test_raw_error_fails_request() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, _sensor) = running(&PipelineConfig::default())?;

    pipeline.hardware_mut().inject_raw_errors(1);
    capture(&mut pipeline, request(0)?)?;
    capture(&mut pipeline, request(1)?)?;

    let done = completed(&mut pipeline);
    assert_eq!(done.len(), 2);

    assert!(done[0].has_error());
    assert!(done[0].metadata().get(ids::SENSOR_SEQUENCE).is_some());
    assert!(done[0].metadata().get(ids::EXPOSURE_TIME).is_none());

    assert!(!done[1].has_error());
    assert!(done[1].metadata().get(ids::EXPOSURE_TIME).is_some());
    Ok(())
}

#[test]
#[serial]
fn test_stop_completes_in_flight_requests() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, _sensor) = running(&PipelineConfig::default())?;
    pipeline
        .hardware_mut()
        .set_completion_order(CompletionOrder::HoldRaw);

    // One frame captured with its raw buffer held, two never captured.
    for cookie in 0..3 {
        pipeline.queue_request(request(cookie)?)?;
    }
    assert!(pipeline.run_until(|p| p.hardware().queued(Queue::Raw) == 3, TIMEOUT));
    assert!(pipeline.hardware_mut().capture()?);
    pipeline.dispatch_pending();

    pipeline.stop();
    assert_eq!(pipeline.state(), State::Configured);
    assert!(!pipeline.has_pending_requests());

    let events = std::mem::take(pipeline.sink_mut());
    assert_eq!(assert_completed_once(&events), 3);
    for event in &events {
        if let CompletionEvent::RequestCompleted(request) = event {
            assert!(request.has_error(), "request {} succeeded", request.cookie());
        }
    }

    // A stop without any request in flight is a no-op.
    pipeline.stop();
    assert!(pipeline.sink().is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_queue_failure_fails_pipeline() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, _sensor) = running(&PipelineConfig::default())?;
    pipeline.hardware_mut().fail_queue(true);

    pipeline.queue_request(request(0)?)?;
    assert!(pipeline.run_until(|p| p.state() == State::Failed, TIMEOUT));

    let rejected = pipeline
        .queue_request(request(1)?)
        .expect_err("pipeline has failed");
    assert!(matches!(rejected.error, HalError::HardwareFatal(_)));

    pipeline.stop();
    assert_eq!(pipeline.state(), State::Failed);
    let done = completed(&mut pipeline);
    assert_eq!(done.len(), 1);
    assert!(done[0].has_error());
    Ok(())
}

#[test]
#[serial]
fn test_start_failure_rolls_back() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, _sensor) = build(&PipelineConfig::default(), 0.25)?;
    pipeline.hardware_mut().fail_stream_on(true);

    assert!(pipeline.start().is_err());
    assert_eq!(pipeline.state(), State::Configured);
    assert!(!pipeline.frames().is_initialized());

    pipeline.hardware_mut().fail_stream_on(false);
    pipeline.start()?;
    capture(&mut pipeline, request(0)?)?;
    assert_eq!(completed(&mut pipeline).len(), 1);
    Ok(())
}

#[test]
#[serial]
fn test_unsupported_revision() {
    let config = PipelineConfig {
        hw_revision: 12,
        ..Default::default()
    };
    assert!(matches!(
        build(&config, 0.25),
        Err(HalError::Configuration(_))
    ));
}

#[test]
#[serial]
fn test_auto_exposure_converges() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, sensor) = running(&PipelineConfig::default())?;
    assert_eq!(sensor.exposure(), 1000);

    let mut locked = None;
    for cookie in 0..30 {
        capture(&mut pipeline, request(cookie)?)?;
        for request in completed(&mut pipeline) {
            assert!(!request.has_error());
            locked = request
                .metadata()
                .get(ids::AE_LOCKED)
                .and_then(ControlValue::as_bool);
        }
    }

    assert_eq!(locked, Some(true));
    assert!((200..300).contains(&sensor.exposure()), "exposure {}", sensor.exposure());
    assert_eq!(sensor.gain(), 16);
    Ok(())
}

#[test]
#[serial]
fn test_auto_exposure_disable() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, sensor) = running(&PipelineConfig::default())?;

    let mut first = request(0)?;
    first.controls_mut().set(ids::AE_ENABLE, false);
    capture(&mut pipeline, first)?;
    assert!(!pipeline.hardware().aec_enabled());

    for cookie in 1..10 {
        capture(&mut pipeline, request(cookie)?)?;
    }
    // Only the initial settings were applied.
    assert_eq!(sensor.exposure(), 4);

    let mut enable = request(10)?;
    enable.controls_mut().set(ids::AE_ENABLE, true);
    capture(&mut pipeline, enable)?;
    assert!(pipeline.hardware().aec_enabled());
    Ok(())
}

#[test]
#[serial]
fn test_hal_config() -> Result<(), Box<dyn Error>> {
    let config = CameraHalConfig::parse(
        r#"{
            "cameras": {
                "platform/csi0": { "facing": "back", "rotation": 90 },
                "usb-1": { "location": "external", "rotation": 0 }
            }
        }"#,
    )?;
    assert!(config.exists());
    assert!(config.is_valid());

    let csi = config.camera_config_data("platform/csi0").ok_or("no csi0")?;
    assert_eq!(csi.facing, Facing::Back);
    assert_eq!(csi.rotation, 90);
    let usb = config.camera_config_data("usb-1").ok_or("no usb-1")?;
    assert_eq!(usb.facing, Facing::External);
    assert!(config.camera_config_data("missing").is_none());

    assert!(matches!(
        CameraHalConfig::parse(r#"{"cameras": {"a": {"facing": "back", "rotation": 45}}}"#),
        Err(HalError::Configuration(_))
    ));
    assert!(CameraHalConfig::parse("cameras: []").is_err());

    let dir = std::env::temp_dir().join(format!("edgefirst-isp-{}", std::process::id()));
    fs::create_dir_all(&dir)?;

    let missing = CameraHalConfig::load(dir.join("missing.json"));
    assert!(!missing.exists());
    assert!(!missing.is_valid());

    let path = dir.join("invalid.json");
    fs::write(&path, r#"{"cameras": {"a": {"facing": "up", "rotation": 0}}}"#)?;
    let invalid = CameraHalConfig::load(&path);
    assert!(invalid.exists());
    assert!(!invalid.is_valid());

    let path = dir.join("camera_hal.json");
    fs::write(&path, r#"{"cameras": {"a": {"facing": "front", "rotation": 270}}}"#)?;
    let loaded = CameraHalConfig::load(&path);
    assert!(loaded.is_valid());
    assert_eq!(
        loaded.camera_config_data("a").map(|c| c.facing),
        Some(Facing::Front)
    );

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
#[serial]
fn test_colour_controls() -> Result<(), Box<dyn Error>> {
    let (mut pipeline, sensor) = running(&PipelineConfig::default())?;

    let mut first = request(0)?;
    first.controls_mut().set(ids::BRIGHTNESS, 0.5f32);
    first.controls_mut().set(ids::CONTRAST, 1.25f32);
    first.controls_mut().set(ids::SATURATION, 3.0f32);
    pipeline.queue_request(first)?;
    assert_eq!(sensor.value(cid::BRIGHTNESS), Some(192));
    assert_eq!(sensor.value(cid::CONTRAST), Some(160));
    assert_eq!(sensor.value(cid::SATURATION), Some(255));

    // Values are rounded to the nearest step and clamped at zero.
    let mut second = request(1)?;
    second.controls_mut().set(ids::BRIGHTNESS, -2.0f32);
    second.controls_mut().set(ids::CONTRAST, 0.0039f32);
    pipeline.queue_request(second)?;
    assert_eq!(sensor.value(cid::BRIGHTNESS), Some(0));
    assert_eq!(sensor.value(cid::CONTRAST), Some(0));
    assert_eq!(sensor.value(cid::SATURATION), Some(255));

    // A sensor failure rejects the request before a frame is opened.
    sensor.fail_control(Some(cid::CONTRAST));
    let mut third = request(2)?;
    third.controls_mut().set(ids::CONTRAST, 1.0f32);
    let rejected = pipeline
        .queue_request(third)
        .expect_err("contrast write fails");
    assert!(matches!(rejected.error, HalError::DevicePartialFailure { index: 0, .. }));
    assert_eq!(rejected.request.cookie(), 2);
    assert_eq!(pipeline.frames().in_flight(), 2);
    sensor.fail_control(None);

    assert!(pipeline.run_until(|p| p.hardware().queued(Queue::Raw) == 2, TIMEOUT));
    pipeline.hardware_mut().capture_all()?;
    assert!(pipeline.run_until(|p| !p.has_pending_requests(), TIMEOUT));
    assert_eq!(assert_completed_once(pipeline.sink()), 2);

    Ok(())
}
