// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_isp::{
    buffer::{BufferHandle, FrameBuffer, Plane, Queue},
    controls::{cid, ids, ControlInfoMap, ControlList, ControlValue},
    device::V4l2Device,
    error::HalError,
    event_loop::{Event, EventLoop},
    ipa::{
        auto_exposure::{exposure_factor, mean_luminance, AutoExposureIpa, HW_REVISION_V10},
        isp::{AeStatistics, IspParams, AE_MEAN_MAX, PARAMS_SIZE, STATS_SIZE},
        proxy::IpaProxy,
        ActionSender, IpaAction, IpaBuffer, IpaEvent, IpaInterface, SensorInfo, SENSOR_ENTITY,
    },
    sensor::{cam_helper_for, SensorDelays},
    virtual_camera::{SceneModel, VirtualSensor},
};
use serial_test::serial;
use std::{
    collections::BTreeMap,
    error::Error,
    io,
    thread,
    time::{Duration, Instant},
};

const EXPOSURE_MIN: u32 = 4;
const EXPOSURE_MAX: u32 = 2000;
const GAIN_MIN: u32 = 16;
const GAIN_MAX: u32 = 256;

struct Harness {
    events: EventLoop,
    ipa: AutoExposureIpa,
    params: FrameBuffer,
    stats: FrameBuffer,
}

fn sensor_info() -> SensorInfo {
    SensorInfo {
        model: "imx477".into(),
        width: 1920,
        height: 1080,
        delays: SensorDelays::default(),
    }
}

fn sensor_controls() -> Result<BTreeMap<u32, ControlInfoMap>, HalError> {
    let device = V4l2Device::open(VirtualSensor::new())?;
    Ok(BTreeMap::from([(SENSOR_ENTITY, device.controls().clone())]))
}

fn ipa_buffer(buffer: &FrameBuffer) -> io::Result<IpaBuffer> {
    Ok(IpaBuffer {
        id: buffer.handle().cookie(),
        planes: buffer
            .planes()
            .iter()
            .map(Plane::try_clone)
            .collect::<io::Result<_>>()?,
    })
}

impl Harness {
    fn new() -> Result<Self, Box<dyn Error>> {
        let events = EventLoop::new();
        let mut ipa = AutoExposureIpa::new(ActionSender::new(events.sender()));
        ipa.init(HW_REVISION_V10)?;
        ipa.configure(&sensor_info(), &BTreeMap::new(), &sensor_controls()?)?;

        let params = FrameBuffer::allocate(BufferHandle::new(Queue::Params, 0), PARAMS_SIZE)?;
        let stats = FrameBuffer::allocate(BufferHandle::new(Queue::Stats, 0), STATS_SIZE)?;
        ipa.map_buffers(vec![ipa_buffer(&params)?, ipa_buffer(&stats)?])?;

        Ok(Self {
            events,
            ipa,
            params,
            stats,
        })
    }

    fn actions(&self) -> Vec<IpaAction> {
        std::iter::from_fn(|| self.events.try_next())
            .filter_map(|event| match event {
                Event::Ipa(action) => Some(action),
                Event::Hardware(_) => None,
            })
            .collect()
    }

    fn queue_request(&mut self, frame: u64, controls: ControlList) -> Vec<IpaAction> {
        self.ipa.process_event(IpaEvent::QueueRequest {
            frame,
            buffer_id: self.params.handle().cookie(),
            controls,
        });
        self.actions()
    }

    fn statistics(&mut self, frame: u64, stats: AeStatistics) -> io::Result<Vec<IpaAction>> {
        let mut map = self.stats.map()?;
        assert!(stats.write_to(map.as_slice_mut()));
        drop(map);

        self.ipa.process_event(IpaEvent::StatBufferReady {
            frame,
            buffer_id: self.stats.handle().cookie(),
        });
        Ok(self.actions())
    }

    fn params(&self) -> io::Result<Option<IspParams>> {
        Ok(IspParams::read_from(self.params.map()?.as_slice()))
    }
}

fn sensor_update(actions: &[IpaAction]) -> Option<(u64, i32, i32)> {
    actions.iter().find_map(|action| match action {
        IpaAction::SetSensorControls { frame, controls } => Some((
            *frame,
            controls.get(cid::EXPOSURE)?.as_i32()?,
            controls.get(cid::ANALOGUE_GAIN)?.as_i32()?,
        )),
        _ => None,
    })
}

fn metadata(actions: &[IpaAction]) -> Option<&ControlList> {
    actions.iter().find_map(|action| match action {
        IpaAction::MetadataReady { metadata, .. } => Some(metadata),
        _ => None,
    })
}

#[test]
#[serial]
fn test_mean_luminance() {
    assert_eq!(mean_luminance(&[0; AE_MEAN_MAX]), 16);
    assert_eq!(mean_luminance(&[15; AE_MEAN_MAX]), 16);
    assert_eq!(mean_luminance(&[60; AE_MEAN_MAX]), 60);

    let mut grid = [10u8; AE_MEAN_MAX];
    grid[..5].copy_from_slice(&[100, 100, 100, 100, 100]);
    assert_eq!(mean_luminance(&grid), 100);

    assert!((exposure_factor(&[60; AE_MEAN_MAX]) - 1.0).abs() < f64::EPSILON);
    assert!((exposure_factor(&[120; AE_MEAN_MAX]) - 0.5).abs() < f64::EPSILON);
    assert!((exposure_factor(&[0; AE_MEAN_MAX]) - 3.75).abs() < f64::EPSILON);
}

#[test]
#[serial]
fn test_lifecycle_errors() -> Result<(), Box<dyn Error>> {
    let events = EventLoop::new();
    let mut ipa = AutoExposureIpa::new(ActionSender::new(events.sender()));

    assert!(matches!(ipa.init(11), Err(HalError::Configuration(_))));
    ipa.init(HW_REVISION_V10)?;
    assert!(matches!(ipa.start(), Err(HalError::Configuration(_))));

    assert!(matches!(
        ipa.configure(&sensor_info(), &BTreeMap::new(), &BTreeMap::new()),
        Err(HalError::InvalidArgument(_))
    ));

    let no_gain: ControlInfoMap = sensor_controls()?[&SENSOR_ENTITY]
        .iter()
        .filter(|(id, _)| id.id() != cid::ANALOGUE_GAIN)
        .map(|(id, info)| (id.clone(), info.clone()))
        .collect();
    let entity_controls = BTreeMap::from([(SENSOR_ENTITY, no_gain)]);
    assert!(matches!(
        ipa.configure(&sensor_info(), &BTreeMap::new(), &entity_controls),
        Err(HalError::InvalidArgument(_))
    ));

    ipa.configure(&sensor_info(), &BTreeMap::new(), &sensor_controls()?)?;
    assert_eq!(ipa.exposure(), EXPOSURE_MIN);
    assert_eq!(ipa.gain(), GAIN_MIN);

    ipa.start()?;
    let actions: Vec<_> = std::iter::from_fn(|| events.try_next()).collect();
    assert_eq!(actions.len(), 1);
    let Some(Event::Ipa(IpaAction::SetSensorControls { frame, controls })) = actions.first()
    else {
        return Err("expected initial sensor controls".into());
    };
    assert_eq!(*frame, 0);
    assert_eq!(controls.get(cid::EXPOSURE), Some(&ControlValue::Integer32(4)));
    assert_eq!(controls.get(cid::ANALOGUE_GAIN), Some(&ControlValue::Integer32(16)));

    Ok(())
}

#[test]
#[serial]
fn test_exposure_stays_in_range() -> Result<(), Box<dyn Error>> {
    let mut harness = Harness::new()?;

    // A bright scene pushes both towards their minimum.
    for frame in 0..12 {
        let actions = harness.statistics(frame, AeStatistics::with_means([120; AE_MEAN_MAX]))?;
        assert_eq!(harness.ipa.exposure(), EXPOSURE_MIN);
        assert_eq!(harness.ipa.gain(), GAIN_MIN);

        let metadata = metadata(&actions).ok_or("no metadata")?;
        assert_eq!(metadata.get(ids::AE_LOCKED), Some(&ControlValue::Bool(false)));
        assert_eq!(metadata.get(ids::EXPOSURE_TIME), Some(&ControlValue::Integer32(4)));
    }

    // A dark scene drives exposure to its maximum before gain.
    let mut saw_exposure_max = false;
    for frame in 12..90 {
        let actions = harness.statistics(frame, AeStatistics::with_means([16; AE_MEAN_MAX]))?;
        let (exposure, gain) = (harness.ipa.exposure(), harness.ipa.gain());
        assert!((EXPOSURE_MIN..=EXPOSURE_MAX).contains(&exposure));
        assert!((GAIN_MIN..=GAIN_MAX).contains(&gain));
        if gain > GAIN_MIN {
            assert_eq!(exposure, EXPOSURE_MAX);
            saw_exposure_max = true;
        }
        if let Some((_, exposure, gain)) = sensor_update(&actions) {
            assert!(exposure as u32 <= EXPOSURE_MAX);
            assert!(gain as u32 <= GAIN_MAX);
        }
    }
    assert!(saw_exposure_max);
    assert_eq!(harness.ipa.exposure(), EXPOSURE_MAX);
    assert_eq!(harness.ipa.gain(), GAIN_MAX);

    // From the top of the range a bright scene takes gain down first, then
    // exposure, never raising either.
    let mut last = (harness.ipa.exposure(), harness.ipa.gain());
    let mut exposure_dropped = false;
    for frame in 90..180 {
        harness.statistics(frame, AeStatistics::with_means([120; AE_MEAN_MAX]))?;
        let (exposure, gain) = (harness.ipa.exposure(), harness.ipa.gain());
        assert!(exposure <= last.0 && gain <= last.1, "frame {frame}");
        if exposure < EXPOSURE_MAX {
            assert_eq!(gain, GAIN_MIN);
            exposure_dropped = true;
        }
        last = (exposure, gain);
    }
    assert!(exposure_dropped);
    assert_eq!(harness.ipa.exposure(), EXPOSURE_MIN);
    assert_eq!(harness.ipa.gain(), GAIN_MIN);

    Ok(())
}

#[test]
#[serial]
fn test_update_interval() -> Result<(), Box<dyn Error>> {
    let mut harness = Harness::new()?;
    let dark = AeStatistics::with_means([20; AE_MEAN_MAX]);

    for frame in 0..9 {
        let actions = harness.statistics(frame, dark)?;
        assert!(metadata(&actions).is_some());
        match sensor_update(&actions) {
            Some((target, ..)) => {
                assert_eq!(frame % u64::from(SensorDelays::default().update_interval()), 0);
                assert_eq!(target, frame + 1);
            }
            None => assert_ne!(frame % 3, 0),
        }
    }

    // Statistics without an exposure measurement leave the loop alone.
    let exposure = harness.ipa.exposure();
    let actions = harness.statistics(9, AeStatistics::default())?;
    assert!(sensor_update(&actions).is_none());
    assert_eq!(harness.ipa.exposure(), exposure);
    let metadata = metadata(&actions).ok_or("no metadata")?;
    assert!(metadata.get(ids::AE_LOCKED).is_none());
    assert!(metadata.get(ids::EXPOSURE_TIME).is_some());

    Ok(())
}

#[test]
#[serial]
fn test_converges_on_scene() -> Result<(), Box<dyn Error>> {
    let mut harness = Harness::new()?;
    let scene = SceneModel::new(0.25);
    let (mut exposure, mut gain) = (EXPOSURE_MIN as i64, GAIN_MIN as i64);
    let mut locked = None;

    for frame in 0..30 {
        let stats = AeStatistics::with_means(scene.exp_means(exposure, gain));
        let actions = harness.statistics(frame, stats)?;
        if let Some((_, e, g)) = sensor_update(&actions) {
            (exposure, gain) = (e as i64, g as i64);
        }
        locked = metadata(&actions)
            .and_then(|m| m.get(ids::AE_LOCKED))
            .and_then(ControlValue::as_bool);
    }

    assert_eq!(locked, Some(true));
    assert!((200..300).contains(&exposure), "exposure {exposure}");
    assert_eq!(gain, GAIN_MIN as i64);
    Ok(())
}

#[test]
#[serial]
fn test_auto_exposure_enable() -> Result<(), Box<dyn Error>> {
    let mut harness = Harness::new()?;

    let mut controls = ControlList::new();
    controls.set(ids::AE_ENABLE, false);
    let actions = harness.queue_request(0, controls);
    assert_eq!(actions, vec![IpaAction::ParamsFilled { frame: 0 }]);
    assert!(!harness.ipa.is_auto_exposure_enabled());
    assert_eq!(harness.params()?.and_then(|p| p.aec_enabled()), Some(false));

    // Statistics are still reported but exposure is left alone.
    let actions = harness.statistics(3, AeStatistics::with_means([20; AE_MEAN_MAX]))?;
    assert!(sensor_update(&actions).is_none());
    assert!(metadata(&actions).is_some());
    assert_eq!(harness.ipa.exposure(), EXPOSURE_MIN);

    let actions = harness.queue_request(4, ControlList::new());
    assert_eq!(actions, vec![IpaAction::ParamsFilled { frame: 4 }]);
    assert_eq!(harness.params()?.and_then(|p| p.aec_enabled()), None);

    let mut controls = ControlList::new();
    controls.set(ids::AE_ENABLE, true);
    harness.queue_request(5, controls);
    assert_eq!(harness.params()?.and_then(|p| p.aec_enabled()), Some(true));
    let actions = harness.statistics(6, AeStatistics::with_means([20; AE_MEAN_MAX]))?;
    assert!(sensor_update(&actions).is_some());

    Ok(())
}

#[test]
#[serial]
fn test_unmapped_buffer_is_fatal() -> Result<(), Box<dyn Error>> {
    let mut harness = Harness::new()?;
    let id = harness.params.handle().cookie();
    harness.ipa.unmap_buffers(&[id]);

    let actions = harness.queue_request(0, ControlList::new());
    assert!(matches!(actions.as_slice(), [IpaAction::Fatal { .. }]));

    harness.ipa.process_event(IpaEvent::StatBufferReady {
        frame: 0,
        buffer_id: 0xdead,
    });
    assert!(matches!(harness.actions().as_slice(), [IpaAction::Fatal { .. }]));
    Ok(())
}

#[test]
#[serial]
fn test_proxy_forwards_calls() -> Result<(), Box<dyn Error>> {
    let events = EventLoop::new();
    let mut proxy = IpaProxy::spawn(AutoExposureIpa::new(ActionSender::new(events.sender())))?;

    assert!(matches!(proxy.init(3), Err(HalError::Configuration(_))));
    proxy.init(HW_REVISION_V10)?;
    proxy.configure(&sensor_info(), &BTreeMap::new(), &sensor_controls()?)?;
    proxy.start()?;

    let event = events
        .next_timeout(Duration::from_secs(1))
        .ok_or("no action from the engine")?;
    assert!(matches!(
        event,
        Event::Ipa(IpaAction::SetSensorControls { frame: 0, .. })
    ));

    proxy.stop();
    assert!(proxy.is_alive());
    Ok(())
}

#[test]
#[serial]
fn test_proxy_map_failure_is_fatal() -> Result<(), Box<dyn Error>> {
    let events = EventLoop::new();
    let mut proxy = IpaProxy::spawn(AutoExposureIpa::new(ActionSender::new(events.sender())))?;
    proxy.init(HW_REVISION_V10)?;

    let err = proxy
        .map_buffers(vec![IpaBuffer {
            id: 1,
            planes: Vec::new(),
        }])
        .expect_err("buffer without planes");
    assert!(matches!(err, HalError::HardwareFatal(_)));
    assert!(err.is_fatal());

    let deadline = Instant::now() + Duration::from_secs(1);
    while proxy.is_alive() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!proxy.is_alive());
    assert!(matches!(
        proxy.init(HW_REVISION_V10),
        Err(HalError::HardwareFatal(_))
    ));
    Ok(())
}

#[test]
#[serial]
fn test_imx477_gain_code() -> Result<(), Box<dyn Error>> {
    let helper = cam_helper_for("imx477").ok_or("no imx477 helper")?;
    assert_eq!(helper.model(), "imx477");
    assert_eq!(helper.delays().update_interval(), 3);

    for (gain, code) in [(1.0, 0), (2.0, 512), (4.0, 768), (16.0, 960)] {
        assert_eq!(helper.gain_code(gain), code, "gain {gain}");
        assert_eq!(helper.gain(code), gain);
    }
    // Codes are truncated, so a round trip may lose a fraction of a step.
    for gain in [1.5, 3.3, 10.0, 22.26] {
        let back = helper.gain(helper.gain_code(gain));
        assert!(back <= gain && gain - back < 0.5, "gain {gain} came back as {back}");
    }
    // Gains below unity cannot be represented.
    assert_eq!(helper.gain_code(0.5), 0);
    assert_eq!(helper.gain_code(0.0), 0);
    assert_eq!(helper.gain(4096), 1024.0);

    assert!(cam_helper_for("ov5640").is_none());
    Ok(())
}
