// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use edgefirst_isp::{
    buffer::{BufferHandle, Queue},
    config::CameraHalConfig,
    controls::ids,
    device::V4l2Device,
    error::HalError,
    event_loop::EventLoop,
    ipa::auto_exposure::AutoExposureIpa,
    pipeline::{CompletionEvent, IspPipeline, PipelineHandler},
    request::{Request, StreamId},
    v4l2::DeviceNode,
    virtual_camera::{SceneModel, VirtualIsp, VirtualSensor},
};
use std::{
    error::Error,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt as _, Layer as _};

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(level);

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(level)),
        Err(_) => None,
    };

    let console = args.tokio_console.then(console_subscriber::spawn);

    #[cfg(feature = "tracy")]
    let tracy = args.tracy.then(|| {
        tracy_client::Client::start();
        tracing_tracy::TracyLayer::default().with_filter(LevelFilter::TRACE)
    });
    #[cfg(not(feature = "tracy"))]
    let tracy: Option<tracing_subscriber::layer::Identity> = None;

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(journald)
        .with(stdout_log)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    Ok(())
}

fn list_controls(path: &Path) -> Result<(), Box<dyn Error>> {
    let device = V4l2Device::open(DeviceNode::open(path)?)?;
    for (id, info) in device.controls().iter() {
        println!("{:#010x} {:<32} {:?} {}", id.id(), id.name(), id.control_type(), info);
    }
    Ok(())
}

/// Runs the virtual camera one request at a time until `frames` requests
/// have completed or `stop` is raised.
fn run_virtual(args: Args, stop: Arc<AtomicBool>) -> Result<usize, HalError> {
    let config = args.pipeline_config();
    let events = EventLoop::new();
    let sensor = VirtualSensor::new();
    let isp = VirtualIsp::new(
        events.sender(),
        sensor.clone(),
        SceneModel::new(args.reflectance),
    );
    let (completions, completed_rx) = kanal::unbounded::<CompletionEvent>();

    let mut pipeline = IspPipeline::new(
        events,
        V4l2Device::open(sensor)?,
        isp,
        completions,
        &config,
        AutoExposureIpa::new,
    )?;
    pipeline.configure(&config.stream_configuration())?;
    pipeline.start()?;

    let raw_buffers = config.buffer_count.max(1) as u64;
    let mut cookie = 0u64;
    let mut completed = 0;

    while completed < args.frames && !stop.load(Ordering::Relaxed) {
        let mut request = Request::new(cookie);
        request.add_buffer(
            StreamId::RAW,
            BufferHandle::new(Queue::Raw, (cookie % raw_buffers) as u32),
        )?;
        if cookie == 0 {
            request.controls_mut().set(ids::AE_ENABLE, true);
        }
        cookie += 1;
        pipeline.queue_request(request)?;

        if !pipeline.run_until(|p| p.hardware().queued(Queue::Raw) > 0, FRAME_TIMEOUT) {
            return Err(HalError::HardwareFatal("parameters were never filled".into()));
        }
        pipeline.hardware_mut().capture_all()?;
        if !pipeline.run_until(|p| !p.has_pending_requests(), FRAME_TIMEOUT) {
            return Err(HalError::HardwareFatal("frame never completed".into()));
        }

        while let Ok(Some(event)) = completed_rx.try_recv() {
            if let CompletionEvent::RequestCompleted(request) = event {
                completed += 1;
                let metadata = request.metadata();
                info!(
                    cookie = request.cookie(),
                    error = request.has_error(),
                    exposure = ?metadata.get(ids::EXPOSURE_TIME),
                    gain = ?metadata.get(ids::ANALOGUE_GAIN),
                    locked = ?metadata.get(ids::AE_LOCKED),
                    "request completed"
                );
            }
        }
    }

    pipeline.stop();
    Ok(completed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    if args.list_controls {
        return list_controls(&args.device);
    }

    if let Some(path) = &args.hal_config {
        let hal = CameraHalConfig::load(path);
        match hal.camera_config_data(&args.camera_id) {
            Some(data) => info!(
                camera = %args.camera_id,
                facing = ?data.facing,
                rotation = data.rotation,
                "camera HAL configuration"
            ),
            None if hal.is_valid() => {
                warn!(camera = %args.camera_id, "camera missing from HAL configuration")
            }
            None => warn!("ignoring invalid camera HAL configuration"),
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut camera = tokio::task::spawn_blocking({
        let stop = stop.clone();
        let args = args.clone();
        move || run_virtual(args, stop)
    });

    let completed = tokio::select! {
        result = &mut camera => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping camera");
            stop.store(true, Ordering::Relaxed);
            camera.await??
        }
    };

    info!(completed, "camera finished");
    Ok(())
}
