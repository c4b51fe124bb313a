// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst ISP Pipeline Library
//!
//! This library provides the completion core of a camera pipeline built
//! around a raw sensor and an image signal processor (ISP). It tracks every
//! frame in flight, batches control transactions against the sensor, and
//! bridges to an auto exposure algorithm running on its own thread.
//!
//! ## Features
//!
//! - **Frame Tracking**: Per-frame records keyed by frame id with a buffer
//!   index, backed by bounded parameter and statistics buffer pools.
//! - **Control Transactions**: Validated, batched V4L2 extended control reads
//!   and writes with precise partial failure reporting.
//! - **Algorithm Bridge**: Message based interface to image processing
//!   algorithms, including an auto exposure implementation.
//! - **Completion Coordination**: Requests complete exactly once, whatever
//!   the order in which their buffers and metadata arrive.
//! - **Virtual Camera**: A simulated sensor and ISP for development and
//!   testing without hardware.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_isp::{
//!     buffer::{BufferHandle, Queue},
//!     config::PipelineConfig,
//!     device::V4l2Device,
//!     event_loop::EventLoop,
//!     ipa::auto_exposure::AutoExposureIpa,
//!     pipeline::{CompletionEvent, IspPipeline, PipelineHandler},
//!     request::{Request, StreamId},
//!     virtual_camera::{SceneModel, VirtualIsp, VirtualSensor},
//! };
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let events = EventLoop::new();
//! let sensor = VirtualSensor::new();
//! let isp = VirtualIsp::new(events.sender(), sensor.clone(), SceneModel::new(0.25));
//! let completions: Vec<CompletionEvent> = Vec::new();
//!
//! let mut pipeline = IspPipeline::new(
//!     events,
//!     V4l2Device::open(sensor)?,
//!     isp,
//!     completions,
//!     &config,
//!     AutoExposureIpa::new,
//! )?;
//! pipeline.configure(&config.stream_configuration())?;
//! pipeline.start()?;
//!
//! let mut request = Request::new(0);
//! request.add_buffer(StreamId::RAW, BufferHandle::new(Queue::Raw, 0))?;
//! pipeline.queue_request(request)?;
//! pipeline.run_until(|p| p.hardware().queued(Queue::Raw) > 0, Duration::from_secs(1));
//! pipeline.hardware_mut().capture()?;
//! pipeline.run_until(|p| !p.has_pending_requests(), Duration::from_secs(1));
//! pipeline.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: `memfd_create` for shared buffers, V4L2 extended controls
//!   for real sensor sub-devices
//!
//! ## Safety
//!
//! This library uses `unsafe` code for the V4L2 ioctls and for mapping
//! shared buffers. All unsafe operations are isolated to the `buffer` and
//! `v4l2` modules and wrapped with safe APIs.

pub mod buffer;
pub mod config;
pub mod controls;
pub mod device;
pub mod error;
pub mod event_loop;
pub mod frames;
pub mod ipa;
pub mod pipeline;
pub mod request;
pub mod sensor;
pub mod v4l2;
pub mod virtual_camera;
