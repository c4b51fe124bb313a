// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Image processing algorithm (IPA) interface.
//!
//! The pipeline talks to an algorithm engine only through the
//! [`IpaInterface`] lifecycle and the tagged [`IpaEvent`] / [`IpaAction`]
//! messages. Buffers are shared by id and duplicated file descriptors, never
//! by pointer, so an engine can run on another thread behind
//! [`proxy::IpaProxy`].

pub mod auto_exposure;
pub mod isp;
pub mod proxy;

use crate::{
    buffer::Plane,
    controls::{ControlInfoMap, ControlList},
    error::Result,
    event_loop::{Event, EventSender},
    frames::FrameId,
    request::StreamId,
    sensor::SensorDelays,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Entity id of the camera sensor in the control maps handed to
/// [`IpaInterface::configure`].
pub const SENSOR_ENTITY: u32 = 0;

/// Sensor description passed to the algorithms at configuration time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorInfo {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub delays: SensorDelays,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IpaStream {
    pub id: StreamId,
    pub width: u32,
    pub height: u32,
}

/// A buffer granted to the algorithms under `id`.
#[derive(Debug)]
pub struct IpaBuffer {
    pub id: u32,
    pub planes: Vec<Plane>,
}

/// Work handed from the pipeline to the algorithms.
#[derive(Debug)]
pub enum IpaEvent {
    /// Fill parameter buffer `buffer_id` for `frame` from the request
    /// `controls`.
    QueueRequest {
        frame: FrameId,
        buffer_id: u32,
        controls: ControlList,
    },
    /// Statistics for `frame` are available in buffer `buffer_id`.
    StatBufferReady { frame: FrameId, buffer_id: u32 },
}

/// Results posted back by the algorithms.
#[derive(Debug, PartialEq)]
pub enum IpaAction {
    ParamsFilled {
        frame: FrameId,
    },
    SetSensorControls {
        frame: FrameId,
        controls: ControlList,
    },
    MetadataReady {
        frame: FrameId,
        metadata: ControlList,
    },
    /// The engine hit an unrecoverable error and stopped processing.
    Fatal {
        reason: String,
    },
}

pub trait IpaInterface: Send {
    fn init(&mut self, hw_revision: u32) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    fn configure(
        &mut self,
        sensor: &SensorInfo,
        streams: &BTreeMap<StreamId, IpaStream>,
        entity_controls: &BTreeMap<u32, ControlInfoMap>,
    ) -> Result<()>;

    /// Maps `buffers` for the lifetime of the engine or until they are
    /// unmapped.
    fn map_buffers(&mut self, buffers: Vec<IpaBuffer>) -> Result<()>;

    fn unmap_buffers(&mut self, ids: &[u32]);

    fn process_event(&mut self, event: IpaEvent);
}

/// Posts [`IpaAction`]s to the owning camera's event loop.
#[derive(Clone)]
pub struct ActionSender {
    tx: EventSender,
}

impl ActionSender {
    pub fn new(tx: EventSender) -> Self {
        Self { tx }
    }

    pub fn send(&self, action: IpaAction) {
        if let Err(e) = self.tx.send(Event::Ipa(action)) {
            warn!("dropping algorithm action, event loop closed: {e}");
        }
    }
}
