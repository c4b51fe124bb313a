// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Single-consumer event queue driving one camera.
//!
//! Hardware completions and algorithm actions are posted from any thread and
//! handled in arrival order by whichever thread owns the [`EventLoop`].

use crate::{
    buffer::{BufferHandle, BufferMetadata},
    ipa::IpaAction,
};
use kanal::{Receiver, Sender};
use std::time::Duration;

#[derive(Debug)]
pub enum HardwareEvent {
    /// A buffer was dequeued from one of the hardware queues.
    BufferReady {
        buffer: BufferHandle,
        metadata: BufferMetadata,
    },
    /// The sensor started exposing frame `sequence`.
    FrameStart { sequence: u32 },
}

#[derive(Debug)]
pub enum Event {
    Hardware(HardwareEvent),
    Ipa(IpaAction),
}

impl From<HardwareEvent> for Event {
    fn from(event: HardwareEvent) -> Self {
        Event::Hardware(event)
    }
}

impl From<IpaAction> for Event {
    fn from(action: IpaAction) -> Self {
        Event::Ipa(action)
    }
}

pub type EventSender = Sender<Event>;

pub struct EventLoop {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = kanal::unbounded();
        Self { tx, rx }
    }

    /// Handle for posting events to this loop.
    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    /// Next queued event, without waiting.
    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok().flatten()
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
