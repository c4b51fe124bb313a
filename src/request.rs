// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture requests as seen by the completion core.

use crate::{
    buffer::BufferHandle,
    controls::ControlList,
    error::{HalError, Result},
};
use std::collections::{BTreeMap, BTreeSet};

/// Logical stream a request buffer is attached to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Raw capture stream fed by the sensor.
    pub const RAW: StreamId = StreamId(0);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Queued,
    Complete,
}

/// Application capture request.
///
/// A request goes Pending → Queued → Complete. Complete is reached exactly
/// once, after every attached buffer has been completed.
#[derive(Debug)]
pub struct Request {
    cookie: u64,
    sequence: Option<u64>,
    buffers: BTreeMap<StreamId, BufferHandle>,
    pending: BTreeSet<BufferHandle>,
    controls: ControlList,
    metadata: ControlList,
    status: RequestStatus,
    error: bool,
}

impl Request {
    pub fn new(cookie: u64) -> Self {
        Self {
            cookie,
            sequence: None,
            buffers: BTreeMap::new(),
            pending: BTreeSet::new(),
            controls: ControlList::new(),
            metadata: ControlList::new(),
            status: RequestStatus::Pending,
            error: false,
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Completion sequence number, assigned when the request is queued.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn add_buffer(&mut self, stream: StreamId, buffer: BufferHandle) -> Result<()> {
        if self.status != RequestStatus::Pending {
            return Err(HalError::InvalidArgument(format!(
                "request {} already queued",
                self.cookie
            )));
        }
        if self.buffers.contains_key(&stream) {
            return Err(HalError::InvalidArgument(format!(
                "request {} already has a buffer for stream {}",
                self.cookie, stream.0
            )));
        }

        self.buffers.insert(stream, buffer);
        self.pending.insert(buffer);
        Ok(())
    }

    pub fn buffer(&self, stream: StreamId) -> Option<BufferHandle> {
        self.buffers.get(&stream).copied()
    }

    pub fn buffers(&self) -> impl Iterator<Item = (StreamId, BufferHandle)> + '_ {
        self.buffers.iter().map(|(s, b)| (*s, *b))
    }

    pub fn has_pending_buffers(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_buffers(&self) -> Vec<BufferHandle> {
        self.pending.iter().copied().collect()
    }

    /// Controls the application wants applied for this capture.
    pub fn controls(&self) -> &ControlList {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut ControlList {
        &mut self.controls
    }

    pub fn metadata(&self) -> &ControlList {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut ControlList {
        &mut self.metadata
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn set_error(&mut self) {
        self.error = true;
    }

    pub fn mark_queued(&mut self, sequence: u64) -> Result<()> {
        if self.status != RequestStatus::Pending {
            return Err(HalError::LogicError(format!(
                "request {} queued twice",
                self.cookie
            )));
        }
        self.sequence = Some(sequence);
        self.status = RequestStatus::Queued;
        Ok(())
    }

    /// Marks `buffer` as completed. Returns true while other buffers of the
    /// request are still pending.
    pub fn complete_buffer(&mut self, buffer: BufferHandle) -> Result<bool> {
        if !self.pending.remove(&buffer) {
            return Err(HalError::LogicError(format!(
                "buffer {buffer} is not pending in request {}",
                self.cookie
            )));
        }
        Ok(!self.pending.is_empty())
    }

    pub fn complete(&mut self) -> Result<()> {
        if self.status == RequestStatus::Complete {
            return Err(HalError::LogicError(format!(
                "request {} completed twice",
                self.cookie
            )));
        }
        if self.has_pending_buffers() {
            return Err(HalError::LogicError(format!(
                "request {} completed with {} pending buffers",
                self.cookie,
                self.pending.len()
            )));
        }
        self.status = RequestStatus::Complete;
        Ok(())
    }
}
