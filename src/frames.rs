// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-frame tracking and the parameter/statistics buffer pools.
//!
//! Every in-flight frame borrows one parameter buffer and one statistics
//! buffer. Frames are stored in an arena keyed by frame id with a secondary
//! index from every buffer the frame references back to its id, so lookups
//! from hardware completions never hold references into the arena.

use crate::{
    buffer::{BufferHandle, Queue},
    error::{HalError, Result},
    request::{Request, StreamId},
};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Frame ids count up from zero for each [`FrameTracker::initialize`] and
/// never wrap within the lifetime of a pipeline.
pub type FrameId = u64;

/// Tracking record of one in-flight frame.
#[derive(Debug)]
pub struct FrameInfo {
    pub id: FrameId,
    pub request: Request,
    pub raw_buffer: Option<BufferHandle>,
    pub param_buffer: BufferHandle,
    pub stat_buffer: BufferHandle,
    pub param_dequeued: bool,
    pub metadata_processed: bool,
}

impl FrameInfo {
    fn buffers(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.request
            .buffers()
            .map(|(_, buffer)| buffer)
            .chain([self.param_buffer, self.stat_buffer])
    }
}

/// A request the tracker could not admit, handed back to the caller along
/// with the reason.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RequestRejected {
    pub request: Request,
    #[source]
    pub error: HalError,
}

impl From<RequestRejected> for HalError {
    fn from(rejected: RequestRejected) -> Self {
        rejected.error
    }
}

#[derive(Debug, Default)]
pub struct FrameTracker {
    available_params: VecDeque<BufferHandle>,
    available_stats: VecDeque<BufferHandle>,
    frames: HashMap<FrameId, FrameInfo>,
    by_buffer: HashMap<BufferHandle, FrameId>,
    next_id: FrameId,
    initialized: bool,
}

impl FrameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds both pools and restarts frame numbering.
    pub fn initialize(
        &mut self,
        params: impl IntoIterator<Item = BufferHandle>,
        stats: impl IntoIterator<Item = BufferHandle>,
    ) -> Result<()> {
        if !self.frames.is_empty() {
            return Err(HalError::Configuration(format!(
                "cannot initialize buffer pools with {} frames in flight",
                self.frames.len()
            )));
        }

        self.available_params.clear();
        self.available_params.extend(params);
        self.available_stats.clear();
        self.available_stats.extend(stats);
        self.next_id = 0;
        self.initialized = true;

        debug!(
            params = self.available_params.len(),
            stats = self.available_stats.len(),
            "frame tracker initialized"
        );
        Ok(())
    }

    /// Releases every pooled buffer. A new [`initialize`](Self::initialize)
    /// is required before frames can be created again.
    pub fn clear(&mut self) -> Result<()> {
        if !self.frames.is_empty() {
            return Err(HalError::Configuration(format!(
                "cannot release buffer pools with {} frames in flight",
                self.frames.len()
            )));
        }

        self.available_params.clear();
        self.available_stats.clear();
        self.initialized = false;
        Ok(())
    }

    /// Opens a tracking record for `request`, borrowing one buffer from each
    /// pool. Never blocks: an empty pool rejects the request and leaves the
    /// pools untouched.
    pub fn create_frame(
        &mut self,
        mut request: Request,
    ) -> std::result::Result<FrameId, RequestRejected> {
        let reject = |request, error| Err(RequestRejected { request, error });

        if !self.initialized {
            return reject(
                request,
                HalError::Configuration("frame tracker is not initialized".into()),
            );
        }

        let (param_buffer, stat_buffer) = match (
            self.available_params.front().copied(),
            self.available_stats.front().copied(),
        ) {
            (Some(param), Some(stat)) => (param, stat),
            (None, _) => return reject(request, HalError::ResourceExhausted("params")),
            (_, None) => return reject(request, HalError::ResourceExhausted("stats")),
        };

        // Parameter and statistics buffers are only ever handed out by the
        // pools.
        let pooled = request
            .buffers()
            .map(|(_, buffer)| buffer)
            .find(|buffer| buffer.queue() != Queue::Raw);
        if let Some(buffer) = pooled {
            return reject(
                request,
                HalError::InvalidArgument(format!("buffer {buffer} belongs to a pooled queue")),
            );
        }

        let in_flight = request
            .buffers()
            .map(|(_, buffer)| buffer)
            .find(|buffer| self.by_buffer.contains_key(buffer));
        if let Some(buffer) = in_flight {
            error!(%buffer, "buffer already belongs to an in-flight frame");
            return reject(
                request,
                HalError::LogicError(format!("buffer {buffer} already in flight")),
            );
        }

        let id = self.next_id;
        if let Err(error) = request.mark_queued(id) {
            return reject(request, error);
        }

        self.next_id += 1;
        self.available_params.pop_front();
        self.available_stats.pop_front();

        let info = FrameInfo {
            id,
            raw_buffer: request.buffer(StreamId::RAW),
            request,
            param_buffer,
            stat_buffer,
            param_dequeued: false,
            metadata_processed: false,
        };

        for buffer in info.buffers() {
            self.by_buffer.insert(buffer, id);
        }
        self.frames.insert(id, info);

        trace!(frame = id, %param_buffer, %stat_buffer, "frame created");
        Ok(id)
    }

    /// Closes the tracking record of frame `id` and returns its buffers to
    /// the pools.
    pub fn remove_frame(&mut self, id: FrameId) -> Result<FrameInfo> {
        let Some(info) = self.frames.remove(&id) else {
            error!(frame = id, "removing a frame that is not in flight");
            return Err(HalError::LogicError(format!("frame {id} is not in flight")));
        };

        for buffer in info.buffers() {
            self.by_buffer.remove(&buffer);
        }
        self.available_params.push_back(info.param_buffer);
        self.available_stats.push_back(info.stat_buffer);

        trace!(frame = id, "frame removed");
        Ok(info)
    }

    pub fn find(&self, id: FrameId) -> Option<&FrameInfo> {
        self.frames.get(&id)
    }

    pub fn find_mut(&mut self, id: FrameId) -> Option<&mut FrameInfo> {
        self.frames.get_mut(&id)
    }

    pub fn find_by_buffer(&self, buffer: BufferHandle) -> Option<&FrameInfo> {
        self.by_buffer
            .get(&buffer)
            .and_then(|id| self.frames.get(id))
    }

    pub fn find_by_buffer_mut(&mut self, buffer: BufferHandle) -> Option<&mut FrameInfo> {
        let id = *self.by_buffer.get(&buffer)?;
        self.frames.get_mut(&id)
    }

    /// True once the raw buffer completed, the parameter buffer was dequeued
    /// and the statistics were processed.
    pub fn try_complete(&self, info: &FrameInfo) -> bool {
        !info.request.has_pending_buffers() && info.param_dequeued && info.metadata_processed
    }

    pub fn in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Ids of the in-flight frames in ascending order.
    pub fn ids(&self) -> Vec<FrameId> {
        let mut ids: Vec<_> = self.frames.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn available_params(&self) -> usize {
        self.available_params.len()
    }

    pub fn available_stats(&self) -> usize {
        self.available_stats.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
