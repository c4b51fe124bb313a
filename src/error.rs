// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error taxonomy for the camera pipeline.
//!
//! Resource exhaustion and device partial failures are expected operating
//! conditions and callers are expected to handle them. `LogicError` and
//! `HardwareFatal` indicate the affected pipeline instance must be torn down.

use std::io;
use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type Result<T> = std::result::Result<T, HalError>;

#[derive(Error, Debug)]
pub enum HalError {
    /// Bad initialization order or missing required configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer pool is empty; stop submitting until a frame completes.
    #[error("{0} buffer pool exhausted")]
    ResourceExhausted(&'static str),

    /// Unknown, disabled or read-only control. The whole batch is rejected
    /// and no device I/O took place.
    #[error("invalid control {id:#010x}: {reason}")]
    InvalidControl { id: u32, reason: &'static str },

    /// The device refused the batch as a whole, no control was modified.
    #[error("device rejected control batch: {0}")]
    DeviceRejected(#[source] io::Error),

    /// The device failed at `index`; controls before it were applied.
    #[error("device failed control at index {index}: {source}")]
    DevicePartialFailure {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("hardware fatal: {0}")]
    HardwareFatal(String),

    #[error("logic error: {0}")]
    LogicError(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HalError {
    /// True for conditions that should tear down the pipeline instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HalError::HardwareFatal(_) | HalError::LogicError(_))
    }
}
