// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer handles and memory shared between the pipeline, the ISP and the
//! algorithm engine.
//!
//! The pipeline never hands raw pointers across a trust boundary. Buffers are
//! identified by a [`BufferHandle`] and backed by file descriptors which can
//! be duplicated and mapped by whichever side was granted them.

use std::{
    ffi::{c_void, CString},
    fmt, io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    ptr::null_mut,
    slice::{from_raw_parts, from_raw_parts_mut},
};
use tracing::{trace, warn};

/// Hardware queue a buffer belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Queue {
    /// Raw sensor capture, attached to application requests.
    Raw,
    /// ISP parameter input.
    Params,
    /// ISP statistics output.
    Stats,
}

impl Queue {
    pub fn name(&self) -> &'static str {
        match self {
            Queue::Raw => "raw",
            Queue::Params => "params",
            Queue::Stats => "stats",
        }
    }
}

/// Identity of a buffer on one of the hardware queues.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle {
    queue: Queue,
    index: u32,
}

impl BufferHandle {
    pub const fn new(queue: Queue, index: u32) -> Self {
        Self { queue, index }
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Identifier under which the buffer is announced to the algorithm
    /// engine. Unique across queues.
    pub fn cookie(&self) -> u32 {
        ((self.queue as u32 + 1) << 16) | (self.index & 0xffff)
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.queue.name(), self.index)
    }
}

/// Completion status reported by the hardware for a dequeued buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum BufferStatus {
    #[default]
    Success,
    Error,
    Cancelled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct BufferMetadata {
    pub status: BufferStatus,
    pub sequence: u32,
    /// Capture timestamp in nanoseconds.
    pub timestamp: u64,
}

/// One memory plane of a frame buffer.
#[derive(Debug)]
pub struct Plane {
    fd: OwnedFd,
    length: usize,
}

impl Plane {
    pub fn new(fd: OwnedFd, length: usize) -> Self {
        Self { fd, length }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Duplicates the file descriptor so the plane can be granted to another
    /// component.
    pub fn try_clone(&self) -> io::Result<Plane> {
        Ok(Plane {
            fd: self.fd.try_clone()?,
            length: self.length,
        })
    }

    pub fn map(&self) -> io::Result<MappedBuffer> {
        MappedBuffer::new(self.fd(), self.length)
    }
}

/// File descriptor backed buffer owned by the pipeline.
#[derive(Debug)]
pub struct FrameBuffer {
    handle: BufferHandle,
    planes: Vec<Plane>,
}

impl FrameBuffer {
    /// Allocates a single plane buffer of `length` bytes in anonymous shared
    /// memory.
    pub fn allocate(handle: BufferHandle, length: usize) -> io::Result<Self> {
        let name = CString::new(format!("isp-{handle}"))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), length as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }

        trace!(%handle, length, "allocated frame buffer");
        Ok(Self {
            handle,
            planes: vec![Plane::new(fd, length)],
        })
    }

    pub fn from_planes(handle: BufferHandle, planes: Vec<Plane>) -> Self {
        Self { handle, planes }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Maps the first plane into the caller's address space.
    pub fn map(&self) -> io::Result<MappedBuffer> {
        match self.planes.first() {
            Some(plane) => plane.map(),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame buffer has no planes",
            )),
        }
    }
}

/// Memory-mapped view of a buffer plane, unmapped on drop.
///
/// # Safety
///
/// While the API is safe, concurrent access from hardware and CPU can lead to
/// race conditions. Only touch the mapping while the buffer is dequeued.
pub struct MappedBuffer {
    mmap: *mut u8,
    len: usize,
}

// SAFETY: the mapping is owned exclusively by this value and is not aliased
// by any other Rust reference; moving it to another thread moves ownership.
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    pub fn new(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty plane",
            ));
        }

        let mmap = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if mmap == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            mmap: mmap.cast::<u8>(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.mmap, self.len) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.mmap, self.len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.mmap.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed: {}", io::Error::last_os_error());
        }
    }
}

impl fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MappedBuffer({:p}, {})", self.mmap, self.len)
    }
}
