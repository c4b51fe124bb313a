// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Extended control access on a V4L2 video or sub-device node.

use crate::device::{BatchFailure, ControlBackend, ExtControl, ExtValue, RawControl};
use std::{
    ffi::{c_char, c_void, CStr},
    fs::OpenOptions,
    io,
    mem::size_of,
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    ptr::null_mut,
};
use tracing::{debug, trace};

const V4L2_CTRL_WHICH_CUR_VAL: u32 = 0;

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct v4l2_query_ext_ctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [c_char; 32],
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
    pub flags: u32,
    pub elem_size: u32,
    pub elems: u32,
    pub nr_of_dims: u32,
    pub dims: [u32; 4],
    pub reserved: [u32; 32],
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub union v4l2_ext_control_value {
    pub value: i32,
    pub value64: i64,
    pub ptr: *mut c_void,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct v4l2_ext_control {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    pub u: v4l2_ext_control_value,
}

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct v4l2_ext_controls {
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut v4l2_ext_control,
}

/// Read/write ioctl request number in the V4L2 ('V') space.
const fn iowr<T>(nr: u32) -> libc::Ioctl {
    const IOC_READ_WRITE: u32 = 3;
    ((IOC_READ_WRITE << 30) | ((size_of::<T>() as u32) << 16) | ((b'V' as u32) << 8) | nr)
        as libc::Ioctl
}

const VIDIOC_G_EXT_CTRLS: libc::Ioctl = iowr::<v4l2_ext_controls>(71);
const VIDIOC_S_EXT_CTRLS: libc::Ioctl = iowr::<v4l2_ext_controls>(72);
const VIDIOC_QUERY_EXT_CTRL: libc::Ioctl = iowr::<v4l2_query_ext_ctrl>(103);

fn ioctl<T>(fd: &OwnedFd, request: libc::Ioctl, arg: &mut T) -> io::Result<()> {
    if unsafe { libc::ioctl(fd.as_raw_fd(), request, arg as *mut T) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An open V4L2 device node.
#[derive(Debug)]
pub struct DeviceNode {
    fd: OwnedFd,
    path: PathBuf,
}

impl DeviceNode {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)?;
        debug!(path = %path.display(), "opened device node");
        Ok(Self {
            fd: file.into(),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ext_ctrls(
        &self,
        request: libc::Ioctl,
        controls: &mut [ExtControl<'_>],
    ) -> Result<(), BatchFailure> {
        let mut raw: Vec<v4l2_ext_control> = controls
            .iter_mut()
            .map(|ctrl| match &mut ctrl.value {
                ExtValue::Integer(v) => v4l2_ext_control {
                    id: ctrl.id,
                    size: 0,
                    reserved2: [0],
                    u: v4l2_ext_control_value { value: *v },
                },
                ExtValue::Integer64(v) => v4l2_ext_control {
                    id: ctrl.id,
                    size: 0,
                    reserved2: [0],
                    u: v4l2_ext_control_value { value64: *v },
                },
                ExtValue::Payload(data) => v4l2_ext_control {
                    id: ctrl.id,
                    size: data.len() as u32,
                    reserved2: [0],
                    u: v4l2_ext_control_value {
                        ptr: data.as_mut_ptr().cast::<c_void>(),
                    },
                },
            })
            .collect();

        let count = raw.len();
        let mut batch = v4l2_ext_controls {
            which: V4L2_CTRL_WHICH_CUR_VAL,
            count: count as u32,
            error_idx: 0,
            request_fd: 0,
            reserved: [0],
            controls: if raw.is_empty() {
                null_mut()
            } else {
                raw.as_mut_ptr()
            },
        };

        let result = ioctl(&self.fd, request, &mut batch);
        let applied = match result {
            Ok(_) => count,
            Err(_) if (batch.error_idx as usize) < count => batch.error_idx as usize,
            Err(_) => 0,
        };

        for (ctrl, raw) in controls.iter_mut().zip(raw.iter()).take(applied) {
            let u = raw.u;
            match &mut ctrl.value {
                ExtValue::Integer(v) => *v = unsafe { u.value },
                ExtValue::Integer64(v) => *v = unsafe { u.value64 },
                ExtValue::Payload(_) => {}
            }
        }

        match result {
            Ok(_) => Ok(()),
            Err(error) if batch.error_idx as usize >= count => Err(BatchFailure::Rejected(error)),
            Err(error) => Err(BatchFailure::At {
                index: batch.error_idx as usize,
                error,
            }),
        }
    }
}

impl ControlBackend for DeviceNode {
    fn query_control(&self, id: u32) -> io::Result<RawControl> {
        let mut query = v4l2_query_ext_ctrl {
            id,
            type_: 0,
            name: [0; 32],
            minimum: 0,
            maximum: 0,
            step: 0,
            default_value: 0,
            flags: 0,
            elem_size: 0,
            elems: 0,
            nr_of_dims: 0,
            dims: [0; 4],
            reserved: [0; 32],
        };
        ioctl(&self.fd, VIDIOC_QUERY_EXT_CTRL, &mut query)?;

        query.name[31] = 0;
        let name = unsafe { CStr::from_ptr(query.name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        trace!(id = query.id, %name, "queried control");

        Ok(RawControl {
            id: query.id,
            name,
            kind: query.type_,
            minimum: query.minimum,
            maximum: query.maximum,
            step: query.step,
            default_value: query.default_value,
            flags: query.flags,
            elems: query.elems,
            elem_size: query.elem_size,
        })
    }

    fn get_controls(&self, controls: &mut [ExtControl<'_>]) -> Result<(), BatchFailure> {
        self.ext_ctrls(VIDIOC_G_EXT_CTRLS, controls)
    }

    fn set_controls(&self, controls: &mut [ExtControl<'_>]) -> Result<(), BatchFailure> {
        self.ext_ctrls(VIDIOC_S_EXT_CTRLS, controls)
    }
}
