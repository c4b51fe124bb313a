// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Batched control transactions against a V4L2 style device.
//!
//! [`V4l2Device`] enumerates the controls a device exposes and performs
//! validated get and set batches on top of a [`ControlBackend`]. Every id in a
//! batch is validated before the backend is touched, so an invalid batch
//! never causes device I/O. A set batch that fails part way reports the
//! failing index and leaves the caller's list updated exactly up to it.
//!
//! # Example
//!
//! ```no_run
//! use edgefirst_isp::{controls::{cid, ControlList}, device::V4l2Device, v4l2::DeviceNode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut sensor = V4l2Device::open(DeviceNode::open("/dev/v4l-subdev0")?)?;
//! let mut ctrls = ControlList::new();
//! ctrls.set(cid::EXPOSURE, 800);
//! ctrls.set(cid::ANALOGUE_GAIN, 64);
//! sensor.write_controls(&mut ctrls)?;
//! println!("applied {ctrls}");
//! # Ok(())
//! # }
//! ```

use crate::{
    controls::{ControlId, ControlInfo, ControlInfoMap, ControlList, ControlType, ControlValue},
    error::{HalError, Result},
};
use std::{collections::HashMap, io, sync::Arc};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Control types reported by `VIDIOC_QUERY_EXT_CTRL`.
pub mod kind {
    pub const INTEGER: u32 = 1;
    pub const BOOLEAN: u32 = 2;
    pub const MENU: u32 = 3;
    pub const BUTTON: u32 = 4;
    pub const INTEGER64: u32 = 5;
    pub const CTRL_CLASS: u32 = 6;
    pub const STRING: u32 = 7;
    pub const BITMASK: u32 = 8;
    pub const INTEGER_MENU: u32 = 9;
    pub const U8: u32 = 0x0100;
    pub const U16: u32 = 0x0101;
    pub const U32: u32 = 0x0102;
}

/// Control flags reported by `VIDIOC_QUERY_EXT_CTRL`.
pub mod flags {
    pub const DISABLED: u32 = 0x0001;
    pub const GRABBED: u32 = 0x0002;
    pub const READ_ONLY: u32 = 0x0004;
    pub const VOLATILE: u32 = 0x0080;
    pub const HAS_PAYLOAD: u32 = 0x0100;

    /// Query the next control after the given id.
    pub const NEXT_CTRL: u32 = 0x8000_0000;
    /// Include compound controls when iterating.
    pub const NEXT_COMPOUND: u32 = 0x4000_0000;
}

/// Description of one control as reported by the device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawControl {
    pub id: u32,
    pub name: String,
    pub kind: u32,
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
    pub flags: u32,
    pub elems: u32,
    pub elem_size: u32,
}

impl RawControl {
    pub fn is_disabled(&self) -> bool {
        self.flags & flags::DISABLED != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & flags::READ_ONLY != 0
    }

    pub fn has_payload(&self) -> bool {
        self.flags & flags::HAS_PAYLOAD != 0
    }

    /// Payload size in bytes for array controls.
    pub fn payload_size(&self) -> usize {
        self.elems as usize * self.elem_size as usize
    }

    /// Control value type used to represent this control, `None` for types
    /// the engine does not marshal.
    pub fn control_type(&self) -> Option<ControlType> {
        match self.kind {
            kind::U8 => Some(ControlType::Byte),
            kind::BOOLEAN => Some(ControlType::Bool),
            kind::INTEGER | kind::MENU | kind::BUTTON | kind::BITMASK | kind::INTEGER_MENU => {
                Some(ControlType::Integer32)
            }
            kind::INTEGER64 => Some(ControlType::Integer64),
            _ => None,
        }
    }

    fn info(&self, control_type: ControlType) -> ControlInfo {
        match control_type {
            ControlType::Bool => ControlInfo::new(
                self.minimum != 0,
                self.maximum != 0,
                self.default_value != 0,
            ),
            ControlType::Integer64 => {
                ControlInfo::new(self.minimum, self.maximum, self.default_value)
            }
            _ => ControlInfo::new(
                saturate(self.minimum),
                saturate(self.maximum),
                saturate(self.default_value),
            ),
        }
    }
}

fn saturate(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Value slot of a control in a device batch.
#[derive(Debug, PartialEq, Eq)]
pub enum ExtValue<'a> {
    Integer(i32),
    Integer64(i64),
    /// Array payload, read and written in place.
    Payload(&'a mut [u8]),
}

#[derive(Debug)]
pub struct ExtControl<'a> {
    pub id: u32,
    pub value: ExtValue<'a>,
}

impl ExtControl<'_> {
    fn scalar(&self) -> Option<i64> {
        match self.value {
            ExtValue::Integer(v) => Some(v as i64),
            ExtValue::Integer64(v) => Some(v),
            ExtValue::Payload(_) => None,
        }
    }
}

/// How a device batch failed.
#[derive(Debug, Error)]
pub enum BatchFailure {
    /// The batch was refused as a whole and nothing was modified.
    #[error("batch rejected: {0}")]
    Rejected(#[source] io::Error),

    /// Processing stopped at `index`. Controls before it were applied and
    /// their slots hold the device values.
    #[error("batch failed at index {index}: {error}")]
    At {
        index: usize,
        #[source]
        error: io::Error,
    },
}

impl BatchFailure {
    /// An index at or past the end of a batch of `count` controls does not
    /// name a failing entry, so the batch counts as rejected.
    fn bounded(self, count: usize) -> Self {
        match self {
            BatchFailure::At { index, error } if index >= count => BatchFailure::Rejected(error),
            other => other,
        }
    }
}

/// Low level access to a device's extended controls.
pub trait ControlBackend {
    /// Describes control `id`. With [`flags::NEXT_CTRL`] or'ed into `id` the
    /// next control after it is described instead, and an error marks the
    /// end of the enumeration.
    fn query_control(&self, id: u32) -> io::Result<RawControl>;

    fn get_controls(&self, controls: &mut [ExtControl<'_>]) -> std::result::Result<(), BatchFailure>;

    fn set_controls(&self, controls: &mut [ExtControl<'_>]) -> std::result::Result<(), BatchFailure>;
}

impl<B: ControlBackend + ?Sized> ControlBackend for Box<B> {
    fn query_control(&self, id: u32) -> io::Result<RawControl> {
        (**self).query_control(id)
    }

    fn get_controls(&self, controls: &mut [ExtControl<'_>]) -> std::result::Result<(), BatchFailure> {
        (**self).get_controls(controls)
    }

    fn set_controls(&self, controls: &mut [ExtControl<'_>]) -> std::result::Result<(), BatchFailure> {
        (**self).set_controls(controls)
    }
}

/// Validated control transactions on one device.
pub struct V4l2Device<B: ControlBackend> {
    backend: B,
    controls: ControlInfoMap,
    raw: HashMap<u32, RawControl>,
}

impl<B: ControlBackend> V4l2Device<B> {
    /// Enumerates the controls of `backend`. Control classes, disabled
    /// controls and types without a value representation are skipped.
    pub fn open(backend: B) -> Result<Self> {
        let mut controls = ControlInfoMap::new();
        let mut raw = HashMap::new();
        let mut next = flags::NEXT_CTRL | flags::NEXT_COMPOUND;

        loop {
            let ctrl = match backend.query_control(next) {
                Ok(ctrl) => ctrl,
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => break,
                Err(e) => {
                    warn!("control enumeration stopped: {e}");
                    break;
                }
            };
            next = ctrl.id | flags::NEXT_CTRL | flags::NEXT_COMPOUND;

            if ctrl.kind == kind::CTRL_CLASS || ctrl.is_disabled() {
                continue;
            }
            let Some(control_type) = ctrl.control_type() else {
                debug!(id = ctrl.id, kind = ctrl.kind, "skipping control of unsupported type");
                continue;
            };

            let info = ctrl.info(control_type);
            trace!(id = ctrl.id, name = %ctrl.name, %info, "discovered control");
            controls.insert(
                Arc::new(ControlId::new(ctrl.id, ctrl.name.clone(), control_type)),
                info,
            );
            raw.insert(ctrl.id, ctrl);
        }

        debug!(count = controls.len(), "enumerated device controls");
        Ok(Self {
            backend,
            controls,
            raw,
        })
    }

    pub fn controls(&self) -> &ControlInfoMap {
        &self.controls
    }

    pub fn raw_info(&self, id: u32) -> Option<&RawControl> {
        self.raw.get(&id)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn validate(&self, id: u32) -> Result<&RawControl> {
        let ctrl = self.raw.get(&id).ok_or(HalError::InvalidControl {
            id,
            reason: "unknown control",
        })?;
        if ctrl.is_disabled() {
            return Err(HalError::InvalidControl {
                id,
                reason: "control is disabled",
            });
        }
        Ok(ctrl)
    }

    fn validate_write(&self, id: u32, value: &ControlValue) -> Result<()> {
        let ctrl = self.validate(id)?;
        if ctrl.is_read_only() {
            return Err(HalError::InvalidControl {
                id,
                reason: "control is read-only",
            });
        }

        let marshallable = match (ctrl.control_type(), value) {
            (Some(ControlType::Byte), ControlValue::Byte(data)) => {
                data.len() == ctrl.payload_size()
            }
            (Some(ControlType::Bool), ControlValue::Bool(_) | ControlValue::Integer32(_)) => true,
            (Some(ControlType::Integer32), ControlValue::Bool(_) | ControlValue::Integer32(_)) => {
                true
            }
            (Some(ControlType::Integer32), ControlValue::Integer64(v)) => {
                i32::try_from(*v).is_ok()
            }
            (Some(ControlType::Integer64), _) => value.as_i64().is_some(),
            _ => false,
        };
        if !marshallable {
            return Err(HalError::InvalidControl {
                id,
                reason: "value type does not match the control",
            });
        }
        Ok(())
    }

    fn control_type(&self, id: u32) -> Option<ControlType> {
        self.raw.get(&id).and_then(RawControl::control_type)
    }

    /// Converts a scalar read back from the device to the control's type.
    fn typed_value(&self, id: u32, v: i64) -> ControlValue {
        match self.control_type(id) {
            Some(ControlType::Bool) => ControlValue::Bool(v != 0),
            Some(ControlType::Integer64) => ControlValue::Integer64(v),
            _ => ControlValue::Integer32(saturate(v)),
        }
    }

    /// Reads the current value of every control in `ids`, in order.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidControl`] without any device I/O if an id is unknown
    /// or disabled. A device failure is reported as
    /// [`HalError::DeviceRejected`] or [`HalError::DevicePartialFailure`];
    /// nothing is returned for a partial read.
    pub fn read_controls(&self, ids: &[u32]) -> Result<ControlList> {
        let mut values = Vec::with_capacity(ids.len());
        for &id in ids {
            let ctrl = self.validate(id)?;
            values.push(match ctrl.control_type() {
                Some(ControlType::Byte) => ControlValue::reserve_bytes(ctrl.payload_size()),
                Some(ControlType::Integer64) => ControlValue::Integer64(0),
                _ => ControlValue::Integer32(0),
            });
        }
        if ids.is_empty() {
            return Ok(ControlList::new());
        }

        let mut ext: Vec<ExtControl> = ids
            .iter()
            .zip(values.iter_mut())
            .map(|(&id, value)| ExtControl {
                id,
                value: ext_value(value, self.control_type(id)),
            })
            .collect();

        if let Err(failure) = self.backend.get_controls(&mut ext) {
            return Err(batch_error("read", failure.bounded(ids.len()), ids.len()));
        }

        let scalars: Vec<Option<i64>> = ext.iter().map(ExtControl::scalar).collect();
        drop(ext);

        Ok(ids
            .iter()
            .zip(values)
            .zip(scalars)
            .map(|((&id, value), scalar)| match scalar {
                Some(v) => (id, self.typed_value(id, v)),
                None => (id, value),
            })
            .collect())
    }

    /// Writes `ctrls` to the device in list order as one batch and updates
    /// every applied entry with the value the device settled on.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidControl`] without any device I/O if an entry is
    /// unknown, disabled, read-only or carries a value the control cannot
    /// take. [`HalError::DeviceRejected`] if the device refused the batch,
    /// the list is untouched. [`HalError::DevicePartialFailure`] if the device
    /// failed at `index`: entries before it are updated, the rest untouched.
    pub fn write_controls(&mut self, ctrls: &mut ControlList) -> Result<()> {
        for (id, value) in ctrls.iter() {
            self.validate_write(id, value)?;
        }
        if ctrls.is_empty() {
            return Ok(());
        }

        let count = ctrls.len();
        let mut ext: Vec<ExtControl> = ctrls
            .iter_mut()
            .map(|(id, value)| ExtControl {
                id,
                value: ext_value(value, self.control_type(id)),
            })
            .collect();

        let result = self
            .backend
            .set_controls(&mut ext)
            .map_err(|failure| failure.bounded(count));
        let scalars: Vec<Option<i64>> = ext.iter().map(ExtControl::scalar).collect();
        drop(ext);

        let applied = match &result {
            Ok(()) => count,
            Err(BatchFailure::Rejected(_)) => 0,
            Err(BatchFailure::At { index, .. }) => *index,
        };

        for ((id, value), scalar) in ctrls.iter_mut().zip(scalars).take(applied) {
            if let Some(v) = scalar {
                *value = self.typed_value(id, v);
            }
        }

        match result {
            Ok(()) => {
                trace!(%ctrls, "controls written");
                Ok(())
            }
            Err(failure) => Err(batch_error("write", failure, count)),
        }
    }

    /// Re-queries the range of every known control in place. Identities
    /// handed out earlier stay valid. Controls that fail to answer are
    /// skipped.
    pub fn refresh_control_info(&mut self) {
        let ids: Vec<u32> = self.controls.ids().collect();
        for id in ids {
            let ctrl = match self.backend.query_control(id) {
                Ok(ctrl) => ctrl,
                Err(e) => {
                    warn!(id, "could not refresh control info: {e}");
                    continue;
                }
            };

            let Some(control_type) = self.controls.control_id(id).map(|c| c.control_type())
            else {
                continue;
            };
            if let Some(info) = self.controls.get_mut(id) {
                *info = ctrl.info(control_type);
            }
            self.raw.insert(id, ctrl);
        }
    }
}

fn ext_value(value: &mut ControlValue, control_type: Option<ControlType>) -> ExtValue<'_> {
    match (value, control_type) {
        (ControlValue::Byte(data), _) => ExtValue::Payload(data),
        (other, Some(ControlType::Integer64)) => {
            ExtValue::Integer64(other.as_i64().unwrap_or_default())
        }
        (other, _) => ExtValue::Integer(other.as_i32().unwrap_or_default()),
    }
}

fn batch_error(op: &str, failure: BatchFailure, count: usize) -> HalError {
    match failure {
        BatchFailure::Rejected(error) => {
            warn!(count, "device rejected control {op}: {error}");
            HalError::DeviceRejected(error)
        }
        BatchFailure::At { index, error } => {
            warn!(count, index, "control {op} failed part way: {error}");
            HalError::DevicePartialFailure {
                index,
                source: error,
            }
        }
    }
}
