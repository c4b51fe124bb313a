// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Typed control values, control descriptions and ordered control lists.

use std::{collections::BTreeMap, fmt, sync::Arc};

/// Application level controls and metadata identifiers.
pub mod ids {
    pub const AE_ENABLE: u32 = 1;
    pub const AE_LOCKED: u32 = 2;
    pub const EXPOSURE_TIME: u32 = 3;
    pub const ANALOGUE_GAIN: u32 = 4;
    pub const BRIGHTNESS: u32 = 5;
    pub const CONTRAST: u32 = 6;
    pub const SATURATION: u32 = 7;
    pub const SENSOR_TIMESTAMP: u32 = 8;
    pub const SENSOR_SEQUENCE: u32 = 9;
}

/// V4L2 control identifiers used by the pipeline and the algorithms.
pub mod cid {
    pub const BRIGHTNESS: u32 = 0x0098_0900;
    pub const CONTRAST: u32 = 0x0098_0901;
    pub const SATURATION: u32 = 0x0098_0902;
    pub const EXPOSURE: u32 = 0x0098_0911;
    pub const VBLANK: u32 = 0x009e_0901;
    pub const HBLANK: u32 = 0x009e_0902;
    pub const ANALOGUE_GAIN: u32 = 0x009e_0903;
    pub const PIXEL_RATE: u32 = 0x009f_0902;
    pub const TEST_PATTERN: u32 = 0x009f_0903;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ControlType {
    #[default]
    None,
    Bool,
    Byte,
    Integer32,
    Integer64,
    Float,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub enum ControlValue {
    #[default]
    None,
    Bool(bool),
    /// Byte array payload. Device transactions read and write this storage
    /// directly.
    Byte(Vec<u8>),
    Integer32(i32),
    Integer64(i64),
    Float(f32),
}

impl ControlValue {
    /// Zero-filled byte array value of `len` elements.
    pub fn reserve_bytes(len: usize) -> Self {
        ControlValue::Byte(vec![0; len])
    }

    pub fn control_type(&self) -> ControlType {
        match self {
            ControlValue::None => ControlType::None,
            ControlValue::Bool(_) => ControlType::Bool,
            ControlValue::Byte(_) => ControlType::Byte,
            ControlValue::Integer32(_) => ControlType::Integer32,
            ControlValue::Integer64(_) => ControlType::Integer64,
            ControlValue::Float(_) => ControlType::Float,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ControlValue::None)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ControlValue::Byte(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(v) => Some(*v),
            ControlValue::Integer32(v) => Some(*v != 0),
            ControlValue::Integer64(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ControlValue::Bool(v) => Some(*v as i32),
            ControlValue::Integer32(v) => Some(*v),
            ControlValue::Integer64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ControlValue::Bool(v) => Some(*v as i64),
            ControlValue::Integer32(v) => Some(*v as i64),
            ControlValue::Integer64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ControlValue::Float(v) => Some(*v),
            ControlValue::Integer32(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            ControlValue::Byte(v) => Some(v),
            _ => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            ControlValue::Byte(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for ControlValue {
    fn from(value: bool) -> Self {
        ControlValue::Bool(value)
    }
}

impl From<i32> for ControlValue {
    fn from(value: i32) -> Self {
        ControlValue::Integer32(value)
    }
}

impl From<i64> for ControlValue {
    fn from(value: i64) -> Self {
        ControlValue::Integer64(value)
    }
}

impl From<f32> for ControlValue {
    fn from(value: f32) -> Self {
        ControlValue::Float(value)
    }
}

impl From<Vec<u8>> for ControlValue {
    fn from(value: Vec<u8>) -> Self {
        ControlValue::Byte(value)
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControlValue::None => write!(f, "<none>"),
            ControlValue::Bool(v) => write!(f, "{v}"),
            ControlValue::Byte(v) => write!(f, "{v:?}"),
            ControlValue::Integer32(v) => write!(f, "{v}"),
            ControlValue::Integer64(v) => write!(f, "{v}"),
            ControlValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Static identity of a control discovered on a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlId {
    id: u32,
    name: String,
    control_type: ControlType,
}

impl ControlId {
    pub fn new(id: u32, name: impl Into<String>, control_type: ControlType) -> Self {
        Self {
            id,
            name: name.into(),
            control_type,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control_type(&self) -> ControlType {
        self.control_type
    }
}

/// Validity range of a control.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ControlInfo {
    min: ControlValue,
    max: ControlValue,
    def: ControlValue,
}

impl ControlInfo {
    pub fn new(
        min: impl Into<ControlValue>,
        max: impl Into<ControlValue>,
        def: impl Into<ControlValue>,
    ) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            def: def.into(),
        }
    }

    pub fn min(&self) -> &ControlValue {
        &self.min
    }

    pub fn max(&self) -> &ControlValue {
        &self.max
    }

    pub fn def(&self) -> &ControlValue {
        &self.def
    }
}

impl fmt::Display for ControlInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}..{}] default {}", self.min, self.max, self.def)
    }
}

/// Controls supported by a device, keyed by numerical id.
///
/// Identities are reference counted so that refreshing the ranges in place
/// never invalidates an `Arc<ControlId>` obtained earlier.
#[derive(Clone, Debug, Default)]
pub struct ControlInfoMap {
    entries: BTreeMap<u32, (Arc<ControlId>, ControlInfo)>,
}

impl ControlInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Arc<ControlId>, info: ControlInfo) {
        self.entries.insert(id.id(), (id, info));
    }

    pub fn get(&self, id: u32) -> Option<&ControlInfo> {
        self.entries.get(&id).map(|(_, info)| info)
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut ControlInfo> {
        self.entries.get_mut(&id).map(|(_, info)| info)
    }

    pub fn control_id(&self, id: u32) -> Option<&Arc<ControlId>> {
        self.entries.get(&id).map(|(cid, _)| cid)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<ControlId>, &ControlInfo)> {
        self.entries.values().map(|(id, info)| (id, info))
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }
}

impl FromIterator<(Arc<ControlId>, ControlInfo)> for ControlInfoMap {
    fn from_iter<T: IntoIterator<Item = (Arc<ControlId>, ControlInfo)>>(iter: T) -> Self {
        let mut map = ControlInfoMap::new();
        for (id, info) in iter {
            map.insert(id, info);
        }
        map
    }
}

/// Ordered list of control values. Insertion order is the order in which a
/// device transaction applies the controls.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlList {
    entries: Vec<(u32, ControlValue)>,
}

impl ControlList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `id` to `value`, keeping the original position if `id` is already
    /// present.
    pub fn set(&mut self, id: u32, value: impl Into<ControlValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(cid, _)| *cid == id) {
            Some((_, v)) => *v = value,
            None => self.entries.push((id, value)),
        }
    }

    pub fn get(&self, id: u32) -> Option<&ControlValue> {
        self.entries
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut ControlValue> {
        self.entries
            .iter_mut()
            .find(|(cid, _)| *cid == id)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.iter().any(|(cid, _)| *cid == id)
    }

    pub fn remove(&mut self, id: u32) -> Option<ControlValue> {
        let pos = self.entries.iter().position(|(cid, _)| *cid == id)?;
        Some(self.entries.remove(pos).1)
    }

    /// Copies every entry of `other` into this list.
    pub fn merge(&mut self, other: &ControlList) {
        for (id, value) in other.iter() {
            self.set(id, value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn ids(&self) -> Vec<u32> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &ControlValue)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut ControlValue)> {
        self.entries.iter_mut().map(|(id, v)| (*id, v))
    }
}

impl FromIterator<(u32, ControlValue)> for ControlList {
    fn from_iter<T: IntoIterator<Item = (u32, ControlValue)>>(iter: T) -> Self {
        let mut list = ControlList::new();
        for (id, value) in iter {
            list.set(id, value);
        }
        list
    }
}

impl fmt::Display for ControlList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (id, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id:#x}: {value}")?;
        }
        write!(f, "}}")
    }
}
