// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Auto exposure algorithm for the ISP.
//!
//! The algorithm drives the mean luminance of the auto exposure grid towards
//! a fixed target. Regions at or below the noise floor are ignored. Every
//! update first moves exposure, then applies whatever is left of the
//! correction to analogue gain, each clamped to the sensor's range.
//! Updates are spaced by the sensor's control delays so that each one sees
//! statistics captured with the previous settings.

use super::{
    isp::{AeStatistics, IspParams, MODULE_AEC},
    ActionSender, IpaAction, IpaBuffer, IpaEvent, IpaInterface, IpaStream, SensorInfo,
    SENSOR_ENTITY,
};
use crate::{
    buffer::{MappedBuffer, Plane},
    controls::{cid, ids, ControlInfo, ControlInfoMap, ControlList},
    error::{HalError, Result},
    frames::FrameId,
    request::StreamId,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, trace};

/// ISP hardware revision supported by this algorithm.
pub const HW_REVISION_V10: u32 = 10;

/// Target mean luminance of the auto exposure grid.
pub const TARGET_MEAN: u32 = 60;

/// Regional means at or below this value are treated as noise.
pub const NOISE_FLOOR: u8 = 15;

/// Maximum relative error at which exposure is reported as locked.
pub const LOCK_TOLERANCE: f64 = 0.05;

/// Mean of the regions above the noise floor. A grid with no usable region
/// is reported just above the floor so the loop keeps raising exposure.
pub fn mean_luminance(exp_mean: &[u8]) -> u32 {
    let (sum, count) = exp_mean
        .iter()
        .filter(|&&v| v > NOISE_FLOOR)
        .fold((0u32, 0u32), |(sum, count), &v| (sum + v as u32, count + 1));

    if count == 0 {
        NOISE_FLOOR as u32 + 1
    } else {
        sum / count
    }
}

/// Correction factor towards [`TARGET_MEAN`] for the given grid.
pub fn exposure_factor(exp_mean: &[u8]) -> f64 {
    TARGET_MEAN as f64 / mean_luminance(exp_mean) as f64
}

struct MappedIpaBuffer {
    memory: MappedBuffer,
    _planes: Vec<Plane>,
}

pub struct AutoExposureIpa {
    actions: ActionSender,
    buffers: HashMap<u32, MappedIpaBuffer>,
    sensor_controls: ControlInfoMap,
    auto_exposure: bool,
    interval: u32,
    exposure: u32,
    min_exposure: u32,
    max_exposure: u32,
    gain: u32,
    min_gain: u32,
    max_gain: u32,
}

fn range(info: &ControlInfo) -> (u32, u32) {
    let min = info.min().as_i32().unwrap_or(1).max(1) as u32;
    let max = info.max().as_i32().unwrap_or(0).max(0) as u32;
    (min, max.max(min))
}

impl AutoExposureIpa {
    pub fn new(actions: ActionSender) -> Self {
        Self {
            actions,
            buffers: HashMap::new(),
            sensor_controls: ControlInfoMap::new(),
            auto_exposure: true,
            interval: 1,
            exposure: 0,
            min_exposure: 0,
            max_exposure: 0,
            gain: 0,
            min_gain: 0,
            max_gain: 0,
        }
    }

    pub fn exposure(&self) -> u32 {
        self.exposure
    }

    pub fn gain(&self) -> u32 {
        self.gain
    }

    pub fn is_auto_exposure_enabled(&self) -> bool {
        self.auto_exposure
    }

    fn fatal(&self, reason: String) {
        error!("{reason}");
        self.actions.send(IpaAction::Fatal { reason });
    }

    fn queue_request(&mut self, frame: FrameId, buffer_id: u32, controls: &ControlList) {
        let mut params = IspParams::default();
        if let Some(enable) = controls.get(ids::AE_ENABLE).and_then(|v| v.as_bool()) {
            self.auto_exposure = enable;
            params.module_en_update = MODULE_AEC;
            if enable {
                params.module_ens = MODULE_AEC;
            }
            debug!(frame, enable, "auto exposure toggled");
        }

        let Some(buffer) = self.buffers.get_mut(&buffer_id) else {
            return self.fatal(format!("parameter buffer {buffer_id} is not mapped"));
        };
        if !params.write_to(buffer.memory.as_slice_mut()) {
            return self.fatal(format!("parameter buffer {buffer_id} is too small"));
        }

        self.actions.send(IpaAction::ParamsFilled { frame });
    }

    fn update_statistics(&mut self, frame: FrameId, buffer_id: u32) {
        let Some(buffer) = self.buffers.get(&buffer_id) else {
            return self.fatal(format!("statistics buffer {buffer_id} is not mapped"));
        };
        let Some(stats) = AeStatistics::read_from(buffer.memory.as_slice()) else {
            return self.fatal(format!("statistics buffer {buffer_id} is too small"));
        };

        let mut metadata = ControlList::new();
        if stats.has_auto_exposure() {
            let factor = exposure_factor(&stats.exp_mean);

            if self.auto_exposure && frame % u64::from(self.interval) == 0 {
                self.apply_factor(factor);
                trace!(frame, factor, exposure = self.exposure, gain = self.gain, "ae update");
                self.set_controls(frame + 1);
            }

            metadata.set(ids::AE_LOCKED, (factor - 1.0).abs() < LOCK_TOLERANCE);
        }
        metadata.set(ids::EXPOSURE_TIME, self.exposure as i32);
        metadata.set(ids::ANALOGUE_GAIN, self.gain as i32);

        self.actions
            .send(IpaAction::MetadataReady { frame, metadata });
    }

    fn apply_factor(&mut self, factor: f64) {
        let total = factor * self.exposure as f64 * self.gain as f64 / self.min_gain as f64;
        self.exposure = (total as u64).clamp(self.min_exposure as u64, self.max_exposure as u64) as u32;

        let residual = total / self.exposure as f64 * self.min_gain as f64;
        self.gain = (residual as u64).clamp(self.min_gain as u64, self.max_gain as u64) as u32;
    }

    fn set_controls(&self, frame: FrameId) {
        let mut controls = ControlList::new();
        controls.set(cid::EXPOSURE, self.exposure as i32);
        controls.set(cid::ANALOGUE_GAIN, self.gain as i32);
        self.actions
            .send(IpaAction::SetSensorControls { frame, controls });
    }
}

impl IpaInterface for AutoExposureIpa {
    fn init(&mut self, hw_revision: u32) -> Result<()> {
        if hw_revision != HW_REVISION_V10 {
            error!(hw_revision, "hardware revision is not supported");
            return Err(HalError::Configuration(format!(
                "ISP hardware revision {hw_revision} is not supported"
            )));
        }
        debug!(hw_revision, "auto exposure initialized");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.sensor_controls.is_empty() {
            return Err(HalError::Configuration(
                "auto exposure started before configure".into(),
            ));
        }
        self.set_controls(0);
        Ok(())
    }

    fn stop(&mut self) {
        debug!("auto exposure stopped");
    }

    fn configure(
        &mut self,
        sensor: &SensorInfo,
        _streams: &BTreeMap<StreamId, IpaStream>,
        entity_controls: &BTreeMap<u32, ControlInfoMap>,
    ) -> Result<()> {
        let ctrls = entity_controls.get(&SENSOR_ENTITY).ok_or_else(|| {
            HalError::InvalidArgument("no sensor control capabilities".into())
        })?;

        let Some(exposure) = ctrls.get(cid::EXPOSURE) else {
            error!("can't find exposure control");
            return Err(HalError::InvalidArgument("sensor has no exposure control".into()));
        };
        let Some(gain) = ctrls.get(cid::ANALOGUE_GAIN) else {
            error!("can't find gain control");
            return Err(HalError::InvalidArgument("sensor has no analogue gain control".into()));
        };

        (self.min_exposure, self.max_exposure) = range(exposure);
        (self.min_gain, self.max_gain) = range(gain);
        self.exposure = self.min_exposure;
        self.gain = self.min_gain;
        self.auto_exposure = true;
        self.interval = sensor.delays.update_interval().max(1);
        self.sensor_controls = ctrls.clone();

        info!(
            sensor = %sensor.model,
            "exposure: {}-{} gain: {}-{} update every {} frames",
            self.min_exposure,
            self.max_exposure,
            self.min_gain,
            self.max_gain,
            self.interval
        );
        Ok(())
    }

    fn map_buffers(&mut self, buffers: Vec<IpaBuffer>) -> Result<()> {
        for buffer in buffers {
            let memory = match buffer.planes.first().map(Plane::map) {
                Some(Ok(memory)) => memory,
                Some(Err(e)) => {
                    error!(id = buffer.id, "failed to mmap buffer: {e}");
                    return Err(HalError::HardwareFatal(format!(
                        "failed to map buffer {}: {e}",
                        buffer.id
                    )));
                }
                None => {
                    return Err(HalError::HardwareFatal(format!(
                        "buffer {} has no planes",
                        buffer.id
                    )))
                }
            };
            trace!(id = buffer.id, len = memory.len(), "mapped buffer");
            self.buffers.insert(
                buffer.id,
                MappedIpaBuffer {
                    memory,
                    _planes: buffer.planes,
                },
            );
        }
        Ok(())
    }

    fn unmap_buffers(&mut self, ids: &[u32]) {
        for id in ids {
            if self.buffers.remove(id).is_some() {
                trace!(id, "unmapped buffer");
            }
        }
    }

    fn process_event(&mut self, event: IpaEvent) {
        match event {
            IpaEvent::QueueRequest {
                frame,
                buffer_id,
                controls,
            } => self.queue_request(frame, buffer_id, &controls),
            IpaEvent::StatBufferReady { frame, buffer_id } => {
                self.update_statistics(frame, buffer_id)
            }
        }
    }
}
