// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-sensor knowledge needed by the control algorithms.

/// Number of frames after which a control written to the sensor takes
/// effect.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SensorDelays {
    pub exposure: u32,
    pub gain: u32,
    pub vblank: u32,
}

impl Default for SensorDelays {
    fn default() -> Self {
        Self {
            exposure: 2,
            gain: 1,
            vblank: 2,
        }
    }
}

impl SensorDelays {
    /// Frames between two algorithm updates, so that every update observes
    /// statistics produced with the previous settings.
    pub fn update_interval(&self) -> u32 {
        self.exposure.max(self.gain) + 1
    }
}

pub trait CamHelper: Send {
    fn model(&self) -> &'static str;

    /// Converts an analogue gain multiplier to the sensor's register code.
    fn gain_code(&self, gain: f64) -> u32;

    /// Converts a register code back to an analogue gain multiplier.
    fn gain(&self, gain_code: u32) -> f64;

    fn delays(&self) -> SensorDelays {
        SensorDelays::default()
    }
}

/// Sony IMX477.
#[derive(Debug, Default)]
pub struct Imx477Helper;

impl CamHelper for Imx477Helper {
    fn model(&self) -> &'static str {
        "imx477"
    }

    fn gain_code(&self, gain: f64) -> u32 {
        if gain <= 0.0 {
            return 0;
        }
        (1024.0 - 1024.0 / gain).max(0.0) as u32
    }

    fn gain(&self, gain_code: u32) -> f64 {
        1024.0 / (1024 - gain_code.min(1023)) as f64
    }

    fn delays(&self) -> SensorDelays {
        SensorDelays {
            exposure: 2,
            gain: 2,
            vblank: 3,
        }
    }
}

/// Helper for the sensor called `model`, if one is known.
pub fn cam_helper_for(model: &str) -> Option<Box<dyn CamHelper>> {
    match model {
        "imx477" => Some(Box::new(Imx477Helper)),
        _ => None,
    }
}
