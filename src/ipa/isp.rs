// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Memory layout of the ISP parameter and statistics buffers.
//!
//! All fields are little endian.
//!
//! Parameters: `module_en_update: u32` at 0, `module_ens: u32` at 4.
//!
//! Statistics: `meas_type: u32` at 0, followed by the 5x5 grid of auto
//! exposure luminance means, one byte per region, row major.

/// Size of a parameter buffer in bytes.
pub const PARAMS_SIZE: usize = 64;

/// Size of a statistics buffer in bytes.
pub const STATS_SIZE: usize = 64;

/// Auto exposure control module enable bit.
pub const MODULE_AEC: u32 = 1 << 5;

/// `meas_type` bit set when auto exposure means are present.
pub const STAT_AUTOEXP: u32 = 1 << 0;

/// Number of auto exposure measurement regions.
pub const AE_MEAN_MAX: usize = 25;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IspParams {
    pub module_en_update: u32,
    pub module_ens: u32,
}

impl IspParams {
    /// Writes the parameters to `buf`, clearing the rest of it. Returns false
    /// if `buf` is too small.
    pub fn write_to(&self, buf: &mut [u8]) -> bool {
        if buf.len() < 8 {
            return false;
        }
        buf.fill(0);
        buf[0..4].copy_from_slice(&self.module_en_update.to_le_bytes());
        buf[4..8].copy_from_slice(&self.module_ens.to_le_bytes());
        true
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        Some(Self {
            module_en_update: u32::from_le_bytes(buf.get(0..4)?.try_into().ok()?),
            module_ens: u32::from_le_bytes(buf.get(4..8)?.try_into().ok()?),
        })
    }

    pub fn aec_enabled(&self) -> Option<bool> {
        (self.module_en_update & MODULE_AEC != 0).then_some(self.module_ens & MODULE_AEC != 0)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AeStatistics {
    pub meas_type: u32,
    pub exp_mean: [u8; AE_MEAN_MAX],
}

impl AeStatistics {
    pub fn with_means(exp_mean: [u8; AE_MEAN_MAX]) -> Self {
        Self {
            meas_type: STAT_AUTOEXP,
            exp_mean,
        }
    }

    pub fn has_auto_exposure(&self) -> bool {
        self.meas_type & STAT_AUTOEXP != 0
    }

    pub fn write_to(&self, buf: &mut [u8]) -> bool {
        if buf.len() < 4 + AE_MEAN_MAX {
            return false;
        }
        buf[0..4].copy_from_slice(&self.meas_type.to_le_bytes());
        buf[4..4 + AE_MEAN_MAX].copy_from_slice(&self.exp_mean);
        true
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        Some(Self {
            meas_type: u32::from_le_bytes(buf.get(0..4)?.try_into().ok()?),
            exp_mean: buf.get(4..4 + AE_MEAN_MAX)?.try_into().ok()?,
        })
    }
}
