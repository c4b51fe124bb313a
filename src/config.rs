// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pipeline settings and the per-camera HAL configuration file.

use crate::{
    error::{HalError, Result},
    ipa::auto_exposure::HW_REVISION_V10,
    pipeline::StreamConfiguration,
    request::StreamId,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, io, path::Path};
use tracing::{debug, error, info};

/// Settings of one camera pipeline instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sensor_model: String,
    pub hw_revision: u32,
    /// Depth of the parameter and statistics buffer pools.
    pub buffer_count: usize,
    pub width: u32,
    pub height: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sensor_model: "imx477".into(),
            hw_revision: HW_REVISION_V10,
            buffer_count: 4,
            width: 1920,
            height: 1080,
        }
    }
}

impl PipelineConfig {
    pub fn stream_configuration(&self) -> StreamConfiguration {
        StreamConfiguration {
            stream: StreamId::RAW,
            width: self.width,
            height: self.height,
            buffer_count: self.buffer_count,
        }
    }
}

/// Which way a camera faces.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
    External,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfigData {
    #[serde(alias = "location")]
    pub facing: Facing,
    /// Clockwise mounting rotation in degrees.
    pub rotation: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HalConfigFile {
    cameras: BTreeMap<String, CameraConfigData>,
}

/// Static properties of the cameras of a device, keyed by camera id.
///
/// ```json
/// {
///   "cameras": {
///     "platform/csi0": { "facing": "back", "rotation": 0 },
///     "usb-0000:00:14.0-1": { "facing": "external", "rotation": 0 }
///   }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CameraHalConfig {
    exists: bool,
    valid: bool,
    cameras: BTreeMap<String, CameraConfigData>,
}

impl CameraHalConfig {
    /// Loads the configuration at `path`. A missing or unreadable file
    /// yields an empty configuration which reports whether it exists and
    /// whether it is valid.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no camera HAL configuration");
                return Self::default();
            }
            Err(e) => {
                error!(path = %path.display(), "failed to read camera HAL configuration: {e}");
                return Self {
                    exists: true,
                    ..Default::default()
                };
            }
        };

        match Self::parse(&text) {
            Ok(config) => {
                info!(
                    path = %path.display(),
                    cameras = config.cameras.len(),
                    "loaded camera HAL configuration"
                );
                config
            }
            Err(e) => {
                error!(path = %path.display(), "invalid camera HAL configuration: {e}");
                Self {
                    exists: true,
                    ..Default::default()
                }
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: HalConfigFile =
            serde_json::from_str(text).map_err(|e| HalError::Configuration(e.to_string()))?;

        for (id, camera) in &file.cameras {
            if !matches!(camera.rotation, 0 | 90 | 180 | 270) {
                return Err(HalError::Configuration(format!(
                    "camera {id}: unsupported rotation {}",
                    camera.rotation
                )));
            }
        }

        Ok(Self {
            exists: true,
            valid: true,
            cameras: file.cameras,
        })
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn camera_config_data(&self, camera_id: &str) -> Option<&CameraConfigData> {
        self.cameras.get(camera_id)
    }
}
