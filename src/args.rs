// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_isp::config::PipelineConfig;
use std::path::PathBuf;

/// Command-line arguments for the EdgeFirst ISP pipeline.
///
/// By default the pipeline runs against the virtual sensor and ISP, which
/// renders a uniformly lit scene so the auto exposure loop can be observed
/// without hardware. Arguments can be specified via command line or
/// environment variables.
///
/// # Example
///
/// ```bash
/// # Run 60 frames of a dark scene
/// edgefirst-isp --frames 60 --reflectance 0.05
///
/// # List the controls of a real sensor sub-device
/// edgefirst-isp --list-controls --device /dev/v4l-subdev2
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// V4L2 sensor sub-device used by --list-controls
    #[arg(short, long, env = "DEVICE", default_value = "/dev/v4l-subdev0")]
    pub device: PathBuf,

    /// Print the controls of --device and exit
    #[arg(long)]
    pub list_controls: bool,

    /// Sensor model, selects the sensor control delays
    #[arg(long, env = "SENSOR_MODEL", default_value = "imx477")]
    pub sensor_model: String,

    /// ISP hardware revision
    #[arg(long, env = "HW_REVISION", default_value = "10")]
    pub hw_revision: u32,

    /// Number of parameter and statistics buffers
    #[arg(long, env = "BUFFER_COUNT", default_value = "4")]
    pub buffer_count: usize,

    /// Capture resolution in pixels (width height)
    #[arg(
        long,
        env = "CAMERA_SIZE",
        default_value = "1920 1080",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub camera_size: Vec<u32>,

    /// Number of frames to capture before exiting
    #[arg(short, long, env = "FRAMES", default_value = "30")]
    pub frames: usize,

    /// Reflectance of the simulated scene
    #[arg(long, env = "REFLECTANCE", default_value = "0.25")]
    pub reflectance: f64,

    /// Path to the camera HAL configuration JSON file
    #[arg(long, env = "HAL_CONFIG")]
    pub hal_config: Option<PathBuf>,

    /// Camera id to look up in the HAL configuration
    #[arg(long, env = "CAMERA_ID", default_value = "virtual0")]
    pub camera_id: String,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            sensor_model: self.sensor_model.clone(),
            hw_revision: self.hw_revision,
            buffer_count: self.buffer_count,
            width: self.camera_size.first().copied().unwrap_or(defaults.width),
            height: self.camera_size.get(1).copied().unwrap_or(defaults.height),
        }
    }
}
