// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use camera_capture::{
    buffer::HeapType,
    config::{CameraConfig, CameraSource},
    error::Result,
    format::FourCC,
};
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the capture demo.
///
/// Every option can also be given through the environment variable named
/// next to it. Options left unset keep the value from `--config`, or the
/// built-in default when no file is given.
///
/// # Example
///
/// ```bash
/// # Via command line
/// camera-capture --source cru1 --camera-size "1280 720" --frames 100
///
/// # Via environment variables
/// export CAMERA_SOURCE=uvc0
/// export CAMERA_SIZE="640 480"
/// camera-capture
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON pipeline configuration file
    #[arg(short, long, env = "CAMERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Camera source
    #[arg(short, long, env = "CAMERA_SOURCE", value_enum)]
    pub source: Option<CameraSource>,

    /// Camera capture resolution in pixels (width height)
    #[arg(long, env = "CAMERA_SIZE", value_delimiter = ' ', num_args = 2)]
    pub camera_size: Option<Vec<u32>>,

    /// Capture pixel format as a fourcc (e.g. YUYV)
    #[arg(long, env = "CAMERA_FORMAT")]
    pub format: Option<FourCC>,

    /// Capture device path, bypassing the media graph lookup
    #[arg(short, long, env = "CAMERA")]
    pub device: Option<PathBuf>,

    /// Number of capture buffers
    #[arg(short, long, env = "CAMERA_BUFFERS")]
    pub buffers: Option<u32>,

    /// DMA heap for capture buffers
    #[arg(long, env = "DMA_HEAP", value_enum)]
    pub heap: Option<HeapType>,

    /// Frame timeout in milliseconds
    #[arg(long, env = "FRAME_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Fail when an entity of the MIPI pipeline is missing
    #[arg(long, env = "STRICT_PIPELINE")]
    pub strict: bool,

    /// Stop after this many frames, runs until interrupted when unset
    #[arg(short, long)]
    pub frames: Option<u64>,

    /// Verbose logging
    #[arg(short, long, env = "VERBOSE")]
    pub verbose: bool,

    /// Log to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    /// Loads the configuration file, if any, and applies the command-line
    /// overrides on top of it.
    pub fn camera_config(&self) -> Result<CameraConfig> {
        let mut config = match &self.config {
            Some(path) => CameraConfig::from_file(path)?,
            None => CameraConfig::default(),
        };

        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(size) = &self.camera_size {
            config.width = size[0];
            config.height = size[1];
        }
        if let Some(format) = self.format {
            config.pixel_format = format;
        }
        if let Some(device) = &self.device {
            config.device = Some(device.clone());
        }
        if let Some(buffers) = self.buffers {
            config.buffer_count = buffers;
        }
        if let Some(heap) = self.heap {
            config.heap = heap;
        }
        if let Some(timeout) = self.timeout {
            config.frame_timeout_ms = Some(timeout);
        }
        if self.strict {
            config.require_complete_pipeline = true;
        }

        config.validate()?;
        Ok(config)
    }
}
