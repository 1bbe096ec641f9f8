// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    buffer::HeapType,
    error::{Error, Result},
    format::{BusFormatTable, FourCC, YUYV},
    media::EntityPatterns,
};

/// Camera inputs of the board.
///
/// Internal MIPI cameras sit behind a capture unit (CRU) whose media graph
/// must be configured; external UVC cameras are used as enumerated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum CameraSource {
    #[default]
    Cru0,
    Cru1,
    Cru2,
    Cru3,
    Uvc0,
    Uvc1,
}

impl CameraSource {
    /// Index of the source's `/dev/mediaN` node.
    pub fn media_index(self) -> u32 {
        match self {
            CameraSource::Cru0 => 0,
            CameraSource::Cru1 => 1,
            CameraSource::Cru2 => 2,
            CameraSource::Cru3 => 3,
            CameraSource::Uvc0 => 4,
            CameraSource::Uvc1 => 5,
        }
    }

    /// Whether the source needs its media graph configured.
    pub fn is_internal(self) -> bool {
        self.media_index() < CameraSource::Uvc0.media_index()
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CameraSource::Cru0 => write!(f, "CRU0"),
            CameraSource::Cru1 => write!(f, "CRU1"),
            CameraSource::Cru2 => write!(f, "CRU2"),
            CameraSource::Cru3 => write!(f, "CRU3"),
            CameraSource::Uvc0 => write!(f, "UVC0"),
            CameraSource::Uvc1 => write!(f, "UVC1"),
        }
    }
}

/// Capture pipeline configuration.
///
/// Every field has a default, so a JSON file only needs the values it
/// changes:
///
/// ```json
/// {
///     "source": "CRU1",
///     "width": 1280,
///     "height": 720,
///     "frame_timeout_ms": 2000,
///     "entity_patterns": { "sensor": "imx462" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraConfig {
    pub source: CameraSource,
    pub width: u32,
    pub height: u32,
    pub pixel_format: FourCC,
    pub buffer_count: u32,
    /// Requested frame interval as `[numerator, denominator]` seconds
    pub frame_interval: Option<(u32, u32)>,
    pub heap: HeapType,
    /// Capture node to use instead of the one found in the media graph
    pub device: Option<PathBuf>,
    pub frame_timeout_ms: Option<u64>,
    /// Fail instead of warning when a pipeline entity is missing
    pub require_complete_pipeline: bool,
    pub entity_patterns: EntityPatterns,
    pub bus_formats: BusFormatTable,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: CameraSource::default(),
            width: 1920,
            height: 1080,
            pixel_format: YUYV,
            buffer_count: 6,
            frame_interval: Some((1, 30)),
            heap: HeapType::default(),
            device: None,
            frame_timeout_ms: None,
            require_complete_pipeline: false,
            entity_patterns: EntityPatterns::default(),
            bus_formats: BusFormatTable::default(),
        }
    }
}

impl CameraConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values the pipeline cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "invalid capture size {}x{}",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(Error::Config("buffer_count must be at least 1".to_string()));
        }
        if self.pixel_format.image_size(self.width, self.height).is_none() {
            return Err(Error::Config(format!(
                "unsupported pixel format {}",
                self.pixel_format
            )));
        }
        if matches!(self.frame_interval, Some((_, 0)) | Some((0, _))) {
            return Err(Error::Config("frame interval terms must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        self.frame_timeout_ms.map(Duration::from_millis)
    }
}
