// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Camera pipeline orchestration.
//!
//! [`Camera::start`] brings a camera source from cold to streaming: it wires
//! the media graph (internal sources only), opens the capture node, agrees
//! on a format, registers the buffer pool and starts the stream. Any failure
//! aborts with a single error and leaves nothing streaming.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, instrument, warn};

use crate::{
    buffer::{DmaHeapManager, HeapType, MemoryManager},
    capture::{CaptureDevice, CaptureOptions, CaptureState, Frame, StopHandle, VideoDevice},
    config::CameraConfig,
    error::{Error, Result},
    media::{
        self, EntityConfig, EntityRole, MediaController, MediaDevice, MediaGraph, PadConfig,
        SubstringMatcher,
    },
    v4l2::V4l2Device,
};

/// Platform services used by [`Camera`].
pub trait Backend {
    type Media: MediaController;
    type Video: VideoDevice;

    fn open_media(&self, index: u32) -> Result<Self::Media>;

    fn open_video(&self, path: &Path) -> Result<Self::Video>;

    fn memory(&self) -> Arc<dyn MemoryManager>;
}

/// Kernel media controller, V4L2 and DMA heap backend.
#[derive(Clone)]
pub struct LinuxBackend {
    memory: Arc<dyn MemoryManager>,
}

impl LinuxBackend {
    pub fn new(heap: HeapType) -> Result<Self> {
        Ok(Self {
            memory: Arc::new(DmaHeapManager::new(heap)?),
        })
    }
}

impl Backend for LinuxBackend {
    type Media = MediaDevice;
    type Video = V4l2Device;

    fn open_media(&self, index: u32) -> Result<MediaDevice> {
        MediaDevice::open_index(index)
    }

    fn open_video(&self, path: &Path) -> Result<V4l2Device> {
        V4l2Device::open(path)
    }

    fn memory(&self) -> Arc<dyn MemoryManager> {
        self.memory.clone()
    }
}

/// Pad plan for the MIPI pipeline: the ISP's source pad feeds the CSI-2
/// receiver's sink pad 0, whose source pad 1 feeds the capture unit, all in
/// `format` at the capture resolution.
pub fn pipeline_plan(width: u32, height: u32, format: &str) -> Vec<EntityConfig> {
    vec![
        EntityConfig {
            role: EntityRole::ImageSignalProcessor,
            sink_pad: PadConfig::default(),
            source_pad: PadConfig::source(0, format, width, height),
        },
        EntityConfig {
            role: EntityRole::BusReceiver,
            sink_pad: PadConfig::sink(0, format, width, height),
            source_pad: PadConfig::source(1, format, width, height),
        },
        EntityConfig {
            role: EntityRole::CaptureSink,
            sink_pad: PadConfig::sink(0, format, width, height),
            source_pad: PadConfig::source(1, format, width, height),
        },
    ]
}

/// A camera source and, once started, its streaming capture device.
pub struct Camera<B: Backend> {
    backend: B,
    config: CameraConfig,
    stop: StopHandle,
    capture: Option<CaptureDevice<B::Video>>,
}

impl<B: Backend> Camera<B> {
    pub fn new(backend: B, config: CameraConfig) -> Result<Self> {
        config.validate()?;
        let stop = StopHandle::new().map_err(|e| Error::device("eventfd", e))?;
        Ok(Self {
            backend,
            config,
            stop,
            capture: None,
        })
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Handle that interrupts [`capture_image`](Self::capture_image) from
    /// another thread. It stays raised until [`stop`](Self::stop).
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.capture
            .as_ref()
            .is_some_and(|capture| capture.state() == CaptureState::Streaming)
    }

    pub fn capture(&self) -> Option<&CaptureDevice<B::Video>> {
        self.capture.as_ref()
    }

    /// Configures the pipeline and starts streaming.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if no capture node is resolved, before
    ///   any format is negotiated
    /// - [`Error::MissingEntity`] for a partial graph when
    ///   `require_complete_pipeline` is set
    /// - any error of graph configuration, format negotiation, buffer
    ///   registration or stream start
    #[instrument(skip(self), fields(source = %self.config.source))]
    pub fn start(&mut self) -> Result<()> {
        if let Some(capture) = &self.capture {
            return Err(Error::InvalidState {
                expected: CaptureState::Closed,
                actual: capture.state(),
            });
        }

        let path = self.prepare_pipeline()?;
        info!("capture device {}", path.display());

        let video = self.backend.open_video(&path)?;
        let options = CaptureOptions {
            frame_interval: self.config.frame_interval,
            frame_timeout: self.config.frame_timeout(),
        };
        let mut capture =
            CaptureDevice::open_with(video, self.backend.memory(), options, self.stop.clone());
        capture.set_format(self.config.width, self.config.height, self.config.pixel_format)?;
        capture.allocate_buffers(self.config.buffer_count)?;
        capture.start_streaming()?;

        self.capture = Some(capture);
        Ok(())
    }

    /// Configures the media graph of internal sources and resolves the
    /// capture node path.
    fn prepare_pipeline(&self) -> Result<PathBuf> {
        let source = self.config.source;
        let index = source.media_index();
        let media_path = PathBuf::from(format!("/dev/media{}", index));

        if !source.is_internal() {
            if let Some(device) = &self.config.device {
                return Ok(device.clone());
            }
            let media = self.backend.open_media(index)?;
            return media::capture_node(media.entities()).ok_or(Error::DeviceNotFound(media_path));
        }

        let media = self.backend.open_media(index)?;
        let matcher = SubstringMatcher::new(self.config.entity_patterns.clone());
        let mut graph = MediaGraph::discover(media, &matcher, self.config.bus_formats.clone());

        let report = graph.report();
        if !report.is_complete() {
            if self.config.require_complete_pipeline {
                report.require_complete()?;
            }
            warn!("partial pipeline, missing {:?}", report.missing);
        }

        let plan = pipeline_plan(
            self.config.width,
            self.config.height,
            &self.config.pixel_format.to_string(),
        );
        let applied = graph.configure(&plan)?;
        info!(
            "media graph configured: {} links, {} pad formats",
            applied.links.len(),
            applied.formats.len()
        );

        match &self.config.device {
            Some(device) => Ok(device.clone()),
            None => graph
                .capture_device_path()
                .ok_or(Error::DeviceNotFound(media_path)),
        }
    }

    fn streaming(&mut self) -> Result<&mut CaptureDevice<B::Video>> {
        self.capture.as_mut().ok_or(Error::InvalidState {
            expected: CaptureState::Streaming,
            actual: CaptureState::Closed,
        })
    }

    /// Blocks until the next frame is captured. The frame must be handed back
    /// with [`release_frame`](Self::release_frame) before the next capture.
    pub fn capture_image(&mut self) -> Result<Frame<'_>> {
        self.streaming()?.capture_frame()
    }

    pub fn release_frame(&mut self) -> Result<()> {
        self.streaming()?.release_frame()
    }

    /// Stops streaming, closes the capture device and lowers the stop
    /// handle so the camera can be started again.
    pub fn stop(&mut self) -> Result<()> {
        let res = match self.capture.take() {
            Some(mut capture) => {
                let res = capture.stop_streaming();
                capture.close();
                res
            }
            None => Ok(()),
        };
        self.stop.reset();
        res
    }
}
