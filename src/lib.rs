// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # Camera Capture Library
//!
//! Zero-copy capture from MIPI CSI-2 and UVC cameras on Linux. Frames are
//! written by the capture hardware straight into physically contiguous DMA
//! buffers that the CPU reads through a cached mapping.
//!
//! ## Modules
//!
//! - [`buffer`]: physical buffer allocation from DMA heaps, with export
//!   handles and cache maintenance.
//! - [`media`]: media controller discovery of the sensor to capture-unit
//!   chain, link setup and pad format propagation.
//! - [`capture`]: the V4L2 capture queue state machine over
//!   [`buffer::PhysicalBuffer`]s.
//! - [`camera`]: the orchestrator bringing a camera source from cold to
//!   streaming.
//!
//! ## Example
//!
//! ```no_run
//! use camera_capture::{
//!     camera::{Camera, LinuxBackend},
//!     config::CameraConfig,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CameraConfig::default();
//! let mut cam = Camera::new(LinuxBackend::new(config.heap)?, config)?;
//! cam.start()?;
//!
//! for _ in 0..10 {
//!     let frame = cam.capture_image()?;
//!     println!("{}x{} frame, {} bytes", frame.width(), frame.height(), frame.bytes_used());
//!     cam.release_frame()?;
//! }
//!
//! cam.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: V4L2 with `DMABUF` import, the media controller API and DMA
//!   heaps (`/dev/dma_heap`)
//! - **Physical addresses**: reported only by kernels carrying the
//!   `DMA_BUF_IOCTL_PHYS` extension
//!
//! ## Safety
//!
//! Kernel interfaces are reached through `unsafe` ioctl and mmap calls,
//! confined to [`sys`], [`buffer`], [`v4l2`] and the media device, behind
//! safe APIs.

pub mod buffer;
pub mod camera;
pub mod capture;
pub mod config;
pub mod error;
pub mod format;
pub mod media;
pub mod sys;
pub mod v4l2;
