// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error types for the capture pipeline.

use crate::{capture::CaptureState, media::EntityRole};
use std::{fmt, io, path::PathBuf};

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the allocator, the media graph, the capture device and
/// the camera pipeline.
#[derive(Debug)]
pub enum Error {
    /// A device control call (ioctl, open, poll) failed for a reason other
    /// than interruption
    Device {
        /// Name of the failing operation, e.g. `VIDIOC_S_FMT`
        op: &'static str,
        source: io::Error,
    },
    /// Physical memory or kernel buffer slots could not be allocated
    ResourceExhausted(String),
    /// A pipeline role expected by the configuration was not discovered
    MissingEntity(EntityRole),
    /// No capture device node could be resolved for the camera source
    DeviceNotFound(PathBuf),
    /// The capture device was driven out of its lifecycle order
    InvalidState {
        expected: CaptureState,
        actual: CaptureState,
    },
    /// A frame is still dequeued and must be released first
    FrameOutstanding(u32),
    /// No buffer is queued with the driver so no frame can arrive
    NoQueuedBuffer,
    /// There is no dequeued frame to release
    NoActiveFrame,
    /// The driver returned a buffer index the queue does not track
    UnexpectedBuffer(u32),
    /// No frame arrived before the configured timeout
    Timeout,
    /// The capture wait was interrupted by a [`crate::capture::StopHandle`]
    Stopped,
    /// Invalid configuration or pipeline plan
    Config(String),
}

impl Error {
    pub fn device(op: &'static str, source: impl Into<io::Error>) -> Self {
        Error::Device {
            op,
            source: source.into(),
        }
    }

    /// Returns true for the clean-stop signal raised during shutdown.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Stopped)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Device { op, source } => write!(f, "{} failed: {}", op, source),
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::MissingEntity(role) => write!(f, "No {} entity in media graph", role),
            Error::DeviceNotFound(path) => {
                write!(f, "No capture device found for {}", path.display())
            }
            Error::InvalidState { expected, actual } => {
                write!(f, "Capture device is {:?}, expected {:?}", actual, expected)
            }
            Error::FrameOutstanding(index) => {
                write!(f, "Frame {} must be released before capturing again", index)
            }
            Error::NoQueuedBuffer => write!(f, "No capture buffer is queued"),
            Error::NoActiveFrame => write!(f, "No frame to release"),
            Error::UnexpectedBuffer(index) => write!(f, "Driver returned unknown buffer {}", index),
            Error::Timeout => write!(f, "Timed out waiting for a frame"),
            Error::Stopped => write!(f, "Capture stopped"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Device { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}
