// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! In-process media controller, capture node and backend used by the
//! integration tests. The capture node keeps the queued dma-buf handles and
//! writes a test pattern through them when a buffer is dequeued, like a
//! capture engine would.

#![allow(dead_code)]

use camera_capture::{
    buffer::{MemoryManager, SharedMemoryManager},
    camera::Backend,
    capture::{self, CaptureFormat, DequeuedBuffer, Readiness, StopHandle, VideoDevice},
    error::{Error, Result},
    format::FourCC,
    media::{EntityInfo, LinkRequest, MediaController, PadFormatRequest},
};
use std::{
    collections::{BTreeMap, VecDeque},
    fs::File,
    io,
    os::{
        fd::{AsRawFd, BorrowedFd, OwnedFd},
        unix::fs::FileExt,
    },
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use unix_ts::Timestamp;

/// Bytes of test pattern written at the start of every captured frame.
pub const PATTERN_LEN: usize = 4096;

pub fn pattern_byte(sequence: u32) -> u8 {
    (sequence % 250) as u8 + 1
}

fn entity(id: u32, name: &str, devnode: Option<&str>) -> EntityInfo {
    EntityInfo {
        id,
        name: name.to_string(),
        devnode: devnode.map(PathBuf::from),
    }
}

/// MIPI camera topology: sensor, optional ISP, CSI-2 receiver and capture
/// unit owning `/dev/video0`.
pub fn mipi_topology(with_isp: bool) -> Vec<EntityInfo> {
    let mut entities = vec![entity(1, "ar1335 0-0036", Some("/dev/v4l-subdev0"))];
    if with_isp {
        entities.push(entity(4, "ap1302.0-003c", Some("/dev/v4l-subdev1")));
    }
    entities.push(entity(7, "csi2-16000400.csi2", Some("/dev/v4l-subdev2")));
    entities.push(entity(10, "cru-ip-16000000.cru0", Some("/dev/v4l-subdev3")));
    entities.push(entity(13, "CRU output", Some("/dev/video0")));
    entities
}

/// Topology of a UVC camera.
pub fn uvc_topology() -> Vec<EntityInfo> {
    vec![
        entity(1, "USB Camera: USB Camera", Some("/dev/video4")),
        entity(3, "USB Camera: USB Camera Meta", Some("/dev/video5")),
        entity(6, "Extension 4", None),
    ]
}

/// Observable state of a [`FakeMedia`].
#[derive(Debug, Default)]
pub struct MediaState {
    /// Links currently enabled
    pub links: Vec<LinkRequest>,
    /// Active format per (entity, pad)
    pub formats: BTreeMap<(String, u32), PadFormatRequest>,
    pub resets: usize,
    pub reject_links: bool,
}

pub struct FakeMedia {
    entities: Vec<EntityInfo>,
    pub state: Arc<Mutex<MediaState>>,
}

impl FakeMedia {
    pub fn new(entities: Vec<EntityInfo>) -> Self {
        Self {
            entities,
            state: Arc::default(),
        }
    }
}

impl MediaController for FakeMedia {
    fn entities(&self) -> &[EntityInfo] {
        &self.entities
    }

    fn reset_links(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.links.clear();
        state.resets += 1;
        Ok(())
    }

    fn setup_link(&mut self, link: &LinkRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.reject_links {
            return Err(Error::device(
                "MEDIA_IOC_SETUP_LINK",
                io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        if !state.links.contains(link) {
            state.links.push(link.clone());
        }
        Ok(())
    }

    fn set_pad_format(&mut self, format: &PadFormatRequest) -> Result<()> {
        // Only subdevice nodes answer VIDIOC_SUBDEV_S_FMT.
        let subdev = self
            .entities
            .iter()
            .find(|entity| entity.name == format.entity)
            .and_then(|entity| entity.devnode.as_ref())
            .is_some_and(|devnode| devnode.to_string_lossy().contains("v4l-subdev"));
        if !subdev {
            return Err(Error::device(
                "VIDIOC_SUBDEV_S_FMT",
                io::Error::from_raw_os_error(libc::ENOTTY),
            ));
        }
        let mut state = self.state.lock().unwrap();
        state
            .formats
            .insert((format.entity.clone(), format.pad), format.clone());
        Ok(())
    }
}

/// Observable state and fault injection of a [`FakeVideo`].
#[derive(Debug, Default)]
pub struct VideoState {
    /// Names of the calls made, in order
    pub calls: Vec<&'static str>,
    pub format: Option<CaptureFormat>,
    /// Highest buffer count the driver grants
    pub max_buffers: Option<u32>,
    pub slots: u32,
    pub queued: VecDeque<(u32, OwnedFd, u32)>,
    pub streaming: bool,
    pub sequence: u32,
    /// Interrupted waits to report before a frame is ready
    pub interrupts: u32,
    /// Waits that wake up early and report a timeout
    pub early_timeouts: u32,
    /// Pixel format the driver substitutes for the requested one
    pub substitute: Option<FourCC>,
    /// Index the driver reports instead of the dequeued one
    pub bogus_index: Option<u32>,
    pub fail_stream_on: bool,
    pub fail_stream_off: bool,
    pub fail_frame_interval: bool,
}

pub struct FakeVideo {
    pub state: Arc<Mutex<VideoState>>,
}

impl FakeVideo {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
        }
    }

    pub fn with_state(state: Arc<Mutex<VideoState>>) -> Self {
        Self { state }
    }
}

fn einval(op: &'static str) -> Error {
    Error::device(op, io::Error::from_raw_os_error(libc::EINVAL))
}

impl VideoDevice for FakeVideo {
    fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<CaptureFormat> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("set_format");
        let fourcc = state.substitute.unwrap_or(fourcc);
        let stride = fourcc.row_stride(width).ok_or_else(|| einval("VIDIOC_S_FMT"))?;
        let format = CaptureFormat {
            width,
            height,
            fourcc,
            bytes_per_line: stride as u32,
            size_image: fourcc.image_size(width, height).unwrap_or(0) as u32,
        };
        state.format = Some(format);
        Ok(format)
    }

    fn set_frame_interval(&mut self, _numerator: u32, _denominator: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("set_frame_interval");
        if state.fail_frame_interval {
            return Err(Error::device(
                "VIDIOC_S_PARM",
                io::Error::from_raw_os_error(libc::ENOTTY),
            ));
        }
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("request_buffers");
        if state.streaming {
            return Err(Error::device(
                "VIDIOC_REQBUFS",
                io::Error::from_raw_os_error(libc::EBUSY),
            ));
        }
        state.queued.clear();
        state.slots = state.max_buffers.map_or(count, |max| count.min(max));
        Ok(state.slots)
    }

    fn queue_buffer(&mut self, index: u32, fd: BorrowedFd<'_>, length: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("queue_buffer");
        if index >= state.slots || state.queued.iter().any(|(i, _, _)| *i == index) {
            return Err(einval("VIDIOC_QBUF"));
        }
        let fd = fd
            .try_clone_to_owned()
            .map_err(|e| Error::device("dup", e))?;
        state.queued.push_back((index, fd, length));
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("dequeue_buffer");
        if !state.streaming {
            return Err(einval("VIDIOC_DQBUF"));
        }
        let (index, fd, length) = state
            .queued
            .pop_front()
            .ok_or_else(|| Error::device("VIDIOC_DQBUF", io::Error::from(io::ErrorKind::WouldBlock)))?;

        let sequence = state.sequence;
        state.sequence += 1;
        let file = File::from(fd);
        let len = PATTERN_LEN.min(length as usize);
        file.write_all_at(&vec![pattern_byte(sequence); len], 0)
            .map_err(|e| Error::device("pattern write", e))?;

        let bytes_used = state
            .format
            .map_or(length, |format| format.size_image.min(length));
        Ok(DequeuedBuffer {
            index: state.bogus_index.unwrap_or(index),
            bytes_used,
            sequence,
            timestamp: Timestamp::new(1_700_000_000 + sequence as i64, 0),
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("stream_on");
        if state.fail_stream_on {
            return Err(Error::device(
                "VIDIOC_STREAMON",
                io::Error::from_raw_os_error(libc::EPIPE),
            ));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("stream_off");
        state.streaming = false;
        state.queued.clear();
        if state.fail_stream_off {
            return Err(einval("VIDIOC_STREAMOFF"));
        }
        Ok(())
    }

    fn wait(&mut self, stop: &StopHandle, timeout: Option<Duration>) -> io::Result<Readiness> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push("wait");
            if stop.is_stopped() {
                return Ok(Readiness::Stopped);
            }
            if state.interrupts > 0 {
                state.interrupts -= 1;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            if state.early_timeouts > 0 {
                state.early_timeouts -= 1;
                return Ok(Readiness::TimedOut);
            }
            if state.streaming && !state.queued.is_empty() {
                return Ok(Readiness::Ready);
            }
        }

        // Nothing will arrive, block on the stop handle only.
        let mut pfd = libc::pollfd {
            fd: stop.fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.map_or(-1, capture::poll_timeout);
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret == 0 {
            return Ok(Readiness::TimedOut);
        }
        Ok(Readiness::Stopped)
    }
}

/// Backend over [`FakeMedia`], [`FakeVideo`] and shared memory.
pub struct FakeBackend {
    /// Topology per media index; a missing index fails to open
    pub topologies: BTreeMap<u32, Vec<EntityInfo>>,
    pub media: Arc<Mutex<MediaState>>,
    pub video: Arc<Mutex<VideoState>>,
    pub memory: Arc<SharedMemoryManager>,
    /// Capture nodes opened, in order
    pub opened: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            topologies: BTreeMap::new(),
            media: Arc::default(),
            video: Arc::default(),
            memory: Arc::new(SharedMemoryManager::new()),
            opened: Arc::default(),
        }
    }

    pub fn with_topology(mut self, index: u32, entities: Vec<EntityInfo>) -> Self {
        self.topologies.insert(index, entities);
        self
    }
}

impl Backend for FakeBackend {
    type Media = FakeMedia;
    type Video = FakeVideo;

    fn open_media(&self, index: u32) -> Result<FakeMedia> {
        let entities = self.topologies.get(&index).cloned().ok_or_else(|| {
            Error::device("media device open", io::Error::from(io::ErrorKind::NotFound))
        })?;
        Ok(FakeMedia {
            entities,
            state: self.media.clone(),
        })
    }

    fn open_video(&self, path: &Path) -> Result<FakeVideo> {
        self.opened.lock().unwrap().push(path.to_path_buf());
        Ok(FakeVideo::with_state(self.video.clone()))
    }

    fn memory(&self) -> Arc<dyn MemoryManager> {
        self.memory.clone()
    }
}
