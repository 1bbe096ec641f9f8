// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use nix::errno::Errno;
use std::{
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsRawFd, BorrowedFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};
use unix_ts::Timestamp;

use crate::{
    capture::{poll_timeout, CaptureFormat, DequeuedBuffer, Readiness, StopHandle, VideoDevice},
    error::{Error, Result},
    format::FourCC,
    sys::{self, V4l2Buffer, V4l2Capability, V4l2Format, V4l2RequestBuffers, V4l2Streamparm},
};

/// V4L2 video capture node (`/dev/videoN`) using imported dma-buf memory.
#[derive(Debug)]
pub struct V4l2Device {
    file: File,
    path: PathBuf,
    driver: String,
    card: String,
}

impl V4l2Device {
    /// Opens `path` and checks it is a streaming video capture device.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| Error::device("video device open", e))?;

        let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
        let fd = file.as_raw_fd();
        sys::retry(|| unsafe { sys::vidioc_querycap(fd, &mut cap) })
            .map_err(|e| Error::device("VIDIOC_QUERYCAP", e))?;

        let caps = if cap.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        let required = sys::V4L2_CAP_VIDEO_CAPTURE | sys::V4L2_CAP_STREAMING;
        if caps & required != required {
            return Err(Error::Config(format!(
                "{} is not a streaming capture device (caps {:#010x})",
                path.display(),
                caps
            )));
        }

        let dev = Self {
            driver: sys::c_str(&cap.driver),
            card: sys::c_str(&cap.card),
            file,
            path,
        };
        debug!("opened {} ({} / {})", dev.path.display(), dev.driver, dev.card);
        Ok(dev)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    fn fd(&self) -> libc::c_int {
        self.file.as_raw_fd()
    }
}

impl VideoDevice for V4l2Device {
    fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<CaptureFormat> {
        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        fmt.fmt.pix.width = width;
        fmt.fmt.pix.height = height;
        fmt.fmt.pix.pixelformat = fourcc.into();
        fmt.fmt.pix.field = sys::V4L2_FIELD_NONE;

        let fd = self.fd();
        sys::retry(|| unsafe { sys::vidioc_s_fmt(fd, &mut fmt) })
            .map_err(|e| Error::device("VIDIOC_S_FMT", e))?;

        let pix = unsafe { fmt.fmt.pix };
        Ok(CaptureFormat {
            width: pix.width,
            height: pix.height,
            fourcc: FourCC::from(pix.pixelformat),
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        })
    }

    fn set_frame_interval(&mut self, numerator: u32, denominator: u32) -> Result<()> {
        let mut parm: V4l2Streamparm = unsafe { std::mem::zeroed() };
        parm.type_ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
        parm.parm.capture.timeperframe.numerator = numerator;
        parm.parm.capture.timeperframe.denominator = denominator;

        let fd = self.fd();
        sys::retry(|| unsafe { sys::vidioc_s_parm(fd, &mut parm) })
            .map_err(|e| Error::device("VIDIOC_S_PARM", e))?;

        let tpf = unsafe { parm.parm.capture.timeperframe };
        if tpf.numerator != numerator || tpf.denominator != denominator {
            debug!(
                "frame interval {}/{} adjusted to {}/{}",
                numerator, denominator, tpf.numerator, tpf.denominator
            );
        }
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let mut req = V4l2RequestBuffers {
            count,
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: sys::V4L2_MEMORY_DMABUF,
            ..Default::default()
        };

        let fd = self.fd();
        match sys::retry(|| unsafe { sys::vidioc_reqbufs(fd, &mut req) }) {
            Ok(_) => Ok(req.count),
            Err(Errno::ENOMEM) => Err(Error::ResourceExhausted(format!(
                "{} cannot provide {} buffers",
                self.path.display(),
                count
            ))),
            Err(e) => Err(Error::device("VIDIOC_REQBUFS", e)),
        }
    }

    fn queue_buffer(&mut self, index: u32, fd: BorrowedFd<'_>, length: u32) -> Result<()> {
        let mut buf = V4l2Buffer::dmabuf(index);
        buf.m.fd = fd.as_raw_fd();
        buf.length = length;
        buf.field = sys::V4L2_FIELD_NONE;

        let dev = self.fd();
        sys::retry(|| unsafe { sys::vidioc_qbuf(dev, &mut buf) })
            .map_err(|e| Error::device("VIDIOC_QBUF", e))?;
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer> {
        let mut buf = V4l2Buffer::dmabuf(0);

        let fd = self.fd();
        sys::retry(|| unsafe { sys::vidioc_dqbuf(fd, &mut buf) })
            .map_err(|e| Error::device("VIDIOC_DQBUF", e))?;

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp: Timestamp::new(
                buf.timestamp.tv_sec as i64,
                buf.timestamp.tv_usec as u32 * 1000,
            ),
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let kind = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        let fd = self.fd();
        sys::retry(|| unsafe { sys::vidioc_streamon(fd, &kind) })
            .map_err(|e| Error::device("VIDIOC_STREAMON", e))?;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let kind = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        let fd = self.fd();
        sys::retry(|| unsafe { sys::vidioc_streamoff(fd, &kind) })
            .map_err(|e| Error::device("VIDIOC_STREAMOFF", e))?;
        Ok(())
    }

    fn wait(&mut self, stop: &StopHandle, timeout: Option<Duration>) -> io::Result<Readiness> {
        if stop.is_stopped() {
            return Ok(Readiness::Stopped);
        }

        let mut fds = [
            libc::pollfd {
                fd: self.fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: stop.fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let timeout = match timeout {
            Some(t) => poll_timeout(t),
            None => -1,
        };

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if fds[1].revents != 0 || stop.is_stopped() {
            return Ok(Readiness::Stopped);
        }
        if ret == 0 {
            return Ok(Readiness::TimedOut);
        }
        if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            warn!("{} poll revents {:#x}", self.path.display(), fds[0].revents);
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(Readiness::Ready)
    }
}
