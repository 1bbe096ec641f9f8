// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture queue state machine.
//!
//! [`CaptureDevice`] drives one capture node through its lifecycle
//!
//! ```text
//! Closed -> Opened -> FormatNegotiated -> BuffersRegistered -> Streaming
//!             ^                                                   |
//!             +------------------------ stop ---------------------+
//! ```
//!
//! and exchanges [`PhysicalBuffer`]s with the driver. Each buffer slot is
//! either queued with the driver or dequeued by the caller, and at most one
//! slot is dequeued at a time: [`CaptureDevice::capture_frame`] must be
//! followed by [`CaptureDevice::release_frame`] before the next capture.
//!
//! # Example
//!
//! ```no_run
//! use camera_capture::{
//!     buffer::{DmaHeapManager, HeapType, MemoryManager},
//!     capture::{CaptureDevice, CaptureOptions},
//!     format::YUYV,
//!     v4l2::V4l2Device,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let memory: Arc<dyn MemoryManager> = Arc::new(DmaHeapManager::new(HeapType::Cma)?);
//! let video = V4l2Device::open("/dev/video0")?;
//! let mut cam = CaptureDevice::open(video, memory, CaptureOptions::default())?;
//! cam.set_format(1920, 1080, YUYV)?;
//! cam.allocate_buffers(4)?;
//! cam.start_streaming()?;
//!
//! let frame = cam.capture_frame()?;
//! println!("frame {} with {} bytes", frame.sequence(), frame.bytes_used());
//! cam.release_frame()?;
//! # Ok(())
//! # }
//! ```

use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use unix_ts::Timestamp;

use crate::{
    buffer::{MemoryManager, PhysicalBuffer},
    error::{Error, Result},
    format::FourCC,
};

/// Lifecycle state of a [`CaptureDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Closed,
    Opened,
    FormatNegotiated,
    BuffersRegistered,
    Streaming,
}

/// Format accepted by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pub bytes_per_line: u32,
    /// Bytes the driver needs per frame, 0 when it does not say
    pub size_image: u32,
}

/// Metadata of a buffer returned by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Timestamp,
}

/// Result of waiting for the capture node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    Stopped,
}

/// `poll(2)` timeout for `timeout`, rounded up to whole milliseconds so a
/// wait never ends before the duration has elapsed.
pub fn poll_timeout(timeout: Duration) -> libc::c_int {
    timeout
        .as_micros()
        .div_ceil(1000)
        .min(libc::c_int::MAX as u128) as libc::c_int
}

/// Kernel capture node interface.
///
/// Implementations retry calls interrupted by signals, except
/// [`wait`](VideoDevice::wait) which reports them as
/// [`io::ErrorKind::Interrupted`] so the caller can recompute its deadline.
pub trait VideoDevice {
    fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<CaptureFormat>;

    fn set_frame_interval(&mut self, numerator: u32, denominator: u32) -> Result<()>;

    /// Requests `count` imported-memory slots and returns how many the driver
    /// granted. A count of zero releases all slots.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    fn queue_buffer(&mut self, index: u32, fd: BorrowedFd<'_>, length: u32) -> Result<()>;

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;

    /// Blocks until a buffer can be dequeued, `stop` is raised or `timeout`
    /// elapses. `None` waits forever.
    fn wait(&mut self, stop: &StopHandle, timeout: Option<Duration>) -> io::Result<Readiness>;
}

#[derive(Debug)]
struct StopSignal {
    fd: OwnedFd,
    raised: AtomicBool,
}

/// Wakes a capture blocked in [`CaptureDevice::capture_frame`] from another
/// thread. The interrupted capture returns [`Error::Stopped`], and so does
/// every later capture until the handle is [`reset`](StopHandle::reset).
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<StopSignal>);

impl StopHandle {
    pub fn new() -> io::Result<Self> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(Arc::new(StopSignal {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
            raised: AtomicBool::new(false),
        })))
    }

    pub fn stop(&self) {
        self.0.raised.store(true, Ordering::SeqCst);
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.0.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            warn!("stop signal write failed: {}", io::Error::last_os_error());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.0.raised.load(Ordering::SeqCst)
    }

    /// Lowers the handle and drains pending wakeups.
    pub fn reset(&self) {
        self.0.raised.store(false, Ordering::SeqCst);
        let mut count: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.0.fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("stop signal drain failed: {}", err);
            }
        }
    }

    /// Descriptor that becomes readable once [`stop`](Self::stop) is called.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

/// Ownership of a slot's contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the driver
    Queued,
    /// Owned by the caller
    Dequeued,
}

/// One slot of the capture queue.
#[derive(Debug)]
pub struct CaptureBuffer {
    index: u32,
    buffer: Arc<PhysicalBuffer>,
    state: SlotState,
}

impl CaptureBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn buffer(&self) -> &Arc<PhysicalBuffer> {
        &self.buffer
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// Slot states of the capture queue with checked transitions.
#[derive(Debug, Default)]
pub struct BufferRing {
    slots: Vec<CaptureBuffer>,
    active: Option<DequeuedBuffer>,
}

impl BufferRing {
    fn new(buffers: Vec<Arc<PhysicalBuffer>>) -> Self {
        let slots = buffers
            .into_iter()
            .enumerate()
            .map(|(index, buffer)| CaptureBuffer {
                index: index as u32,
                buffer,
                state: SlotState::Queued,
            })
            .collect();
        Self {
            slots,
            active: None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[CaptureBuffer] {
        &self.slots
    }

    pub fn state(&self, index: u32) -> Option<SlotState> {
        self.slots.get(index as usize).map(|slot| slot.state)
    }

    pub fn queued(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Queued)
            .count()
    }

    /// Index of the dequeued slot, if any.
    pub fn active(&self) -> Option<u32> {
        self.active.map(|buf| buf.index)
    }

    fn check_capture(&self) -> Result<()> {
        if let Some(active) = self.active {
            return Err(Error::FrameOutstanding(active.index));
        }
        if self.queued() == 0 {
            return Err(Error::NoQueuedBuffer);
        }
        Ok(())
    }

    fn dequeued(&mut self, buf: DequeuedBuffer) -> Result<&CaptureBuffer> {
        let slot = self
            .slots
            .get_mut(buf.index as usize)
            .filter(|slot| slot.state == SlotState::Queued)
            .ok_or(Error::UnexpectedBuffer(buf.index))?;
        slot.state = SlotState::Dequeued;
        self.active = Some(buf);
        Ok(slot)
    }

    fn is_queued(&self, index: u32) -> bool {
        self.state(index) == Some(SlotState::Queued)
    }

    fn active_slot(&self) -> Result<&CaptureBuffer> {
        let active = self.active.ok_or(Error::NoActiveFrame)?;
        Ok(&self.slots[active.index as usize])
    }

    fn requeued(&mut self) {
        if let Some(active) = self.active.take() {
            self.slots[active.index as usize].state = SlotState::Queued;
        }
    }
}

/// A captured frame, borrowed from the [`CaptureDevice`] until it is
/// released.
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a PhysicalBuffer,
    meta: DequeuedBuffer,
    format: CaptureFormat,
}

impl Frame<'_> {
    pub fn index(&self) -> u32 {
        self.meta.index
    }

    /// The whole capture buffer.
    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// The bytes the driver wrote.
    pub fn payload(&self) -> &[u8] {
        let used = (self.meta.bytes_used as usize).min(self.buffer.size());
        &self.buffer.as_slice()[..used]
    }

    pub fn len(&self) -> usize {
        self.buffer.size()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.size() == 0
    }

    pub fn bytes_used(&self) -> u32 {
        self.meta.bytes_used
    }

    pub fn sequence(&self) -> u32 {
        self.meta.sequence
    }

    pub fn timestamp(&self) -> Timestamp {
        self.meta.timestamp
    }

    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    pub fn format(&self) -> FourCC {
        self.format.fourcc
    }

    pub fn buffer(&self) -> &PhysicalBuffer {
        self.buffer
    }
}

/// Tunables for a [`CaptureDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Frame interval requested after the format, as (numerator, denominator)
    /// seconds. Drivers that do not support it keep their default rate.
    pub frame_interval: Option<(u32, u32)>,
    /// Longest time to wait for a frame, `None` waits forever
    pub frame_timeout: Option<Duration>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            frame_interval: Some((1, 30)),
            frame_timeout: None,
        }
    }
}

/// Owner of a capture node and its buffer queue.
///
/// Not safe for concurrent use; all operations take `&mut self`. Dropping
/// the device stops streaming and releases its buffers.
pub struct CaptureDevice<D: VideoDevice> {
    device: Option<D>,
    memory: Arc<dyn MemoryManager>,
    options: CaptureOptions,
    state: CaptureState,
    format: Option<CaptureFormat>,
    ring: BufferRing,
    stop: StopHandle,
}

impl<D: VideoDevice> CaptureDevice<D> {
    /// Takes ownership of an opened capture node.
    pub fn open(device: D, memory: Arc<dyn MemoryManager>, options: CaptureOptions) -> Result<Self> {
        let stop = StopHandle::new().map_err(|e| Error::device("eventfd", e))?;
        Ok(Self::open_with(device, memory, options, stop))
    }

    /// Like [`open`](Self::open), interrupted by an existing [`StopHandle`].
    pub fn open_with(
        device: D,
        memory: Arc<dyn MemoryManager>,
        options: CaptureOptions,
        stop: StopHandle,
    ) -> Self {
        Self {
            device: Some(device),
            memory,
            options,
            state: CaptureState::Opened,
            format: None,
            ring: BufferRing::default(),
            stop,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn format(&self) -> Option<CaptureFormat> {
        self.format
    }

    pub fn buffers(&self) -> &BufferRing {
        &self.ring
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn require(&self, expected: CaptureState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn dev(&mut self) -> Result<&mut D> {
        let actual = self.state;
        self.device.as_mut().ok_or(Error::InvalidState {
            expected: CaptureState::Opened,
            actual,
        })
    }

    /// Negotiates the capture format, then the frame interval on a best
    /// effort basis.
    ///
    /// # Errors
    ///
    /// Fails if the format cannot be sized, the driver rejects it, or the
    /// driver substitutes another pixel format.
    #[instrument(skip(self))]
    pub fn set_format(&mut self, width: u32, height: u32, fourcc: FourCC) -> Result<CaptureFormat> {
        self.require(CaptureState::Opened)?;
        let min_size = fourcc
            .image_size(width, height)
            .ok_or_else(|| Error::Config(format!("unsupported capture format {}", fourcc)))?;

        let mut format = self.dev()?.set_format(width, height, fourcc)?;
        if format.fourcc != fourcc {
            return Err(Error::Config(format!(
                "driver selected {} instead of {}",
                format.fourcc, fourcc
            )));
        }
        if format.width != width || format.height != height {
            warn!(
                "requested {}x{} but driver set {}x{}",
                width, height, format.width, format.height
            );
        }
        let driver_min = fourcc
            .image_size(format.width, format.height)
            .unwrap_or(min_size);
        format.size_image = format.size_image.max(driver_min as u32);

        if let Some((numerator, denominator)) = self.options.frame_interval {
            if let Err(e) = self.dev()?.set_frame_interval(numerator, denominator) {
                warn!("frame interval {}/{} not applied: {}", numerator, denominator, e);
            }
        }

        info!(
            "capture format {}x{} {} ({} bytes)",
            format.width, format.height, format.fourcc, format.size_image
        );
        self.format = Some(format);
        self.state = CaptureState::FormatNegotiated;
        Ok(format)
    }

    /// Requests `count` queue slots, backs each with a freshly allocated
    /// [`PhysicalBuffer`] and queues them all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when the driver grants no slots or
    /// a buffer cannot be allocated, and the driver error if queueing fails.
    /// The driver's slots are released again on failure.
    #[instrument(skip(self))]
    pub fn allocate_buffers(&mut self, count: u32) -> Result<usize> {
        self.require(CaptureState::FormatNegotiated)?;
        if count == 0 {
            return Err(Error::Config("buffer count must be at least 1".to_string()));
        }
        let size = match self.format {
            Some(format) => format.size_image as usize,
            None => return Err(Error::Config("no capture format".to_string())),
        };

        let granted = self.dev()?.request_buffers(count)?;
        if granted == 0 {
            return Err(Error::ResourceExhausted(format!(
                "driver granted none of {} buffers",
                count
            )));
        }
        if granted < count {
            warn!("requested {} buffers but driver granted {}", count, granted);
        }
        let count = granted.min(count);

        match self.register(count, size) {
            Ok(buffers) => {
                self.ring = BufferRing::new(buffers);
                self.state = CaptureState::BuffersRegistered;
                Ok(self.ring.len())
            }
            Err(e) => {
                if let Err(err) = self.dev()?.request_buffers(0) {
                    warn!("releasing driver buffers failed: {}", err);
                }
                Err(e)
            }
        }
    }

    fn register(&mut self, count: u32, size: usize) -> Result<Vec<Arc<PhysicalBuffer>>> {
        let mut buffers = Vec::with_capacity(count as usize);
        for index in 0..count {
            let buffer = Arc::new(PhysicalBuffer::allocate(&self.memory, size, 1)?);
            debug!("queue buffer {} {}", index, buffer);
            self.dev()?
                .queue_buffer(index, buffer.fd(), buffer.size() as u32)?;
            buffers.push(buffer);
        }
        Ok(buffers)
    }

    pub fn start_streaming(&mut self) -> Result<()> {
        self.require(CaptureState::BuffersRegistered)?;
        self.dev()?.stream_on()?;
        self.state = CaptureState::Streaming;
        info!("streaming with {} buffers", self.ring.len());
        Ok(())
    }

    /// Stops streaming and releases every buffer. The format and buffers must
    /// be negotiated again before the next [`start_streaming`].
    ///
    /// [`start_streaming`]: Self::start_streaming
    pub fn stop_streaming(&mut self) -> Result<()> {
        self.require(CaptureState::Streaming)?;
        self.dev()?.stream_off()?;
        self.release_buffers();
        self.state = CaptureState::Opened;
        info!("streaming stopped");
        Ok(())
    }

    /// Like [`stop_streaming`](Self::stop_streaming) but a failing
    /// stream-off is only logged.
    fn abort_streaming(&mut self) {
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.stream_off() {
                warn!("stream off failed: {}", e);
            }
        }
        self.release_buffers();
        self.state = CaptureState::Opened;
    }

    fn release_buffers(&mut self) {
        if self.ring.is_empty() {
            return;
        }
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.request_buffers(0) {
                warn!("releasing driver buffers failed: {}", e);
            }
        }
        self.ring = BufferRing::default();
        self.format = None;
    }

    /// Blocks until the driver fills a buffer, then hands it to the caller.
    ///
    /// Signals interrupting the wait are retried. The buffer is flushed so
    /// the CPU sees what the hardware wrote.
    ///
    /// # Errors
    ///
    /// - [`Error::FrameOutstanding`] if the previous frame was not released
    /// - [`Error::NoQueuedBuffer`] if no buffer is queued with the driver
    /// - [`Error::Stopped`] if the [`StopHandle`] was raised
    /// - [`Error::Timeout`] if the configured frame timeout elapsed
    /// - [`Error::UnexpectedBuffer`] if the driver returns a buffer that is
    ///   not queued; streaming is stopped and the device is back to Opened
    /// - the driver error if waiting or dequeueing fails
    pub fn capture_frame(&mut self) -> Result<Frame<'_>> {
        self.require(CaptureState::Streaming)?;
        self.ring.check_capture()?;

        let timeout = self.options.frame_timeout;
        let deadline = timeout.map(|t| Instant::now() + t);
        let stop = self.stop.clone();
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.dev()?.wait(&stop, remaining) {
                Ok(Readiness::Ready) => break,
                Ok(Readiness::TimedOut) if deadline.is_some_and(|d| Instant::now() >= d) => {
                    return Err(Error::Timeout)
                }
                Ok(Readiness::TimedOut) => continue,
                Ok(Readiness::Stopped) => return Err(Error::Stopped),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("frame wait interrupted, retrying");
                    continue;
                }
                Err(e) => return Err(Error::device("poll", e)),
            }
        }

        let dequeued = self.dev()?.dequeue_buffer()?;
        if !self.ring.is_queued(dequeued.index) {
            // The driver holds a buffer the ring cannot account for.
            error!(
                "driver returned buffer {} outside the {} queued slots, stopping stream",
                dequeued.index,
                self.ring.queued()
            );
            self.abort_streaming();
            return Err(Error::UnexpectedBuffer(dequeued.index));
        }
        let format = self.format.ok_or(Error::InvalidState {
            expected: CaptureState::Streaming,
            actual: self.state,
        })?;
        let slot = self.ring.dequeued(dequeued)?;
        slot.buffer.flush()?;

        Ok(Frame {
            buffer: &slot.buffer,
            meta: dequeued,
            format,
        })
    }

    /// The currently dequeued frame, if any.
    pub fn active_frame(&self) -> Option<Frame<'_>> {
        let meta = self.ring.active?;
        let format = self.format?;
        Some(Frame {
            buffer: &self.ring.slots[meta.index as usize].buffer,
            meta,
            format,
        })
    }

    /// Gives the dequeued buffer back to the driver.
    pub fn release_frame(&mut self) -> Result<()> {
        self.require(CaptureState::Streaming)?;
        let slot = self.ring.active_slot()?;
        let index = slot.index;
        let buffer = slot.buffer.clone();
        self.dev()?
            .queue_buffer(index, buffer.fd(), buffer.size() as u32)?;
        self.ring.requeued();
        Ok(())
    }

    /// Stops streaming, ignoring a failure to do so, releases the buffers and
    /// closes the device. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == CaptureState::Closed {
            return;
        }
        if self.state == CaptureState::Streaming {
            if let Some(device) = self.device.as_mut() {
                if let Err(e) = device.stream_off() {
                    warn!("stream off failed while closing: {}", e);
                }
            }
        }
        self.release_buffers();
        self.device = None;
        self.state = CaptureState::Closed;
        debug!("capture device closed");
    }
}

impl<D: VideoDevice> Drop for CaptureDevice<D> {
    fn drop(&mut self) {
        self.close();
    }
}
