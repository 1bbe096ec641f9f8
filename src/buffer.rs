// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Physically contiguous, DMA-shareable frame buffers.
//!
//! A [`PhysicalBuffer`] is allocated from a [`MemoryManager`], zero-filled,
//! mapped into the process and exported as a dma-buf file descriptor so the
//! capture driver can write into it without a copy. The buffer is released
//! back to its manager exactly once, when the last owner drops it.
//!
//! Two managers are provided:
//!
//! - [`DmaHeapManager`] allocates from a Linux DMA heap (`/dev/dma_heap/*`).
//! - [`SharedMemoryManager`] allocates anonymous `memfd` memory, for hosts
//!   without DMA heaps and for tests.

use core::fmt;
use dma_buf::DmaBuf;
use dma_heap::{Heap, HeapKind};
use serde::Deserialize;
use std::{
    collections::HashMap,
    ffi::c_void,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    ptr::{null_mut, NonNull},
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, DmaBufSync);

/// Vendor extension exposing the physical address of a contiguous dma-buf.
/// The kernel writes the address back through the argument.
const DMA_BUF_IOCTL_PHYS: libc::c_ulong =
    nix::request_code_write!(b'b', 10, std::mem::size_of::<libc::c_ulong>()) as libc::c_ulong;

/// A region handed out by a [`MemoryManager`].
#[derive(Debug)]
pub struct Allocation {
    /// Manager-specific identifier used for export, flush and free
    pub id: u32,
    /// Bus address of the region when the platform reports one
    pub physical_address: Option<u64>,
    /// Start of the CPU mapping
    pub virtual_address: NonNull<u8>,
    /// Mapped length in bytes, at least the requested size
    pub size: usize,
}

/// Interface to the platform's physical memory subsystem.
///
/// Implementations own every region they hand out until [`free`] is called
/// with its id; the mapping returned by [`alloc`] stays valid until then.
///
/// [`alloc`]: MemoryManager::alloc
/// [`free`]: MemoryManager::free
pub trait MemoryManager: Send + Sync {
    fn alloc(&self, size: usize) -> io::Result<Allocation>;

    /// Returns a new file descriptor referring to the region, usable by other
    /// kernel subsystems (e.g. V4L2 `DMABUF` import).
    fn export(&self, id: u32) -> io::Result<OwnedFd>;

    /// Synchronises CPU caches for `size` bytes starting at `offset`.
    fn flush(&self, id: u32, offset: usize, size: usize) -> io::Result<()>;

    fn free(&self, id: u32);
}

/// Heap to allocate DMA buffers from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HeapType {
    /// Physically contiguous CMA heap
    #[default]
    Cma,
    /// System heap (scatter-gather, no physical address)
    System,
}

impl From<HeapType> for HeapKind {
    fn from(heap: HeapType) -> Self {
        match heap {
            HeapType::Cma => HeapKind::Cma,
            HeapType::System => HeapKind::System,
        }
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// A mapped file descriptor owned by a memory manager.
struct Region {
    fd: OwnedFd,
    map: *mut u8,
    len: usize,
}

// SAFETY: the mapping is only dereferenced through PhysicalBuffer, which
// upholds the aliasing rules; the Region itself only unmaps on drop.
unsafe impl Send for Region {}

impl Region {
    fn map(fd: OwnedFd, len: usize) -> io::Result<Self> {
        let map = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            map: map as *mut u8,
            len,
        })
    }

    fn address(&self) -> NonNull<u8> {
        // mmap never returns null on success
        NonNull::new(self.map).unwrap_or(NonNull::dangling())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.map.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed: {}", io::Error::last_os_error());
        }
    }
}

#[derive(Default)]
struct Pool {
    next_id: u32,
    regions: HashMap<u32, Region>,
}

impl Pool {
    fn insert(&mut self, region: Region) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.regions.insert(id, region);
        id
    }

    fn get(&self, id: u32) -> io::Result<&Region> {
        self.regions.get(&id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no allocation {}", id))
        })
    }
}

fn lock(pool: &Mutex<Pool>) -> MutexGuard<'_, Pool> {
    pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Memory manager backed by a Linux DMA heap.
pub struct DmaHeapManager {
    heap: Heap,
    kind: HeapType,
    pool: Mutex<Pool>,
}

impl DmaHeapManager {
    /// Opens the requested DMA heap.
    ///
    /// # Errors
    ///
    /// Returns an error if the heap device does not exist or cannot be
    /// opened (usually a permissions issue on `/dev/dma_heap`).
    pub fn new(kind: HeapType) -> Result<Self> {
        let heap = Heap::new(kind.into())
            .map_err(|e| Error::device("dma_heap open", io::Error::other(e.to_string())))?;
        Ok(Self {
            heap,
            kind,
            pool: Mutex::new(Pool::default()),
        })
    }

    fn physical_address(fd: BorrowedFd) -> Option<u64> {
        let mut paddr: libc::c_ulong = 0;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), DMA_BUF_IOCTL_PHYS as _, &mut paddr) };
        if ret < 0 || paddr == 0 {
            return None;
        }
        Some(paddr as u64)
    }
}

impl MemoryManager for DmaHeapManager {
    fn alloc(&self, size: usize) -> io::Result<Allocation> {
        let len = size.next_multiple_of(page_size());
        let fd = self.heap.allocate(len).map_err(|e| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("{:?} heap allocation of {} bytes: {}", self.kind, len, e),
            )
        })?;
        let physical_address = Self::physical_address(fd.as_fd());
        let region = Region::map(fd, len)?;
        let virtual_address = region.address();
        let id = lock(&self.pool).insert(region);
        Ok(Allocation {
            id,
            physical_address,
            virtual_address,
            size: len,
        })
    }

    fn export(&self, id: u32) -> io::Result<OwnedFd> {
        lock(&self.pool).get(id)?.fd.try_clone()
    }

    fn flush(&self, id: u32, _offset: usize, _size: usize) -> io::Result<()> {
        // dma-buf cache maintenance always covers the whole buffer
        let pool = lock(&self.pool);
        let fd = pool.get(id)?.fd.as_raw_fd();
        let start = DmaBufSync {
            flags: DMA_BUF_SYNC_START | DMA_BUF_SYNC_RW,
        };
        unsafe { dma_buf_ioctl_sync(fd, &start) }?;
        let end = DmaBufSync {
            flags: DMA_BUF_SYNC_END | DMA_BUF_SYNC_RW,
        };
        unsafe { dma_buf_ioctl_sync(fd, &end) }?;
        Ok(())
    }

    fn free(&self, id: u32) {
        if lock(&self.pool).regions.remove(&id).is_none() {
            warn!("free of unknown dma heap allocation {}", id);
        }
    }
}

/// Memory manager backed by anonymous shared memory (`memfd`).
///
/// The memory is cache coherent so [`MemoryManager::flush`] only validates
/// the id. No physical address is reported.
#[derive(Default)]
pub struct SharedMemoryManager {
    pool: Mutex<Pool>,
}

impl SharedMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> usize {
        lock(&self.pool).regions.len()
    }
}

impl MemoryManager for SharedMemoryManager {
    fn alloc(&self, size: usize) -> io::Result<Allocation> {
        let len = size.next_multiple_of(page_size());
        let raw = unsafe { libc::memfd_create(c"camera-capture".as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let region = Region::map(fd, len)?;
        let virtual_address = region.address();
        let id = lock(&self.pool).insert(region);
        Ok(Allocation {
            id,
            physical_address: None,
            virtual_address,
            size: len,
        })
    }

    fn export(&self, id: u32) -> io::Result<OwnedFd> {
        lock(&self.pool).get(id)?.fd.try_clone()
    }

    fn flush(&self, id: u32, offset: usize, size: usize) -> io::Result<()> {
        let pool = lock(&self.pool);
        let region = pool.get(id)?;
        if offset + size > region.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "flush range exceeds allocation",
            ));
        }
        Ok(())
    }

    fn free(&self, id: u32) {
        if lock(&self.pool).regions.remove(&id).is_none() {
            warn!("free of unknown shared memory allocation {}", id);
        }
    }
}

/// DMA-backed memory region shared between the CPU and the capture hardware.
///
/// The region is `size * count` bytes, zero-filled on allocation, and
/// exported as a dma-buf file descriptor. It is returned to its
/// [`MemoryManager`] when dropped. Share it through `Arc`; it cannot be
/// cloned.
///
/// # Example
///
/// ```no_run
/// use camera_capture::buffer::{DmaHeapManager, HeapType, MemoryManager, PhysicalBuffer};
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let heap: Arc<dyn MemoryManager> = Arc::new(DmaHeapManager::new(HeapType::Cma)?);
/// let buf = PhysicalBuffer::allocate(&heap, 1920 * 1080 * 2, 1)?;
/// buf.flush()?;
/// println!("{} bytes at {:?}", buf.size(), buf.physical_address());
/// # Ok(())
/// # }
/// ```
pub struct PhysicalBuffer {
    manager: Arc<dyn MemoryManager>,
    id: u32,
    size: usize,
    count: u32,
    physical_address: Option<u64>,
    vaddr: NonNull<u8>,
    fd: OwnedFd,
}

// SAFETY: the mapping stays valid until drop and the manager is Send + Sync.
// Mutable access to the contents requires &mut self.
unsafe impl Send for PhysicalBuffer {}
unsafe impl Sync for PhysicalBuffer {}

impl PhysicalBuffer {
    /// Allocates `size * count` bytes from `manager`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the manager cannot satisfy the
    /// request or the region cannot be exported, and [`Error::Config`] for a
    /// zero or overflowing size.
    pub fn allocate(manager: &Arc<dyn MemoryManager>, size: usize, count: u32) -> Result<Self> {
        let total = size
            .checked_mul(count as usize)
            .filter(|total| *total > 0)
            .ok_or_else(|| Error::Config(format!("invalid buffer size {} x {}", size, count)))?;

        let alloc = manager.alloc(total).map_err(|e| {
            Error::ResourceExhausted(format!("allocation of {} bytes failed: {}", total, e))
        })?;
        unsafe { alloc.virtual_address.as_ptr().write_bytes(0, total) };

        let fd = match manager.export(alloc.id) {
            Ok(fd) => fd,
            Err(e) => {
                manager.free(alloc.id);
                return Err(Error::ResourceExhausted(format!(
                    "export of allocation {} failed: {}",
                    alloc.id, e
                )));
            }
        };
        debug!("physical buffer {} alloc'd ({} bytes)", alloc.id, total);

        Ok(Self {
            manager: manager.clone(),
            id: alloc.id,
            size: total,
            count,
            physical_address: alloc.physical_address,
            vaddr: alloc.virtual_address,
            fd,
        })
    }

    /// Makes hardware writes visible to CPU reads of the whole buffer.
    pub fn flush(&self) -> Result<()> {
        self.manager
            .flush(self.id, 0, self.size)
            .map_err(|e| Error::device("buffer flush", e))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Total size in bytes (`size * count`).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn physical_address(&self) -> Option<u64> {
        self.physical_address
    }

    pub fn virtual_address(&self) -> *mut u8 {
        self.vaddr.as_ptr()
    }

    /// Export handle, as registered with the capture queue.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicates the export handle as a [`DmaBuf`] for other subsystems.
    pub fn dmabuf(&self) -> io::Result<DmaBuf> {
        Ok(DmaBuf::from(self.fd.try_clone()?))
    }

    /// CPU view of the buffer. Call [`flush`](Self::flush) first when the
    /// hardware may have written to it.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.vaddr.as_ptr(), self.size) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.vaddr.as_ptr(), self.size) }
    }
}

impl Drop for PhysicalBuffer {
    fn drop(&mut self) {
        self.manager.free(self.id);
        debug!("physical buffer {} freed", self.id);
    }
}

impl fmt::Debug for PhysicalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PhysicalBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("count", &self.count)
            .field("physical_address", &self.physical_address)
            .field("fd", &self.fd)
            .finish()
    }
}

impl fmt::Display for PhysicalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.physical_address {
            Some(paddr) => write!(f, "buf:{} {}B paddr:{:#x} fd:{:?}", self.id, self.size, paddr, self.fd),
            None => write!(f, "buf:{} {}B fd:{:?}", self.id, self.size, self.fd),
        }
    }
}
