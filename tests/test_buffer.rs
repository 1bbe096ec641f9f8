// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use camera_capture::{
    buffer::{DmaHeapManager, HeapType, MemoryManager, PhysicalBuffer, SharedMemoryManager},
    error::Error as CaptureError,
};
use serial_test::serial;
use std::{
    error::Error,
    fs::File,
    os::{
        fd::{AsRawFd, BorrowedFd},
        unix::fs::FileExt,
    },
    sync::Arc,
};

fn shared() -> (Arc<SharedMemoryManager>, Arc<dyn MemoryManager>) {
    let shm = Arc::new(SharedMemoryManager::new());
    let mgr: Arc<dyn MemoryManager> = shm.clone();
    (shm, mgr)
}

#[test]
fn test_allocate() -> Result<(), Box<dyn Error>> {
    let (_, mgr) = shared();
    let buf = PhysicalBuffer::allocate(&mgr, 1920 * 1080 * 2, 1)?;
    println!("{}", buf);

    assert_eq!(buf.size(), 4147200);
    assert_eq!(buf.count(), 1);
    assert_eq!(buf.physical_address(), None);
    assert!(!buf.virtual_address().is_null());
    assert!(buf.as_slice().iter().all(|b| *b == 0));
    Ok(())
}

#[test]
fn test_allocate_count() -> Result<(), Box<dyn Error>> {
    let (_, mgr) = shared();
    let buf = PhysicalBuffer::allocate(&mgr, 4096, 3)?;
    assert_eq!(buf.size(), 3 * 4096);
    assert_eq!(buf.count(), 3);
    Ok(())
}

#[test]
fn test_invalid_size() {
    let (shm, mgr) = shared();
    assert!(matches!(
        PhysicalBuffer::allocate(&mgr, 0, 4),
        Err(CaptureError::Config(_))
    ));
    assert!(matches!(
        PhysicalBuffer::allocate(&mgr, usize::MAX, 2),
        Err(CaptureError::Config(_))
    ));
    assert_eq!(shm.allocations(), 0);
}

#[test]
fn test_free_on_drop() -> Result<(), Box<dyn Error>> {
    let (shm, mgr) = shared();
    let a = Arc::new(PhysicalBuffer::allocate(&mgr, 4096, 1)?);
    let b = PhysicalBuffer::allocate(&mgr, 4096, 1)?;
    assert_ne!(a.id(), b.id());
    assert_eq!(shm.allocations(), 2);

    let shared = a.clone();
    drop(a);
    assert_eq!(shm.allocations(), 2);
    drop(shared);
    assert_eq!(shm.allocations(), 1);
    drop(b);
    assert_eq!(shm.allocations(), 0);
    Ok(())
}

#[test]
fn test_export_visible_after_flush() -> Result<(), Box<dyn Error>> {
    let (_, mgr) = shared();
    let buf = PhysicalBuffer::allocate(&mgr, 8192, 1)?;

    // Write through the exported handle, as an importing device would.
    let exported = File::from(buf.fd().try_clone_to_owned()?);
    exported.write_all_at(b"frame data", 100)?;

    buf.flush()?;
    assert_eq!(&buf.as_slice()[100..110], b"frame data");
    assert_eq!(buf.as_slice()[99], 0);
    Ok(())
}

#[test]
fn test_cpu_writes_visible_to_export() -> Result<(), Box<dyn Error>> {
    let (_, mgr) = shared();
    let mut buf = PhysicalBuffer::allocate(&mgr, 4096, 1)?;
    buf.as_slice_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
    buf.flush()?;

    let dmabuf = buf.dmabuf()?;
    let fd = unsafe { BorrowedFd::borrow_raw(dmabuf.as_raw_fd()) };
    let exported = File::from(fd.try_clone_to_owned()?);
    let mut head = [0u8; 4];
    exported.read_exact_at(&mut head, 0)?;
    assert_eq!(head, [1, 2, 3, 4]);
    Ok(())
}

#[test]
fn test_flush_checks_range() -> Result<(), Box<dyn Error>> {
    let (_, mgr) = shared();
    let alloc = mgr.alloc(100)?;
    assert!(alloc.size >= 100);
    assert!(mgr.flush(alloc.id, 0, alloc.size).is_ok());
    assert!(mgr.flush(alloc.id, 1, alloc.size).is_err());
    mgr.free(alloc.id);
    assert!(mgr.flush(alloc.id, 0, 1).is_err());
    Ok(())
}

#[test]
#[serial]
#[ignore = "requires a CMA dma heap"]
fn test_cma_heap() -> Result<(), Box<dyn Error>> {
    let mgr: Arc<dyn MemoryManager> = Arc::new(DmaHeapManager::new(HeapType::Cma)?);
    let buf = PhysicalBuffer::allocate(&mgr, 3840 * 2160 * 2, 1)?;
    println!("{}", buf);
    assert!(buf.size() >= 3840 * 2160 * 2);
    buf.flush()?;
    Ok(())
}
