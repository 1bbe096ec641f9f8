// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use camera_capture::{
    camera::{Camera, LinuxBackend},
    config::{CameraConfig, CameraSource},
    error::Error as CaptureError,
    media::EntityRole,
};
use common::{mipi_topology, pattern_byte, uvc_topology, FakeBackend, PATTERN_LEN};
use serial_test::serial;
use std::{error::Error, path::PathBuf};

#[test]
fn test_start_mipi() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(true));
    let media = backend.media.clone();
    let video = backend.video.clone();
    let opened = backend.opened.clone();

    let mut cam = Camera::new(backend, CameraConfig::default())?;
    cam.start()?;
    assert!(cam.is_streaming());

    assert_eq!(*opened.lock().unwrap(), [PathBuf::from("/dev/video0")]);
    {
        let media = media.lock().unwrap();
        assert_eq!(media.resets, 1);
        assert_eq!(media.links.len(), 2);
        assert_eq!(media.formats.len(), 3);
        assert!(!media.formats.keys().any(|(entity, _)| entity == "CRU output"));
    }
    {
        let video = video.lock().unwrap();
        assert!(video.streaming);
        assert_eq!(video.slots, 6);
        assert_eq!(video.queued.len(), 6);
    }

    for n in 0..8 {
        let frame = cam.capture_image()?;
        assert_eq!(frame.sequence(), n);
        assert_eq!((frame.width(), frame.height()), (1920, 1080));
        assert!(frame.data()[..PATTERN_LEN].iter().all(|b| *b == pattern_byte(n)));
        cam.release_frame()?;
    }

    cam.stop()?;
    assert!(!cam.is_streaming());
    assert!(!video.lock().unwrap().streaming);
    Ok(())
}

#[test]
fn test_partial_config_file() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(true));
    let media = backend.media.clone();
    let config = CameraConfig::from_json(
        r#"{
            "entity_patterns": { "sensor": "ar1335" },
            "bus_formats": { "Y8": { "name": "Y8_1X8", "code": 8193 } }
        }"#,
    )?;

    let mut cam = Camera::new(backend, config)?;
    cam.start()?;
    let media = media.lock().unwrap();
    assert_eq!(media.links.len(), 2);
    assert_eq!(media.formats.len(), 3);
    Ok(())
}

#[test]
fn test_start_missing_isp() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(false));
    let media = backend.media.clone();

    let mut cam = Camera::new(backend, CameraConfig::default())?;
    cam.start()?;
    assert!(cam.is_streaming());
    assert_eq!(media.lock().unwrap().links.len(), 1);
    Ok(())
}

#[test]
fn test_strict_pipeline() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(false));
    let video = backend.video.clone();
    let config = CameraConfig {
        require_complete_pipeline: true,
        ..Default::default()
    };

    let mut cam = Camera::new(backend, config)?;
    assert!(matches!(
        cam.start(),
        Err(CaptureError::MissingEntity(EntityRole::ImageSignalProcessor))
    ));
    assert!(video.lock().unwrap().calls.is_empty());
    Ok(())
}

#[test]
fn test_device_not_found() -> Result<(), Box<dyn Error>> {
    let mut topology = mipi_topology(true);
    for entity in topology.iter_mut() {
        entity.devnode = None;
    }
    let backend = FakeBackend::new().with_topology(0, topology);
    let video = backend.video.clone();
    let opened = backend.opened.clone();

    let mut cam = Camera::new(backend, CameraConfig::default())?;
    match cam.start() {
        Err(CaptureError::DeviceNotFound(path)) => {
            assert_eq!(path, PathBuf::from("/dev/media0"))
        }
        other => panic!("expected DeviceNotFound, got {:?}", other),
    }
    assert!(opened.lock().unwrap().is_empty());
    assert!(video.lock().unwrap().calls.is_empty());
    assert!(!cam.is_streaming());
    Ok(())
}

#[test]
fn test_media_device_missing() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(true));
    let config = CameraConfig {
        source: CameraSource::Cru2,
        ..Default::default()
    };
    let mut cam = Camera::new(backend, config)?;
    assert!(matches!(cam.start(), Err(CaptureError::Device { .. })));
    Ok(())
}

#[test]
fn test_device_override() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(1, mipi_topology(true));
    let opened = backend.opened.clone();
    let config = CameraConfig {
        source: CameraSource::Cru1,
        device: Some(PathBuf::from("/dev/video9")),
        ..Default::default()
    };

    let mut cam = Camera::new(backend, config)?;
    cam.start()?;
    assert_eq!(*opened.lock().unwrap(), [PathBuf::from("/dev/video9")]);
    Ok(())
}

#[test]
fn test_start_uvc() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(4, uvc_topology());
    let media = backend.media.clone();
    let opened = backend.opened.clone();
    let config = CameraConfig {
        source: CameraSource::Uvc0,
        width: 640,
        height: 480,
        ..Default::default()
    };

    let mut cam = Camera::new(backend, config)?;
    cam.start()?;
    assert_eq!(*opened.lock().unwrap(), [PathBuf::from("/dev/video4")]);
    // External cameras are used as enumerated.
    assert_eq!(media.lock().unwrap().resets, 0);

    let frame = cam.capture_image()?;
    assert_eq!(frame.payload().len(), 640 * 480 * 2);
    Ok(())
}

#[test]
fn test_stream_on_failure() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(true));
    let video = backend.video.clone();
    let memory = backend.memory.clone();
    video.lock().unwrap().fail_stream_on = true;

    let mut cam = Camera::new(backend, CameraConfig::default())?;
    assert!(matches!(cam.start(), Err(CaptureError::Device { .. })));
    assert!(!cam.is_streaming());

    let video = video.lock().unwrap();
    assert!(!video.streaming);
    assert_eq!(video.slots, 0);
    assert_eq!(memory.allocations(), 0);
    Ok(())
}

#[test]
fn test_start_twice() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(true));
    let mut cam = Camera::new(backend, CameraConfig::default())?;
    cam.start()?;
    assert!(matches!(
        cam.start(),
        Err(CaptureError::InvalidState { .. })
    ));
    assert!(cam.is_streaming());
    Ok(())
}

#[test]
fn test_capture_before_start() -> Result<(), Box<dyn Error>> {
    let mut cam = Camera::new(FakeBackend::new(), CameraConfig::default())?;
    assert!(matches!(
        cam.capture_image(),
        Err(CaptureError::InvalidState { .. })
    ));
    assert!(matches!(
        cam.release_frame(),
        Err(CaptureError::InvalidState { .. })
    ));
    cam.stop()?;
    Ok(())
}

#[test]
fn test_invalid_config() {
    let config = CameraConfig {
        buffer_count: 0,
        ..Default::default()
    };
    assert!(matches!(
        Camera::new(FakeBackend::new(), config),
        Err(CaptureError::Config(_))
    ));
}

#[test]
fn test_stop_before_capture() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(true));
    let mut cam = Camera::new(backend, CameraConfig::default())?;
    cam.stop_handle().stop();
    cam.start()?;
    assert!(cam.capture_image().unwrap_err().is_stopped());
    Ok(())
}

#[test]
fn test_restart_after_stop_handle() -> Result<(), Box<dyn Error>> {
    let backend = FakeBackend::new().with_topology(0, mipi_topology(true));
    let media = backend.media.clone();
    let mut cam = Camera::new(backend, CameraConfig::default())?;
    cam.start()?;

    let stop = cam.stop_handle();
    stop.stop();
    assert!(cam.capture_image().unwrap_err().is_stopped());
    cam.stop()?;
    assert!(!stop.is_stopped());

    cam.start()?;
    assert_eq!(media.lock().unwrap().resets, 2);
    let frame = cam.capture_image()?;
    assert_eq!(frame.sequence(), 0);
    cam.release_frame()?;
    cam.stop()?;
    Ok(())
}

#[test]
#[serial]
#[ignore = "requires an RZ/V2H board with a MIPI camera on CRU0"]
fn test_camera() -> Result<(), Box<dyn Error>> {
    let config = CameraConfig::default();
    let mut cam = Camera::new(LinuxBackend::new(config.heap)?, config)?;
    cam.start()?;
    for _ in 0..30 {
        let frame = cam.capture_image()?;
        println!("frame {} {}B", frame.sequence(), frame.bytes_used());
        cam.release_frame()?;
    }
    cam.stop()?;
    Ok(())
}
