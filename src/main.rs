// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use camera_capture::camera::{Camera, LinuxBackend};
use clap::Parser;
use std::{error::Error, time::Instant};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, Layer};

fn update_fps(prev: &mut Instant, history: &mut [u64], index: &mut usize) -> u64 {
    let now = Instant::now();
    let elapsed = now.duration_since(*prev);
    *prev = now;

    history[*index] = 1_000_000_000 / elapsed.as_nanos().max(1) as u64;
    *index = (*index + 1) % history.len();

    history.iter().sum::<u64>() / history.len() as u64
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let stdout = tracing_subscriber::fmt::layer().with_filter(level);
    let journald = if args.journald {
        Some(tracing_journald::layer()?.with_filter(level))
    } else {
        None
    };
    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(LevelFilter::TRACE))
    } else {
        None
    };
    let subscriber = tracing_subscriber::registry()
        .with(stdout)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    let config = args.camera_config()?;
    info!(
        "{} {}x{} {} with {} buffers",
        config.source, config.width, config.height, config.pixel_format, config.buffer_count
    );

    let backend = LinuxBackend::new(config.heap)?;
    let mut cam = Camera::new(backend, config)?;

    let stop = cam.stop_handle();
    ctrlc::set_handler(move || stop.stop())?;

    cam.start()?;

    let mut prev = Instant::now();
    let mut history = vec![0; 30];
    let mut index = 0;
    let mut count = 0;
    while args.frames.map_or(true, |frames| count < frames) {
        let fps = update_fps(&mut prev, &mut history, &mut index);
        let now = Instant::now();
        let frame = match cam.capture_image() {
            Ok(frame) => frame,
            Err(e) if e.is_stopped() => break,
            Err(e) => {
                error!("capture failed: {}", e);
                cam.stop()?;
                return Err(e.into());
            }
        };
        let capture_time = now.elapsed();
        info!(
            "frame {} seq {} {}B at {}.{:09} capture: {:?} fps: {}",
            frame.index(),
            frame.sequence(),
            frame.bytes_used(),
            frame.timestamp().seconds(),
            frame.timestamp().subsec(9),
            capture_time,
            fps
        );
        cam.release_frame()?;
        count += 1;
    }

    cam.stop()?;
    info!("captured {} frames", count);
    Ok(())
}
