//! OpenCV-backed camera capture, enabled with the `with-opencv` feature.

use std::thread;

use anyhow::Result;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    source::parse_device_index,
    types::{CaptureError, Frame},
};

/// Spawns a background thread that continually captures frames from `uri`,
/// resized to `target_size` (width, height).
pub fn spawn_camera_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let (tx, rx) = bounded(2);
    let uri = uri.to_string();

    thread::Builder::new()
        .name("video-ingest-opencv".into())
        .spawn(move || {
            if let Err(err) = capture_loop(&uri, target_size, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

fn capture_loop(
    uri: &str,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut cap = open_video_capture(uri)?;
    configure_camera(&mut cap, target_size, 30.0);

    let mut frame = Mat::default();
    let mut scratch = Mat::default();
    let (target_w, target_h) = target_size;
    let mut sequence: u64 = 0;

    loop {
        let grabbed = cap
            .read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Err(CaptureError::Closed);
        }

        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 {
            continue;
        }

        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &scratch
        } else {
            &frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        sequence = sequence.wrapping_add(1);
        let frame = Frame::new(
            data,
            target_w,
            target_h,
            Utc::now().timestamp_millis(),
            sequence,
        );
        if tx.send(Ok(frame)).is_err() {
            break;
        }
    }

    Ok(())
}

fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? => {
            return Ok(cap);
        }
        Ok(_) => {}
        Err(err) => warn!("failed to open {uri}: {err}"),
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
