//! FFmpeg subprocess readers producing raw BGR8 frames over a pipe.

use std::{
    io::Read,
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::{Result, anyhow};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    source::parse_device_index,
    types::{CaptureError, Frame},
};

/// Frames buffered between the ffmpeg pipe and the poller.
const READER_QUEUE: usize = 2;

/// Spawn ffmpeg for a V4L device, RTSP feed, or video file and stream BGR8
/// frames scaled to `target_size` from a background thread.
///
/// Files are paced at their native frame rate so a recording replays like a
/// live camera.
pub fn spawn_ffmpeg_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    if let Some(index) = parse_device_index(uri) {
        cmd.arg("-f")
            .arg("video4linux2")
            .arg("-i")
            .arg(format!("/dev/video{index}"));
    } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        cmd.arg("-rtsp_transport")
            .arg("tcp")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay")
            .arg("-i")
            .arg(uri);
    } else {
        cmd.arg("-re").arg("-i").arg(uri);
    }

    cmd.arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    debug!("Starting ffmpeg capture for {uri} at {}x{}", target_size.0, target_size.1);
    spawn_pipe_reader(cmd, target_size)
}

fn spawn_pipe_reader(
    mut cmd: Command,
    target_size: (i32, i32),
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let (tx, rx) = bounded(READER_QUEUE);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    thread::Builder::new()
        .name("video-ingest-ffmpeg".into())
        .spawn(move || {
            if let Err(err) = pipe_loop(stdout, child, target_size, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

fn pipe_loop(
    mut stdout: impl Read,
    mut child: Child,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];
    let mut sequence: u64 = 0;
    let mut result = Ok(());

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                sequence = sequence.wrapping_add(1);
                let frame = Frame::new(
                    buffer.clone(),
                    target_size.0,
                    target_size.1,
                    Utc::now().timestamp_millis(),
                    sequence,
                );
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!("ffmpeg stream ended after {sequence} frame(s)");
                result = Err(CaptureError::Closed);
                break;
            }
            Err(err) => {
                result = Err(CaptureError::Other(err.into()));
                break;
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
    result
}
