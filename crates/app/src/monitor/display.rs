//! Display collaborator: fire-and-forget frame broadcast to the preview.

use std::{io, thread::JoinHandle};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use image::{
    ImageBuffer, Rgb, RgbImage,
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
};
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::monitor::{
    config::PreviewSettings,
    data::{FrameMetadata, PreviewPacket, SharedPacket},
    telemetry::spawn_thread,
};

const DEFECT_BOX_COLOR: Rgb<u8> = Rgb([255, 48, 48]);

/// Accepts frames at up to capture rate and must never block the caller.
pub trait Display: Send {
    fn broadcast(&self, frame: Frame, metadata: FrameMetadata);
}

/// Hands frames to the encoder thread, dropping while it is busy.
pub struct PreviewDisplay {
    tx: Sender<(Frame, FrameMetadata)>,
}

impl Display for PreviewDisplay {
    fn broadcast(&self, frame: Frame, metadata: FrameMetadata) {
        match self.tx.try_send((frame, metadata)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!("printwatch_display_dropped_total").increment(1);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Preview encoder has stopped; discarding frame");
            }
        }
    }
}

/// Start the encoder thread. It exits once the returned display is dropped.
pub(crate) fn spawn_preview_encoder(
    settings: PreviewSettings,
    shared: SharedPacket,
) -> io::Result<(PreviewDisplay, JoinHandle<()>)> {
    let (tx, rx) = bounded(1);
    let handle = spawn_thread("printwatch-preview-encode", move || {
        encode_loop(&rx, &settings, &shared)
    })?;
    Ok((PreviewDisplay { tx }, handle))
}

fn encode_loop(
    rx: &Receiver<(Frame, FrameMetadata)>,
    settings: &PreviewSettings,
    shared: &SharedPacket,
) {
    for (frame, metadata) in rx.iter() {
        match encode_preview(&frame, metadata, settings) {
            Ok(packet) => {
                if let Ok(mut guard) = shared.lock() {
                    *guard = Some(packet);
                }
            }
            Err(err) => warn!("Preview encode failed: {err:?}"),
        }
    }
    debug!("Preview encoder exiting");
}

/// Resize to the preview size, outline the last defect and JPEG-encode.
pub(crate) fn encode_preview(
    frame: &Frame,
    metadata: FrameMetadata,
    settings: &PreviewSettings,
) -> Result<PreviewPacket> {
    if frame.width <= 0 || frame.height <= 0 || frame.data.len() < frame.expected_len() {
        return Err(anyhow!(
            "frame {} has no usable pixels ({}x{}, {} bytes)",
            frame.sequence,
            frame.width,
            frame.height,
            frame.data.len()
        ));
    }
    let width = frame.width as u32;
    let height = frame.height as u32;
    let rgb = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width, height, bgr_to_rgb(&frame.data))
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    let (out_w, out_h) = settings.size;
    let mut image = if (out_w, out_h) == (width, height) {
        rgb
    } else {
        imageops::resize(&rgb, out_w, out_h, FilterType::Triangle)
    };

    if let Some(defect) = metadata.last_defect.as_ref() {
        let sx = out_w as f32 / width as f32;
        let sy = out_h as f32 / height as f32;
        draw_rectangle(
            &mut image,
            (defect.bbox[0] * sx).round() as i32,
            (defect.bbox[1] * sy).round() as i32,
            (defect.bbox[2] * sx).round() as i32,
            (defect.bbox[3] * sy).round() as i32,
            DEFECT_BOX_COLOR,
        );
    }

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, settings.jpeg_quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;

    Ok(PreviewPacket { jpeg, metadata })
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}

/// Two-pixel outline, clamped to the image.
fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);
    if left > right || top > bottom {
        return;
    }

    for inset in 0..2 {
        let (l, t) = ((left + inset).min(right), (top + inset).min(bottom));
        let (r, b) = ((right - inset).max(left), (bottom - inset).max(top));
        for x in l..=r {
            image.put_pixel(x as u32, t as u32, color);
            image.put_pixel(x as u32, b as u32, color);
        }
        for y in t..=b {
            image.put_pixel(l as u32, y as u32, color);
            image.put_pixel(r as u32, y as u32, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::monitor::data::DefectSummary;

    fn settings(size: (u32, u32)) -> PreviewSettings {
        PreviewSettings {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            jpeg_quality: 80,
            size,
        }
    }

    fn metadata(last_defect: Option<DefectSummary>) -> FrameMetadata {
        FrameMetadata {
            layer: 4,
            temperatures: None,
            last_defect,
            timestamp_ms: 0,
            frame_sequence: 9,
        }
    }

    #[test]
    fn encodes_resized_jpeg() {
        let frame = Frame::new(vec![90; 32 * 16 * 3], 32, 16, 0, 9);
        let defect = DefectSummary {
            defect_type: "warping".to_string(),
            confidence: 0.9,
            bbox: [4.0, 2.0, 20.0, 12.0],
            timestamp_ms: 0,
        };

        let packet = encode_preview(&frame, metadata(Some(defect)), &settings((16, 8))).unwrap();

        assert_eq!(&packet.jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&packet.jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
        assert_eq!(packet.metadata.frame_sequence, 9);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = Frame::new(vec![0; 10], 32, 16, 0, 1);
        assert!(encode_preview(&frame, metadata(None), &settings((16, 8))).is_err());
    }

    #[test]
    fn busy_encoder_drops_instead_of_blocking() {
        let (tx, rx) = bounded(1);
        let display = PreviewDisplay { tx };
        let frame = Frame::new(vec![0; 12], 2, 2, 0, 1);

        display.broadcast(frame.clone(), metadata(None));
        display.broadcast(frame, metadata(None));

        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn rectangle_outline_is_clamped() {
        let mut image = RgbImage::new(8, 8);
        draw_rectangle(&mut image, -5, 1, 20, 6, DEFECT_BOX_COLOR);

        assert_eq!(*image.get_pixel(0, 1), DEFECT_BOX_COLOR);
        assert_eq!(*image.get_pixel(7, 6), DEFECT_BOX_COLOR);
        assert_eq!(*image.get_pixel(4, 4), Rgb([0, 0, 0]));
    }
}
