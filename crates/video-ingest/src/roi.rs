//! Region-of-interest mask restricting analysis to the print area.

use crate::types::Frame;

/// Axis-aligned print-area rectangle, expressed against a reference frame
/// size and rescaled for frames of other sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoiMask {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub reference_width: i32,
    pub reference_height: i32,
}

impl Default for RoiMask {
    fn default() -> Self {
        Self {
            left: 400,
            top: 300,
            right: 1520,
            bottom: 900,
            reference_width: 1920,
            reference_height: 1080,
        }
    }
}

impl RoiMask {
    /// Rectangle in pixel coordinates of a `width` x `height` frame, clamped
    /// to its bounds. Right/bottom are inclusive.
    fn scaled(&self, width: i32, height: i32) -> (usize, usize, usize, usize) {
        let sx = width as f32 / self.reference_width.max(1) as f32;
        let sy = height as f32 / self.reference_height.max(1) as f32;
        let clamp_x = |v: i32| ((v as f32 * sx).round() as i32).clamp(0, width - 1) as usize;
        let clamp_y = |v: i32| ((v as f32 * sy).round() as i32).clamp(0, height - 1) as usize;
        (
            clamp_x(self.left),
            clamp_y(self.top),
            clamp_x(self.right),
            clamp_y(self.bottom),
        )
    }

    /// Return a copy of `frame` with every pixel outside the rectangle zeroed.
    /// The input frame is left untouched.
    pub fn apply(&self, frame: &Frame) -> Frame {
        if frame.width <= 0 || frame.height <= 0 || frame.data.len() < frame.expected_len() {
            return frame.clone();
        }
        let channels = frame.format.channels();
        let (left, top, right, bottom) = self.scaled(frame.width, frame.height);
        let row_bytes = frame.width as usize * channels;

        let mut masked = vec![0u8; frame.data.len()];
        for y in top..=bottom {
            let start = y * row_bytes + left * channels;
            let end = y * row_bytes + (right + 1) * channels;
            masked[start..end].copy_from_slice(&frame.data[start..end]);
        }

        Frame {
            data: masked.into(),
            ..frame.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: i32, height: i32) -> Frame {
        Frame::new(vec![200; (width * height * 3) as usize], width, height, 0, 1)
    }

    fn pixel(frame: &Frame, x: usize, y: usize) -> u8 {
        frame.data[(y * frame.width as usize + x) * 3]
    }

    #[test]
    fn zeroes_pixels_outside_rectangle() {
        let mask = RoiMask {
            left: 1,
            top: 1,
            right: 2,
            bottom: 2,
            reference_width: 4,
            reference_height: 4,
        };
        let frame = solid(4, 4);

        let masked = mask.apply(&frame);

        assert_eq!(pixel(&masked, 0, 0), 0);
        assert_eq!(pixel(&masked, 1, 1), 200);
        assert_eq!(pixel(&masked, 2, 2), 200);
        assert_eq!(pixel(&masked, 3, 2), 0);
        assert_eq!(pixel(&frame, 0, 0), 200, "source frame untouched");
    }

    #[test]
    fn rectangle_scales_with_frame_size() {
        let mask = RoiMask {
            left: 2,
            top: 2,
            right: 4,
            bottom: 4,
            reference_width: 8,
            reference_height: 8,
        };
        let masked = mask.apply(&solid(4, 4));

        assert_eq!(pixel(&masked, 0, 0), 0);
        assert_eq!(pixel(&masked, 1, 1), 200);
        assert_eq!(pixel(&masked, 3, 3), 0);
    }
}
