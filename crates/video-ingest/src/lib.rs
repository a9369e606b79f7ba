//! Frame acquisition for the print monitor.
//!
//! Readers run on their own threads and hand frames over bounded channels;
//! `ChannelSource` turns such a channel into the non-blocking `FrameSource`
//! poll the capture worker expects.

#[cfg(feature = "with-opencv")]
mod camera;
mod ffmpeg;
mod roi;
mod source;
mod types;

#[cfg(feature = "with-opencv")]
pub use camera::spawn_camera_reader;
pub use ffmpeg::spawn_ffmpeg_reader;
pub use roi::RoiMask;
pub use source::{ChannelSource, FrameSource};
pub use types::{CaptureError, Frame, FrameFormat};
