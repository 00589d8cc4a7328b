#![forbid(unsafe_code)]

//! Overlay laboratory EMF/temperature measurements onto a video recording.
//!
//! The hard part is temporal: instrument samples arrive on their own
//! irregular clock and have to be resampled onto the video's per-frame
//! presentation timestamps before anything is drawn. The rest is a
//! deterministic per-frame compositor (crop, logo, rolling-rate plot inset,
//! text read-outs) feeding a piped ffmpeg encoder, wrapped in a staged,
//! progress-reporting pipeline.
//!
//! `ffmpeg`/`ffprobe` are required on `PATH`; decode and encode go through
//! rawvideo rgb24 pipes rather than linked FFmpeg libraries.

pub mod compose;
pub mod config;
pub mod encode_ffmpeg;
pub mod error;
pub mod frame;
pub mod media;
pub mod pipeline;
pub mod plot;
pub mod probe;
pub mod series;

pub use compose::{compose, info_lines, put_text, BBox, OverlayText};
pub use config::{GraphConfig, LogoConfig, OverlayConfig, TextConfig};
pub use encode_ffmpeg::{is_ffmpeg_on_path, EncodeConfig, FfmpegEncoder};
pub use error::{OverlayError, OverlayResult};
pub use frame::{Anchor, CropRegion, FrameRgb};
pub use media::{convert_video, VideoContext, VideoReader};
pub use pipeline::{
    CancelHandle, OverlayJob, Pipeline, PipelineEvent, ProcessProgress, ProcessResult, StageInfo,
};
pub use plot::{AxisLimits, PlotRaster, PlotRenderer};
pub use probe::probe_timestamps_ms;
pub use series::{align, AlignedSeries, FrameValues, MeasurementSeries};
