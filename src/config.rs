use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context as _;

use crate::error::{OverlayError, OverlayResult};

/// Immutable per-job configuration.
///
/// Built once by the caller and passed by reference into component
/// constructors; components never consult shared mutable state mid-job.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub text: TextConfig,
    pub graph: GraphConfig,
    pub logo: LogoConfig,
    /// Optional free-text line rendered above the operator line.
    pub additional_text: Option<String>,
    /// Attach the composited frame to per-frame progress events (live preview).
    pub preview_frames: bool,
    /// Bound of the worker-to-caller event channel.
    pub event_capacity: usize,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub margin_x: i32,
    pub margin_y: i32,
    pub line_spacing: i32,
    /// Padding added around each string's rendered bounding box.
    pub padding: i32,
    /// Pixel height of the regular overlay font.
    pub size: u32,
    /// Pixel height of the small variant (operator line, free-text line).
    pub size_small: u32,
    pub color: [u8; 3],
    pub panel_color: [u8; 3],
    /// Opacity of the translucent background panel behind each text line.
    pub panel_alpha: u8,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub enabled: bool,
    /// Trailing time window shown on the x axis, seconds.
    pub time_window_sec: f64,
    /// Centered rolling-mean window over the temperature series, frames.
    pub temp_smoothing_window: usize,
    /// Centered rolling-mean window over the derivative series, frames.
    pub speed_smoothing_window: usize,
    pub line_width: u32,
    pub marker_size: u32,
    pub line_color: [u8; 3],
    pub marker_color: [u8; 3],
    pub panel_color: [u8; 3],
    /// Opacity of the plot panel where nothing is drawn.
    pub panel_alpha: u8,
    /// Inset size as a fraction of the output frame size.
    pub width_frac: f64,
    pub height_frac: f64,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogoConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            text: TextConfig::default(),
            graph: GraphConfig::default(),
            logo: LogoConfig::default(),
            additional_text: None,
            preview_frames: false,
            event_capacity: 64,
        }
    }
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            margin_x: 5,
            margin_y: 5,
            line_spacing: 10,
            padding: 5,
            size: 60,
            size_small: 40,
            color: [255, 255, 0],
            panel_color: [63, 63, 63],
            panel_alpha: 160,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time_window_sec: 30.0,
            temp_smoothing_window: 15,
            speed_smoothing_window: 15,
            line_width: 2,
            marker_size: 4,
            line_color: [255, 255, 0],
            marker_color: [255, 0, 0],
            panel_color: [63, 63, 63],
            panel_alpha: 112,
            width_frac: 0.34,
            height_frac: 0.30,
        }
    }
}

impl OverlayConfig {
    pub fn from_json_file(path: &Path) -> OverlayResult<Self> {
        let f = File::open(path)
            .with_context(|| format!("open config '{}'", path.display()))?;
        let cfg: OverlayConfig = serde_json::from_reader(BufReader::new(f))
            .map_err(|e| OverlayError::validation(format!("parse config JSON: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> OverlayResult<()> {
        if self.text.size == 0 || self.text.size_small == 0 {
            return Err(OverlayError::validation("text sizes must be non-zero"));
        }
        if self.graph.time_window_sec <= 0.0 {
            return Err(OverlayError::validation(
                "graph time window must be positive",
            ));
        }
        if self.graph.temp_smoothing_window == 0 || self.graph.speed_smoothing_window == 0 {
            return Err(OverlayError::validation(
                "smoothing windows must be at least 1 frame",
            ));
        }
        if !(0.0..=1.0).contains(&self.graph.width_frac)
            || !(0.0..=1.0).contains(&self.graph.height_frac)
        {
            return Err(OverlayError::validation(
                "graph size fractions must be within [0, 1]",
            ));
        }
        if self.event_capacity == 0 {
            return Err(OverlayError::validation("event capacity must be non-zero"));
        }
        Ok(())
    }
}

impl GraphConfig {
    /// Inset size for a given output frame, floored to a usable minimum.
    pub fn inset_size(&self, frame_w: u32, frame_h: u32) -> (u32, u32) {
        let w = ((f64::from(frame_w) * self.width_frac) as u32).max(160);
        let h = ((f64::from(frame_h) * self.height_frac) as u32).max(120);
        (w.min(frame_w), h.min(frame_h))
    }
}
