use plotters::prelude::*;

use crate::{config::GraphConfig, error::OverlayResult};

/// Straight-alpha RGBA raster in the channel order the compositor consumes.
#[derive(Clone, Debug)]
pub struct PlotRaster {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Axis limits of the rolling viewport. Compared exactly: the background is
/// re-rasterized only when the viewport actually moved.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisLimits {
    pub x: (f64, f64),
    pub y: (f64, f64),
}

/// Incremental renderer for the rate-of-change series.
///
/// Keeps a cached raster of the static layer (panel, axes, grid, labels) and
/// redraws only the history line and current-value marker per frame.
/// Re-rasterizing labels every frame is the dominant cost at high
/// resolutions, and unnecessary while the viewport is unchanged.
pub struct PlotRenderer {
    speed: Vec<f64>,
    fps: f64,
    window_frames: usize,
    width: u32,
    height: u32,
    cfg: GraphConfig,
    background: Vec<u8>,
    cached_limits: Option<AxisLimits>,
    background_renders: usize,
}

impl PlotRenderer {
    pub fn new(speed: &[f64], fps: f64, width: u32, height: u32, cfg: &GraphConfig) -> Self {
        // Instrument glitches produce NaN/inf samples; they render as zero.
        let speed: Vec<f64> = speed
            .iter()
            .map(|v| if v.is_finite() { *v } else { 0.0 })
            .collect();
        let fps = if fps > 0.0 { fps } else { 30.0 };

        Self {
            window_frames: (cfg.time_window_sec * fps) as usize,
            speed,
            fps,
            width: width.max(1),
            height: height.max(1),
            cfg: cfg.clone(),
            background: Vec::new(),
            cached_limits: None,
            background_renders: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.speed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speed.is_empty()
    }

    /// Number of times the static layer has been rasterized.
    pub fn background_renders(&self) -> usize {
        self.background_renders
    }

    /// Viewport for a frame: trailing time window on x, padded min/max of the
    /// visible samples on y.
    pub fn compute_limits(&self, idx: usize) -> AxisLimits {
        let t = idx as f64 / self.fps;
        let x = if t <= self.cfg.time_window_sec {
            (0.0, t.max(0.1))
        } else {
            (t - self.cfg.time_window_sec, t)
        };

        let start = idx.saturating_sub(self.window_frames);
        let visible = &self.speed[start..=idx.min(self.speed.len().saturating_sub(1))];
        let y = if visible.is_empty() {
            (-1.0, 1.0)
        } else {
            let y_min = visible.iter().cloned().fold(f64::INFINITY, f64::min);
            let y_max = visible.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mut margin = (y_max - y_min) * 0.1;
            if margin == 0.0 {
                margin = 1.0;
            }
            (y_min - margin, y_max + margin)
        };

        AxisLimits { x, y }
    }

    /// Render the overlay for a frame. An index outside the series is a
    /// programming error in the caller's frame loop.
    pub fn overlay_rgba(&mut self, idx: usize) -> OverlayResult<PlotRaster> {
        assert!(
            idx < self.speed.len(),
            "plot frame index {idx} out of range 0..{}",
            self.speed.len()
        );

        let limits = self.compute_limits(idx);
        if self.cached_limits != Some(limits) {
            self.render_background(limits)?;
            self.cached_limits = Some(limits);
        }

        let mut rgb = self.background.clone();
        self.draw_dynamic(&mut rgb, idx, limits)?;

        Ok(PlotRaster {
            width: self.width,
            height: self.height,
            data: rgb_to_rgba_keyed(&rgb, self.cfg.panel_color, self.cfg.panel_alpha),
        })
    }

    fn label_px(&self) -> (i32, i32) {
        // Left/bottom tick label gutters, scaled with the inset.
        let left = (self.width as i32 / 6).clamp(30, 70);
        let bottom = (self.height as i32 / 6).clamp(24, 50);
        (left, bottom)
    }

    fn font_pt(&self) -> (i32, i32) {
        let title = (self.height as i32 / 10).clamp(12, 28);
        let label = (self.height as i32 / 14).clamp(8, 18);
        (title, label)
    }

    fn render_background(&mut self, limits: AxisLimits) -> OverlayResult<()> {
        let mut buf = vec![0u8; self.width as usize * self.height as usize * 3];
        let panel = rgb(self.cfg.panel_color);
        let fg = rgb(self.cfg.line_color);
        let (left, bottom) = self.label_px();
        let (title_pt, label_pt) = self.font_pt();

        {
            let root = BitMapBackend::with_buffer(&mut buf, (self.width, self.height))
                .into_drawing_area();
            root.fill(&panel)?;

            let mut chart = ChartBuilder::on(&root)
                .margin(5)
                .caption("dT/dt (\u{b0}C/s)", ("sans-serif", title_pt).into_font().color(&fg))
                .set_label_area_size(LabelAreaPosition::Left, left)
                .set_label_area_size(LabelAreaPosition::Bottom, bottom)
                .build_cartesian_2d(limits.x.0..limits.x.1, limits.y.0..limits.y.1)?;

            chart
                .configure_mesh()
                .light_line_style(fg.mix(0.1))
                .bold_line_style(fg.mix(0.2))
                .axis_style(&fg)
                .label_style(("sans-serif", label_pt).into_font().color(&fg))
                .x_desc("t(s)")
                .x_labels(5)
                .y_labels(4)
                .x_label_formatter(&|v| format!("{v:.1}"))
                .y_label_formatter(&|v| format!("{v:.2}"))
                .draw()?;

            root.present()?;
        }

        self.background = buf;
        self.background_renders += 1;
        Ok(())
    }

    fn draw_dynamic(&self, buf: &mut [u8], idx: usize, limits: AxisLimits) -> OverlayResult<()> {
        let fg = rgb(self.cfg.line_color);
        let marker = rgb(self.cfg.marker_color);
        let (left, bottom) = self.label_px();
        let (title_pt, _) = self.font_pt();
        let fps = self.fps;

        let root =
            BitMapBackend::with_buffer(buf, (self.width, self.height)).into_drawing_area();

        // Same builder geometry as the background pass, so both charts map
        // data coordinates onto the same pixels; the mesh is not redrawn.
        let mut chart = ChartBuilder::on(&root)
            .margin(5)
            .caption("dT/dt (\u{b0}C/s)", ("sans-serif", title_pt).into_font().color(&fg))
            .set_label_area_size(LabelAreaPosition::Left, left)
            .set_label_area_size(LabelAreaPosition::Bottom, bottom)
            .build_cartesian_2d(limits.x.0..limits.x.1, limits.y.0..limits.y.1)?;

        let history = (0..=idx).map(|i| (i as f64 / fps, self.speed[i]));
        chart.draw_series(LineSeries::new(
            history,
            ShapeStyle::from(&fg).stroke_width(self.cfg.line_width),
        ))?;

        chart.draw_series(std::iter::once(Circle::new(
            (idx as f64 / fps, self.speed[idx]),
            self.cfg.marker_size as i32,
            marker.filled(),
        )))?;

        root.present()?;
        Ok(())
    }
}

fn rgb(c: [u8; 3]) -> RGBColor {
    RGBColor(c[0], c[1], c[2])
}

/// Derive straight alpha from an RGB raster: pixels left at the panel fill
/// color carry the panel's translucency, drawn pixels scale toward opaque by
/// their maximum channel distance from the fill.
fn rgb_to_rgba_keyed(rgb: &[u8], panel: [u8; 3], panel_alpha: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgb.len() / 3 * 4);
    for px in rgb.chunks_exact(3) {
        let coverage = px
            .iter()
            .zip(panel.iter())
            .map(|(&c, &p)| (i16::from(c) - i16::from(p)).unsigned_abs())
            .max()
            .unwrap_or(0) as u32;
        let alpha =
            u32::from(panel_alpha) + ((255 - u32::from(panel_alpha)) * coverage + 127) / 255;
        out.extend_from_slice(px);
        out.push(alpha.min(255) as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fonts_available() -> bool {
        ("sans-serif", 12)
            .into_font()
            .box_size("0")
            .map(|(w, h)| w > 0 && h > 0)
            .unwrap_or(false)
    }

    fn renderer(speed: &[f64], fps: f64) -> PlotRenderer {
        PlotRenderer::new(speed, fps, 320, 240, &GraphConfig::default())
    }

    #[test]
    fn warmup_widens_x_range_from_zero() {
        let r = renderer(&vec![0.0; 100], 10.0);
        let limits = r.compute_limits(0);
        assert_eq!(limits.x, (0.0, 0.1));

        let limits = r.compute_limits(50); // t = 5s, window 30s
        assert_eq!(limits.x, (0.0, 5.0));
    }

    #[test]
    fn full_window_slides_with_time() {
        let speed = vec![0.0; 2000];
        let r = renderer(&speed, 10.0);
        let limits = r.compute_limits(1000); // t = 100s
        assert_eq!(limits.x, (70.0, 100.0));
    }

    #[test]
    fn y_limits_pad_visible_range_by_ten_percent() {
        let mut speed = vec![0.0; 50];
        speed[10] = 10.0;
        let r = renderer(&speed, 10.0);
        let limits = r.compute_limits(20);
        assert_eq!(limits.y, (-1.0, 11.0));
    }

    #[test]
    fn flat_series_gets_fixed_margin() {
        let r = renderer(&vec![5.0; 50], 10.0);
        let limits = r.compute_limits(10);
        assert_eq!(limits.y, (4.0, 6.0));
    }

    #[test]
    fn y_limits_track_only_the_trailing_window() {
        // A large excursion older than the window must not affect the range.
        let mut speed = vec![0.0; 500];
        speed[0] = 1000.0;
        let r = PlotRenderer::new(
            &speed,
            10.0,
            320,
            240,
            &GraphConfig {
                time_window_sec: 2.0,
                ..GraphConfig::default()
            },
        );
        let limits = r.compute_limits(400);
        assert_eq!(limits.y, (-1.0, 1.0));
    }

    #[test]
    fn non_finite_samples_are_sanitized() {
        let r = renderer(&[f64::NAN, f64::INFINITY, 1.0], 10.0);
        assert_eq!(r.speed, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn background_rerenders_iff_limits_change() {
        if !fonts_available() {
            return;
        }
        let mut r = renderer(&vec![1.0; 100], 10.0);
        r.overlay_rgba(5).unwrap();
        assert_eq!(r.background_renders(), 1);

        // Same frame, same limits: cached background is reused.
        r.overlay_rgba(5).unwrap();
        r.overlay_rgba(5).unwrap();
        assert_eq!(r.background_renders(), 1);

        // Time advanced, x limits moved: one more rasterization.
        r.overlay_rgba(6).unwrap();
        assert_eq!(r.background_renders(), 2);
    }

    #[test]
    fn overlay_raster_has_rgba_layout_and_panel_alpha() {
        if !fonts_available() {
            return;
        }
        let cfg = GraphConfig::default();
        let mut r = PlotRenderer::new(&vec![0.0; 10], 10.0, 200, 150, &cfg);
        let raster = r.overlay_rgba(0).unwrap();
        assert_eq!(raster.data.len(), 200 * 150 * 4);
        // Panel-colored pixels carry the configured translucency.
        assert!(raster.data.chunks_exact(4).any(|px| px[3] == cfg.panel_alpha));
        // Something was drawn fully or nearly opaque (axes/line).
        assert!(raster.data.chunks_exact(4).any(|px| px[3] > cfg.panel_alpha));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_index_panics() {
        let mut r = renderer(&[1.0, 2.0], 10.0);
        let _ = r.overlay_rgba(2);
    }

    #[test]
    fn keyed_alpha_scales_with_channel_distance() {
        let panel = [0, 0, 0];
        let data = [0u8, 0, 0, 255, 255, 255, 0, 0, 128]; // panel, white, mid-blue
        let out = rgb_to_rgba_keyed(&data, panel, 100);
        assert_eq!(out[3], 100);
        assert_eq!(out[7], 255);
        assert!(out[11] > 100 && out[11] < 255);
    }
}
