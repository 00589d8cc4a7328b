use plotters::prelude::*;

use crate::{
    config::{OverlayConfig, TextConfig},
    error::{OverlayError, OverlayResult},
    frame::{blend_rgba_at, fill_rect_blend, Anchor, CropRegion, FrameRgb},
    plot::PlotRaster,
    series::FrameValues,
};

/// Static text block contents for a job.
#[derive(Clone, Debug)]
pub struct OverlayText {
    pub operator: String,
    pub sample: String,
    /// Optional free-text line rendered below the operator line.
    pub extra: Option<String>,
}

impl OverlayText {
    pub fn new(operator: &str, sample: &str, extra: Option<String>) -> Self {
        Self {
            operator: format!("Operator: {operator}"),
            sample: format!("Sample: {sample}"),
            extra,
        }
    }
}

/// Occupied bounding box of a drawn text panel, padding included. Callers
/// stack subsequent lines against these edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BBox {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

/// Measurement read-out lines for the top-left stack, in draw order.
pub fn info_lines(values: &FrameValues) -> Vec<String> {
    let mut lines = vec![
        format!("t(s): {:.1}", values.time),
        format!("E(mV): {:.2}", values.emf),
    ];
    if let Some(temp) = values.temp {
        lines.push(format!("T(\u{b0}C): {temp:.0}"));
        if let Some(speed) = values.speed {
            lines.push(format!("dT/dt(\u{b0}C/s): {speed:.2}"));
        }
    }
    lines
}

/// Resolve an anchored text box to its padding-expanded panel rectangle.
pub(crate) fn panel_box(anchor: Anchor, x: i32, y: i32, w: u32, h: u32, padding: i32) -> BBox {
    let (tx, ty) = anchor.top_left(x, y, w, h);
    BBox {
        x0: tx - padding,
        y0: ty - padding,
        x1: tx + w as i32 + padding,
        y1: ty + h as i32 + padding,
    }
}

/// The plot inset is dropped silently when it would not fit below the top
/// margin at the frame's right edge.
pub(crate) fn inset_fits(fw: u32, fh: u32, gw: u32, gh: u32, y_off: i32) -> bool {
    let x_off = fw as i64 - gw as i64;
    x_off > 0 && i64::from(y_off) + i64::from(gh) < i64::from(fh)
}

/// Draw one text line on a translucent panel. Returns the occupied box.
pub fn put_text(
    frame: &mut FrameRgb,
    text: &str,
    x: i32,
    y: i32,
    anchor: Anchor,
    small: bool,
    cfg: &TextConfig,
) -> OverlayResult<BBox> {
    let size = if small { cfg.size_small } else { cfg.size };
    let color = RGBColor(cfg.color[0], cfg.color[1], cfg.color[2]);
    let style = ("sans-serif", size as i32).into_font().color(&color);

    let (tw, th) = style.font.box_size(text).map_err(|e| {
        OverlayError::validation(format!("text layout failed for '{text}': {e:?}"))
    })?;

    let bbox = panel_box(anchor, x, y, tw, th, cfg.padding);
    fill_rect_blend(
        frame,
        bbox.x0,
        bbox.y0,
        bbox.x1,
        bbox.y1,
        cfg.panel_color,
        cfg.panel_alpha,
    );

    let (tx, ty) = anchor.top_left(x, y, tw, th);
    let mut backend = BitMapBackend::with_buffer(&mut frame.data, (frame.width, frame.height));
    backend
        .draw_text(text, &style, (tx, ty))
        .map_err(|e| OverlayError::validation(format!("text rendering failed: {e}")))?;
    backend
        .present()
        .map_err(|e| OverlayError::validation(format!("text rendering failed: {e}")))?;

    Ok(bbox)
}

/// Compose one annotated frame: crop, logo, plot inset, then text blocks.
/// Consumes the decoded frame and returns a new buffer; the input is never
/// visible to the caller again, partially modified.
pub fn compose(
    frame: FrameRgb,
    crop: Option<CropRegion>,
    values: &FrameValues,
    plot: Option<&PlotRaster>,
    text: &OverlayText,
    logo: Option<&image::RgbaImage>,
    cfg: &OverlayConfig,
) -> OverlayResult<FrameRgb> {
    let mut frame = match crop {
        Some(region) => {
            let region = region.clamp(frame.width, frame.height);
            frame.crop(region)
        }
        None => frame,
    };

    if let Some(logo) = logo {
        let frame_w = frame.width as i32;
        let frame_h = frame.height as i32;
        blend_rgba_at(
            &mut frame,
            logo.as_raw(),
            logo.width(),
            logo.height(),
            frame_w,
            frame_h,
            Anchor::BottomRight,
        )?;
    }

    if let Some(raster) = plot {
        let y_off = cfg.text.margin_y;
        if inset_fits(frame.width, frame.height, raster.width, raster.height, y_off) {
            let x_off = (frame.width - raster.width) as i32;
            blend_rgba_at(
                &mut frame,
                &raster.data,
                raster.width,
                raster.height,
                x_off,
                y_off,
                Anchor::TopLeft,
            )?;
        }
    }

    // Top-left read-outs, stacked downward.
    let mut y = cfg.text.margin_y;
    for line in info_lines(values) {
        let bbox = put_text(
            &mut frame,
            &line,
            cfg.text.margin_x,
            y,
            Anchor::TopLeft,
            false,
            &cfg.text,
        )?;
        y = bbox.y1 + cfg.text.line_spacing;
    }

    // Bottom-left block, stacked upward from the bottom edge.
    let mut y = frame.height as i32 - cfg.text.margin_y;
    if let Some(extra) = &text.extra {
        let bbox = put_text(
            &mut frame,
            extra,
            cfg.text.margin_x,
            y,
            Anchor::BottomLeft,
            true,
            &cfg.text,
        )?;
        y = bbox.y0 - cfg.text.line_spacing;
    }
    let bbox = put_text(
        &mut frame,
        &text.operator,
        cfg.text.margin_x,
        y,
        Anchor::BottomLeft,
        true,
        &cfg.text,
    )?;
    let y = bbox.y0 - cfg.text.line_spacing;
    put_text(
        &mut frame,
        &text.sample,
        cfg.text.margin_x,
        y,
        Anchor::BottomLeft,
        false,
        &cfg.text,
    )?;

    Ok(frame)
}
