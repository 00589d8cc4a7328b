use crate::{
    config::GraphConfig,
    error::{OverlayError, OverlayResult},
};

/// Raw instrument data as loaded by the caller. Read-only to this crate.
#[derive(Clone, Debug)]
pub struct MeasurementSeries {
    /// Seconds, strictly increasing.
    pub time: Vec<f64>,
    /// Electromotive force, millivolts.
    pub emf: Vec<f64>,
    /// Calibrated temperature, degrees Celsius. Absent for uncalibrated runs.
    pub temp: Option<Vec<f64>>,
}

impl MeasurementSeries {
    pub fn validate(&self) -> OverlayResult<()> {
        if self.time.is_empty() {
            return Err(OverlayError::validation("measurement series is empty"));
        }
        if self.emf.len() != self.time.len() {
            return Err(OverlayError::validation(format!(
                "emf length {} does not match time length {}",
                self.emf.len(),
                self.time.len()
            )));
        }
        if let Some(temp) = &self.temp {
            if temp.len() != self.time.len() {
                return Err(OverlayError::validation(format!(
                    "temp length {} does not match time length {}",
                    temp.len(),
                    self.time.len()
                )));
            }
        }
        if self.time.iter().any(|t| !t.is_finite()) {
            return Err(OverlayError::validation(
                "measurement timestamps must be finite",
            ));
        }
        if self.time.windows(2).any(|w| w[0] >= w[1]) {
            return Err(OverlayError::validation(
                "measurement timestamps must be strictly increasing",
            ));
        }
        Ok(())
    }
}

/// Measurement values resampled onto the video's per-frame timestamp vector.
/// Built once per job; all arrays share the frame count as their length.
#[derive(Clone, Debug)]
pub struct AlignedSeries {
    /// Per-frame presentation times, seconds.
    pub timestamps: Vec<f64>,
    pub emf: Vec<f64>,
    pub temp: Option<Vec<f64>>,
    /// Smoothed d(temp)/dt. Present iff `temp` is.
    pub speed: Option<Vec<f64>>,
}

/// Values for a single frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameValues {
    pub time: f64,
    pub emf: f64,
    pub temp: Option<f64>,
    pub speed: Option<f64>,
}

impl AlignedSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn values_at(&self, idx: usize) -> FrameValues {
        FrameValues {
            time: self.timestamps[idx],
            emf: self.emf[idx],
            temp: self.temp.as_ref().map(|t| t[idx]),
            speed: self.speed.as_ref().map(|s| s[idx]),
        }
    }
}

/// Resample a measurement series onto the video frame clock.
///
/// `emf`/`temp` are piecewise-linear interpolations; outside the raw span the
/// edge segment's slope is followed rather than clamping to the edge value.
pub fn align(
    frame_timestamps_sec: &[f64],
    series: &MeasurementSeries,
    graph: &GraphConfig,
) -> OverlayResult<AlignedSeries> {
    series.validate()?;

    let emf = interp_linear_extrapolated(frame_timestamps_sec, &series.time, &series.emf);
    let (temp, speed) = match &series.temp {
        Some(raw_temp) => {
            let temp = interp_linear_extrapolated(frame_timestamps_sec, &series.time, raw_temp);
            let speed = calculate_speed(
                frame_timestamps_sec,
                &temp,
                graph.temp_smoothing_window,
                graph.speed_smoothing_window,
            );
            (Some(temp), Some(speed))
        }
        None => (None, None),
    };

    Ok(AlignedSeries {
        timestamps: frame_timestamps_sec.to_vec(),
        emf,
        temp,
        speed,
    })
}

/// Smoothed derivative of a sampled signal.
///
/// A single-pass derivative of a low-sample-rate noisy signal is unusable at
/// video frame rates, so the signal is denoised before differentiation and
/// the gradient denoised again after.
pub fn calculate_speed(
    x: &[f64],
    y: &[f64],
    temp_window: usize,
    speed_window: usize,
) -> Vec<f64> {
    if x.len() < 2 {
        return vec![0.0; y.len()];
    }
    let smooth = rolling_mean_centered(y, temp_window);
    let raw_speed = gradient(&smooth, x);
    rolling_mean_centered(&raw_speed, speed_window)
}

/// Piecewise-linear interpolation of `(xp, fp)` sampled at `xs`, with linear
/// extrapolation along the nearest edge segment outside `xp`'s span.
pub fn interp_linear_extrapolated(xs: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    debug_assert_eq!(xp.len(), fp.len());
    if xp.len() == 1 {
        return vec![fp[0]; xs.len()];
    }

    xs.iter()
        .map(|&x| {
            let seg = match xp.binary_search_by(|v| v.total_cmp(&x)) {
                Ok(i) => return fp[i],
                Err(0) => 0,
                Err(i) if i >= xp.len() => xp.len() - 2,
                Err(i) => i - 1,
            };
            let slope = (fp[seg + 1] - fp[seg]) / (xp[seg + 1] - xp[seg]);
            fp[seg] + (x - xp[seg]) * slope
        })
        .collect()
}

/// Centered rolling mean with a minimum of one in-window sample.
///
/// The window for index `i` covers `[i + w/2 - w + 1, i + w/2]`, intersected
/// with the series; partial windows average whatever samples are available.
pub fn rolling_mean_centered(y: &[f64], window: usize) -> Vec<f64> {
    let n = y.len();
    if n == 0 {
        return Vec::new();
    }
    let w = window.max(1) as i64;

    (0..n as i64)
        .map(|i| {
            let hi = (i + w / 2).min(n as i64 - 1) as usize;
            let lo = (i + w / 2 - w + 1).max(0) as usize;
            let slice = &y[lo..=hi];
            slice.iter().sum::<f64>() / slice.len() as f64
        })
        .collect()
}

/// Discrete gradient dy/dx on a possibly non-uniform grid: second-order
/// central differences in the interior, one-sided at the two boundaries.
/// Repeated x values contribute a zero slope instead of an infinity.
pub fn gradient(y: &[f64], x: &[f64]) -> Vec<f64> {
    debug_assert_eq!(y.len(), x.len());
    let n = y.len();
    if n < 2 {
        return vec![0.0; n];
    }

    let one_sided = |a: usize, b: usize| -> f64 {
        let dx = x[b] - x[a];
        if dx == 0.0 { 0.0 } else { (y[b] - y[a]) / dx }
    };

    let mut out = vec![0.0; n];
    out[0] = one_sided(0, 1);
    out[n - 1] = one_sided(n - 2, n - 1);
    for i in 1..n - 1 {
        let hs = x[i] - x[i - 1];
        let hd = x[i + 1] - x[i];
        out[i] = if hs == 0.0 && hd == 0.0 {
            0.0
        } else if hs == 0.0 {
            one_sided(i, i + 1)
        } else if hd == 0.0 {
            one_sided(i - 1, i)
        } else {
            (hs * hs * y[i + 1] + (hd * hd - hs * hs) * y[i] - hd * hd * y[i - 1])
                / (hs * hd * (hs + hd))
        };
    }
    out
}
