use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context as _;
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::{
    compose::{compose, OverlayText},
    config::OverlayConfig,
    encode_ffmpeg::{EncodeConfig, FfmpegEncoder},
    error::{OverlayError, OverlayResult},
    frame::{CropRegion, FrameRgb},
    media::{convert_video, VideoContext, VideoReader},
    plot::PlotRenderer,
    probe::probe_timestamps_ms,
    series::{align, AlignedSeries, MeasurementSeries},
};

/// Point-in-time progress of the running stage, optionally carrying the
/// composited frame for live preview.
#[derive(Clone, Debug)]
pub struct ProcessProgress {
    pub value: f64,
    pub frame: Option<FrameRgb>,
}

impl ProcessProgress {
    pub fn at(value: f64) -> Self {
        Self { value, frame: None }
    }
}

/// Announces a new progress scale when the pipeline enters a stage.
#[derive(Clone, Debug)]
pub struct StageInfo {
    pub total_units: f64,
    pub label: String,
    pub unit: String,
}

/// Terminal outcome of a job. Exactly one is delivered per run.
#[derive(Clone, Debug)]
pub struct ProcessResult {
    pub success: bool,
    pub error_message: Option<String>,
}

impl ProcessResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(msg.into()),
        }
    }
}

/// Everything crossing the worker/caller boundary.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Stage(StageInfo),
    Progress(ProcessProgress),
    Finished(ProcessResult),
}

/// One overlay job as supplied by the caller.
#[derive(Clone, Debug)]
pub struct OverlayJob {
    pub video_input: PathBuf,
    pub video_output: PathBuf,
    pub series: MeasurementSeries,
    pub crop: Option<CropRegion>,
    pub operator: String,
    pub sample: String,
}

/// Cooperative cancellation flag, checked between frames and between stages.
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Drives one job end to end on a dedicated worker: optional pre-conversion,
/// the sequential overlay pass, and the final container conversion.
///
/// The pipeline owns a scoped temporary workspace for the duration of the run
/// and removes it on every exit path. Frame order is strictly sequential; the
/// plot cache and the derivative both assume monotonically increasing
/// indices.
pub struct Pipeline {
    job: OverlayJob,
    cfg: OverlayConfig,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(job: OverlayJob, cfg: OverlayConfig) -> Self {
        Self {
            job,
            cfg,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Run on a dedicated worker thread, returning the event channel.
    pub fn spawn(self) -> OverlayResult<(thread::JoinHandle<()>, Receiver<PipelineEvent>)> {
        let (tx, rx) = bounded(self.cfg.event_capacity);
        let handle = thread::Builder::new()
            .name("thermoverlay-pipeline".into())
            .spawn(move || self.run(&tx))
            .context("failed to spawn pipeline worker thread")?;
        Ok((handle, rx))
    }

    /// Execute the job, delivering exactly one terminal result. Every failure
    /// mode below this point, panics included, is converted into a
    /// `ProcessResult` rather than crossing the channel as an exception.
    pub fn run(self, events: &Sender<PipelineEvent>) {
        let result =
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run_inner(events)))
            {
                Ok(result) => result,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "worker panicked".to_string());
                    ProcessResult::failure(format!("internal error: {msg}"))
                }
            };
        let _ = events.send(PipelineEvent::Finished(result));
    }

    fn run_inner(&self, events: &Sender<PipelineEvent>) -> ProcessResult {
        let tempdir = match tempfile::TempDir::new() {
            Ok(dir) => dir,
            Err(e) => {
                return ProcessResult::failure(format!(
                    "failed to allocate temporary workspace: {e}"
                ));
            }
        };

        let outcome = self.execute(tempdir.path(), events);
        tracing::info!(tempdir = %tempdir.path().display(), "cleaning temporary workspace");

        match outcome {
            Ok(()) => ProcessResult::ok(),
            Err(e) => {
                let chain = anyhow::Error::new(e);
                ProcessResult::failure(format!("{chain:#}"))
            }
        }
    }

    fn execute(&self, tempdir: &Path, events: &Sender<PipelineEvent>) -> OverlayResult<()> {
        self.check_cancelled()?;

        let input = &self.job.video_input;
        let output = &self.job.video_output;
        if output.exists() {
            return Err(OverlayError::validation(format!(
                "output file '{}' already exists; refusing to overwrite",
                output.display()
            )));
        }

        let tmp1 = tempdir.join("out1.mp4");
        let tmp2 = tempdir.join("out2.mp4");

        // Stage 1: normalize the container when it exposes no usable
        // per-packet timestamps. Precise alignment needs them.
        self.emit_stage(events, 100.0, "1/3", "%");
        let (file_to_overlay, timestamps_ms) = match probe_timestamps_ms(input, 0) {
            Ok(ts) if ts.len() >= 2 => {
                self.emit(events, PipelineEvent::Progress(ProcessProgress::at(100.0)));
                (input.clone(), ts)
            }
            Ok(_) | Err(OverlayError::InvalidStream(_)) => {
                tracing::warn!("input video has no usable timestamps, preconverting");
                convert_video(input, &tmp1, |pct| {
                    self.emit(events, PipelineEvent::Progress(ProcessProgress::at(pct)));
                })?;
                let ts = probe_timestamps_ms(&tmp1, 0)?;
                (tmp1.clone(), ts)
            }
            Err(e) => return Err(e),
        };
        self.check_cancelled()?;

        let timestamps: Vec<f64> = timestamps_ms.iter().map(|&ms| ms as f64 / 1000.0).collect();
        tracing::info!(frames = timestamps.len(), "number of video frames");
        let aligned = align(&timestamps, &self.job.series, &self.cfg.graph)?;
        if aligned.is_empty() {
            return Err(OverlayError::invalid_stream(
                "video exposes no frames to overlay",
            ));
        }

        // Stage 2: frame-by-frame overlay.
        self.emit_stage(events, (aligned.len() - 1) as f64, "2/3", "frame");
        self.overlay_pass(&file_to_overlay, &tmp2, &aligned, events)?;

        // Stage 3: final container conversion to the caller's destination.
        self.emit_stage(events, 100.0, "3/3", "%");
        self.check_cancelled()?;
        convert_video(&tmp2, output, |pct| {
            self.emit(events, PipelineEvent::Progress(ProcessProgress::at(pct)));
        })?;

        Ok(())
    }

    fn overlay_pass(
        &self,
        input: &Path,
        output: &Path,
        aligned: &AlignedSeries,
        events: &Sender<PipelineEvent>,
    ) -> OverlayResult<()> {
        let ctx = VideoContext::open(input)?;
        let fps = if ctx.fps > 0.0 { ctx.fps } else { 30.0 };

        let crop = match self.job.crop {
            Some(region) => Some(region.clamp(ctx.width, ctx.height).snap_even()),
            // yuv420p output needs even dimensions either way.
            None if ctx.width % 2 != 0 || ctx.height % 2 != 0 => Some(CropRegion::new(
                0,
                0,
                (ctx.width & !1) as i32,
                (ctx.height & !1) as i32,
            )),
            None => None,
        };
        let (out_w, out_h) = match crop {
            Some(region) => (region.w as u32, region.h as u32),
            None => (ctx.width, ctx.height),
        };
        tracing::info!(width = out_w, height = out_h, fps, "overlay pass started");

        let mut reader = VideoReader::open(&ctx)?;
        let mut encoder = FfmpegEncoder::new(EncodeConfig {
            width: out_w,
            height: out_h,
            fps,
            out_path: output.to_path_buf(),
            overwrite: true,
        })?;

        let logo = self.load_logo();
        let mut plot = match &aligned.speed {
            Some(speed) if self.cfg.graph.enabled => {
                let (gw, gh) = self.cfg.graph.inset_size(out_w, out_h);
                Some(PlotRenderer::new(speed, fps, gw, gh, &self.cfg.graph))
            }
            _ => None,
        };
        let text = OverlayText::new(
            &self.job.operator,
            &self.job.sample,
            self.cfg.additional_text.clone(),
        );

        for idx in 0..aligned.len() {
            self.check_cancelled()?;

            let raw = match reader.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if idx + 1 < aligned.len() {
                        tracing::warn!(frame = idx, "video stream ended early");
                    }
                    break;
                }
                // Recoverable: stop the loop, finalize what was written.
                Err(e) => {
                    tracing::warn!(frame = idx, error = %e, "frame read failed, finalizing partial output");
                    break;
                }
            };

            let raster = match plot.as_mut() {
                Some(renderer) => Some(renderer.overlay_rgba(idx)?),
                None => None,
            };
            let composited = compose(
                raw,
                crop,
                &aligned.values_at(idx),
                raster.as_ref(),
                &text,
                logo.as_ref(),
                &self.cfg,
            )?;
            encoder.encode_frame(&composited)?;

            self.emit(
                events,
                PipelineEvent::Progress(ProcessProgress {
                    value: idx as f64,
                    frame: self.cfg.preview_frames.then_some(composited),
                }),
            );
        }

        reader.close();
        encoder.finish()?;
        tracing::info!("overlay pass finished");
        Ok(())
    }

    fn load_logo(&self) -> Option<image::RgbaImage> {
        if !self.cfg.logo.enabled {
            return None;
        }
        let path = self.cfg.logo.path.as_ref()?;
        match image::open(path) {
            Ok(img) => Some(img.to_rgba8()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load logo, disabling");
                None
            }
        }
    }

    fn check_cancelled(&self) -> OverlayResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(OverlayError::validation("job cancelled by caller"));
        }
        Ok(())
    }

    fn emit_stage(&self, events: &Sender<PipelineEvent>, total_units: f64, label: &str, unit: &str) {
        self.emit(
            events,
            PipelineEvent::Stage(StageInfo {
                total_units,
                label: label.to_string(),
                unit: unit.to_string(),
            }),
        );
    }

    // A caller that dropped its receiver aborts nothing; the job runs to its
    // terminal result regardless.
    fn emit(&self, events: &Sender<PipelineEvent>, event: PipelineEvent) {
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(input: &Path, output: &Path) -> OverlayJob {
        OverlayJob {
            video_input: input.to_path_buf(),
            video_output: output.to_path_buf(),
            series: MeasurementSeries {
                time: vec![0.0, 1.0],
                emf: vec![1.0, 2.0],
                temp: None,
            },
            crop: None,
            operator: "op".to_string(),
            sample: "sample".to_string(),
        }
    }

    fn collect_events(rx: &Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        rx.iter().collect()
    }

    #[test]
    fn existing_output_path_is_a_caller_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        std::fs::write(&output, b"occupied").unwrap();

        let pipeline = Pipeline::new(job(&dir.path().join("in.mp4"), &output), OverlayConfig::default());
        let (handle, rx) = pipeline.spawn().unwrap();
        let events = collect_events(&rx);
        handle.join().unwrap();

        let PipelineEvent::Finished(result) = events.last().unwrap() else {
            panic!("last event must be the terminal result");
        };
        assert!(!result.success);
        assert!(
            result.error_message.as_ref().unwrap().contains("already exists"),
            "{:?}",
            result.error_message
        );
        // The pre-existing file is untouched.
        assert_eq!(std::fs::read(&output).unwrap(), b"occupied");
    }

    #[test]
    fn missing_input_fails_with_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            job(&dir.path().join("nope.mp4"), &dir.path().join("out.mp4")),
            OverlayConfig::default(),
        );
        let (handle, rx) = pipeline.spawn().unwrap();
        let events = collect_events(&rx);
        handle.join().unwrap();

        let finished: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::Finished(_)))
            .collect();
        assert_eq!(finished.len(), 1);
        let PipelineEvent::Finished(result) = finished[0] else {
            unreachable!()
        };
        assert!(!result.success);
        assert!(
            result.error_message.as_ref().unwrap().contains("nope.mp4"),
            "{:?}",
            result.error_message
        );
    }

    #[test]
    fn cancelled_job_reports_failure_without_touching_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let pipeline = Pipeline::new(job(&dir.path().join("in.mp4"), &output), OverlayConfig::default());
        pipeline.cancel_handle().cancel();

        let (handle, rx) = pipeline.spawn().unwrap();
        let events = collect_events(&rx);
        handle.join().unwrap();

        let PipelineEvent::Finished(result) = events.last().unwrap() else {
            panic!("expected terminal result");
        };
        assert!(!result.success);
        assert!(
            result.error_message.as_ref().unwrap().contains("cancelled"),
            "{:?}",
            result.error_message
        );
        assert!(!output.exists());
    }
}
