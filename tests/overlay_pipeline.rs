use std::{path::Path, process::Command};

use thermoverlay::{
    put_text, Anchor, CropRegion, FrameRgb, MeasurementSeries, OverlayConfig, OverlayJob,
    Pipeline, PipelineEvent, ProcessResult, TextConfig, VideoContext,
};

fn ffmpeg_tools_available() -> bool {
    let ffmpeg_ok = Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    let ffprobe_ok = Command::new("ffprobe")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    ffmpeg_ok && ffprobe_ok
}

// The compositor needs a resolvable system font; skip rendering tests on
// hosts without one.
fn text_rendering_available() -> bool {
    let mut frame = FrameRgb::new(64, 64);
    put_text(
        &mut frame,
        "0",
        5,
        5,
        Anchor::TopLeft,
        false,
        &TextConfig::default(),
    )
    .is_ok()
}

fn synth_mp4(root: &Path) -> anyhow::Result<std::path::PathBuf> {
    std::fs::create_dir_all(root)?;
    let video_path = root.join("clip.mp4");
    let status = Command::new("ffmpeg")
        .args([
            "-v",
            "error",
            "-y",
            "-f",
            "lavfi",
            "-i",
            "testsrc=size=64x64:rate=30",
            "-t",
            "1",
            "-pix_fmt",
            "yuv420p",
            "-c:v",
            "libx264",
        ])
        .arg(&video_path)
        .status()?;
    anyhow::ensure!(status.success(), "ffmpeg failed creating clip.mp4");
    Ok(video_path)
}

// A raw Annex-B bitstream: packets exist but carry no presentation
// timestamps, which forces the pre-conversion branch.
fn synth_raw_h264(root: &Path) -> anyhow::Result<std::path::PathBuf> {
    std::fs::create_dir_all(root)?;
    let video_path = root.join("clip.h264");
    let status = Command::new("ffmpeg")
        .args([
            "-v",
            "error",
            "-y",
            "-f",
            "lavfi",
            "-i",
            "testsrc=size=64x64:rate=30",
            "-t",
            "1",
            "-c:v",
            "libx264",
            "-f",
            "h264",
        ])
        .arg(&video_path)
        .status()?;
    anyhow::ensure!(status.success(), "ffmpeg failed creating clip.h264");
    Ok(video_path)
}

fn series() -> MeasurementSeries {
    MeasurementSeries {
        time: vec![0.0, 0.5, 1.0],
        emf: vec![1.0, 2.0, 3.0],
        temp: Some(vec![20.0, 25.0, 35.0]),
    }
}

fn run_job(job: OverlayJob, cfg: OverlayConfig) -> Vec<PipelineEvent> {
    let (handle, rx) = Pipeline::new(job, cfg).spawn().unwrap();
    let events: Vec<PipelineEvent> = rx.iter().collect();
    handle.join().unwrap();
    events
}

fn terminal(events: &[PipelineEvent]) -> &ProcessResult {
    let finished: Vec<&ProcessResult> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Finished(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 1, "exactly one terminal result expected");
    finished[0]
}

#[test]
fn full_pipeline_produces_annotated_output() {
    if !ffmpeg_tools_available() || !text_rendering_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let input = synth_mp4(root.path()).unwrap();
    let output = root.path().join("out").join("annotated.mp4");

    let events = run_job(
        OverlayJob {
            video_input: input,
            video_output: output.clone(),
            series: series(),
            crop: None,
            operator: "A. Operator".to_string(),
            sample: "sample-1".to_string(),
        },
        OverlayConfig::default(),
    );

    let result = terminal(&events);
    assert!(result.success, "{:?}", result.error_message);
    assert!(output.exists());

    let stages: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Stage(s) => Some(s.label.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(stages, vec!["1/3", "2/3", "3/3"]);

    let ctx = VideoContext::open(&output).unwrap();
    assert_eq!((ctx.width, ctx.height), (64, 64));
}

#[test]
fn valid_timestamps_skip_the_preconvert_stage() {
    if !ffmpeg_tools_available() || !text_rendering_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let input = synth_mp4(root.path()).unwrap();
    let output = root.path().join("annotated.mp4");

    let events = run_job(
        OverlayJob {
            video_input: input,
            video_output: output,
            series: series(),
            crop: None,
            operator: String::new(),
            sample: String::new(),
        },
        OverlayConfig::default(),
    );
    assert!(terminal(&events).success);

    // Between the first two stage markers the skip emits a single 100%
    // progress event instead of a conversion percentage stream.
    let stage2_at = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::Stage(s) if s.label == "2/3"))
        .unwrap();
    let stage1_progress: Vec<f64> = events[..stage2_at]
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress(p) => Some(p.value),
            _ => None,
        })
        .collect();
    assert_eq!(stage1_progress, vec![100.0]);
}

#[test]
fn timestampless_input_takes_the_preconvert_branch() {
    if !ffmpeg_tools_available() || !text_rendering_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let input = synth_raw_h264(root.path()).unwrap();
    let output = root.path().join("annotated.mp4");

    // Raw bitstreams expose no per-packet timestamps; alignment is only
    // possible after the input is remuxed, so success implies the branch ran.
    let events = run_job(
        OverlayJob {
            video_input: input,
            video_output: output.clone(),
            series: series(),
            crop: None,
            operator: String::new(),
            sample: String::new(),
        },
        OverlayConfig::default(),
    );

    let result = terminal(&events);
    assert!(result.success, "{:?}", result.error_message);
    assert!(output.exists());
}

#[test]
fn cropped_output_has_the_requested_size() {
    if !ffmpeg_tools_available() || !text_rendering_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let input = synth_mp4(root.path()).unwrap();
    let output = root.path().join("cropped.mp4");

    let events = run_job(
        OverlayJob {
            video_input: input,
            video_output: output.clone(),
            series: series(),
            crop: Some(CropRegion::new(8, 8, 32, 20)),
            operator: String::new(),
            sample: String::new(),
        },
        OverlayConfig::default(),
    );
    assert!(terminal(&events).success);

    let ctx = VideoContext::open(&output).unwrap();
    assert_eq!((ctx.width, ctx.height), (32, 20));
}

#[test]
fn preview_progress_carries_composited_frames() {
    if !ffmpeg_tools_available() || !text_rendering_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let input = synth_mp4(root.path()).unwrap();
    let output = root.path().join("annotated.mp4");

    let cfg = OverlayConfig {
        preview_frames: true,
        ..OverlayConfig::default()
    };
    let events = run_job(
        OverlayJob {
            video_input: input,
            video_output: output,
            series: series(),
            crop: None,
            operator: String::new(),
            sample: String::new(),
        },
        cfg,
    );
    assert!(terminal(&events).success);

    let preview_dims: Vec<(u32, u32)> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress(p) => p.frame.as_ref().map(|f| (f.width, f.height)),
            _ => None,
        })
        .collect();
    assert!(!preview_dims.is_empty());
    assert!(preview_dims.iter().all(|&d| d == (64, 64)));
}

#[test]
fn frame_progress_indices_are_strictly_increasing() {
    if !ffmpeg_tools_available() || !text_rendering_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let input = synth_mp4(root.path()).unwrap();
    let output = root.path().join("annotated.mp4");

    let events = run_job(
        OverlayJob {
            video_input: input,
            video_output: output,
            series: series(),
            crop: None,
            operator: String::new(),
            sample: String::new(),
        },
        OverlayConfig::default(),
    );
    assert!(terminal(&events).success);

    let stage2_at = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::Stage(s) if s.label == "2/3"))
        .unwrap();
    let stage3_at = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::Stage(s) if s.label == "3/3"))
        .unwrap();
    let frame_values: Vec<f64> = events[stage2_at..stage3_at]
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress(p) => Some(p.value),
            _ => None,
        })
        .collect();
    assert!(!frame_values.is_empty());
    assert!(frame_values.windows(2).all(|w| w[1] > w[0]));
    assert_eq!(frame_values[0], 0.0);
}
