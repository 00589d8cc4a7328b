use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use clap::Parser;
use thermoverlay::{
    CropRegion, MeasurementSeries, OverlayConfig, OverlayJob, Pipeline, PipelineEvent,
};

#[derive(Parser, Debug)]
#[command(name = "thermoverlay", version)]
struct Cli {
    /// Measurement series CSV: `time,emf[,temp]` per line, header optional.
    series: PathBuf,

    /// Input video file.
    video: PathBuf,

    /// Output video path. Defaults to `<video stem>_overlay.mp4`.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Overlay configuration JSON.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Crop region as `X:Y:WxH`.
    #[arg(long)]
    crop: Option<String>,

    /// Disable the rolling-rate plot inset.
    #[arg(long)]
    no_graph: bool,

    /// Operator name rendered in the bottom-left block.
    #[arg(long, default_value = "")]
    operator: String,

    /// Sample name rendered in the bottom-left block.
    #[arg(long, default_value = "")]
    sample: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let series = read_series_csv(&cli.series)?;
    let output = cli
        .out
        .unwrap_or_else(|| default_output_path(&cli.video));
    anyhow::ensure!(
        !output.exists(),
        "output file '{}' already exists",
        output.display()
    );

    let mut cfg = match &cli.config {
        Some(path) => OverlayConfig::from_json_file(path)?,
        None => OverlayConfig::default(),
    };
    if cli.no_graph {
        cfg.graph.enabled = false;
    }

    let crop = cli.crop.as_deref().map(parse_crop).transpose()?;

    let job = OverlayJob {
        video_input: cli.video,
        video_output: output.clone(),
        series,
        crop,
        operator: cli.operator,
        sample: cli.sample,
    };

    let (handle, events) = Pipeline::new(job, cfg).spawn()?;

    let mut unit = String::new();
    let mut result = None;
    for event in events {
        match event {
            PipelineEvent::Stage(stage) => {
                eprintln!(
                    "stage {} ({:.0} {})",
                    stage.label, stage.total_units, stage.unit
                );
                unit = stage.unit;
            }
            PipelineEvent::Progress(progress) => {
                eprint!("\r  {:>8.1} {unit}", progress.value);
                let _ = std::io::stderr().flush();
            }
            PipelineEvent::Finished(r) => {
                eprintln!();
                result = Some(r);
            }
        }
    }
    let _ = handle.join();

    let result = result.context("pipeline ended without a terminal result")?;
    if !result.success {
        anyhow::bail!(
            "{}",
            result
                .error_message
                .unwrap_or_else(|| "overlay job failed".to_string())
        );
    }

    eprintln!("wrote {}", output.display());
    Ok(())
}

fn default_output_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    video.with_file_name(format!("{stem}_overlay.mp4"))
}

/// Minimal `time,emf[,temp]` reader. The instrument formats proper are
/// handled by their own tooling; this accepts the plain export they produce.
fn read_series_csv(path: &Path) -> anyhow::Result<MeasurementSeries> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read series '{}'", path.display()))?;

    let mut time = Vec::new();
    let mut emf = Vec::new();
    let mut temp: Vec<f64> = Vec::new();
    let mut has_temp = None;

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if lineno == 0 && fields[0].parse::<f64>().is_err() {
            // Header row.
            continue;
        }
        anyhow::ensure!(
            fields.len() == 2 || fields.len() == 3,
            "line {}: expected 2 or 3 columns, got {}",
            lineno + 1,
            fields.len()
        );
        let with_temp = fields.len() == 3;
        match has_temp {
            None => has_temp = Some(with_temp),
            Some(expected) => anyhow::ensure!(
                expected == with_temp,
                "line {}: inconsistent column count",
                lineno + 1
            ),
        }

        let parse = |s: &str| -> anyhow::Result<f64> {
            s.parse::<f64>()
                .with_context(|| format!("line {}: invalid number '{s}'", lineno + 1))
        };
        time.push(parse(fields[0])?);
        emf.push(parse(fields[1])?);
        if with_temp {
            temp.push(parse(fields[2])?);
        }
    }

    let series = MeasurementSeries {
        time,
        emf,
        temp: has_temp.unwrap_or(false).then_some(temp),
    };
    series.validate()?;
    Ok(series)
}

fn parse_crop(s: &str) -> anyhow::Result<CropRegion> {
    let err = || anyhow::anyhow!("invalid crop '{s}', expected X:Y:WxH");
    let mut parts = s.split(':');
    let x = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let y = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
    let size = parts.next().ok_or_else(err)?;
    if parts.next().is_some() {
        return Err(err());
    }
    let (w, h) = size.split_once('x').ok_or_else(err)?;
    Ok(CropRegion::new(
        x,
        y,
        w.parse().map_err(|_| err())?,
        h.parse().map_err(|_| err())?,
    ))
}
